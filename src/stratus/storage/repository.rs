/*
 * Copyright (C) 2025 The Stratus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{is_constraint_violation, PodBinding, Resource, StorageError, BINDING_PENDING};
use crate::stratus::k8s::node::{Node, NodeStatus};
use crate::stratus::k8s::pod::ObjectMeta;

/// Durable CRUD over cluster objects, nodes, and pod bindings. Every method
/// is one linearized operation against the shared connection; callers re-read
/// when they need freshness.
#[derive(Clone)]
pub struct Repository {
    conn: Arc<Mutex<Connection>>,
}

fn not_found_on_no_rows(err: rusqlite::Error, what: String) -> StorageError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound(what),
        other => StorageError::Backend(other),
    }
}

impl Repository {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Repository { conn }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("storage lock poisoned")
    }

    // --- generic resources ---

    /// Insert a new object. The unique key is (kind, namespace, name); a
    /// second create with the same triple reports a conflict. The store
    /// assigns both timestamps and, when absent, the UID.
    pub fn create_resource(&self, resource: &Resource) -> Result<Resource, StorageError> {
        let mut stored = resource.clone();
        if stored.id.is_empty() {
            stored.id = uuid::Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        stored.created_at = now;
        stored.updated_at = now;

        let conn = self.lock();
        conn.execute(
            "INSERT INTO resources (id, kind, namespace, name, metadata, spec, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                stored.id,
                stored.kind,
                stored.namespace,
                stored.name,
                stored.metadata,
                stored.spec,
                stored.status,
                stored.created_at,
                stored.updated_at,
            ],
        )
        .map_err(|err| {
            if is_constraint_violation(&err) {
                StorageError::Conflict(format!(
                    "resource {}/{}/{}",
                    stored.kind, stored.namespace, stored.name
                ))
            } else {
                StorageError::Backend(err)
            }
        })?;
        Ok(stored)
    }

    pub fn get_resource(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Resource, StorageError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, kind, namespace, name, metadata, spec, status, created_at, updated_at
             FROM resources WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            params![kind, namespace, name],
            row_to_resource,
        )
        .map_err(|err| not_found_on_no_rows(err, format!("resource {kind}/{namespace}/{name}")))
    }

    /// Full-record replacement of metadata, spec, and status. The store
    /// advances the updated timestamp.
    pub fn update_resource(&self, resource: &Resource) -> Result<(), StorageError> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE resources SET metadata = ?1, spec = ?2, status = ?3, updated_at = ?4
             WHERE kind = ?5 AND namespace = ?6 AND name = ?7",
            params![
                resource.metadata,
                resource.spec,
                resource.status,
                Utc::now(),
                resource.kind,
                resource.namespace,
                resource.name,
            ],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!(
                "resource {}/{}/{}",
                resource.kind, resource.namespace, resource.name
            )));
        }
        Ok(())
    }

    pub fn delete_resource(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let conn = self.lock();
        let affected = conn.execute(
            "DELETE FROM resources WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            params![kind, namespace, name],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!(
                "resource {kind}/{namespace}/{name}"
            )));
        }
        Ok(())
    }

    /// List objects of one kind, newest first. An empty namespace lists
    /// across all namespaces.
    pub fn list_resources(&self, kind: &str, namespace: &str) -> Result<Vec<Resource>, StorageError> {
        let conn = self.lock();
        let mut resources = Vec::new();
        if namespace.is_empty() {
            let mut stmt = conn.prepare(
                "SELECT id, kind, namespace, name, metadata, spec, status, created_at, updated_at
                 FROM resources WHERE kind = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![kind], row_to_resource)?;
            for row in rows {
                resources.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, kind, namespace, name, metadata, spec, status, created_at, updated_at
                 FROM resources WHERE kind = ?1 AND namespace = ?2 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![kind, namespace], row_to_resource)?;
            for row in rows {
                resources.push(row?);
            }
        }
        Ok(resources)
    }

    // --- nodes ---

    pub fn create_node(&self, node: &Node) -> Result<Node, StorageError> {
        let mut stored = node.clone();
        if stored.metadata.uid.is_empty() {
            stored.metadata.uid = uuid::Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        stored.metadata.created_at = Some(now);

        let labels_json = serde_json::to_string(&stored.metadata.labels)?;
        let status_json = serde_json::to_string(&stored.status)?;
        let address = first_address(&stored.status);

        let conn = self.lock();
        conn.execute(
            "INSERT INTO nodes (id, name, labels, address, status, last_heartbeat, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                stored.metadata.uid,
                stored.metadata.name,
                labels_json,
                address,
                status_json,
                now,
                now,
            ],
        )
        .map_err(|err| {
            if is_constraint_violation(&err) {
                StorageError::Conflict(format!("node {}", stored.metadata.name))
            } else {
                StorageError::Backend(err)
            }
        })?;
        Ok(stored)
    }

    pub fn get_node(&self, name: &str) -> Result<Node, StorageError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, labels, status, created_at FROM nodes WHERE name = ?1",
                params![name],
                node_columns,
            )
            .map_err(|err| not_found_on_no_rows(err, format!("node {name}")))?;
        build_node(row)
    }

    /// Replace a node's labels, address, and status. The heartbeat column
    /// advances with every status write.
    pub fn update_node(&self, node: &Node) -> Result<(), StorageError> {
        let labels_json = serde_json::to_string(&node.metadata.labels)?;
        let status_json = serde_json::to_string(&node.status)?;
        let address = first_address(&node.status);

        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE nodes SET labels = ?1, address = ?2, status = ?3, last_heartbeat = ?4
             WHERE name = ?5",
            params![labels_json, address, status_json, Utc::now(), node.metadata.name],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!(
                "node {}",
                node.metadata.name
            )));
        }
        Ok(())
    }

    pub fn delete_node(&self, name: &str) -> Result<(), StorageError> {
        let conn = self.lock();
        let affected = conn.execute("DELETE FROM nodes WHERE name = ?1", params![name])?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("node {name}")));
        }
        Ok(())
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, labels, status, created_at FROM nodes ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], node_columns)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(build_node(row?)?);
        }
        Ok(nodes)
    }

    /// Record a heartbeat for `name`: bump the heartbeat column and, when the
    /// stored status carries a Ready condition, its lastHeartbeatTime, in a
    /// single transaction.
    pub fn touch_node_heartbeat(&self, name: &str) -> Result<(), StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();

        let status_json: String = tx
            .query_row(
                "SELECT status FROM nodes WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(|err| not_found_on_no_rows(err, format!("node {name}")))?;

        match refresh_ready_heartbeat(&status_json, now)? {
            Some(refreshed) => {
                tx.execute(
                    "UPDATE nodes SET status = ?1, last_heartbeat = ?2 WHERE name = ?3",
                    params![refreshed, now, name],
                )?;
            }
            None => {
                tx.execute(
                    "UPDATE nodes SET last_heartbeat = ?1 WHERE name = ?2",
                    params![now, name],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- pod bindings ---

    /// Bind a pod to a node. The node row must exist (foreign key) and a pod
    /// may hold at most one binding.
    pub fn bind_pod(&self, pod_id: &str, node_id: &str) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pod_bindings (pod_id, node_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![pod_id, node_id, BINDING_PENDING, Utc::now()],
        )
        .map_err(|err| {
            if is_constraint_violation(&err) {
                StorageError::Conflict(format!("binding for pod {pod_id} on node {node_id}"))
            } else {
                StorageError::Backend(err)
            }
        })?;
        Ok(())
    }

    pub fn get_binding(&self, pod_id: &str) -> Result<PodBinding, StorageError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT pod_id, node_id, status, created_at FROM pod_bindings WHERE pod_id = ?1",
            params![pod_id],
            |row| {
                Ok(PodBinding {
                    pod_id: row.get(0)?,
                    node_id: row.get(1)?,
                    status: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .map_err(|err| not_found_on_no_rows(err, format!("binding for pod {pod_id}")))
    }

    pub fn set_binding_status(&self, pod_id: &str, status: &str) -> Result<(), StorageError> {
        let conn = self.lock();
        let affected = conn.execute(
            "UPDATE pod_bindings SET status = ?1 WHERE pod_id = ?2",
            params![status, pod_id],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("binding for pod {pod_id}")));
        }
        Ok(())
    }

    pub fn delete_binding(&self, pod_id: &str) -> Result<(), StorageError> {
        let conn = self.lock();
        let affected = conn.execute(
            "DELETE FROM pod_bindings WHERE pod_id = ?1",
            params![pod_id],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("binding for pod {pod_id}")));
        }
        Ok(())
    }

    pub fn list_bindings_by_node(&self, node_id: &str) -> Result<Vec<PodBinding>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT pod_id, node_id, status, created_at FROM pod_bindings
             WHERE node_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![node_id], |row| {
            Ok(PodBinding {
                pod_id: row.get(0)?,
                node_id: row.get(1)?,
                status: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut bindings = Vec::new();
        for row in rows {
            bindings.push(row?);
        }
        Ok(bindings)
    }
}

fn row_to_resource(row: &rusqlite::Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: row.get(0)?,
        kind: row.get(1)?,
        namespace: row.get(2)?,
        name: row.get(3)?,
        metadata: row.get(4)?,
        spec: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

type NodeColumns = (String, String, String, String, DateTime<Utc>);

fn node_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn build_node(
    (id, name, labels_json, status_json, created_at): NodeColumns,
) -> Result<Node, StorageError> {
    let labels: HashMap<String, String> = if labels_json.is_empty() {
        HashMap::new()
    } else {
        serde_json::from_str(&labels_json)?
    };
    let status: NodeStatus = if status_json.is_empty() {
        NodeStatus::default()
    } else {
        serde_json::from_str(&status_json)?
    };

    Ok(Node {
        metadata: ObjectMeta {
            name,
            uid: id,
            labels,
            created_at: Some(created_at),
            ..Default::default()
        },
        status,
        ..Default::default()
    })
}

fn first_address(status: &NodeStatus) -> String {
    status
        .addresses
        .first()
        .map(|a| a.address.clone())
        .unwrap_or_default()
}

fn refresh_ready_heartbeat(
    status_json: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, StorageError> {
    if status_json.is_empty() {
        return Ok(None);
    }
    let mut status: NodeStatus = serde_json::from_str(status_json)?;
    let Some(ready) = status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == crate::stratus::k8s::node::CONDITION_READY)
    else {
        return Ok(None);
    };
    ready.last_heartbeat_time = Some(now);
    Ok(Some(serde_json::to_string(&status)?))
}
