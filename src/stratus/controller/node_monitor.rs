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

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::error::Error;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::spawn_tick_loop;
use crate::stratus::k8s::node::{Node, NodeCondition, CONDITION_READY};
use crate::stratus::k8s::pod::{Pod, PodCondition};
use crate::stratus::logger::{log_error, log_info, log_warn};
use crate::stratus::storage::{Repository, BINDING_NODE_FAILED};
use crate::stratus::util::with_context;

const COMPONENT: &str = "node-monitor";
const TICK_PERIOD: Duration = Duration::from_secs(30);

/// Keeps every node's Ready condition consistent with heartbeat recency and
/// fails over pods bound to nodes that stopped reporting.
pub struct NodeMonitor {
    repository: Repository,
    heartbeat_timeout: ChronoDuration,
}

impl NodeMonitor {
    pub fn new(repository: Repository, heartbeat_timeout: Duration) -> Self {
        NodeMonitor {
            repository,
            heartbeat_timeout: ChronoDuration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| ChronoDuration::minutes(2)),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_tick_loop(COMPONENT, TICK_PERIOD, cancel, move || {
            self.check_node_health()
        })
    }

    /// One monitor tick over all nodes.
    pub fn check_node_health(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let nodes = self
            .repository
            .list_nodes()
            .map_err(|e| with_context(e, "failed to list nodes"))?;
        let now = Utc::now();

        for mut node in nodes {
            if node.ready_condition().is_none() {
                node.status.conditions.push(NodeCondition {
                    condition_type: CONDITION_READY.to_string(),
                    status: "Unknown".to_string(),
                    last_heartbeat_time: Some(now),
                    last_transition_time: Some(now),
                    reason: "NodeStatusNeverUpdated".to_string(),
                    message: "Node has never reported status".to_string(),
                });
            }

            let (current_status, last_heartbeat) = {
                let ready = node.ready_condition().expect("ready condition present");
                (
                    ready.status.clone(),
                    ready
                        .last_heartbeat_time
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                )
            };
            let elapsed = now - last_heartbeat;

            if elapsed > self.heartbeat_timeout {
                if current_status != "False" {
                    log_warn(
                        COMPONENT,
                        "Node missed its heartbeat window",
                        &[
                            ("node", node.metadata.name.as_str()),
                            ("elapsed", format!("{}s", elapsed.num_seconds()).as_str()),
                        ],
                    );
                    {
                        let ready = node.ready_condition_mut().expect("ready condition present");
                        ready.status = "False".to_string();
                        ready.last_transition_time = Some(now);
                        ready.reason = "NodeNotReady".to_string();
                        ready.message = format!(
                            "Node has not sent a heartbeat for {}s",
                            elapsed.num_seconds()
                        );
                    }
                    if let Err(err) = self.repository.update_node(&node) {
                        log_error(
                            COMPONENT,
                            "Failed to persist node status",
                            &[
                                ("node", node.metadata.name.as_str()),
                                ("error", err.to_string().as_str()),
                            ],
                        );
                    }
                    if let Err(err) = self.handle_node_failure(&node) {
                        log_error(
                            COMPONENT,
                            "Failed to fail over pods",
                            &[
                                ("node", node.metadata.name.as_str()),
                                ("error", err.to_string().as_str()),
                            ],
                        );
                    }
                }
            } else if current_status != "True" {
                log_info(
                    COMPONENT,
                    "Node is healthy again",
                    &[("node", node.metadata.name.as_str())],
                );
                {
                    let ready = node.ready_condition_mut().expect("ready condition present");
                    ready.status = "True".to_string();
                    ready.last_transition_time = Some(now);
                    ready.reason = "NodeReady".to_string();
                    ready.message = "Node is ready".to_string();
                }
                if let Err(err) = self.repository.update_node(&node) {
                    log_error(
                        COMPONENT,
                        "Failed to persist node status",
                        &[
                            ("node", node.metadata.name.as_str()),
                            ("error", err.to_string().as_str()),
                        ],
                    );
                }
            }
        }

        Ok(())
    }

    /// Mark every binding on the failed node and release its pods so the
    /// scheduler can place them elsewhere.
    fn handle_node_failure(&self, node: &Node) -> Result<(), Box<dyn Error + Send + Sync>> {
        let bindings = self
            .repository
            .list_bindings_by_node(&node.metadata.uid)
            .map_err(|e| with_context(e, "failed to list bindings for failed node"))?;

        log_info(
            COMPONENT,
            "Failing over pods from unhealthy node",
            &[
                ("node", node.metadata.name.as_str()),
                ("pods", bindings.len().to_string().as_str()),
            ],
        );

        let pods = self
            .repository
            .list_resources("Pod", "")
            .map_err(|e| with_context(e, "failed to list pods"))?;

        for binding in bindings {
            if let Err(err) = self
                .repository
                .set_binding_status(&binding.pod_id, BINDING_NODE_FAILED)
            {
                log_error(
                    COMPONENT,
                    "Failed to update binding status",
                    &[
                        ("pod", binding.pod_id.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                continue;
            }

            let Some(resource) = pods.iter().find(|r| r.id == binding.pod_id) else {
                continue;
            };

            let mut pod = match Pod::from_resource(resource) {
                Ok(pod) => pod,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Skipping unparseable pod",
                        &[
                            ("pod", binding.pod_id.as_str()),
                            ("error", err.to_string().as_str()),
                        ],
                    );
                    continue;
                }
            };

            pod.status.phase = "Failed".to_string();
            pod.status.conditions.push(PodCondition {
                condition_type: "NodeFailed".to_string(),
                status: "True".to_string(),
                last_transition_time: Some(Utc::now()),
                reason: "NodeNotReady".to_string(),
                message: format!("Node {} is not ready", node.metadata.name),
            });
            // An empty node name makes the pod eligible for rescheduling.
            pod.spec.node_name = String::new();

            let mut updated = resource.clone();
            updated.spec = match serde_json::to_string(&pod.spec) {
                Ok(json) => json,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Failed to serialize pod spec",
                        &[("error", err.to_string().as_str())],
                    );
                    continue;
                }
            };
            updated.status = match serde_json::to_string(&pod.status) {
                Ok(json) => json,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Failed to serialize pod status",
                        &[("error", err.to_string().as_str())],
                    );
                    continue;
                }
            };

            if let Err(err) = self.repository.update_resource(&updated) {
                log_error(
                    COMPONENT,
                    "Failed to persist failed pod",
                    &[
                        ("pod", binding.pod_id.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                continue;
            }

            log_info(
                COMPONENT,
                "Marked pod as failed after node failure",
                &[
                    ("namespace", updated.namespace.as_str()),
                    ("pod", updated.name.as_str()),
                ],
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratus::k8s::node::{NodeStatus, NodeCondition};
    use crate::stratus::k8s::pod::{ObjectMeta, PodSpec, PodStatus};
    use crate::stratus::storage::{Database, Resource};

    fn open_repository() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path()).expect("open database");
        let repo = db.repository();
        (dir, repo)
    }

    fn node_with_heartbeat(name: &str, status: &str, heartbeat: DateTime<Utc>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            status: NodeStatus {
                conditions: vec![NodeCondition {
                    condition_type: CONDITION_READY.to_string(),
                    status: status.to_string(),
                    last_heartbeat_time: Some(heartbeat),
                    last_transition_time: Some(heartbeat),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn running_pod_resource(name: &str, node_name: &str) -> Resource {
        let spec = PodSpec {
            node_name: node_name.to_string(),
            ..Default::default()
        };
        let status = PodStatus {
            phase: "Running".to_string(),
            ..Default::default()
        };
        let mut resource = Resource::new("Pod", "default", name);
        resource.spec = serde_json::to_string(&spec).unwrap();
        resource.status = serde_json::to_string(&status).unwrap();
        resource
    }

    #[test]
    fn stale_node_fails_over_its_pods() {
        let (_dir, repo) = open_repository();
        let stale = Utc::now() - ChronoDuration::minutes(5);
        let node = repo
            .create_node(&node_with_heartbeat("worker-1", "True", stale))
            .expect("create node");
        let pod = repo
            .create_resource(&running_pod_resource("web-1", "worker-1"))
            .expect("create pod");
        repo.bind_pod(&pod.id, &node.metadata.uid).expect("bind");

        let monitor = NodeMonitor::new(repo.clone(), Duration::from_secs(120));
        monitor.check_node_health().expect("tick");

        let node = repo.get_node("worker-1").expect("get node");
        let ready = node.ready_condition().expect("ready condition");
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "NodeNotReady");

        let pod = Pod::from_resource(&repo.get_resource("Pod", "default", "web-1").unwrap())
            .expect("parse pod");
        assert_eq!(pod.spec.node_name, "");
        assert_eq!(pod.status.phase, "Failed");
        assert!(pod
            .status
            .conditions
            .iter()
            .any(|c| c.condition_type == "NodeFailed" && c.status == "True"));

        let binding = repo.get_binding(&pod.metadata.uid).expect("binding");
        assert_eq!(binding.status, "NodeFailed");
    }

    #[test]
    fn fresh_node_transitions_back_to_ready() {
        let (_dir, repo) = open_repository();
        repo.create_node(&node_with_heartbeat("worker-1", "False", Utc::now()))
            .expect("create node");

        let monitor = NodeMonitor::new(repo.clone(), Duration::from_secs(120));
        monitor.check_node_health().expect("tick");

        let node = repo.get_node("worker-1").expect("get node");
        let ready = node.ready_condition().expect("ready condition");
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "NodeReady");
    }

    #[test]
    fn node_without_ready_condition_is_seeded_unknown() {
        let (_dir, repo) = open_repository();
        let node = Node {
            metadata: ObjectMeta {
                name: "worker-1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        repo.create_node(&node).expect("create node");

        let monitor = NodeMonitor::new(repo.clone(), Duration::from_secs(120));
        monitor.check_node_health().expect("tick");

        // The freshly seeded condition carries a current heartbeat, so the
        // same tick flips it straight to True.
        let node = repo.get_node("worker-1").expect("get node");
        let ready = node.ready_condition().expect("ready condition");
        assert_eq!(ready.status, "True");
    }

    #[test]
    fn already_failed_node_is_not_failed_twice() {
        let (_dir, repo) = open_repository();
        let stale = Utc::now() - ChronoDuration::minutes(10);
        let node = repo
            .create_node(&node_with_heartbeat("worker-1", "False", stale))
            .expect("create node");
        let pod = repo
            .create_resource(&running_pod_resource("web-1", "worker-1"))
            .expect("create pod");
        repo.bind_pod(&pod.id, &node.metadata.uid).expect("bind");

        let monitor = NodeMonitor::new(repo.clone(), Duration::from_secs(120));
        monitor.check_node_health().expect("tick");

        // Ready was already False, so failover must not have run.
        let pod = Pod::from_resource(&repo.get_resource("Pod", "default", "web-1").unwrap())
            .expect("parse pod");
        assert_eq!(pod.spec.node_name, "worker-1");
        assert_eq!(pod.status.phase, "Running");
    }
}
