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

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use super::error::ApiError;
use super::{parse_json, ApiContext, DeleteResponse};
use crate::stratus::k8s::node::{Node, NodeCondition, NodeList, NodeStatus, CONDITION_READY};
use crate::stratus::k8s::pod::{Pod, PodList};
use crate::stratus::k8s::validation::validate_node;
use crate::stratus::logger::log_warn;

const COMPONENT: &str = "api-nodes";

/// POST /api/v1/nodes
pub(crate) async fn create_node(
    State(ctx): State<ApiContext>,
    body: Bytes,
) -> Result<(StatusCode, Json<Node>), ApiError> {
    let mut node: Node = parse_json(&body)?;
    validate_node(&node).map_err(|e| ApiError::validation("Node", e))?;

    let now = Utc::now();
    node.api_version = "v1".to_string();
    node.kind = "Node".to_string();
    node.metadata.uid = uuid::Uuid::new_v4().to_string();
    node.metadata.created_at = Some(now);
    node.metadata.updated_at = Some(now);

    // A node registered without a Ready condition starts out Unknown until
    // its first status report.
    if node.ready_condition().is_none() {
        node.status.conditions.push(NodeCondition {
            condition_type: CONDITION_READY.to_string(),
            status: "Unknown".to_string(),
            last_heartbeat_time: Some(now),
            last_transition_time: Some(now),
            reason: "NodeStatusNeverUpdated".to_string(),
            message: "Node status has never been updated".to_string(),
        });
    }

    let stored = ctx
        .repository
        .create_node(&node)
        .map_err(|e| ApiError::storage("Node", e))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// GET /api/v1/nodes/{name}
pub(crate) async fn get_node(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<Node>, ApiError> {
    let node = ctx
        .repository
        .get_node(&name)
        .map_err(|e| ApiError::storage("Node", e))?;
    Ok(Json(node))
}

/// PUT /api/v1/nodes/{name}
pub(crate) async fn update_node(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Node>, ApiError> {
    let mut node: Node = parse_json(&body)?;
    if node.metadata.name != name {
        return Err(ApiError::name_mismatch("Node"));
    }
    validate_node(&node).map_err(|e| ApiError::validation("Node", e))?;

    node.metadata.updated_at = Some(Utc::now());
    ctx.repository
        .update_node(&node)
        .map_err(|e| ApiError::storage("Node", e))?;
    Ok(Json(node))
}

/// DELETE /api/v1/nodes/{name}
pub(crate) async fn delete_node(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    ctx.repository
        .delete_node(&name)
        .map_err(|e| ApiError::storage("Node", e))?;
    Ok(Json(DeleteResponse::new("Node")))
}

/// GET /api/v1/nodes
pub(crate) async fn list_nodes(
    State(ctx): State<ApiContext>,
) -> Result<Json<NodeList>, ApiError> {
    let nodes = ctx
        .repository
        .list_nodes()
        .map_err(|e| ApiError::storage("Node", e))?;
    Ok(Json(NodeList::new(nodes)))
}

/// POST /api/v1/nodes/{name}/heartbeat — an empty body touches the heartbeat
/// timestamp; a NodeStatus body replaces the node's status wholesale.
pub(crate) async fn node_heartbeat(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if body.is_empty() {
        ctx.repository
            .touch_node_heartbeat(&name)
            .map_err(|e| ApiError::storage("Node", e))?;
    } else {
        let status: NodeStatus = parse_json(&body)?;
        let mut node = ctx
            .repository
            .get_node(&name)
            .map_err(|e| ApiError::storage("Node", e))?;
        node.status = status;
        ctx.repository
            .update_node(&node)
            .map_err(|e| ApiError::storage("Node", e))?;
    }

    Ok(Json(json!({
        "message": "Node heartbeat updated successfully",
        "timestamp": Utc::now(),
    })))
}

/// GET /api/v1/nodes/{name}/pods — the pods currently bound to a node.
pub(crate) async fn node_pods(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<PodList>, ApiError> {
    let node = ctx
        .repository
        .get_node(&name)
        .map_err(|e| ApiError::storage("Node", e))?;
    let bindings = ctx
        .repository
        .list_bindings_by_node(&node.metadata.uid)
        .map_err(|e| ApiError::storage("PodBinding", e))?;
    let resources = ctx
        .repository
        .list_resources("Pod", "")
        .map_err(|e| ApiError::storage("Pod", e))?;

    let mut pods = Vec::new();
    for binding in &bindings {
        let Some(resource) = resources.iter().find(|r| r.id == binding.pod_id) else {
            continue;
        };
        match Pod::from_resource(resource) {
            Ok(pod) => pods.push(pod),
            Err(err) => log_warn(
                COMPONENT,
                "Skipping unparseable pod in node listing",
                &[
                    ("pod", resource.name.as_str()),
                    ("error", err.to_string().as_str()),
                ],
            ),
        }
    }
    Ok(Json(PodList::new(pods)))
}
