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

use super::error::ApiError;
use super::{parse_json, ApiContext, DeleteResponse, DEFAULT_NAMESPACE};
use crate::stratus::k8s::pod::{Pod, PodCondition, PodList, PodStatus};
use crate::stratus::k8s::validation::validate_pod;
use crate::stratus::logger::log_warn;
use crate::stratus::storage::Resource;

const COMPONENT: &str = "api-pods";

pub(crate) async fn create_pod(
    State(ctx): State<ApiContext>,
    body: Bytes,
) -> Result<(StatusCode, Json<Pod>), ApiError> {
    create_pod_in_namespace(&ctx, DEFAULT_NAMESPACE, body)
}

pub(crate) async fn create_namespaced_pod(
    State(ctx): State<ApiContext>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Pod>), ApiError> {
    create_pod_in_namespace(&ctx, &namespace, body)
}

fn create_pod_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    body: Bytes,
) -> Result<(StatusCode, Json<Pod>), ApiError> {
    let mut pod: Pod = parse_json(&body)?;
    if pod.metadata.namespace.is_empty() {
        pod.metadata.namespace = namespace.to_string();
    }
    if pod.metadata.namespace != namespace {
        return Err(ApiError::namespace_mismatch("Pod"));
    }
    validate_pod(&pod).map_err(|e| ApiError::validation("Pod", e))?;

    let now = Utc::now();
    pod.api_version = "v1".to_string();
    pod.kind = "Pod".to_string();
    pod.metadata.uid = uuid::Uuid::new_v4().to_string();
    pod.metadata.created_at = Some(now);
    pod.metadata.updated_at = Some(now);
    pod.status = PodStatus {
        phase: "Pending".to_string(),
        conditions: vec![PodCondition {
            condition_type: "PodScheduled".to_string(),
            status: "False".to_string(),
            last_transition_time: Some(now),
            reason: "Unschedulable".to_string(),
            message: "Pod is waiting to be scheduled".to_string(),
        }],
        ..Default::default()
    };

    let mut resource = Resource::new(
        "Pod",
        pod.metadata.namespace.as_str(),
        pod.metadata.name.as_str(),
    );
    resource.id = pod.metadata.uid.clone();
    resource.metadata =
        serde_json::to_string(&pod.metadata).map_err(ApiError::serialization)?;
    resource.spec = serde_json::to_string(&pod.spec).map_err(ApiError::serialization)?;
    resource.status = serde_json::to_string(&pod.status).map_err(ApiError::serialization)?;

    ctx.repository
        .create_resource(&resource)
        .map_err(|e| ApiError::storage("Pod", e))?;
    Ok((StatusCode::CREATED, Json(pod)))
}

pub(crate) async fn get_pod(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<Pod>, ApiError> {
    get_pod_in_namespace(&ctx, DEFAULT_NAMESPACE, &name)
}

pub(crate) async fn get_namespaced_pod(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Pod>, ApiError> {
    get_pod_in_namespace(&ctx, &namespace, &name)
}

fn get_pod_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
) -> Result<Json<Pod>, ApiError> {
    let resource = ctx
        .repository
        .get_resource("Pod", namespace, name)
        .map_err(|e| ApiError::storage("Pod", e))?;
    let pod = Pod::from_resource(&resource).map_err(|e| ApiError::parse("pod", e))?;
    Ok(Json(pod))
}

pub(crate) async fn update_pod(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Pod>, ApiError> {
    update_pod_in_namespace(&ctx, DEFAULT_NAMESPACE, &name, body)
}

pub(crate) async fn update_namespaced_pod(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Pod>, ApiError> {
    update_pod_in_namespace(&ctx, &namespace, &name, body)
}

fn update_pod_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
    body: Bytes,
) -> Result<Json<Pod>, ApiError> {
    let mut pod: Pod = parse_json(&body)?;
    if pod.metadata.namespace.is_empty() {
        pod.metadata.namespace = namespace.to_string();
    }
    if pod.metadata.name != name {
        return Err(ApiError::name_mismatch("Pod"));
    }
    if pod.metadata.namespace != namespace {
        return Err(ApiError::namespace_mismatch("Pod"));
    }
    validate_pod(&pod).map_err(|e| ApiError::validation("Pod", e))?;

    let existing = ctx
        .repository
        .get_resource("Pod", namespace, name)
        .map_err(|e| ApiError::storage("Pod", e))?;

    // Identity fields are server-owned and survive the replacement.
    pod.metadata.uid = existing.id.clone();
    pod.metadata.created_at = Some(existing.created_at);
    pod.metadata.updated_at = Some(Utc::now());

    let mut resource = existing;
    resource.metadata =
        serde_json::to_string(&pod.metadata).map_err(ApiError::serialization)?;
    resource.spec = serde_json::to_string(&pod.spec).map_err(ApiError::serialization)?;
    resource.status = serde_json::to_string(&pod.status).map_err(ApiError::serialization)?;

    ctx.repository
        .update_resource(&resource)
        .map_err(|e| ApiError::storage("Pod", e))?;
    Ok(Json(pod))
}

/// PUT .../pods/{name}/status — the node agent's status report path.
pub(crate) async fn update_pod_status(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Pod>, ApiError> {
    let status: PodStatus = parse_json(&body)?;
    let mut resource = ctx
        .repository
        .get_resource("Pod", &namespace, &name)
        .map_err(|e| ApiError::storage("Pod", e))?;
    resource.status = serde_json::to_string(&status).map_err(ApiError::serialization)?;
    ctx.repository
        .update_resource(&resource)
        .map_err(|e| ApiError::storage("Pod", e))?;

    let pod = Pod::from_resource(&resource).map_err(|e| ApiError::parse("pod", e))?;
    Ok(Json(pod))
}

pub(crate) async fn delete_pod(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    delete_pod_in_namespace(&ctx, DEFAULT_NAMESPACE, &name)
}

pub(crate) async fn delete_namespaced_pod(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    delete_pod_in_namespace(&ctx, &namespace, &name)
}

fn delete_pod_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
) -> Result<Json<DeleteResponse>, ApiError> {
    ctx.repository
        .delete_resource("Pod", namespace, name)
        .map_err(|e| ApiError::storage("Pod", e))?;
    Ok(Json(DeleteResponse::new("Pod")))
}

pub(crate) async fn list_pods(State(ctx): State<ApiContext>) -> Result<Json<PodList>, ApiError> {
    list_pods_in_namespace(&ctx, "")
}

pub(crate) async fn list_namespaced_pods(
    State(ctx): State<ApiContext>,
    Path(namespace): Path<String>,
) -> Result<Json<PodList>, ApiError> {
    list_pods_in_namespace(&ctx, &namespace)
}

fn list_pods_in_namespace(ctx: &ApiContext, namespace: &str) -> Result<Json<PodList>, ApiError> {
    let resources = ctx
        .repository
        .list_resources("Pod", namespace)
        .map_err(|e| ApiError::storage("Pod", e))?;

    let mut pods = Vec::new();
    for resource in &resources {
        match Pod::from_resource(resource) {
            Ok(pod) => pods.push(pod),
            Err(err) => log_warn(
                COMPONENT,
                "Skipping unparseable pod in listing",
                &[
                    ("namespace", resource.namespace.as_str()),
                    ("pod", resource.name.as_str()),
                    ("error", err.to_string().as_str()),
                ],
            ),
        }
    }
    Ok(Json(PodList::new(pods)))
}
