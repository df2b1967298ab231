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
use crate::stratus::k8s::service::{Service, ServiceList, ServiceStatus};
use crate::stratus::k8s::validation::validate_service;
use crate::stratus::logger::log_warn;
use crate::stratus::storage::Resource;

const COMPONENT: &str = "api-services";

pub(crate) async fn create_service(
    State(ctx): State<ApiContext>,
    body: Bytes,
) -> Result<(StatusCode, Json<Service>), ApiError> {
    create_service_in_namespace(&ctx, DEFAULT_NAMESPACE, body)
}

pub(crate) async fn create_namespaced_service(
    State(ctx): State<ApiContext>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Service>), ApiError> {
    create_service_in_namespace(&ctx, &namespace, body)
}

fn create_service_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    body: Bytes,
) -> Result<(StatusCode, Json<Service>), ApiError> {
    let mut service: Service = parse_json(&body)?;
    if service.metadata.namespace.is_empty() {
        service.metadata.namespace = namespace.to_string();
    }
    if service.metadata.namespace != namespace {
        return Err(ApiError::namespace_mismatch("Service"));
    }
    validate_service(&service).map_err(|e| ApiError::validation("Service", e))?;

    let now = Utc::now();
    service.api_version = "v1".to_string();
    service.kind = "Service".to_string();
    service.metadata.uid = uuid::Uuid::new_v4().to_string();
    service.metadata.created_at = Some(now);
    service.metadata.updated_at = Some(now);
    // Endpoints are owned by the reconciler; a new service starts empty.
    service.status = ServiceStatus::default();

    let mut resource = Resource::new(
        "Service",
        service.metadata.namespace.as_str(),
        service.metadata.name.as_str(),
    );
    resource.id = service.metadata.uid.clone();
    resource.metadata =
        serde_json::to_string(&service.metadata).map_err(ApiError::serialization)?;
    resource.spec = serde_json::to_string(&service.spec).map_err(ApiError::serialization)?;
    resource.status = serde_json::to_string(&service.status).map_err(ApiError::serialization)?;

    ctx.repository
        .create_resource(&resource)
        .map_err(|e| ApiError::storage("Service", e))?;
    Ok((StatusCode::CREATED, Json(service)))
}

pub(crate) async fn get_service(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<Service>, ApiError> {
    get_service_in_namespace(&ctx, DEFAULT_NAMESPACE, &name)
}

pub(crate) async fn get_namespaced_service(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Service>, ApiError> {
    get_service_in_namespace(&ctx, &namespace, &name)
}

fn get_service_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
) -> Result<Json<Service>, ApiError> {
    let resource = ctx
        .repository
        .get_resource("Service", namespace, name)
        .map_err(|e| ApiError::storage("Service", e))?;
    let service = Service::from_resource(&resource).map_err(|e| ApiError::parse("service", e))?;
    Ok(Json(service))
}

pub(crate) async fn update_service(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Service>, ApiError> {
    update_service_in_namespace(&ctx, DEFAULT_NAMESPACE, &name, body)
}

pub(crate) async fn update_namespaced_service(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Service>, ApiError> {
    update_service_in_namespace(&ctx, &namespace, &name, body)
}

fn update_service_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
    body: Bytes,
) -> Result<Json<Service>, ApiError> {
    let mut service: Service = parse_json(&body)?;
    if service.metadata.namespace.is_empty() {
        service.metadata.namespace = namespace.to_string();
    }
    if service.metadata.name != name {
        return Err(ApiError::name_mismatch("Service"));
    }
    if service.metadata.namespace != namespace {
        return Err(ApiError::namespace_mismatch("Service"));
    }
    validate_service(&service).map_err(|e| ApiError::validation("Service", e))?;

    let existing = ctx
        .repository
        .get_resource("Service", namespace, name)
        .map_err(|e| ApiError::storage("Service", e))?;

    service.metadata.uid = existing.id.clone();
    service.metadata.created_at = Some(existing.created_at);
    service.metadata.updated_at = Some(Utc::now());
    // The stored endpoints are the reconciler's output; a spec update must
    // not clobber them.
    service.status = if existing.status.is_empty() {
        ServiceStatus::default()
    } else {
        serde_json::from_str(&existing.status).map_err(|e| ApiError::parse("service", e))?
    };

    let mut resource = existing;
    resource.metadata =
        serde_json::to_string(&service.metadata).map_err(ApiError::serialization)?;
    resource.spec = serde_json::to_string(&service.spec).map_err(ApiError::serialization)?;
    resource.status = serde_json::to_string(&service.status).map_err(ApiError::serialization)?;

    ctx.repository
        .update_resource(&resource)
        .map_err(|e| ApiError::storage("Service", e))?;
    Ok(Json(service))
}

pub(crate) async fn delete_service(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    delete_service_in_namespace(&ctx, DEFAULT_NAMESPACE, &name)
}

pub(crate) async fn delete_namespaced_service(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    delete_service_in_namespace(&ctx, &namespace, &name)
}

fn delete_service_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
) -> Result<Json<DeleteResponse>, ApiError> {
    ctx.repository
        .delete_resource("Service", namespace, name)
        .map_err(|e| ApiError::storage("Service", e))?;
    Ok(Json(DeleteResponse::new("Service")))
}

pub(crate) async fn list_services(
    State(ctx): State<ApiContext>,
) -> Result<Json<ServiceList>, ApiError> {
    list_services_in_namespace(&ctx, "")
}

pub(crate) async fn list_namespaced_services(
    State(ctx): State<ApiContext>,
    Path(namespace): Path<String>,
) -> Result<Json<ServiceList>, ApiError> {
    list_services_in_namespace(&ctx, &namespace)
}

fn list_services_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
) -> Result<Json<ServiceList>, ApiError> {
    let resources = ctx
        .repository
        .list_resources("Service", namespace)
        .map_err(|e| ApiError::storage("Service", e))?;

    let mut services = Vec::new();
    for resource in &resources {
        match Service::from_resource(resource) {
            Ok(service) => services.push(service),
            Err(err) => log_warn(
                COMPONENT,
                "Skipping unparseable service in listing",
                &[
                    ("namespace", resource.namespace.as_str()),
                    ("service", resource.name.as_str()),
                    ("error", err.to_string().as_str()),
                ],
            ),
        }
    }
    Ok(Json(ServiceList::new(services)))
}
