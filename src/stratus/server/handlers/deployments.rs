use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;

use super::error::ApiError;
use super::{parse_json, ApiContext, DeleteResponse, DEFAULT_NAMESPACE};
use crate::stratus::k8s::deployment::{Deployment, DeploymentList};
use crate::stratus::k8s::validation::validate_deployment;
use crate::stratus::logger::log_warn;
use crate::stratus::storage::Resource;

const COMPONENT: &str = "api-deployments";

pub(crate) async fn create_deployment(
    State(ctx): State<ApiContext>,
    body: Bytes,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    create_deployment_in_namespace(&ctx, DEFAULT_NAMESPACE, body)
}

pub(crate) async fn create_namespaced_deployment(
    State(ctx): State<ApiContext>,
    Path(namespace): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    create_deployment_in_namespace(&ctx, &namespace, body)
}

fn create_deployment_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    body: Bytes,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let mut deployment: Deployment = parse_json(&body)?;
    if deployment.metadata.namespace.is_empty() {
        deployment.metadata.namespace = namespace.to_string();
    }
    if deployment.metadata.namespace != namespace {
        return Err(ApiError::namespace_mismatch("Deployment"));
    }
    validate_deployment(&deployment).map_err(|e| ApiError::validation("Deployment", e))?;

    let now = Utc::now();
    deployment.api_version = "v1".to_string();
    deployment.kind = "Deployment".to_string();
    deployment.metadata.uid = uuid::Uuid::new_v4().to_string();
    deployment.metadata.created_at = Some(now);
    deployment.metadata.updated_at = Some(now);

    let mut resource = Resource::new(
        "Deployment",
        deployment.metadata.namespace.as_str(),
        deployment.metadata.name.as_str(),
    );
    resource.id = deployment.metadata.uid.clone();
    resource.metadata =
        serde_json::to_string(&deployment.metadata).map_err(ApiError::serialization)?;
    resource.spec = serde_json::to_string(&deployment.spec).map_err(ApiError::serialization)?;
    resource.status =
        serde_json::to_string(&deployment.status).map_err(ApiError::serialization)?;

    ctx.repository
        .create_resource(&resource)
        .map_err(|e| ApiError::storage("Deployment", e))?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub(crate) async fn get_deployment(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    get_deployment_in_namespace(&ctx, DEFAULT_NAMESPACE, &name)
}

pub(crate) async fn get_namespaced_deployment(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Deployment>, ApiError> {
    get_deployment_in_namespace(&ctx, &namespace, &name)
}

fn get_deployment_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
) -> Result<Json<Deployment>, ApiError> {
    let resource = ctx
        .repository
        .get_resource("Deployment", namespace, name)
        .map_err(|e| ApiError::storage("Deployment", e))?;
    let deployment =
        Deployment::from_resource(&resource).map_err(|e| ApiError::parse("deployment", e))?;
    Ok(Json(deployment))
}

pub(crate) async fn update_deployment(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Deployment>, ApiError> {
    update_deployment_in_namespace(&ctx, DEFAULT_NAMESPACE, &name, body)
}

pub(crate) async fn update_namespaced_deployment(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Deployment>, ApiError> {
    update_deployment_in_namespace(&ctx, &namespace, &name, body)
}

fn update_deployment_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
    body: Bytes,
) -> Result<Json<Deployment>, ApiError> {
    let mut deployment: Deployment = parse_json(&body)?;
    if deployment.metadata.namespace.is_empty() {
        deployment.metadata.namespace = namespace.to_string();
    }
    if deployment.metadata.name != name {
        return Err(ApiError::name_mismatch("Deployment"));
    }
    if deployment.metadata.namespace != namespace {
        return Err(ApiError::namespace_mismatch("Deployment"));
    }
    validate_deployment(&deployment).map_err(|e| ApiError::validation("Deployment", e))?;

    let existing = ctx
        .repository
        .get_resource("Deployment", namespace, name)
        .map_err(|e| ApiError::storage("Deployment", e))?;

    deployment.metadata.uid = existing.id.clone();
    deployment.metadata.created_at = Some(existing.created_at);
    deployment.metadata.updated_at = Some(Utc::now());

    let mut resource = existing;
    resource.metadata =
        serde_json::to_string(&deployment.metadata).map_err(ApiError::serialization)?;
    resource.spec = serde_json::to_string(&deployment.spec).map_err(ApiError::serialization)?;
    resource.status =
        serde_json::to_string(&deployment.status).map_err(ApiError::serialization)?;

    ctx.repository
        .update_resource(&resource)
        .map_err(|e| ApiError::storage("Deployment", e))?;
    Ok(Json(deployment))
}

pub(crate) async fn delete_deployment(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    delete_deployment_in_namespace(&ctx, DEFAULT_NAMESPACE, &name)
}

pub(crate) async fn delete_namespaced_deployment(
    State(ctx): State<ApiContext>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    delete_deployment_in_namespace(&ctx, &namespace, &name)
}

fn delete_deployment_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
    name: &str,
) -> Result<Json<DeleteResponse>, ApiError> {
    ctx.repository
        .delete_resource("Deployment", namespace, name)
        .map_err(|e| ApiError::storage("Deployment", e))?;
    Ok(Json(DeleteResponse::new("Deployment")))
}

pub(crate) async fn list_deployments(
    State(ctx): State<ApiContext>,
) -> Result<Json<DeploymentList>, ApiError> {
    list_deployments_in_namespace(&ctx, "")
}

pub(crate) async fn list_namespaced_deployments(
    State(ctx): State<ApiContext>,
    Path(namespace): Path<String>,
) -> Result<Json<DeploymentList>, ApiError> {
    list_deployments_in_namespace(&ctx, &namespace)
}

fn list_deployments_in_namespace(
    ctx: &ApiContext,
    namespace: &str,
) -> Result<Json<DeploymentList>, ApiError> {
    let resources = ctx
        .repository
        .list_resources("Deployment", namespace)
        .map_err(|e| ApiError::storage("Deployment", e))?;

    let mut deployments = Vec::new();
    for resource in &resources {
        match Deployment::from_resource(resource) {
            Ok(deployment) => deployments.push(deployment),
            Err(err) => log_warn(
                COMPONENT,
                "Skipping unparseable deployment in listing",
                &[
                    ("namespace", resource.namespace.as_str()),
                    ("deployment", resource.name.as_str()),
                    ("error", err.to_string().as_str()),
                ],
            ),
        }
    }
    Ok(Json(DeploymentList::new(deployments)))
}
