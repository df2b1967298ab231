use serde::{Deserialize, Serialize};
use std::error::Error;

use super::pod::{LabelSelector, ObjectMeta, PodSpec};
use crate::stratus::storage::Resource;
use crate::stratus::util::with_context;

/// Data a pod created from a template should have.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollingUpdateStrategy {
    #[serde(rename = "maxUnavailable", default)]
    pub max_unavailable: i32,
    #[serde(rename = "maxSurge", default)]
    pub max_surge: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentStrategy {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub strategy_type: String,
    #[serde(rename = "rollingUpdate", skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateStrategy>,
}

/// Desired behavior of a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub replicas: i32,
    #[serde(default)]
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
    #[serde(default)]
    pub strategy: DeploymentStrategy,
}

/// Most recently observed status of a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,
}

/// Declarative update surface for pods. Deployments are persisted and served
/// over the API; the control plane does not reconcile them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
}

impl Default for Deployment {
    fn default() -> Self {
        Deployment {
            api_version: "v1".to_string(),
            kind: "Deployment".to_string(),
            metadata: ObjectMeta::default(),
            spec: DeploymentSpec::default(),
            status: DeploymentStatus::default(),
        }
    }
}

impl Deployment {
    pub fn from_resource(resource: &Resource) -> Result<Deployment, Box<dyn Error + Send + Sync>> {
        let mut metadata: ObjectMeta = if resource.metadata.is_empty() {
            ObjectMeta::default()
        } else {
            serde_json::from_str(&resource.metadata).map_err(|e| {
                with_context(
                    e,
                    format!(
                        "failed to parse deployment metadata for {}/{}",
                        resource.namespace, resource.name
                    ),
                )
            })?
        };
        metadata.name = resource.name.clone();
        metadata.namespace = resource.namespace.clone();
        metadata.uid = resource.id.clone();
        metadata.created_at = Some(resource.created_at);
        metadata.updated_at = Some(resource.updated_at);

        let spec: DeploymentSpec = serde_json::from_str(&resource.spec).map_err(|e| {
            with_context(
                e,
                format!(
                    "failed to parse deployment spec for {}/{}",
                    resource.namespace, resource.name
                ),
            )
        })?;
        let status: DeploymentStatus = if resource.status.is_empty() {
            DeploymentStatus::default()
        } else {
            serde_json::from_str(&resource.status).map_err(|e| {
                with_context(
                    e,
                    format!(
                        "failed to parse deployment status for {}/{}",
                        resource.namespace, resource.name
                    ),
                )
            })?
        };

        Ok(Deployment {
            api_version: "v1".to_string(),
            kind: "Deployment".to_string(),
            metadata,
            spec,
            status,
        })
    }
}

/// List wrapper returned by the deployments collection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentList {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub items: Vec<Deployment>,
}

impl DeploymentList {
    pub fn new(items: Vec<Deployment>) -> Self {
        DeploymentList {
            api_version: "v1".to_string(),
            kind: "DeploymentList".to_string(),
            items,
        }
    }
}
