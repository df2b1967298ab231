use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;

use super::pod::ObjectMeta;
use crate::stratus::storage::Resource;
use crate::stratus::util::with_context;

/// A single service port mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "targetPort", default)]
    pub target_port: u16,
}

impl ServicePort {
    /// The port traffic is forwarded to; falls back to `port` when unset.
    pub fn resolved_target(&self) -> u16 {
        if self.target_port == 0 {
            self.port
        } else {
            self.target_port
        }
    }
}

/// Attributes a user creates on a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub service_type: String,
}

/// A routable backend derived from a ready pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub ready: bool,
    #[serde(rename = "nodeName", default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
}

/// Current status of a service. The endpoints list is owned by the endpoint
/// reconciler; no other writer may touch it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

/// A named abstraction over a set of pods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub status: ServiceStatus,
}

impl Default for Service {
    fn default() -> Self {
        Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: ObjectMeta::default(),
            spec: ServiceSpec::default(),
            status: ServiceStatus::default(),
        }
    }
}

impl Service {
    pub fn from_resource(resource: &Resource) -> Result<Service, Box<dyn Error + Send + Sync>> {
        let mut metadata: ObjectMeta = if resource.metadata.is_empty() {
            ObjectMeta::default()
        } else {
            serde_json::from_str(&resource.metadata).map_err(|e| {
                with_context(
                    e,
                    format!(
                        "failed to parse service metadata for {}/{}",
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

        let spec: ServiceSpec = serde_json::from_str(&resource.spec).map_err(|e| {
            with_context(
                e,
                format!(
                    "failed to parse service spec for {}/{}",
                    resource.namespace, resource.name
                ),
            )
        })?;
        let status: ServiceStatus = if resource.status.is_empty() {
            ServiceStatus::default()
        } else {
            serde_json::from_str(&resource.status).map_err(|e| {
                with_context(
                    e,
                    format!(
                        "failed to parse service status for {}/{}",
                        resource.namespace, resource.name
                    ),
                )
            })?
        };

        Ok(Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata,
            spec,
            status,
        })
    }
}

/// List wrapper returned by the services collection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceList {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub items: Vec<Service>,
}

impl ServiceList {
    pub fn new(items: Vec<Service>) -> Self {
        ServiceList {
            api_version: "v1".to_string(),
            kind: "ServiceList".to_string(),
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_port_defaults_to_port() {
        let explicit = ServicePort {
            port: 80,
            target_port: 8080,
            ..Default::default()
        };
        assert_eq!(explicit.resolved_target(), 8080);

        let implicit = ServicePort {
            port: 443,
            ..Default::default()
        };
        assert_eq!(implicit.resolved_target(), 443);
    }

    #[test]
    fn endpoints_serialize_with_node_name() {
        let endpoint = Endpoint {
            ip: "10.0.0.4".to_string(),
            port: 8080,
            ready: true,
            node_name: "worker-2".to_string(),
        };
        let value = serde_json::to_value(&endpoint).expect("to value");
        assert_eq!(value["nodeName"], "worker-2");
        assert_eq!(value["ready"], true);
    }
}
