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

use regex::Regex;
use std::error::Error;
use std::fmt;
use std::sync::OnceLock;

use super::deployment::{Deployment, DeploymentSpec};
use super::node::Node;
use super::pod::{Container, ObjectMeta, Pod, PodSpec};
use super::service::{Service, ServiceSpec};

const MAX_NAME_LENGTH: usize = 253;
const RESTART_POLICIES: [&str; 3] = ["Always", "OnFailure", "Never"];
const SERVICE_TYPES: [&str; 3] = ["ClusterIP", "NodePort", "LoadBalancer"];

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "validation error on field '{}': {}",
            self.field, self.message
        )
    }
}

/// All validation failures found for one object.
#[derive(Debug, Clone, Default)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(ValidationError::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

impl Error for ValidationErrors {}

/// DNS subdomain: lowercase alphanumeric labels separated by dots, dashes
/// allowed inside a label, at most 253 characters overall.
pub fn is_valid_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("name pattern compiles")
    });
    name.len() <= MAX_NAME_LENGTH && pattern.is_match(name)
}

fn validate_object_meta(meta: &ObjectMeta, errors: &mut ValidationErrors) {
    if meta.name.is_empty() {
        errors.push("metadata.name", "name is required");
    } else if !is_valid_name(&meta.name) {
        errors.push("metadata.name", "name must be a valid DNS subdomain");
    }

    if !meta.namespace.is_empty() && !is_valid_name(&meta.namespace) {
        errors.push(
            "metadata.namespace",
            "namespace must be a valid DNS subdomain",
        );
    }
}

fn validate_container(container: &Container, field_path: &str, errors: &mut ValidationErrors) {
    if container.name.is_empty() {
        errors.push(format!("{field_path}.name"), "name is required");
    } else if !is_valid_name(&container.name) {
        errors.push(
            format!("{field_path}.name"),
            "name must be a valid DNS subdomain",
        );
    }

    if container.image.is_empty() {
        errors.push(format!("{field_path}.image"), "image is required");
    }

    for (i, port) in container.ports.iter().enumerate() {
        if port.container_port == 0 {
            errors.push(
                format!("{field_path}.ports[{i}].containerPort"),
                "must be between 1 and 65535",
            );
        }
    }
}

fn validate_pod_spec(spec: &PodSpec, field_prefix: &str, errors: &mut ValidationErrors) {
    if spec.containers.is_empty() {
        errors.push(
            format!("{field_prefix}.containers"),
            "at least one container is required",
        );
    }

    for (i, container) in spec.containers.iter().enumerate() {
        validate_container(container, &format!("{field_prefix}.containers[{i}]"), errors);
    }

    if !spec.restart_policy.is_empty() && !RESTART_POLICIES.contains(&spec.restart_policy.as_str())
    {
        errors.push(
            format!("{field_prefix}.restartPolicy"),
            "must be one of: Always, OnFailure, Never",
        );
    }
}

fn validate_service_spec(spec: &ServiceSpec, errors: &mut ValidationErrors) {
    if spec.ports.is_empty() {
        errors.push("spec.ports", "at least one port is required");
    }

    for (i, port) in spec.ports.iter().enumerate() {
        if port.port == 0 {
            errors.push(format!("spec.ports[{i}].port"), "must be between 1 and 65535");
        }
    }

    if !spec.service_type.is_empty() && !SERVICE_TYPES.contains(&spec.service_type.as_str()) {
        errors.push(
            "spec.type",
            "must be one of: ClusterIP, NodePort, LoadBalancer",
        );
    }
}

fn validate_deployment_spec(spec: &DeploymentSpec, errors: &mut ValidationErrors) {
    if spec.replicas < 0 {
        errors.push("spec.replicas", "must be non-negative");
    }
    validate_pod_spec(&spec.template.spec, "spec.template.spec", errors);
}

pub fn validate_pod(pod: &Pod) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    validate_object_meta(&pod.metadata, &mut errors);
    validate_pod_spec(&pod.spec, "spec", &mut errors);
    errors.into_result()
}

pub fn validate_service(service: &Service) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    validate_object_meta(&service.metadata, &mut errors);
    validate_service_spec(&service.spec, &mut errors);
    errors.into_result()
}

pub fn validate_deployment(deployment: &Deployment) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    validate_object_meta(&deployment.metadata, &mut errors);
    validate_deployment_spec(&deployment.spec, &mut errors);
    errors.into_result()
}

pub fn validate_node(node: &Node) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    validate_object_meta(&node.metadata, &mut errors);
    errors.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratus::k8s::deployment::PodTemplateSpec;
    use crate::stratus::k8s::service::ServicePort;

    fn valid_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "web-1".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "web".to_string(),
                    image: "nginx:1.27".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn dns_subdomain_names() {
        assert!(is_valid_name("web"));
        assert!(is_valid_name("web-1"));
        assert!(is_valid_name("web.example.com"));
        assert!(!is_valid_name("Web"));
        assert!(!is_valid_name("-web"));
        assert!(!is_valid_name("web-"));
        assert!(!is_valid_name("web..example"));
        assert!(!is_valid_name(&"a".repeat(254)));
    }

    #[test]
    fn pod_without_containers_is_rejected() {
        let mut pod = valid_pod();
        pod.spec.containers.clear();
        let err = validate_pod(&pod).unwrap_err();
        assert!(err.to_string().contains("at least one container"));
    }

    #[test]
    fn pod_with_bad_restart_policy_is_rejected() {
        let mut pod = valid_pod();
        pod.spec.restart_policy = "Sometimes".to_string();
        let err = validate_pod(&pod).unwrap_err();
        assert!(err.to_string().contains("restartPolicy"));
    }

    #[test]
    fn pod_with_empty_image_is_rejected() {
        let mut pod = valid_pod();
        pod.spec.containers[0].image.clear();
        let err = validate_pod(&pod).unwrap_err();
        assert!(err.to_string().contains("image is required"));
    }

    #[test]
    fn service_requires_ports_and_known_type() {
        let mut service = Service {
            metadata: ObjectMeta {
                name: "svc".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(validate_service(&service).is_err());

        service.spec.ports.push(ServicePort {
            port: 80,
            ..Default::default()
        });
        assert!(validate_service(&service).is_ok());

        service.spec.service_type = "Magic".to_string();
        assert!(validate_service(&service).is_err());
    }

    #[test]
    fn deployment_replicas_must_be_non_negative() {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: "web".to_string(),
                ..Default::default()
            },
            spec: DeploymentSpec {
                replicas: -1,
                template: PodTemplateSpec {
                    spec: valid_pod().spec,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let err = validate_deployment(&deployment).unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }
}
