use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::spawn_tick_loop;
use crate::stratus::k8s::pod::{Container, Pod};
use crate::stratus::k8s::service::{Endpoint, Service, ServicePort, ServiceStatus};
use crate::stratus::logger::{log_error, log_info};
use crate::stratus::storage::{Repository, Resource};
use crate::stratus::util::with_context;

const COMPONENT: &str = "endpoint-reconciler";
const TICK_PERIOD: Duration = Duration::from_secs(10);

/// Rebuilds every service's endpoint list from the ready pods matching its
/// selector, writing back only when the set actually changed.
pub struct EndpointReconciler {
    repository: Repository,
}

impl EndpointReconciler {
    pub fn new(repository: Repository) -> Self {
        EndpointReconciler { repository }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_tick_loop(COMPONENT, TICK_PERIOD, cancel, move || {
            self.reconcile_services()
        })
    }

    /// One reconciler tick: a single service+pod listing shared across all
    /// services.
    pub fn reconcile_services(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let services = self
            .repository
            .list_resources("Service", "")
            .map_err(|e| with_context(e, "failed to list services"))?;
        let pods = self
            .repository
            .list_resources("Pod", "")
            .map_err(|e| with_context(e, "failed to list pods"))?;

        for service in &services {
            if let Err(err) = self.reconcile_service(service, &pods) {
                log_error(
                    COMPONENT,
                    "Failed to reconcile service",
                    &[
                        ("namespace", service.namespace.as_str()),
                        ("service", service.name.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
            }
        }
        Ok(())
    }

    fn reconcile_service(
        &self,
        resource: &Resource,
        pods: &[Resource],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let service = Service::from_resource(resource)?;
        let matching = matching_pods(&service, pods);
        let endpoints = build_endpoints(&matching, &service.spec.ports);

        if endpoints_equal(&service.status.endpoints, &endpoints) {
            return Ok(());
        }

        log_info(
            COMPONENT,
            "Updating service endpoints",
            &[
                ("namespace", resource.namespace.as_str()),
                ("service", resource.name.as_str()),
                ("endpoints", endpoints.len().to_string().as_str()),
            ],
        );

        let status = ServiceStatus { endpoints };
        let mut updated = resource.clone();
        updated.status = serde_json::to_string(&status)
            .map_err(|e| with_context(e, "failed to serialize service status"))?;
        self.repository
            .update_resource(&updated)
            .map_err(|e| with_context(e, "failed to persist service endpoints"))?;
        Ok(())
    }
}

/// Pods in the service's namespace that match its selector and are ready to
/// receive traffic. Unparseable pods are skipped for this tick.
fn matching_pods(service: &Service, pods: &[Resource]) -> Vec<Pod> {
    let mut matching = Vec::new();
    for resource in pods {
        if resource.namespace != service.metadata.namespace {
            continue;
        }
        let pod = match Pod::from_resource(resource) {
            Ok(pod) => pod,
            Err(err) => {
                log_error(
                    COMPONENT,
                    "Skipping unparseable pod",
                    &[
                        ("namespace", resource.namespace.as_str()),
                        ("pod", resource.name.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                continue;
            }
        };
        if matches_selector(&service.spec.selector, &pod.metadata.labels) && pod_ready(&pod) {
            matching.push(pod);
        }
    }
    matching
}

/// An empty selector matches nothing; otherwise every selector pair must be
/// present in the pod's labels.
pub fn matches_selector(
    selector: &HashMap<String, String>,
    labels: &HashMap<String, String>,
) -> bool {
    if selector.is_empty() {
        return false;
    }
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Ready means Running with an IP, plus either an explicit Ready condition
/// reporting True or, absent one, every reported container ready. A pod with
/// no container statuses at all counts as ready.
pub fn pod_ready(pod: &Pod) -> bool {
    if pod.status.phase != "Running" {
        return false;
    }
    if pod.status.pod_ip.is_empty() {
        return false;
    }

    for condition in &pod.status.conditions {
        if condition.condition_type == "Ready" {
            return condition.status == "True";
        }
    }

    if !pod.status.container_statuses.is_empty() {
        return pod.status.container_statuses.iter().all(|c| c.ready);
    }

    true
}

/// One endpoint per (ready pod, service port).
pub fn build_endpoints(pods: &[Pod], ports: &[ServicePort]) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    for pod in pods {
        for service_port in ports {
            let target = service_port.resolved_target();
            let mut port = find_container_port(&pod.spec.containers, target, &service_port.name);
            if port == 0 {
                port = target;
            }
            endpoints.push(Endpoint {
                ip: pod.status.pod_ip.clone(),
                port,
                ready: true,
                node_name: pod.spec.node_name.clone(),
            });
        }
    }
    endpoints
}

/// The container port matching the service port by name, or failing that by
/// number; zero when neither matches.
fn find_container_port(containers: &[Container], target_port: u16, port_name: &str) -> u16 {
    for container in containers {
        for port in &container.ports {
            if !port_name.is_empty() && port.name == port_name {
                return port.container_port;
            }
            if port.container_port == target_port {
                return port.container_port;
            }
        }
    }
    0
}

/// Order-independent equality keyed on (ip, port) with value equality on
/// (ready, nodeName).
pub fn endpoints_equal(a: &[Endpoint], b: &[Endpoint]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let index: HashMap<(String, u16), (bool, String)> = b
        .iter()
        .map(|e| ((e.ip.clone(), e.port), (e.ready, e.node_name.clone())))
        .collect();

    a.iter().all(|e| {
        index.get(&(e.ip.clone(), e.port)) == Some(&(e.ready, e.node_name.clone()))
    })
}
