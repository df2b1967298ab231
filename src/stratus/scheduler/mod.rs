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

pub mod policy;

use chrono::Utc;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::stratus::controller::spawn_tick_loop;
use crate::stratus::k8s::node::Node;
use crate::stratus::k8s::pod::{Pod, PodCondition};
use crate::stratus::logger::{log_error, log_info};
use crate::stratus::storage::{Repository, Resource};
use crate::stratus::util::{new_error, with_context};
use policy::{BasicPolicy, PlacementPolicy, ResourcePolicy};

const COMPONENT: &str = "scheduler";
const TICK_PERIOD: Duration = Duration::from_secs(5);

/// Binds every unbound pod to exactly one ready node.
pub struct Scheduler {
    repository: Repository,
    policy: Arc<dyn PlacementPolicy>,
    // Select-and-bind is a critical section: the loop itself is single
    // threaded, the mutex makes the scheduler safe to embed behind other
    // callers.
    scheduling_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(repository: Repository, policy: Arc<dyn PlacementPolicy>) -> Self {
        Scheduler {
            repository,
            policy,
            scheduling_lock: Mutex::new(()),
        }
    }

    /// Pick the placement policy from the `--resource-scheduler` flag.
    pub fn with_flag(repository: Repository, resource_aware: bool) -> Self {
        let policy: Arc<dyn PlacementPolicy> = if resource_aware {
            Arc::new(ResourcePolicy)
        } else {
            Arc::new(BasicPolicy)
        };
        Self::new(repository, policy)
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        log_info(
            COMPONENT,
            "Starting scheduler",
            &[("policy", self.policy.name())],
        );
        spawn_tick_loop(COMPONENT, TICK_PERIOD, cancel, move || {
            self.schedule_pending_pods()
        })
    }

    /// One scheduling tick over all pending pods.
    pub fn schedule_pending_pods(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let pending = self.pending_pods()?;
        if pending.is_empty() {
            return Ok(());
        }

        log_info(
            COMPONENT,
            "Found pending pods to schedule",
            &[("count", pending.len().to_string().as_str())],
        );

        let nodes = self.ready_nodes()?;
        if nodes.is_empty() {
            return Err(new_error("no ready nodes available for scheduling"));
        }

        for pod in &pending {
            if let Err(err) = self.schedule_pod(pod, &nodes) {
                log_error(
                    COMPONENT,
                    "Failed to schedule pod",
                    &[
                        ("namespace", pod.metadata.namespace.as_str()),
                        ("pod", pod.metadata.name.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
            }
        }
        Ok(())
    }

    fn schedule_pod(&self, pod: &Pod, nodes: &[Node]) -> Result<(), Box<dyn Error + Send + Sync>> {
        let _guard = self
            .scheduling_lock
            .lock()
            .expect("scheduling lock poisoned");

        // Another caller may have bound this pod since the listing.
        match self.repository.get_binding(&pod.metadata.uid) {
            Ok(_) => return Ok(()),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(Box::new(err)),
        }

        let node = self.policy.select(pod, nodes)?;

        self.repository
            .bind_pod(&pod.metadata.uid, &node.metadata.uid)
            .map_err(|e| with_context(e, "failed to bind pod to node"))?;

        let mut scheduled = pod.clone();
        scheduled.spec.node_name = node.metadata.name.clone();
        scheduled.status.phase = "Scheduled".to_string();
        scheduled.status.conditions.push(PodCondition {
            condition_type: "PodScheduled".to_string(),
            status: "True".to_string(),
            last_transition_time: Some(Utc::now()),
            reason: "Scheduled".to_string(),
            message: format!(
                "Successfully assigned {}/{} to {}",
                pod.metadata.namespace, pod.metadata.name, node.metadata.name
            ),
        });

        let mut resource = Resource::new(
            "Pod",
            scheduled.metadata.namespace.clone(),
            scheduled.metadata.name.clone(),
        );
        resource.metadata = serde_json::to_string(&scheduled.metadata)
            .map_err(|e| with_context(e, "failed to serialize pod metadata"))?;
        resource.spec = serde_json::to_string(&scheduled.spec)
            .map_err(|e| with_context(e, "failed to serialize pod spec"))?;
        resource.status = serde_json::to_string(&scheduled.status)
            .map_err(|e| with_context(e, "failed to serialize pod status"))?;
        self.repository
            .update_resource(&resource)
            .map_err(|e| with_context(e, "failed to persist scheduled pod"))?;

        log_info(
            COMPONENT,
            "Scheduled pod",
            &[
                ("namespace", pod.metadata.namespace.as_str()),
                ("pod", pod.metadata.name.as_str()),
                ("node", node.metadata.name.as_str()),
            ],
        );
        Ok(())
    }

    /// Pods with no node assignment that are not already marked Scheduled.
    /// Records that fail to parse are skipped for this tick.
    fn pending_pods(&self) -> Result<Vec<Pod>, Box<dyn Error + Send + Sync>> {
        let resources = self
            .repository
            .list_resources("Pod", "")
            .map_err(|e| with_context(e, "failed to list pods"))?;

        let mut pending = Vec::new();
        for resource in &resources {
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
            if pod.spec.node_name.is_empty() && pod.status.phase != "Scheduled" {
                pending.push(pod);
            }
        }
        Ok(pending)
    }

    fn ready_nodes(&self) -> Result<Vec<Node>, Box<dyn Error + Send + Sync>> {
        let nodes = self
            .repository
            .list_nodes()
            .map_err(|e| with_context(e, "failed to list nodes"))?;
        Ok(nodes.into_iter().filter(Node::is_ready).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratus::k8s::node::{NodeCondition, NodeStatus, CONDITION_READY};
    use crate::stratus::k8s::pod::{Container, ObjectMeta, PodSpec, ResourceRequirements};
    use crate::stratus::storage::Database;
    use std::collections::HashMap;

    fn open_repository() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path()).expect("open database");
        let repo = db.repository();
        (dir, repo)
    }

    fn ready_node(name: &str, cpu: &str, memory: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            status: NodeStatus {
                allocatable: HashMap::from([
                    ("cpu".to_string(), cpu.to_string()),
                    ("memory".to_string(), memory.to_string()),
                ]),
                conditions: vec![NodeCondition {
                    condition_type: CONDITION_READY.to_string(),
                    status: "True".to_string(),
                    last_heartbeat_time: Some(Utc::now()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pending_pod_resource(name: &str, cpu: &str, memory: &str) -> Resource {
        let pod = Pod {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: "app:1".to_string(),
                    resources: ResourceRequirements {
                        requests: HashMap::from([
                            ("cpu".to_string(), cpu.to_string()),
                            ("memory".to_string(), memory.to_string()),
                        ]),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let mut resource = Resource::new("Pod", "default", name);
        resource.metadata = serde_json::to_string(&pod.metadata).unwrap();
        resource.spec = serde_json::to_string(&pod.spec).unwrap();
        resource.status = r#"{"phase":"Pending"}"#.to_string();
        resource
    }

    #[test]
    fn binds_pod_to_the_roomier_node_under_pressure() {
        let (_dir, repo) = open_repository();
        repo.create_node(&ready_node("small", "2", "4Gi")).unwrap();
        let large = repo.create_node(&ready_node("large", "8", "16Gi")).unwrap();
        let pod = repo
            .create_resource(&pending_pod_resource("p", "4", "8Gi"))
            .unwrap();

        let scheduler = Scheduler::with_flag(repo.clone(), true);
        scheduler.schedule_pending_pods().expect("tick");

        let stored = repo.get_resource("Pod", "default", "p").unwrap();
        let scheduled = Pod::from_resource(&stored).unwrap();
        assert_eq!(scheduled.spec.node_name, "large");
        assert_eq!(scheduled.status.phase, "Scheduled");
        assert!(scheduled
            .status
            .conditions
            .iter()
            .any(|c| c.condition_type == "PodScheduled" && c.status == "True"));

        let binding = repo.get_binding(&pod.id).expect("binding exists");
        assert_eq!(binding.node_id, large.metadata.uid);
    }

    #[test]
    fn no_ready_nodes_is_a_tick_error() {
        let (_dir, repo) = open_repository();
        repo.create_resource(&pending_pod_resource("p", "1", "1Gi"))
            .unwrap();

        let scheduler = Scheduler::with_flag(repo.clone(), true);
        let err = scheduler.schedule_pending_pods().unwrap_err();
        assert!(err.to_string().contains("no ready nodes"));
    }

    #[test]
    fn unsatisfiable_selector_leaves_pod_pending() {
        let (_dir, repo) = open_repository();
        repo.create_node(&ready_node("n1", "4", "8Gi")).unwrap();

        let mut resource = pending_pod_resource("p", "1", "1Gi");
        let mut spec: PodSpec = serde_json::from_str(&resource.spec).unwrap();
        spec.node_selector
            .insert("disk".to_string(), "ssd".to_string());
        resource.spec = serde_json::to_string(&spec).unwrap();
        let created = repo.create_resource(&resource).unwrap();

        let scheduler = Scheduler::with_flag(repo.clone(), true);
        scheduler.schedule_pending_pods().expect("tick succeeds");

        let stored = repo.get_resource("Pod", "default", "p").unwrap();
        let pod = Pod::from_resource(&stored).unwrap();
        assert_eq!(pod.spec.node_name, "");
        assert_ne!(pod.status.phase, "Scheduled");
        assert!(repo.get_binding(&created.id).unwrap_err().is_not_found());
    }

    #[test]
    fn already_bound_pods_are_skipped() {
        let (_dir, repo) = open_repository();
        let node = repo.create_node(&ready_node("n1", "4", "8Gi")).unwrap();
        let pod = repo
            .create_resource(&pending_pod_resource("p", "1", "1Gi"))
            .unwrap();
        repo.bind_pod(&pod.id, &node.metadata.uid).unwrap();

        let scheduler = Scheduler::with_flag(repo.clone(), true);
        scheduler.schedule_pending_pods().expect("tick");

        // The pod record itself is untouched because the binding short
        // circuits the mutation.
        let stored = repo.get_resource("Pod", "default", "p").unwrap();
        let parsed = Pod::from_resource(&stored).unwrap();
        assert_eq!(parsed.spec.node_name, "");
    }

    #[test]
    fn scheduled_pods_are_not_rescheduled() {
        let (_dir, repo) = open_repository();
        repo.create_node(&ready_node("n1", "4", "8Gi")).unwrap();
        let mut resource = pending_pod_resource("p", "1", "1Gi");
        resource.status = r#"{"phase":"Scheduled"}"#.to_string();
        repo.create_resource(&resource).unwrap();

        let scheduler = Scheduler::with_flag(repo.clone(), true);
        scheduler.schedule_pending_pods().expect("tick");

        let stored = repo.get_resource("Pod", "default", "p").unwrap();
        let pod = Pod::from_resource(&stored).unwrap();
        // Phase Scheduled excludes the pod from the pending set even though
        // nodeName is still empty.
        assert!(pod.status.conditions.is_empty());
    }

    #[test]
    fn basic_policy_schedules_without_resource_data() {
        let (_dir, repo) = open_repository();
        let mut node = ready_node("n1", "0", "0");
        node.status.allocatable.clear();
        repo.create_node(&node).unwrap();
        repo.create_resource(&pending_pod_resource("p", "4", "8Gi"))
            .unwrap();

        let scheduler = Scheduler::with_flag(repo.clone(), false);
        scheduler.schedule_pending_pods().expect("tick");

        let stored = repo.get_resource("Pod", "default", "p").unwrap();
        let pod = Pod::from_resource(&stored).unwrap();
        assert_eq!(pod.spec.node_name, "n1");
    }
}
