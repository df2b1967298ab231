use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

use super::runtime::{pod_container_specs, ContainerRuntime};
use crate::stratus::k8s::pod::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Pod, PodStatus,
};
use crate::stratus::logger::{log_error, log_info};
use crate::stratus::util::with_context;

const COMPONENT: &str = "pod-manager";
const STOP_TIMEOUT_SECS: u32 = 30;

/// Reconciles the set of pods assigned to this node against the container
/// runtime: creates the missing, removes the unassigned, recreates the
/// changed.
pub struct PodManager {
    runtime: Arc<dyn ContainerRuntime>,
    pods: Mutex<HashMap<String, Pod>>,
    container_ids: Mutex<HashMap<String, String>>,
}

impl PodManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        PodManager {
            runtime,
            pods: Mutex::new(HashMap::new()),
            container_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Bring the runtime in line with `desired`. Per-pod failures are logged
    /// and the rest of the sync continues.
    pub fn sync_pods(&self, desired: &[Pod]) {
        let mut pods = self.pods.lock().expect("pod map lock poisoned");

        let desired_by_uid: HashMap<&str, &Pod> = desired
            .iter()
            .map(|pod| (pod.metadata.uid.as_str(), pod))
            .collect();

        let stale: Vec<String> = pods
            .keys()
            .filter(|uid| !desired_by_uid.contains_key(uid.as_str()))
            .cloned()
            .collect();
        for uid in stale {
            if let Some(existing) = pods.remove(&uid) {
                if let Err(err) = self.delete_pod(&existing) {
                    log_error(
                        COMPONENT,
                        "Failed to delete pod",
                        &[
                            ("pod", existing.metadata.name.as_str()),
                            ("error", err.to_string().as_str()),
                        ],
                    );
                }
            }
        }

        for pod in desired {
            let existing = pods.get(&pod.metadata.uid).cloned();
            match existing {
                None => {
                    if let Err(err) = self.create_pod(pod) {
                        log_error(
                            COMPONENT,
                            "Failed to create pod",
                            &[
                                ("pod", pod.metadata.name.as_str()),
                                ("error", err.to_string().as_str()),
                            ],
                        );
                        continue;
                    }
                    pods.insert(pod.metadata.uid.clone(), pod.clone());
                }
                Some(existing) if pod_needs_update(&existing, pod) => {
                    if let Err(err) = self
                        .delete_pod(&existing)
                        .and_then(|_| self.create_pod(pod))
                    {
                        log_error(
                            COMPONENT,
                            "Failed to recreate pod",
                            &[
                                ("pod", pod.metadata.name.as_str()),
                                ("error", err.to_string().as_str()),
                            ],
                        );
                        continue;
                    }
                    pods.insert(pod.metadata.uid.clone(), pod.clone());
                }
                Some(_) => {}
            }
        }
    }

    fn create_pod(&self, pod: &Pod) -> Result<(), Box<dyn Error + Send + Sync>> {
        log_info(
            COMPONENT,
            "Creating pod",
            &[("pod", pod.metadata.name.as_str())],
        );

        for spec in pod_container_specs(pod) {
            self.runtime
                .pull_image(&spec.image)
                .map_err(|e| with_context(e, format!("failed to pull image {}", spec.image)))?;
            let id = self
                .runtime
                .create_container(&spec)
                .map_err(|e| with_context(e, format!("failed to create container {}", spec.name)))?;
            self.container_ids
                .lock()
                .expect("container id lock poisoned")
                .insert(spec.name.clone(), id.clone());
            self.runtime
                .start_container(&id)
                .map_err(|e| with_context(e, format!("failed to start container {}", spec.name)))?;
        }
        Ok(())
    }

    fn delete_pod(&self, pod: &Pod) -> Result<(), Box<dyn Error + Send + Sync>> {
        log_info(
            COMPONENT,
            "Deleting pod",
            &[("pod", pod.metadata.name.as_str())],
        );

        for container in &pod.spec.containers {
            let key = format!("{}-{}", pod.metadata.uid, container.name);
            let Some(id) = self
                .container_ids
                .lock()
                .expect("container id lock poisoned")
                .remove(&key)
            else {
                continue;
            };
            if let Err(err) = self.runtime.stop_container(&id, STOP_TIMEOUT_SECS) {
                log_error(
                    COMPONENT,
                    "Failed to stop container",
                    &[("container", id.as_str()), ("error", err.to_string().as_str())],
                );
            }
            if let Err(err) = self.runtime.remove_container(&id, true) {
                log_error(
                    COMPONENT,
                    "Failed to remove container",
                    &[("container", id.as_str()), ("error", err.to_string().as_str())],
                );
            }
        }
        Ok(())
    }

    /// Derive the pod's status from per-container runtime state: all running
    /// ⇒ Running, all exited clean ⇒ Succeeded, otherwise Pending.
    pub fn pod_status(&self, pod: &Pod) -> PodStatus {
        let mut container_statuses = Vec::with_capacity(pod.spec.containers.len());
        let mut all_running = true;
        let mut all_succeeded = true;
        let mut pod_ip = String::new();

        for container in &pod.spec.containers {
            let key = format!("{}-{}", pod.metadata.uid, container.name);
            let id = self
                .container_ids
                .lock()
                .expect("container id lock poisoned")
                .get(&key)
                .cloned();

            let Some(id) = id else {
                all_running = false;
                all_succeeded = false;
                container_statuses.push(ContainerStatus {
                    name: container.name.clone(),
                    ready: false,
                    image: container.image.clone(),
                    state: ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: "ContainerCreating".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                });
                continue;
            };

            let status = match self.runtime.container_status(&id) {
                Ok(status) => status,
                Err(err) => {
                    log_error(
                        COMPONENT,
                        "Failed to inspect container",
                        &[("container", id.as_str()), ("error", err.to_string().as_str())],
                    );
                    all_running = false;
                    all_succeeded = false;
                    container_statuses.push(ContainerStatus {
                        name: container.name.clone(),
                        ready: false,
                        image: container.image.clone(),
                        state: ContainerState {
                            waiting: Some(ContainerStateWaiting {
                                reason: "ContainerStatusUnknown".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        ..Default::default()
                    });
                    continue;
                }
            };

            if pod_ip.is_empty() && !status.ip.is_empty() {
                pod_ip = status.ip.clone();
            }

            let (state, ready) = match status.state.as_str() {
                "running" => (
                    ContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: Some(Utc::now()),
                        }),
                        ..Default::default()
                    },
                    true,
                ),
                "exited" => {
                    all_running = false;
                    if status.exit_code != 0 {
                        all_succeeded = false;
                    }
                    (
                        ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: status.exit_code,
                                reason: "Completed".to_string(),
                                finished_at: Some(Utc::now()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        false,
                    )
                }
                other => {
                    all_running = false;
                    all_succeeded = false;
                    (
                        ContainerState {
                            waiting: Some(ContainerStateWaiting {
                                reason: other.to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        false,
                    )
                }
            };

            container_statuses.push(ContainerStatus {
                name: container.name.clone(),
                ready,
                image: status.image,
                container_id: status.id,
                state,
                ..Default::default()
            });
        }

        let phase = if all_running {
            "Running"
        } else if all_succeeded {
            "Succeeded"
        } else {
            "Pending"
        };

        PodStatus {
            phase: phase.to_string(),
            pod_ip,
            start_time: Some(Utc::now()),
            container_statuses,
            ..Default::default()
        }
    }
}

/// A pod must be torn down and recreated when its container set, images, or
/// environment changed.
fn pod_needs_update(old: &Pod, new: &Pod) -> bool {
    if old.spec.containers.len() != new.spec.containers.len() {
        return true;
    }
    for (old_container, new_container) in old.spec.containers.iter().zip(&new.spec.containers) {
        if old_container.image != new_container.image {
            return true;
        }
        if old_container.env != new_container.env {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratus::agent::runtime::{ContainerSpec, RuntimeContainerStatus};
    use crate::stratus::k8s::pod::{Container, EnvVar, ObjectMeta, PodSpec};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeRuntime {
        calls: StdMutex<Vec<String>>,
        running: StdMutex<HashMap<String, RuntimeContainerStatus>>,
    }

    impl FakeRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn ping(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
            Ok(())
        }

        fn pull_image(&self, image: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.calls.lock().unwrap().push(format!("pull {image}"));
            Ok(())
        }

        fn create_container(
            &self,
            spec: &ContainerSpec,
        ) -> Result<String, Box<dyn Error + Send + Sync>> {
            let id = format!("cid-{}", spec.name);
            self.calls.lock().unwrap().push(format!("create {}", spec.name));
            self.running.lock().unwrap().insert(
                id.clone(),
                RuntimeContainerStatus {
                    id: id.clone(),
                    state: "created".to_string(),
                    ip: "10.1.0.7".to_string(),
                    image: spec.image.clone(),
                    ..Default::default()
                },
            );
            Ok(id)
        }

        fn start_container(&self, id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.calls.lock().unwrap().push(format!("start {id}"));
            if let Some(status) = self.running.lock().unwrap().get_mut(id) {
                status.state = "running".to_string();
            }
            Ok(())
        }

        fn stop_container(
            &self,
            id: &str,
            _timeout_secs: u32,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.calls.lock().unwrap().push(format!("stop {id}"));
            Ok(())
        }

        fn remove_container(
            &self,
            id: &str,
            _force: bool,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.calls.lock().unwrap().push(format!("remove {id}"));
            self.running.lock().unwrap().remove(id);
            Ok(())
        }

        fn container_status(
            &self,
            id: &str,
        ) -> Result<RuntimeContainerStatus, Box<dyn Error + Send + Sync>> {
            self.running
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| crate::stratus::util::new_error(format!("no such container {id}")))
        }
    }

    fn pod(uid: &str, name: &str, image: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                uid: uid.to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: image.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn sync_creates_new_and_removes_unassigned_pods() {
        let runtime = Arc::new(FakeRuntime::default());
        let manager = PodManager::new(runtime.clone());

        manager.sync_pods(&[pod("uid-1", "web-1", "nginx:1")]);
        assert_eq!(
            runtime.calls(),
            vec!["pull nginx:1", "create uid-1-main", "start cid-uid-1-main"]
        );

        manager.sync_pods(&[]);
        let calls = runtime.calls();
        assert!(calls.contains(&"stop cid-uid-1-main".to_string()));
        assert!(calls.contains(&"remove cid-uid-1-main".to_string()));
    }

    #[test]
    fn changed_image_recreates_the_pod() {
        let runtime = Arc::new(FakeRuntime::default());
        let manager = PodManager::new(runtime.clone());

        manager.sync_pods(&[pod("uid-1", "web-1", "nginx:1")]);
        manager.sync_pods(&[pod("uid-1", "web-1", "nginx:2")]);

        let calls = runtime.calls();
        assert!(calls.contains(&"pull nginx:2".to_string()));
        assert!(calls.contains(&"stop cid-uid-1-main".to_string()));
    }

    #[test]
    fn unchanged_pod_is_left_alone() {
        let runtime = Arc::new(FakeRuntime::default());
        let manager = PodManager::new(runtime.clone());

        manager.sync_pods(&[pod("uid-1", "web-1", "nginx:1")]);
        let before = runtime.calls().len();
        manager.sync_pods(&[pod("uid-1", "web-1", "nginx:1")]);
        assert_eq!(runtime.calls().len(), before);
    }

    #[test]
    fn pod_status_reflects_container_state() {
        let runtime = Arc::new(FakeRuntime::default());
        let manager = PodManager::new(runtime.clone());
        let p = pod("uid-1", "web-1", "nginx:1");

        manager.sync_pods(&[p.clone()]);
        let status = manager.pod_status(&p);
        assert_eq!(status.phase, "Running");
        assert_eq!(status.pod_ip, "10.1.0.7");
        assert_eq!(status.container_statuses.len(), 1);
        assert!(status.container_statuses[0].ready);

        // A pod the manager never created reports ContainerCreating.
        let unknown = pod("uid-2", "web-2", "nginx:1");
        let status = manager.pod_status(&unknown);
        assert_eq!(status.phase, "Pending");
        assert_eq!(
            status.container_statuses[0]
                .state
                .waiting
                .as_ref()
                .map(|w| w.reason.as_str()),
            Some("ContainerCreating")
        );
    }

    #[test]
    fn env_change_triggers_recreate() {
        let mut changed = pod("uid-1", "web-1", "nginx:1");
        changed.spec.containers[0].env.push(EnvVar {
            name: "MODE".to_string(),
            value: "prod".to_string(),
        });
        assert!(pod_needs_update(&pod("uid-1", "web-1", "nginx:1"), &changed));
        assert!(!pod_needs_update(
            &pod("uid-1", "web-1", "nginx:1"),
            &pod("uid-1", "web-1", "nginx:1")
        ));
    }
}
