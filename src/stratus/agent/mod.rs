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

pub mod client;
pub mod pod_manager;
pub mod runtime;

use chrono::Utc;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::stratus::k8s::node::{
    Node, NodeAddress, NodeCondition, NodeStatus, CONDITION_READY,
};
use crate::stratus::k8s::pod::ObjectMeta;
use crate::stratus::logger::{log_error, log_info};
use crate::stratus::util::with_context;
use client::ApiClient;
use pod_manager::PodManager;
use runtime::ContainerRuntime;

const COMPONENT: &str = "node-agent";
const POD_SYNC_PERIOD: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AgentConfig {
    pub node_name: String,
    pub api_server: String,
    pub heartbeat_interval: Duration,
}

/// Per-node collaborator: registers the node, heartbeats its status, and
/// reconciles assigned pods through the container runtime.
#[derive(Clone)]
pub struct NodeAgent {
    config: AgentConfig,
    client: ApiClient,
    runtime: Arc<dyn ContainerRuntime>,
    pod_manager: Arc<PodManager>,
}

impl NodeAgent {
    pub fn new(config: AgentConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let client = ApiClient::new(config.api_server.clone());
        let pod_manager = Arc::new(PodManager::new(Arc::clone(&runtime)));
        NodeAgent {
            config,
            client,
            runtime,
            pod_manager,
        }
    }

    /// Register with the control plane, then run the heartbeat and pod sync
    /// loops until cancelled.
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, Box<dyn Error + Send + Sync>> {
        log_info(
            COMPONENT,
            "Starting node agent",
            &[("node", self.config.node_name.as_str())],
        );
        self.register_node()
            .await
            .map_err(|e| with_context(e, "failed to register node"))?;

        let heartbeat = {
            let agent = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(agent.config.heartbeat_interval);
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            log_info(COMPONENT, "Heartbeat loop stopped", &[]);
                            return;
                        }
                        _ = timer.tick() => {
                            if let Err(err) = agent.send_heartbeat().await {
                                log_error(
                                    COMPONENT,
                                    "Failed to send heartbeat",
                                    &[("error", err.to_string().as_str())],
                                );
                            }
                        }
                    }
                }
            })
        };

        let pod_sync = {
            let agent = self.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(POD_SYNC_PERIOD);
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            log_info(COMPONENT, "Pod sync loop stopped", &[]);
                            return;
                        }
                        _ = timer.tick() => {
                            if let Err(err) = agent.sync_pods().await {
                                log_error(
                                    COMPONENT,
                                    "Failed to sync pods",
                                    &[("error", err.to_string().as_str())],
                                );
                            }
                        }
                    }
                }
            })
        };

        Ok(vec![heartbeat, pod_sync])
    }

    async fn register_node(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let node = Node {
            metadata: ObjectMeta {
                name: self.config.node_name.clone(),
                ..Default::default()
            },
            status: self.node_status()?,
            ..Default::default()
        };
        self.client.register_node(&node).await
    }

    async fn send_heartbeat(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let status = self.node_status()?;
        self.client
            .update_node_status(&self.config.node_name, &status)
            .await
    }

    /// Current node status: a fresh Ready condition plus this host's
    /// capacity. Allocatable mirrors capacity; nothing is reserved.
    fn node_status(&self) -> Result<NodeStatus, Box<dyn Error + Send + Sync>> {
        self.runtime
            .ping()
            .map_err(|e| with_context(e, "container runtime unavailable"))?;

        let now = Utc::now();
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let memory_bytes = total_memory_bytes().unwrap_or(4 << 30);

        let resources = std::collections::HashMap::from([
            ("cpu".to_string(), cpus.to_string()),
            ("memory".to_string(), memory_bytes.to_string()),
        ]);

        let hostname = hostname().unwrap_or_else(|| self.config.node_name.clone());

        Ok(NodeStatus {
            capacity: resources.clone(),
            allocatable: resources,
            conditions: vec![NodeCondition {
                condition_type: CONDITION_READY.to_string(),
                status: "True".to_string(),
                last_heartbeat_time: Some(now),
                last_transition_time: Some(now),
                reason: "NodeReady".to_string(),
                message: "Node is ready".to_string(),
            }],
            addresses: vec![NodeAddress {
                address_type: "Hostname".to_string(),
                address: hostname,
            }],
            ..Default::default()
        })
    }

    async fn sync_pods(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let pods = self
            .client
            .assigned_pods(&self.config.node_name)
            .await
            .map_err(|e| with_context(e, "failed to fetch assigned pods"))?;

        self.pod_manager.sync_pods(&pods);

        for pod in &pods {
            let status = self.pod_manager.pod_status(pod);
            if let Err(err) = self.client.update_pod_status(pod, &status).await {
                log_error(
                    COMPONENT,
                    "Failed to report pod status",
                    &[
                        ("pod", pod.metadata.name.as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
            }
        }
        Ok(())
    }
}

/// Fallback node name when none is configured: the kernel hostname.
pub fn default_node_name() -> String {
    hostname().unwrap_or_else(|| "node".to_string())
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// MemTotal from /proc/meminfo, in bytes.
fn total_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_memory_is_positive_on_linux() {
        if let Some(bytes) = total_memory_bytes() {
            assert!(bytes > 0);
        }
    }
}
