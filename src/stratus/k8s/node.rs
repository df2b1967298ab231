use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::pod::ObjectMeta;

pub const CONDITION_READY: &str = "Ready";

/// Attributes a node is created with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(
        rename = "externalID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub external_id: String,
}

/// Observed state of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capacity: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub allocatable: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<NodeCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,
    #[serde(rename = "nodeInfo", default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeSystemInfo>,
}

/// Condition of a node, tracking both heartbeat and transition times.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(rename = "lastHeartbeatTime", skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    pub address: String,
}

/// Identifying information reported by the node agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSystemInfo {
    #[serde(rename = "machineID", default)]
    pub machine_id: String,
    #[serde(rename = "kernelVersion", default)]
    pub kernel_version: String,
    #[serde(rename = "osImage", default)]
    pub os_image: String,
    #[serde(rename = "containerRuntimeVersion", default)]
    pub container_runtime_version: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(rename = "operatingSystem", default)]
    pub operating_system: String,
}

/// A worker node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            api_version: "v1".to_string(),
            kind: "Node".to_string(),
            metadata: ObjectMeta::default(),
            spec: NodeSpec::default(),
            status: NodeStatus::default(),
        }
    }
}

impl Node {
    pub fn ready_condition(&self) -> Option<&NodeCondition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == CONDITION_READY)
    }

    pub fn ready_condition_mut(&mut self) -> Option<&mut NodeCondition> {
        self.status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == CONDITION_READY)
    }

    /// A node is ready when its `Ready` condition reports `True`.
    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .map(|c| c.status == "True")
            .unwrap_or(false)
    }
}

/// List wrapper returned by the nodes collection endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeList {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub items: Vec<Node>,
}

impl NodeList {
    pub fn new(items: Vec<Node>) -> Self {
        NodeList {
            api_version: "v1".to_string(),
            kind: "NodeList".to_string(),
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with_ready(status: &str) -> Node {
        Node {
            status: NodeStatus {
                conditions: vec![NodeCondition {
                    condition_type: CONDITION_READY.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn readiness_follows_ready_condition() {
        assert!(node_with_ready("True").is_ready());
        assert!(!node_with_ready("False").is_ready());
        assert!(!node_with_ready("Unknown").is_ready());
        assert!(!Node::default().is_ready());
    }

    #[test]
    fn condition_times_round_trip() {
        let now = Utc::now();
        let node = node_with_ready("True");
        let mut node = node;
        node.ready_condition_mut().unwrap().last_heartbeat_time = Some(now);

        let encoded = serde_json::to_string(&node.status).expect("serialize");
        let decoded: NodeStatus = serde_json::from_str(&encoded).expect("deserialize");
        let heartbeat = decoded.conditions[0].last_heartbeat_time.expect("heartbeat");
        assert_eq!(heartbeat.timestamp(), now.timestamp());
    }
}
