use std::error::Error;
use std::time::Duration;

use crate::stratus::k8s::node::{Node, NodeStatus};
use crate::stratus::k8s::pod::{Pod, PodList, PodStatus};
use crate::stratus::util::{new_error, with_context};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the control-plane API, used by the node agent.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        ApiClient {
            base_url,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
        }
    }

    /// Register this node. A conflict means the node survived an agent
    /// restart and is treated as success.
    pub async fn register_node(&self, node: &Node) -> Result<(), Box<dyn Error + Send + Sync>> {
        let url = format!("{}/api/v1/nodes", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(node)
            .send()
            .await
            .map_err(|e| with_context(e, "failed to register node"))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        ensure_success(&url, response).await?;
        Ok(())
    }

    /// Report a fresh NodeStatus through the heartbeat endpoint.
    pub async fn update_node_status(
        &self,
        node_name: &str,
        status: &NodeStatus,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let url = format!("{}/api/v1/nodes/{}/heartbeat", self.base_url, node_name);
        let response = self
            .http
            .post(&url)
            .json(status)
            .send()
            .await
            .map_err(|e| with_context(e, "failed to send heartbeat"))?;
        ensure_success(&url, response).await?;
        Ok(())
    }

    /// The pods currently assigned to this node.
    pub async fn assigned_pods(
        &self,
        node_name: &str,
    ) -> Result<Vec<Pod>, Box<dyn Error + Send + Sync>> {
        let url = format!("{}/api/v1/nodes/{}/pods", self.base_url, node_name);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| with_context(e, "failed to fetch assigned pods"))?;
        let response = ensure_success(&url, response).await?;
        let list: PodList = response
            .json()
            .await
            .map_err(|e| with_context(e, "failed to decode pod list"))?;
        Ok(list.items)
    }

    /// Report a pod's observed status back to the control plane.
    pub async fn update_pod_status(
        &self,
        pod: &Pod,
        status: &PodStatus,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let namespace = if pod.metadata.namespace.is_empty() {
            "default"
        } else {
            pod.metadata.namespace.as_str()
        };
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/status",
            self.base_url, namespace, pod.metadata.name
        );
        let response = self
            .http
            .put(&url)
            .json(status)
            .send()
            .await
            .map_err(|e| with_context(e, "failed to report pod status"))?;
        ensure_success(&url, response).await?;
        Ok(())
    }
}

async fn ensure_success(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, Box<dyn Error + Send + Sync>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(new_error(format!("{url} returned {status}: {body}")))
}
