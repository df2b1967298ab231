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

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::stratus::controller::spawn_tick_loop;
use crate::stratus::k8s::service::{Endpoint, ServiceStatus};
use crate::stratus::logger::{log_error, log_info, log_warn};
use crate::stratus::storage::Repository;
use crate::stratus::util::with_context;

const COMPONENT: &str = "loadbalancer";
const REFRESH_PERIOD: Duration = Duration::from_secs(5);

/// Headers that must not be forwarded across the proxy hop.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

struct ProxyState {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

/// Round-robin pool for one service. The cursor is monotonic and only
/// rebounds to zero when an endpoint replacement leaves it out of range.
pub struct ServiceProxy {
    pub name: String,
    pub namespace: String,
    state: Mutex<ProxyState>,
}

impl ServiceProxy {
    fn new(name: String, namespace: String, endpoints: Vec<Endpoint>) -> Self {
        ServiceProxy {
            name,
            namespace,
            state: Mutex::new(ProxyState {
                endpoints,
                cursor: 0,
            }),
        }
    }

    /// The next ready endpoint, or None when the pool has no healthy member.
    pub fn next_healthy(&self) -> Option<Endpoint> {
        let mut state = self.state.lock().expect("proxy lock poisoned");

        let healthy: Vec<usize> = state
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, endpoint)| endpoint.ready)
            .map(|(i, _)| i)
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let chosen = state.endpoints[healthy[state.cursor % healthy.len()]].clone();
        state.cursor += 1;
        Some(chosen)
    }

    pub fn replace_endpoints(&self, endpoints: Vec<Endpoint>) {
        let mut state = self.state.lock().expect("proxy lock poisoned");
        if state.cursor >= endpoints.len() {
            state.cursor = 0;
        }
        state.endpoints = endpoints;
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state
            .lock()
            .expect("proxy lock poisoned")
            .endpoints
            .clone()
    }
}

/// Routes HTTP traffic to service endpoints, refreshing its routing table
/// from the store.
#[derive(Clone)]
pub struct LoadBalancer {
    repository: Repository,
    table: Arc<RwLock<HashMap<String, Arc<ServiceProxy>>>>,
    client: reqwest::Client,
}

impl LoadBalancer {
    pub fn new(repository: Repository) -> Self {
        LoadBalancer {
            repository,
            table: Arc::new(RwLock::new(HashMap::new())),
            client: reqwest::Client::new(),
        }
    }

    /// Bind the listener and start both the HTTP server and the table
    /// refresh loop.
    pub async fn spawn(
        &self,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<(JoinHandle<()>, JoinHandle<()>), Box<dyn Error + Send + Sync>> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| with_context(e, "failed to bind load balancer port"))?;
        log_info(
            COMPONENT,
            "Load balancer listening",
            &[("port", port.to_string().as_str())],
        );

        let router = self.router();
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(server_cancel.cancelled_owned())
                .await
            {
                log_error(
                    COMPONENT,
                    "Load balancer server error",
                    &[("error", err.to_string().as_str())],
                );
            }
        });

        let refresher = self.clone();
        let refresh = spawn_tick_loop(COMPONENT, REFRESH_PERIOD, cancel, move || {
            refresher.update_services()
        });

        Ok((server, refresh))
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .with_state(self.clone())
    }

    /// Rebuild the routing table from the store: upsert a proxy per service,
    /// drop proxies whose service is gone.
    pub fn update_services(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let services = self
            .repository
            .list_resources("Service", "")
            .map_err(|e| with_context(e, "failed to list services"))?;

        let mut table = self.table.write().expect("table lock poisoned");
        let mut current: HashSet<String> = HashSet::new();

        for resource in &services {
            let key = service_key(&resource.name, &resource.namespace);
            current.insert(key.clone());

            let status: ServiceStatus = if resource.status.is_empty() {
                ServiceStatus::default()
            } else {
                match serde_json::from_str(&resource.status) {
                    Ok(status) => status,
                    Err(err) => {
                        log_warn(
                            COMPONENT,
                            "Skipping service with unparseable status",
                            &[
                                ("service", key.as_str()),
                                ("error", err.to_string().as_str()),
                            ],
                        );
                        continue;
                    }
                }
            };

            match table.get(&key).cloned() {
                Some(proxy) => proxy.replace_endpoints(status.endpoints),
                None => {
                    log_info(COMPONENT, "Added service proxy", &[("service", key.as_str())]);
                    table.insert(
                        key,
                        Arc::new(ServiceProxy::new(
                            resource.name.clone(),
                            resource.namespace.clone(),
                            status.endpoints,
                        )),
                    );
                }
            }
        }

        table.retain(|key, _| {
            let keep = current.contains(key);
            if !keep {
                log_info(COMPONENT, "Removed service proxy", &[("service", key.as_str())]);
            }
            keep
        });

        Ok(())
    }

    /// Current endpoints for a service, mainly for tests and diagnostics.
    pub fn service_endpoints(&self, name: &str, namespace: &str) -> Option<Vec<Endpoint>> {
        let table = self.table.read().expect("table lock poisoned");
        table
            .get(&service_key(name, namespace))
            .map(|proxy| proxy.endpoints())
    }

    fn proxy_for(&self, name: &str, namespace: &str) -> Option<Arc<ServiceProxy>> {
        let table = self.table.read().expect("table lock poisoned");
        table.get(&service_key(name, namespace)).cloned()
    }

    async fn forward(
        &self,
        endpoint: &Endpoint,
        request: Request,
    ) -> Result<Response, Box<dyn Error + Send + Sync>> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("http://{}:{}{}", endpoint.ip, endpoint.port, path_and_query);

        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| with_context(e, "failed to read request body"))?;

        let mut upstream = self.client.request(parts.method, url).body(bytes);
        for (name, value) in &parts.headers {
            if *name == header::HOST || is_hop_by_hop(name) {
                continue;
            }
            upstream = upstream.header(name, value);
        }

        let upstream_response = upstream.send().await?;

        let mut builder = Response::builder().status(upstream_response.status());
        for (name, value) in upstream_response.headers() {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let payload = upstream_response.bytes().await?;
        builder
            .body(Body::from(payload))
            .map_err(|e| with_context(e, "failed to build proxied response"))
    }
}

fn service_key(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}")
}

/// Derive (service, namespace) from a request: the first two Host labels,
/// a bare hostname with namespace "default", or the first path segment with
/// namespace "default". Anything trailing the second label is ignored.
fn resolve_service(request: &Request) -> Option<(String, String)> {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host());

    if let Some(host) = host {
        let host = host.split(':').next().unwrap_or("");
        if !host.is_empty() {
            let labels: Vec<&str> = host.split('.').collect();
            if labels.len() >= 2 {
                return Some((labels[0].to_string(), labels[1].to_string()));
            }
            return Some((labels[0].to_string(), "default".to_string()));
        }
    }

    let first_segment = request
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("");
    if !first_segment.is_empty() {
        return Some((first_segment.to_string(), "default".to_string()));
    }

    None
}

async fn handle_request(State(lb): State<LoadBalancer>, request: Request) -> Response {
    let Some((name, namespace)) = resolve_service(&request) else {
        return (StatusCode::NOT_FOUND, "Service not found").into_response();
    };

    let Some(proxy) = lb.proxy_for(&name, &namespace) else {
        return (StatusCode::NOT_FOUND, "Service not found").into_response();
    };

    let Some(endpoint) = proxy.next_healthy() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "No healthy endpoints available",
        )
            .into_response();
    };

    match lb.forward(&endpoint, request).await {
        Ok(response) => response,
        Err(err) => {
            log_error(
                COMPONENT,
                "Proxy error",
                &[
                    ("upstream", format!("{}:{}", endpoint.ip, endpoint.port).as_str()),
                    ("error", err.to_string().as_str()),
                ],
            );
            (
                StatusCode::BAD_GATEWAY,
                "Service temporarily unavailable",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratus::storage::{Database, Resource};

    fn endpoint(ip: &str, ready: bool) -> Endpoint {
        Endpoint {
            ip: ip.to_string(),
            port: 8080,
            ready,
            node_name: String::new(),
        }
    }

    fn request_with_host(host: &str) -> Request {
        axum::http::Request::builder()
            .uri("/some/path")
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn host_resolution_uses_first_two_labels() {
        let req = request_with_host("web.prod.svc.cluster.local");
        assert_eq!(
            resolve_service(&req),
            Some(("web".to_string(), "prod".to_string()))
        );

        let req = request_with_host("web.prod:8081");
        assert_eq!(
            resolve_service(&req),
            Some(("web".to_string(), "prod".to_string()))
        );

        let req = request_with_host("web");
        assert_eq!(
            resolve_service(&req),
            Some(("web".to_string(), "default".to_string()))
        );
    }

    #[test]
    fn path_resolution_falls_back_to_default_namespace() {
        let req = axum::http::Request::builder()
            .uri("/web/health")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            resolve_service(&req),
            Some(("web".to_string(), "default".to_string()))
        );

        let req = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        assert_eq!(resolve_service(&req), None);
    }

    #[test]
    fn round_robin_skips_unready_endpoints() {
        let proxy = ServiceProxy::new(
            "web".to_string(),
            "default".to_string(),
            vec![
                endpoint("10.0.0.1", true),
                endpoint("10.0.0.2", false),
                endpoint("10.0.0.3", true),
            ],
        );

        let picks: Vec<String> = (0..6)
            .map(|_| proxy.next_healthy().expect("healthy endpoint").ip)
            .collect();
        assert_eq!(
            picks,
            vec![
                "10.0.0.1", "10.0.0.3", "10.0.0.1", "10.0.0.3", "10.0.0.1", "10.0.0.3"
            ]
        );
    }

    #[test]
    fn no_healthy_endpoints_yields_none() {
        let proxy = ServiceProxy::new(
            "web".to_string(),
            "default".to_string(),
            vec![endpoint("10.0.0.1", false)],
        );
        assert!(proxy.next_healthy().is_none());

        let empty = ServiceProxy::new("web".to_string(), "default".to_string(), Vec::new());
        assert!(empty.next_healthy().is_none());
    }

    #[test]
    fn cursor_rebinds_only_when_out_of_range() {
        let proxy = ServiceProxy::new(
            "web".to_string(),
            "default".to_string(),
            vec![endpoint("10.0.0.1", true), endpoint("10.0.0.2", true)],
        );
        proxy.next_healthy();
        proxy.next_healthy();
        proxy.next_healthy(); // cursor = 3

        // Replacement with a shorter list rebinds the cursor.
        proxy.replace_endpoints(vec![endpoint("10.0.0.9", true)]);
        assert_eq!(proxy.next_healthy().unwrap().ip, "10.0.0.9");

        // Replacement with a list at least as long keeps the cursor.
        let proxy = ServiceProxy::new(
            "web".to_string(),
            "default".to_string(),
            vec![endpoint("10.0.0.1", true), endpoint("10.0.0.2", true)],
        );
        proxy.next_healthy(); // cursor = 1
        proxy.replace_endpoints(vec![endpoint("10.0.1.1", true), endpoint("10.0.1.2", true)]);
        assert_eq!(proxy.next_healthy().unwrap().ip, "10.0.1.2");
    }

    #[test]
    fn refresh_upserts_and_removes_proxies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path()).expect("open database");
        let repo = db.repository();

        let mut service = Resource::new("Service", "default", "web");
        service.spec = r#"{"selector":{"app":"web"},"ports":[{"port":80}]}"#.to_string();
        service.status = serde_json::to_string(&ServiceStatus {
            endpoints: vec![endpoint("10.0.0.1", true)],
        })
        .unwrap();
        repo.create_resource(&service).expect("create service");

        let lb = LoadBalancer::new(repo.clone());
        lb.update_services().expect("first refresh");
        let endpoints = lb.service_endpoints("web", "default").expect("proxy exists");
        assert_eq!(endpoints.len(), 1);

        // Endpoint replacement flows through on the next refresh.
        let mut stored = repo.get_resource("Service", "default", "web").unwrap();
        stored.status = serde_json::to_string(&ServiceStatus {
            endpoints: vec![endpoint("10.0.0.1", true), endpoint("10.0.0.2", true)],
        })
        .unwrap();
        repo.update_resource(&stored).expect("update");
        lb.update_services().expect("second refresh");
        assert_eq!(lb.service_endpoints("web", "default").unwrap().len(), 2);

        // A deleted service loses its proxy.
        repo.delete_resource("Service", "default", "web").expect("delete");
        lb.update_services().expect("third refresh");
        assert!(lb.service_endpoints("web", "default").is_none());
    }
}
