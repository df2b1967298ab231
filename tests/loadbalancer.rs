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

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use tower::util::ServiceExt;

use stratus::stratus::k8s::service::{Endpoint, ServiceStatus};
use stratus::stratus::loadbalancer::LoadBalancer;
use stratus::stratus::storage::{Database, Repository, Resource};

/// Spin up a trivial upstream that answers every request with `ident`.
async fn spawn_upstream(ident: &'static str) -> u16 {
    let app = Router::new()
        .route("/", get(move || async move { ident }))
        .fallback(move || async move { ident });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    port
}

fn open_repository() -> (tempfile::TempDir, Repository) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::open(dir.path()).expect("open database");
    let repo = db.repository();
    (dir, repo)
}

fn endpoint(port: u16, ready: bool) -> Endpoint {
    Endpoint {
        ip: "127.0.0.1".to_string(),
        port,
        ready,
        node_name: String::new(),
    }
}

fn store_service(repo: &Repository, name: &str, endpoints: Vec<Endpoint>) {
    let mut resource = Resource::new("Service", "default", name);
    resource.spec = r#"{"selector":{"app":"web"},"ports":[{"port":80}]}"#.to_string();
    resource.status = serde_json::to_string(&ServiceStatus { endpoints }).unwrap();
    repo.create_resource(&resource).expect("create service");
}

async fn dispatch(lb: &LoadBalancer, host: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .uri("/")
        .header(header::HOST, host)
        .body(Body::empty())
        .unwrap();
    let response = lb.router().oneshot(request).await.expect("dispatch");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, String::from_utf8_lossy(&bytes).to_string())
}

#[tokio::test]
async fn round_robin_alternates_across_ready_endpoints() {
    let (_dir, repo) = open_repository();
    let port_a = spawn_upstream("upstream-a").await;
    let port_b = spawn_upstream("upstream-b").await;

    // The middle endpoint is not ready and must never see traffic.
    store_service(
        &repo,
        "web",
        vec![
            endpoint(port_a, true),
            endpoint(9, false),
            endpoint(port_b, true),
        ],
    );

    let lb = LoadBalancer::new(repo);
    lb.update_services().expect("refresh");

    let mut hits: HashMap<String, usize> = HashMap::new();
    for _ in 0..10 {
        let (status, body) = dispatch(&lb, "web.default").await;
        assert_eq!(status, StatusCode::OK);
        *hits.entry(body).or_default() += 1;
    }

    assert_eq!(hits.get("upstream-a"), Some(&5));
    assert_eq!(hits.get("upstream-b"), Some(&5));
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn unknown_service_is_404() {
    let (_dir, repo) = open_repository();
    let lb = LoadBalancer::new(repo);
    lb.update_services().expect("refresh");

    let (status, body) = dispatch(&lb, "nope.default").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Service not found");
}

#[tokio::test]
async fn exhausted_pool_is_503() {
    let (_dir, repo) = open_repository();
    store_service(&repo, "web", vec![endpoint(9, false)]);

    let lb = LoadBalancer::new(repo);
    lb.update_services().expect("refresh");

    let (status, body) = dispatch(&lb, "web.default").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "No healthy endpoints available");
}

#[tokio::test]
async fn unreachable_upstream_is_502() {
    let (_dir, repo) = open_repository();
    // Port 9 (discard) is not listening.
    store_service(&repo, "web", vec![endpoint(9, true)]);

    let lb = LoadBalancer::new(repo);
    lb.update_services().expect("refresh");

    let (status, body) = dispatch(&lb, "web.default").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body, "Service temporarily unavailable");
}

#[tokio::test]
async fn host_with_cluster_suffix_and_path_fallback_resolve() {
    let (_dir, repo) = open_repository();
    let port = spawn_upstream("upstream-a").await;
    store_service(&repo, "web", vec![endpoint(port, true)]);

    let lb = LoadBalancer::new(repo);
    lb.update_services().expect("refresh");

    // Trailing labels are ignored: web.default.svc.cluster.local → web.default.
    let (status, body) = dispatch(&lb, "web.default.svc.cluster.local").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "upstream-a");

    // A bare path resolves against the default namespace.
    let request = Request::builder()
        .uri("/web/anything")
        .body(Body::empty())
        .unwrap();
    let response = lb.router().oneshot(request).await.expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn proxied_requests_preserve_method_path_and_body() {
    let (_dir, repo) = open_repository();

    // An upstream that echoes what it received.
    let app = Router::new().route(
        "/echo/{tail}",
        axum::routing::post(
            |axum::extract::Path(tail): axum::extract::Path<String>, body: String| async move {
                format!("{tail}:{body}")
            },
        ),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    store_service(&repo, "web", vec![endpoint(port, true)]);
    let lb = LoadBalancer::new(repo);
    lb.update_services().expect("refresh");

    let request = Request::builder()
        .method("POST")
        .uri("/echo/hello")
        .header(header::HOST, "web.default")
        .body(Body::from("payload"))
        .unwrap();
    let response = lb.router().oneshot(request).await.expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"hello:payload");
}

#[tokio::test]
async fn deleted_service_stops_routing_after_refresh() {
    let (_dir, repo) = open_repository();
    let port = spawn_upstream("upstream-a").await;
    store_service(&repo, "web", vec![endpoint(port, true)]);

    let lb = LoadBalancer::new(repo.clone());
    lb.update_services().expect("refresh");
    let (status, _) = dispatch(&lb, "web.default").await;
    assert_eq!(status, StatusCode::OK);

    repo.delete_resource("Service", "default", "web")
        .expect("delete");
    lb.update_services().expect("refresh after delete");

    let (status, body) = dispatch(&lb, "web.default").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Service not found");
}
