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

pub mod handlers;

use std::error::Error;

use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::stratus::logger::{log_error, log_info};
use crate::stratus::util::with_context;
pub use handlers::ApiContext;
use handlers::{deployments, nodes, pods, services};

const COMPONENT: &str = "api-server";

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// The full object ingress API.
pub fn router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/health", get(health))
        // Pods.
        .route("/api/v1/pods", post(pods::create_pod).get(pods::list_pods))
        .route(
            "/api/v1/pods/{name}",
            get(pods::get_pod)
                .put(pods::update_pod)
                .delete(pods::delete_pod),
        )
        .route(
            "/api/v1/namespaces/{namespace}/pods",
            post(pods::create_namespaced_pod).get(pods::list_namespaced_pods),
        )
        .route(
            "/api/v1/namespaces/{namespace}/pods/{name}",
            get(pods::get_namespaced_pod)
                .put(pods::update_namespaced_pod)
                .delete(pods::delete_namespaced_pod),
        )
        .route(
            "/api/v1/namespaces/{namespace}/pods/{name}/status",
            put(pods::update_pod_status),
        )
        // Services.
        .route(
            "/api/v1/services",
            post(services::create_service).get(services::list_services),
        )
        .route(
            "/api/v1/services/{name}",
            get(services::get_service)
                .put(services::update_service)
                .delete(services::delete_service),
        )
        .route(
            "/api/v1/namespaces/{namespace}/services",
            post(services::create_namespaced_service).get(services::list_namespaced_services),
        )
        .route(
            "/api/v1/namespaces/{namespace}/services/{name}",
            get(services::get_namespaced_service)
                .put(services::update_namespaced_service)
                .delete(services::delete_namespaced_service),
        )
        // Deployments.
        .route(
            "/api/v1/deployments",
            post(deployments::create_deployment).get(deployments::list_deployments),
        )
        .route(
            "/api/v1/deployments/{name}",
            get(deployments::get_deployment)
                .put(deployments::update_deployment)
                .delete(deployments::delete_deployment),
        )
        .route(
            "/api/v1/namespaces/{namespace}/deployments",
            post(deployments::create_namespaced_deployment)
                .get(deployments::list_namespaced_deployments),
        )
        .route(
            "/api/v1/namespaces/{namespace}/deployments/{name}",
            get(deployments::get_namespaced_deployment)
                .put(deployments::update_namespaced_deployment)
                .delete(deployments::delete_namespaced_deployment),
        )
        // Nodes (cluster scoped).
        .route(
            "/api/v1/nodes",
            post(nodes::create_node).get(nodes::list_nodes),
        )
        .route(
            "/api/v1/nodes/{name}",
            get(nodes::get_node)
                .put(nodes::update_node)
                .delete(nodes::delete_node),
        )
        .route("/api/v1/nodes/{name}/heartbeat", post(nodes::node_heartbeat))
        .route("/api/v1/nodes/{name}/pods", get(nodes::node_pods))
        .with_state(ctx)
}

/// Bind and serve the API until the token is cancelled.
pub async fn spawn(
    ctx: ApiContext,
    port: u16,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, Box<dyn Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| with_context(e, "failed to bind API server port"))?;
    log_info(
        COMPONENT,
        "API server listening",
        &[("port", port.to_string().as_str())],
    );

    let app = router(ctx);
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            log_error(
                COMPONENT,
                "API server error",
                &[("error", err.to_string().as_str())],
            );
        }
        log_info(COMPONENT, "API server stopped", &[]);
    }))
}
