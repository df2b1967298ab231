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

use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::stratus::agent::runtime::{ContainerRuntime, DockerRuntime};
use crate::stratus::agent::{self, AgentConfig, NodeAgent};
use crate::stratus::controller::endpoints::EndpointReconciler;
use crate::stratus::controller::node_monitor::NodeMonitor;
use crate::stratus::loadbalancer::LoadBalancer;
use crate::stratus::logger::{log_info, set_log_format, LogFormat};
use crate::stratus::scheduler::Scheduler;
use crate::stratus::server::{self, ApiContext};
use crate::stratus::storage::Database;
use crate::stratus::util::with_context;

/// A miniature cluster orchestrator.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Stratus {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane: object API, controllers, and load balancer
    Server(ServerArgs),

    /// Run the pod scheduler against a shared data directory
    Scheduler(SchedulerArgs),

    /// Run the per-node agent
    Agent(AgentArgs),
}

#[derive(Args)]
pub struct ServerArgs {
    /// Directory for the durable store
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Port for the object API
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Port for the load balancer
    #[arg(long, default_value_t = 8081)]
    pub lb_port: u16,

    /// Seconds without a heartbeat before a node is marked NotReady
    #[arg(long, default_value_t = 120)]
    pub heartbeat_timeout: u64,

    /// Emit logs as JSON instead of key=value text
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Args)]
pub struct SchedulerArgs {
    /// Directory for the durable store
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Use the resource-aware scheduling policy
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub resource_scheduler: bool,

    /// Emit logs as JSON instead of key=value text
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Args)]
pub struct AgentArgs {
    /// Name of this node; defaults to the hostname
    #[arg(long)]
    pub node_name: Option<String>,

    /// URL of the control-plane API
    #[arg(long, default_value = "http://localhost:8080")]
    pub api_server: String,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval: u64,

    /// Emit logs as JSON instead of key=value text
    #[arg(long)]
    pub log_json: bool,
}

pub async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Stratus::parse();
    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Scheduler(args) => run_scheduler(args).await,
        Commands::Agent(args) => run_agent(args).await,
    }
}

fn apply_log_format(json: bool) {
    if json {
        set_log_format(LogFormat::Json);
    } else {
        set_log_format(LogFormat::Text);
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    apply_log_format(args.log_json);

    let db = Database::open(&args.data_dir)
        .map_err(|e| with_context(e, "failed to initialize store"))?;
    let repository = db.repository();
    let cancel = CancellationToken::new();

    let monitor = NodeMonitor::new(
        repository.clone(),
        Duration::from_secs(args.heartbeat_timeout),
    )
    .spawn(cancel.clone());
    let reconciler = EndpointReconciler::new(repository.clone()).spawn(cancel.clone());

    let lb = LoadBalancer::new(repository.clone());
    let (lb_server, lb_refresh) = lb.spawn(args.lb_port, cancel.clone()).await?;

    let api = server::spawn(ApiContext { repository }, args.port, cancel.clone()).await?;

    shutdown_signal().await;
    log_info("main", "Shutting down", &[]);
    cancel.cancel();
    for handle in [monitor, reconciler, lb_server, lb_refresh, api] {
        let _ = handle.await;
    }
    Ok(())
}

async fn run_scheduler(args: SchedulerArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    apply_log_format(args.log_json);

    let db = Database::open(&args.data_dir)
        .map_err(|e| with_context(e, "failed to initialize store"))?;
    let repository = db.repository();
    let cancel = CancellationToken::new();

    let handle = Scheduler::with_flag(repository, args.resource_scheduler).spawn(cancel.clone());

    shutdown_signal().await;
    log_info("main", "Shutting down scheduler", &[]);
    cancel.cancel();
    let _ = handle.await;
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    apply_log_format(args.log_json);

    let node_name = args.node_name.unwrap_or_else(agent::default_node_name);
    let config = AgentConfig {
        node_name,
        api_server: args.api_server,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
    };
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new());
    let node_agent = NodeAgent::new(config, runtime);

    let cancel = CancellationToken::new();
    let handles = node_agent.start(cancel.clone()).await?;

    shutdown_signal().await;
    log_info("main", "Shutting down node agent", &[]);
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
