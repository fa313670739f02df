//! logbarrel node
//!
//! Runs the four stores, joins the cluster and serves the query API.

use logbarrel::api;
use logbarrel::cluster::Instance;
use logbarrel::config::{ComponentFactory, NodeConfig};
use logbarrel::telemetry::Telemetry;
use logbarrel::Error;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// logbarrel node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster-unique instance id (random when unset)
    #[arg(long, env = "LOGBARREL_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Address peers use to reach this node
    #[arg(long, env = "LOGBARREL_HOST_IP", default_value = "127.0.0.1")]
    host_ip: String,

    /// Host name reported to peers
    #[arg(long, env = "LOGBARREL_HOST_NAME", default_value = "localhost")]
    host_name: String,

    /// Cluster pub/sub port
    #[arg(long, default_value = "6362")]
    pub_port: u16,

    /// Log ingestion port
    #[arg(long, default_value = "6363")]
    log_port: u16,

    /// HTTP API port
    #[arg(long, default_value = "6364")]
    web_port: u16,

    /// Root directory for persisted streams and the spill file
    #[arg(long, env = "LOGBARREL_DATA_DIR", default_value = "/var/lib/logbarrel")]
    data_dir: PathBuf,

    /// Persister for operation events: file, eventfile
    #[arg(long, env = "LOGBARREL_EVENT_PERSISTER", default_value = "eventfile")]
    event_persister: String,

    /// Persister for container logs: file, eventfile
    #[arg(long, env = "LOGBARREL_CONTAINER_PERSISTER", default_value = "file")]
    container_persister: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let instance_id = args
        .instance_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let _telemetry = Telemetry::init_for_component("logbarrel", &instance_id, &args.log_level)?;
    info!(instance_id = %instance_id, "Starting logbarrel node");

    let instance = Instance::new(instance_id.clone(), args.host_ip.clone())
        .with_ports(args.pub_port, args.log_port, args.web_port)
        .with_host_name(args.host_name.clone());

    let mut config = NodeConfig::new(instance, &args.data_dir);
    config.event_persister = args.event_persister.parse()?;
    config.container_persister = args.container_persister.parse()?;

    let coordination = ComponentFactory::coordination_store_from_env()?;
    let broadcaster = ComponentFactory::broadcaster_from_env(config.cluster.pubsub_capacity)?;
    let coordinator = ComponentFactory::build_coordinator(config, coordination, broadcaster)?;

    coordinator.start().await?;

    let router = api::build_http_router(coordinator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], args.web_port));
    let listener = TcpListener::bind(addr).await?;
    info!(web_port = args.web_port, data_dir = %args.data_dir.display(), "Node ready");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {e}")));
    if let Err(e) = &served {
        error!(error = %e, "HTTP server stopped");
    }

    info!("Node shutting down");
    coordinator.stop().await?;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
