//! shardhouse server
//!
//! Runs an N x M cluster (coordination ensemble, storage nodes, router,
//! ingestion gateway and query coordinator) in one process and serves the
//! ingestion, query, admin and node RPC APIs over HTTP.

use shardhouse::api::{self, ApiServerConfig};
use shardhouse::clock::SystemClock;
use shardhouse::cluster::{LocalCluster, PartitionKind, Wiring};
use shardhouse::config::{ClusterConfig, ComponentFactory};
use shardhouse::telemetry::{Telemetry, TelemetryConfig};
use shardhouse::transport::HttpTransport;
use shardhouse::Error;

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Nodes call each other in-process
    Local,
    /// Nodes call each other through this server's node RPC endpoints
    Http,
}

/// shardhouse server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP API port
    #[arg(long, env = "SHARDHOUSE_HTTP_PORT", default_value = "8123")]
    http_port: u16,

    /// Address other nodes use to reach this server (http transport only)
    #[arg(long, env = "SHARDHOUSE_ADVERTISE_ADDR")]
    advertise_addr: Option<String>,

    /// Node-to-node transport
    #[arg(long, value_enum, default_value = "local")]
    transport: TransportKind,

    /// Number of shard groups; overrides SHARDHOUSE_SHARD_GROUPS
    #[arg(long)]
    shard_groups: Option<u32>,

    /// Replicas per shard group; overrides SHARDHOUSE_REPLICAS_PER_GROUP
    #[arg(long)]
    replicas: Option<usize>,

    /// Partition function: hash_range or modulo
    #[arg(long)]
    partition: Option<PartitionKind>,

    /// WAL root directory; overrides SHARDHOUSE_WAL_DIR
    #[arg(long)]
    wal_dir: Option<PathBuf>,

    /// Node RPC timeout in milliseconds (http transport only)
    #[arg(long, default_value = "5000")]
    rpc_timeout_ms: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = ClusterConfig::from_env()?;
    if let Some(n) = args.shard_groups {
        config.shard_groups = n;
    }
    if let Some(m) = args.replicas {
        config.replicas_per_group = m;
    }
    if let Some(partition) = args.partition {
        config.partition = partition;
    }
    if let Some(dir) = args.wal_dir.clone() {
        config.wal.wal_dir = dir;
    }
    config.validate()?;

    let telemetry = TelemetryConfig::from_env("shardhouse", &config)?;
    let _telemetry = Telemetry::init(telemetry, &args.log_level)?;
    info!("Starting shardhouse");

    info!(
        shard_groups = config.shard_groups,
        replicas_per_group = config.replicas_per_group,
        ensemble_size = config.ensemble_size,
        partition = ?config.partition,
        wal_dir = %config.wal.wal_dir.display(),
        transport = ?args.transport,
        "Cluster configuration"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    let listener = TcpListener::bind(addr).await?;

    let wiring = match args.transport {
        TransportKind::Local => Wiring::InProcess,
        TransportKind::Http => {
            let advertise = args
                .advertise_addr
                .clone()
                .unwrap_or_else(|| format!("http://127.0.0.1:{}", args.http_port));
            let transport = HttpTransport::new(Duration::from_millis(args.rpc_timeout_ms))?;
            Wiring::Http {
                advertise,
                transport: Arc::new(transport),
            }
        }
    };

    let object_store = ComponentFactory::create_object_store().await?;
    let clock = Arc::new(SystemClock::default());
    let cluster =
        Arc::new(LocalCluster::start_with(config, clock, object_store, wiring).await?);

    let cancel = CancellationToken::new();
    let background = cluster.spawn_background(cancel.clone());

    let server_config = ApiServerConfig {
        http_port: args.http_port,
        ..Default::default()
    };
    let router = api::build_http_router(cluster.clone(), &server_config);

    info!(http_port = args.http_port, "shardhouse ready");

    let shutdown = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {e}")))?;

    cancel.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("shardhouse shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
