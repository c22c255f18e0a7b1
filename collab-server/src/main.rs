//! collab-server binary entry point.
//!
//! Usage:
//! ```bash
//! collab-server --config collab.toml
//! collab-server --standalone
//! collab-server --help
//! ```

use anyhow::Context;
use clap::Parser;
use collab_types::InstanceId;
use quire_collab_server::backend::{RedisBackend, SyncBackend};
use quire_collab_server::config::Config;
use quire_collab_server::gateway::CollabGateway;
use quire_collab_server::http::build_router;
use quire_collab_server::storage::SqliteStorage;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaborative document sync server")]
#[command(version)]
struct Args {
    /// Configuration file. Defaults apply when it does not exist.
    #[arg(short, long, value_name = "PATH", default_value = "collab.toml")]
    config: PathBuf,

    /// Run without cross-instance sync.
    #[arg(long)]
    standalone: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "No configuration file, using defaults");
        Config::default()
    };
    if args.standalone {
        config.sync.enabled = false;
    }

    let storage = SqliteStorage::new(&config.persistence.database)
        .await
        .with_context(|| format!("failed to open {}", config.persistence.database.display()))?;

    let backend: Option<Arc<dyn SyncBackend>> = if config.sync.enabled {
        let redis = RedisBackend::connect(&config.sync.redis_url)
            .await
            .context("failed to connect to Redis")?;
        Some(Arc::new(redis))
    } else {
        None
    };

    let instance = InstanceId::generate();
    let gateway = Arc::new(CollabGateway::new(&config, instance, Arc::new(storage), backend));
    let app = build_router(Arc::clone(&gateway), &config);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    info!(
        address = %config.server.bind_address,
        instance = %gateway.instance(),
        mode = %gateway.mode(),
        "collab-server listening"
    );

    let drain_gateway = Arc::clone(&gateway);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received, draining");
        let report = drain_gateway.drain().await;
        info!(
            documents = report.documents,
            closed = report.closed_connections,
            forced = report.forced_connections,
            unflushed = report.unflushed_documents,
            elapsed = ?report.elapsed,
            "Drained"
        );
    })
    .await
    .context("server error")?;

    Ok(())
}
