use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::admission::Admission;
use tollgate::bucket::TokenBucket;
use tollgate::config::TollgateConfig;
use tollgate::grpc::{BucketStoreService, GateService, GrpcServer};
use tollgate::store::{Backend, MemoryStore};

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Token-bucket admission control")]
struct Cli {
    /// YAML configuration file; TOLLGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Answer admission checks using the configured store
    Serve,
    /// Host the bucket store shared by several `serve` instances
    Store,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::load(cli.config.as_deref())?;
    info!(
        grpc_addr = %config.server.grpc_addr,
        rate = config.limiter.rate,
        capacity = config.limiter.capacity,
        store = ?config.store.kind,
        "Configuration loaded"
    );

    match cli.command {
        Command::Serve => serve(config).await?,
        Command::Store => store(config).await?,
    }

    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: TollgateConfig) -> anyhow::Result<()> {
    let backend = Backend::from_config(&config.store).await?;

    let mut limiter = TokenBucket::new(config.limiter.policy()?, backend)
        .with_guard_shards(config.limiter.guard_shards);
    if let Some(timeout) = config.limiter.store_timeout() {
        limiter = limiter.with_store_timeout(timeout);
    }
    info!("Token bucket initialized");

    let admission = Admission::new(
        Arc::new(limiter),
        config.limiter.key_strategy,
        config.limiter.cost_per_request,
    );
    let gate = GateService::new(Arc::new(admission), config.limiter.api_key_header.clone());

    GrpcServer::gate(config.server.grpc_addr, gate)
        .serve_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn store(config: TollgateConfig) -> anyhow::Result<()> {
    let service = BucketStoreService::new(Arc::new(MemoryStore::new()))
        .with_guard_shards(config.limiter.guard_shards);

    let sweeper = config.store.idle_ttl().map(|ttl| {
        info!(ttl_secs = ttl.as_secs(), "Evicting idle buckets");
        service.spawn_eviction(ttl)
    });

    let result = GrpcServer::bucket_store(config.store.listen_addr, service)
        .serve_with_shutdown(shutdown_signal())
        .await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    result?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
