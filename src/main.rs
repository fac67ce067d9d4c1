use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentry_gate::collab::{
    AbuseReporter, CidrCdnMembership, LogTxSink, MemorySnapshotStore, MemoryTxLog,
    NoopAbuseReporter, RedisSnapshotStore, SnapshotStore, WafReporter,
};
use sentry_gate::config::GatewayConfig;
use sentry_gate::proxy::{build_http_client, Collaborators, GatewayContext, GatewayServer};
use sentry_gate::ratelimit::RateLimiterSet;

const TX_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "sentry-gate", version, about)]
struct Cli {
    /// YAML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }

    info!("Starting Sentry Gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        windows = config.rate_limits.windows.len(),
        origins = config.upstreams.origins.len(),
        "Configuration loaded"
    );

    let limiters = RateLimiterSet::from_windows(&config.rate_limits.windows)?;
    let store: Arc<dyn SnapshotStore> = match &config.persistence.redis_url {
        Some(url) => Arc::new(RedisSnapshotStore::connect(url).await?),
        None => {
            warn!("No Redis configured, limiter state will not survive a restart");
            Arc::new(MemorySnapshotStore::new())
        }
    };
    match limiters.load_from_cache(store.as_ref()).await {
        Ok(restored) => info!(restored, "Rate limiter state restored"),
        Err(e) => warn!(error = %e, "Failed to restore rate limiter state"),
    }

    let background = CancellationToken::new();
    let mut tasks = Vec::new();
    let http = build_http_client(&config.upstreams)?;

    let (tx_log, writer) =
        MemoryTxLog::spawn(Arc::new(LogTxSink), TX_QUEUE_SIZE, background.clone());
    tasks.push(writer);

    let abuse: Arc<dyn AbuseReporter> = match &config.waf.endpoint {
        Some(endpoint) => {
            let (reporter, worker) = WafReporter::spawn(
                &config.waf,
                endpoint.clone(),
                http.clone(),
                limiters.clone(),
                background.clone(),
            );
            tasks.push(worker);
            let seeding = reporter.clone();
            tokio::spawn(async move {
                if let Err(e) = seeding.seed_banned().await {
                    warn!(error = %e, "Failed to load the banned client list");
                }
            });
            Arc::new(reporter)
        }
        None => Arc::new(NoopAbuseReporter),
    };

    let cdn = CidrCdnMembership::from_config(&config.cdn)?;
    info!(networks = cdn.len(), "CDN membership loaded");

    let sweep_interval = Duration::from_secs(config.rate_limits.sweep_interval_secs);
    let listen_addr = config.server.listen_addr;
    let grace = config.server.shutdown_grace();
    let ctx = Arc::new(GatewayContext::new(
        config,
        limiters.clone(),
        http,
        Collaborators {
            cdn: Arc::new(cdn),
            tx_log,
            abuse,
        },
    )?);

    tasks.extend(limiters.spawn_sweeper(sweep_interval, background.clone()));

    GatewayServer::new(listen_addr, ctx)
        .serve_with_shutdown(shutdown_signal(), grace)
        .await?;

    // flush before the background tasks go away
    if let Err(e) = limiters.save_cache(store.as_ref()).await {
        warn!(error = %e, "Failed to save rate limiter state");
    }
    background.cancel();
    for task in tasks {
        let _ = task.await;
    }

    info!("Sentry Gate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
