use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use spyglass_plc::api::{self, ApiState};
use spyglass_plc::metrics::Metrics;
use spyglass_plc::mirror::{Mirror, MirrorConfig, DEFAULT_PAGE_SIZE};
use spyglass_plc::store::PlcStore;

/// PLC directory mirror
#[derive(Parser, Debug)]
#[command(name = "spyglass-plc", version)]
struct Args {
    /// enable debug logging
    #[arg(long, env = "SPYGLASS_PLC_DEBUG")]
    debug: bool,

    /// listen address for the lookup http server
    #[arg(long, env = "SPYGLASS_PLC_LISTEN_ADDR", default_value = "0.0.0.0:3260")]
    listen_addr: String,

    /// listen address for the metrics http server
    #[arg(long, env = "SPYGLASS_PLC_METRICS_LISTEN_ADDR", default_value = "0.0.0.0:3261")]
    metrics_listen_addr: String,

    /// host of the PLC directory
    #[arg(long, env = "ATP_PLC_HOST", default_value = "https://plc.directory")]
    plc_host: String,

    /// path to the data directory
    #[arg(long, env = "SPYGLASS_PLC_DATA_DIR", default_value = "./data/plc-mirror")]
    data_dir: PathBuf,

    /// how long to wait before polling for new data after a short page
    #[arg(long, env = "SPYGLASS_PLC_CHECK_INTERVAL", default_value = "5s")]
    check_interval: humantime::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data directory {:?}", args.data_dir))?;

    let store = PlcStore::open(&args.data_dir).await.context("failed to open database")?;
    store.migrate().await.context("failed to migrate database")?;

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(Metrics::new(&registry).context("failed to register metrics")?);

    let mirror = Arc::new(Mirror::new(
        store.clone(),
        MirrorConfig {
            host: args.plc_host,
            page_size: DEFAULT_PAGE_SIZE,
            check_interval: *args.check_interval,
        },
        metrics,
    ));

    let shutdown = CancellationToken::new();
    // One set for the long-running routines so a panic in any of them is
    // observed below and turns into a non-zero exit.
    let mut tasks = JoinSet::new();

    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(err) = mirror.run(shutdown).await {
                tracing::error!(err = %err, "failed to run mirror");
            }
        });
    }

    let lookup = api::router(ApiState { store });
    let lookup_listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    tracing::info!(addr = %args.listen_addr, "lookup server listening");
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = axum::serve(lookup_listener, lookup)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!(err = %err, "lookup server failed");
            }
        });
    }

    let metrics_router = api::metrics_router(registry);
    let metrics_listener = tokio::net::TcpListener::bind(&args.metrics_listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.metrics_listen_addr))?;
    tracing::info!(addr = %args.metrics_listen_addr, "metrics server listening");
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = axum::serve(metrics_listener, metrics_router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!(err = %err, "metrics server failed");
            }
        });
    }

    let mut panicked = tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("received signal, shutting down");
            false
        }
        Some(result) = tasks.join_next() => observe_exit(result),
    };

    shutdown.cancel();
    while let Some(result) = tasks.join_next().await {
        panicked |= observe_exit(result);
    }
    tracing::info!("shutdown complete");

    if panicked {
        anyhow::bail!("terminated by routine panic");
    }
    Ok(())
}

/// Returns true when the routine panicked; a panic must turn into a
/// non-zero exit even when it happens during the drain.
fn observe_exit(result: Result<(), JoinError>) -> bool {
    match result {
        Err(err) if err.is_panic() => {
            tracing::error!(err = %err, "routine panicked, shutting down");
            true
        }
        _ => false,
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).expect("failed to install handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
