use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use spyglass_stream::api::{self, ApiState};
use spyglass_stream::metrics::Metrics;
use spyglass_stream::scheduler::{DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS};
use spyglass_stream::stream::{Stream, StreamConfig};
use spyglass_stream::warehouse::{Warehouse, WarehouseConfig};

const LIVENESS_INTERVAL: Duration = Duration::from_secs(15);

/// atproto firehose stream consumer
#[derive(Parser, Debug)]
#[command(name = "spyglass-stream", version)]
struct Args {
    /// full websocket path to the ATProto SubscribeRepos XRPC endpoint
    #[arg(
        long,
        env = "SPYGLASS_WS_URL",
        default_value = "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos"
    )]
    ws_url: String,

    /// port to serve the http server on
    #[arg(long, env = "SPYGLASS_PORT", default_value_t = 8080)]
    port: u16,

    /// enable debug logging
    #[arg(long, env = "SPYGLASS_DEBUG")]
    debug: bool,

    /// path to the sqlite database
    #[arg(long, env = "SPYGLASS_SQLITE_PATH", default_value = "./data/spyglass.db")]
    sqlite_path: String,

    /// run database migrations on startup
    #[arg(
        long,
        env = "SPYGLASS_MIGRATE_DB",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    migrate_db: bool,

    /// time to live for events and records in the DB (0 disables the sweeper)
    #[arg(long, env = "SPYGLASS_EVT_RECORD_TTL", default_value = "72h")]
    evt_record_ttl: humantime::Duration,

    /// Google Cloud project ID for BigQuery; fan-out is disabled when unset
    #[arg(long, env = "SPYGLASS_BIGQUERY_PROJECT_ID")]
    bigquery_project_id: Option<String>,

    /// BigQuery dataset name
    #[arg(long, env = "SPYGLASS_BIGQUERY_DATASET", default_value = "")]
    bigquery_dataset: String,

    /// BigQuery table name prefix
    #[arg(long, env = "SPYGLASS_BIGQUERY_TABLE_PREFIX", default_value = "records")]
    bigquery_table_prefix: String,

    /// rate limit for PLC lookups in requests per second
    #[arg(long, env = "SPYGLASS_PLC_RATE_LIMIT", default_value_t = 100.0)]
    plc_rate_limit: f64,

    /// host of the PLC directory used for identity lookups
    #[arg(long, env = "SPYGLASS_PLC_HOST", default_value = "https://plc.directory")]
    plc_host: String,

    /// lookup DID docs on commit events (avoid on high-volume deployments
    /// without a rate-limit bypass)
    #[arg(long, env = "SPYGLASS_LOOKUP_ON_COMMIT")]
    lookup_on_commit: bool,
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

    tracing::info!("starting up");

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(Metrics::new(&registry).context("failed to register metrics")?);

    let shutdown = CancellationToken::new();
    // Cancelled when a critical routine decides the process must die.
    let kill = CancellationToken::new();

    let mut warehouse_task = None;
    let warehouse = match &args.bigquery_project_id {
        Some(project_id) => {
            tracing::info!("bigquery project id set, starting warehouse sink");
            let (handle, task) = Warehouse::start(
                WarehouseConfig {
                    project_id: project_id.clone(),
                    dataset: args.bigquery_dataset.clone(),
                    table_prefix: args.bigquery_table_prefix.clone(),
                },
                shutdown.clone(),
            )
            .await
            .context("failed to start warehouse sink")?;
            warehouse_task = Some(task);
            Some(handle)
        }
        None => None,
    };

    let config = StreamConfig {
        ws_url: args.ws_url,
        sqlite_path: args.sqlite_path,
        migrate: args.migrate_db,
        record_ttl: Some(*args.evt_record_ttl).filter(|ttl| !ttl.is_zero()),
        plc_host: args.plc_host,
        plc_rate_limit: args.plc_rate_limit,
        lookup_on_commit: args.lookup_on_commit,
        workers: DEFAULT_WORKERS,
        queue_depth: DEFAULT_QUEUE_DEPTH,
    };
    let stream = Arc::new(Stream::new(config, warehouse, metrics).await?);

    // The critical routines run in one set so a panic in any of them is
    // observed below and turns into a non-zero exit.
    let mut tasks = JoinSet::new();

    // HTTP query surface.
    let router = api::router(ApiState { store: stream.store(), registry });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("failed to bind port {}", args.port))?;
    tracing::info!(port = args.port, "http server listening");
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!(err = %err, "http server failed");
            }
            tracing::info!("http server shut down");
        });
    }

    // Firehose read loop.
    {
        let shutdown = shutdown.clone();
        let kill = kill.clone();
        let stream = stream.clone();
        tasks.spawn(async move {
            if let Err(err) = stream.run(shutdown).await {
                tracing::error!(err = %err, "stream returned an error");
                kill.cancel();
            }
        });
    }

    // Liveness: no new events for a while means the upstream connection is
    // wedged; die so the outer supervisor restarts us.
    {
        let shutdown = shutdown.clone();
        let kill = kill.clone();
        let stream = stream.clone();
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(LIVENESS_INTERVAL);
            tick.tick().await;
            let mut last_seq = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("shutting down liveness checker");
                        return;
                    }
                    _ = tick.tick() => {
                        let seq = stream.last_seq();
                        if seq == last_seq {
                            tracing::error!(last_seq, "no new events, shutting down for the supervisor to restart us");
                            kill.cancel();
                            return;
                        }
                        tracing::debug!(last_seq = seq, "received new events, resetting liveness timer");
                        last_seq = seq;
                    }
                }
            }
        });
    }

    let mut killed = tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("received signal, shutting down");
            false
        }
        _ = kill.cancelled() => {
            tracing::info!("shutting down due to critical routine failure");
            true
        }
        Some(result) = tasks.join_next() => match result {
            Err(err) if err.is_panic() => {
                tracing::error!(err = %err, "critical routine panicked, shutting down");
                true
            }
            // A routine finished on its own; whether that is fatal is
            // decided by the kill token it may have cancelled on the way
            // out.
            _ => kill.is_cancelled(),
        }
    };

    tracing::info!("shutting down, waiting for routines to finish");
    shutdown.cancel();
    while let Some(result) = tasks.join_next().await {
        killed |= observe_exit(result);
    }
    if let Some(task) = warehouse_task {
        killed |= observe_exit(task.await);
    }
    tracing::info!("shutdown complete");

    if killed {
        anyhow::bail!("terminated by liveness monitor or critical routine failure");
    }
    Ok(())
}

/// Returns true when the routine panicked; a panicking routine must turn
/// into a non-zero exit even if it died during the drain.
fn observe_exit(result: Result<(), JoinError>) -> bool {
    match result {
        Err(err) if err.is_panic() => {
            tracing::error!(err = %err, "critical routine panicked");
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
