//! The consumer service: WebSocket read loop, scheduler fan-out, cursor
//! flusher and retention sweeper.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use spyglass_firehose::types::FrameError;
use spyglass_firehose::{Event, FirehoseClient, Frame};

use crate::consumer::Consumer;
use crate::metrics::Metrics;
use crate::resolver::IdentityResolver;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::warehouse::WarehouseHandle;

const CURSOR_FLUSH_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    pub sqlite_path: String,
    pub migrate: bool,
    /// Retention for events and records; `None` (or zero) disables the
    /// sweeper.
    pub record_ttl: Option<Duration>,
    pub plc_host: String,
    pub plc_rate_limit: f64,
    pub lookup_on_commit: bool,
    pub workers: usize,
    pub queue_depth: usize,
}

pub struct Stream {
    config: StreamConfig,
    store: Store,
    consumer: Arc<Consumer>,
    last_seq: Arc<RwLock<i64>>,
}

impl Stream {
    pub async fn new(
        config: StreamConfig,
        warehouse: Option<WarehouseHandle>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let store = Store::open(&config.sqlite_path).await?;
        if config.migrate {
            tracing::info!("running database migrations");
            store.migrate().await?;
            tracing::info!("database migrations complete");
        }

        let resolver = Arc::new(IdentityResolver::new(&config.plc_host, config.plc_rate_limit));
        let last_seq = Arc::new(RwLock::new(0));
        let consumer = Arc::new(Consumer::new(
            store.clone(),
            resolver,
            warehouse,
            config.lookup_on_commit,
            last_seq.clone(),
            metrics,
        ));

        Ok(Self { config, store, consumer, last_seq })
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// The highest sequence number seen so far, read by the cursor flusher
    /// and the liveness monitor.
    pub fn last_seq(&self) -> i64 {
        *self.last_seq.read().expect("seq lock poisoned")
    }

    /// Runs the stream until the token is cancelled or the connection hits a
    /// terminal error. The cursor is flushed before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let cursor = self.store.load_cursor().await?.filter(|&seq| seq != 0);
        if let Some(seq) = cursor {
            *self.last_seq.write().expect("seq lock poisoned") = seq;
        }

        // Background timers share a local token so they also stop when the
        // read loop fails on its own.
        let local = shutdown.child_token();
        let flusher = tokio::spawn(cursor_flusher(
            self.store.clone(),
            self.last_seq.clone(),
            local.clone(),
        ));
        let sweeper = self
            .config
            .record_ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| tokio::spawn(sweeper(self.store.clone(), ttl, local.clone())));

        let client = FirehoseClient::new(&self.config.ws_url, cursor);
        tracing::info!(url = %client.request_uri()?, "connecting to relay");
        let mut ws = client.connect().await?;

        let consumer = self.consumer.clone();
        let scheduler =
            Scheduler::new(self.config.workers, self.config.queue_depth, move |event: Event| {
                let consumer = consumer.clone();
                async move { consumer.handle_event(event).await }
            });

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                message = ws.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        // Invalid framing or DAG-CBOR is a hard error: drop
                        // the connection rather than skip the frame.
                        let frame = match Frame::parse(data.as_ref()) {
                            Ok(frame) => frame,
                            Err(err) => break Err(anyhow!("invalid frame: {err}")),
                        };
                        match Event::from_frame(&frame) {
                            Ok(Some(event)) => {
                                let key = event.scheduling_key().to_string();
                                if scheduler.submit(&key, event).await.is_err() {
                                    break Err(anyhow!("scheduler shut down"));
                                }
                            }
                            Ok(None) => {}
                            Err(FrameError::Upstream(body)) => {
                                break Err(anyhow!("upstream error frame: {}", body.error));
                            }
                            Err(FrameError::Decode(err)) => {
                                break Err(anyhow!("failed to decode frame payload: {err}"));
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Err(anyhow!("relay closed the stream: {frame:?}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Err(anyhow!("websocket error: {err}")),
                    None => break Err(anyhow!("stream ended")),
                }
            }
        };

        tracing::info!("repo stream shutting down, draining scheduler");
        scheduler.shutdown().await;

        // Stop the timers; the flusher writes the final cursor on its way
        // out.
        local.cancel();
        let _ = flusher.await;
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        tracing::info!("repo stream shut down");
        result
    }
}

async fn cursor_flusher(store: Store, last_seq: Arc<RwLock<i64>>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(CURSOR_FLUSH_INTERVAL);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let seq = *last_seq.read().expect("seq lock poisoned");
                tracing::info!(seq, "stream closed, saving cursor");
                if let Err(err) = store.save_cursor(seq).await {
                    tracing::error!(err = %err, "failed to save cursor");
                }
                return;
            }
            _ = tick.tick() => {
                let seq = *last_seq.read().expect("seq lock poisoned");
                tracing::info!(seq, "saving cursor");
                if let Err(err) = store.save_cursor(seq).await {
                    tracing::error!(err = %err, "failed to save cursor");
                }
            }
        }
    }
}

async fn sweeper(store: Store, ttl: Duration, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {
                tracing::info!("deleting old events and records");
                match store.sweep(ttl).await {
                    Ok((events_deleted, records_deleted)) => {
                        tracing::info!(events_deleted, records_deleted, "old events and records deleted");
                    }
                    Err(err) => tracing::error!(err = %err, "failed to delete old rows"),
                }
            }
        }
    }
}
