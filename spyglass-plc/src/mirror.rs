//! The paginator: walks the directory's `export` endpoint and persists
//! every operation, advancing a durable cursor after each page.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use spyglass_common::RateLimiter;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::models::PlcOperation;
use crate::store::{Cursor, OpRow, PlcStore};

pub const DEFAULT_PAGE_SIZE: usize = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to back off after the directory rate-limits us.
const RATE_LIMITED_BACKOFF: Duration = Duration::from_secs(2 * 60);
/// How long to back off after any other upstream failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("rate limited")]
    RateLimited,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response status: {0}")]
    Status(StatusCode),
    #[error("failed to decode JSON line: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to save page: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub host: String,
    pub page_size: usize,
    pub check_interval: Duration,
}

pub struct Mirror {
    config: MirrorConfig,
    store: PlcStore,
    http: reqwest::Client,
    limiter: RateLimiter,
    metrics: Arc<Metrics>,
}

impl Mirror {
    pub fn new(store: PlcStore, config: MirrorConfig, metrics: Arc<Metrics>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(crate::USER_AGENT)
            .build()
            .expect("reqwest client");
        Self {
            config: MirrorConfig { host: config.host.trim_end_matches('/').to_string(), ..config },
            store,
            http,
            limiter: RateLimiter::new(1.0, 1),
            metrics,
        }
    }

    /// Runs the paginator until cancelled. Upstream failures back off and
    /// retry; they never terminate the loop.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!("running");
        let mut cursor = self.store.load_cursor().await?;

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("shutting down run loop");
                return Ok(());
            }

            let wait = match self.next_page(&mut cursor).await {
                Ok(ops_seen) => {
                    tracing::info!(ops_seen, "got next page");
                    if ops_seen < self.config.page_size {
                        self.config.check_interval
                    } else {
                        continue;
                    }
                }
                Err(PageError::RateLimited) => {
                    tracing::warn!("rate limited, waiting before retrying");
                    RATE_LIMITED_BACKOFF
                }
                Err(err) => {
                    tracing::error!(err = %err, "failed to get next page");
                    RETRY_BACKOFF
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutting down run loop");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Fetches and persists one export page, returning how many operations
    /// it carried. The cursor is advanced only after the batch is written.
    pub async fn next_page(&self, cursor: &mut Option<Cursor>) -> Result<usize, PageError> {
        let mut url = format!("{}/export?count={}", self.config.host, self.config.page_size);
        if let Some(cursor) = cursor.as_ref() {
            url.push_str(&format!("&after={}", cursor.last_created_at));
        }

        tracing::info!(url = %url, "getting next page");

        self.limiter.acquire().await;
        let response =
            self.http.get(&url).header("Accept", "application/json").send().await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(PageError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(PageError::Status(response.status()));
        }

        // The response body is JSON lines.
        let body = response.text().await?;
        let mut ops = Vec::new();
        let mut dids = Vec::new();
        let mut next = cursor.clone().unwrap_or_default();

        for line in body.lines().filter(|line| !line.trim().is_empty()) {
            let op: PlcOperation = serde_json::from_str(line)?;
            let row = OpRow::from_operation(&op)?;

            dids.push((op.did.clone(), row.created_at.clone()));
            next.did = op.did;
            next.cid = op.cid;
            next.last_created_at = row.created_at.clone();
            next.ops_seen += 1;
            ops.push(row);
        }

        if ops.is_empty() {
            return Ok(0);
        }

        let count = ops.len();
        self.store.insert_ops(&ops).await?;
        self.store.insert_dids(&dids).await?;
        self.store.save_cursor(&next).await?;
        *cursor = Some(next);

        self.metrics.pages_fetched.inc();
        self.metrics.ops_ingested.inc_by(count as u64);
        Ok(count)
    }
}
