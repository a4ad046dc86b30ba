//! Optional batched fan-out of records into BigQuery.
//!
//! This is a lossy sink: the embedded store is canonical, so a failed flush
//! is logged and dropped. Rows buffer up to [`BUFFER_ROWS`] and flush on a
//! 5-second tick, on a full buffer, and on shutdown. The target table
//! carries a UTC-day suffix and is created when the day rolls over.

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::{
    table::Table, table_data_insert_all_request::TableDataInsertAllRequest,
    table_field_schema::TableFieldSchema, table_schema::TableSchema,
};
use gcp_bigquery_client::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BUFFER_ROWS: usize = 10_000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct WarehouseRecord {
    pub created_at: String,
    pub firehose_seq: i64,
    pub repo: String,
    pub collection: String,
    pub r_key: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub project_id: String,
    pub dataset: String,
    pub table_prefix: String,
}

/// Cheap handle used by the consumer to enqueue rows.
#[derive(Clone)]
pub struct WarehouseHandle {
    tx: mpsc::Sender<WarehouseRecord>,
}

impl WarehouseHandle {
    /// Enqueues a row without waiting; a full buffer drops the row.
    pub fn enqueue(&self, record: WarehouseRecord) {
        if let Err(err) = self.tx.try_send(record) {
            tracing::warn!(err = %err, "warehouse buffer full, dropping record");
        }
    }
}

pub struct Warehouse {
    client: Client,
    config: WarehouseConfig,
    table_date: Option<NaiveDate>,
}

impl Warehouse {
    /// Connects with application-default credentials and spawns the flush
    /// loop. The returned handle is what producers use.
    pub async fn start(
        config: WarehouseConfig,
        shutdown: CancellationToken,
    ) -> Result<(WarehouseHandle, JoinHandle<()>), BQError> {
        let client = Client::from_application_default_credentials().await?;
        let (tx, rx) = mpsc::channel(BUFFER_ROWS);
        let warehouse = Self { client, config, table_date: None };
        let task = tokio::spawn(warehouse.run(rx, shutdown));
        Ok((WarehouseHandle { tx }, task))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WarehouseRecord>, shutdown: CancellationToken) {
        let mut buffer: Vec<WarehouseRecord> = Vec::new();
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                record = rx.recv() => match record {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= BUFFER_ROWS {
                            self.flush(&mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.flush(&mut buffer).await,
                _ = shutdown.cancelled() => break,
            }
        }

        // Drain whatever was queued before shutdown.
        while let Ok(record) = rx.try_recv() {
            buffer.push(record);
        }
        self.flush(&mut buffer).await;
        tracing::info!("warehouse sink shut down");
    }

    async fn flush(&mut self, buffer: &mut Vec<WarehouseRecord>) {
        if buffer.is_empty() {
            return;
        }
        let rows = std::mem::take(buffer);
        let count = rows.len();

        let table_id = match self.ensure_table().await {
            Ok(table_id) => table_id,
            Err(err) => {
                tracing::error!(err = %err, count, "failed to prepare warehouse table, dropping batch");
                return;
            }
        };

        let mut request = TableDataInsertAllRequest::new();
        for row in rows {
            if let Err(err) = request.add_row(None, row) {
                tracing::error!(err = %err, "failed to serialize warehouse row, dropping it");
            }
        }

        match self
            .client
            .tabledata()
            .insert_all(&self.config.project_id, &self.config.dataset, &table_id, request)
            .await
        {
            Ok(response) => {
                if let Some(errors) = response.insert_errors {
                    if !errors.is_empty() {
                        tracing::error!(failed = errors.len(), count, "warehouse rejected rows");
                        return;
                    }
                }
                tracing::debug!(count, table = %table_id, "flushed warehouse batch");
            }
            Err(err) => {
                tracing::error!(err = %err, count, "warehouse flush failed, dropping batch");
            }
        }
    }

    /// Returns today's table id, creating the table at the UTC day boundary.
    async fn ensure_table(&mut self) -> Result<String, BQError> {
        let today = Utc::now().date_naive();
        let table_id = table_id(&self.config.table_prefix, today);

        if self.table_date == Some(today) {
            return Ok(table_id);
        }

        let exists = self
            .client
            .table()
            .get(&self.config.project_id, &self.config.dataset, &table_id, None)
            .await
            .is_ok();
        if !exists {
            tracing::info!(table = %table_id, "warehouse table does not exist, creating");
            self.client
                .table()
                .create(Table::new(
                    &self.config.project_id,
                    &self.config.dataset,
                    &table_id,
                    record_schema(),
                ))
                .await?;
        }

        self.table_date = Some(today);
        Ok(table_id)
    }
}

fn table_id(prefix: &str, date: NaiveDate) -> String {
    format!("{}_{}", prefix, date.format("%Y%m%d"))
}

fn record_schema() -> TableSchema {
    TableSchema::new(vec![
        TableFieldSchema::timestamp("created_at"),
        TableFieldSchema::integer("firehose_seq"),
        TableFieldSchema::string("repo"),
        TableFieldSchema::string("collection"),
        TableFieldSchema::string("r_key"),
        TableFieldSchema::string("action"),
        TableFieldSchema::string("raw"),
        TableFieldSchema::string("error"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_id_uses_utc_day_suffix() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(table_id("records", date), "records_20240309");
    }

    #[test]
    fn rows_serialize_for_insert_all() {
        let row = WarehouseRecord {
            created_at: "2024-03-09T00:00:00Z".into(),
            firehose_seq: 42,
            repo: "did:plc:aaaa".into(),
            collection: "app.bsky.feed.post".into(),
            r_key: "3kabc".into(),
            action: "create".into(),
            raw: Some(r#"{"text":"hi"}"#.into()),
            error: String::new(),
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["firehose_seq"], 42);
        assert_eq!(value["r_key"], "3kabc");

        let mut request = TableDataInsertAllRequest::new();
        request.add_row(None, row).expect("row should serialize");
    }
}
