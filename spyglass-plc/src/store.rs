//! The mirror's embedded store: operations, the subject index, and the
//! paginator's cursor. Single-writer / pooled-reader split, WAL journaling
//! and NORMAL synchronous, the same way the consumer's store is set up.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::QueryBuilder;

use crate::models::PlcOperation;

const READER_MAX_CONNECTIONS: u32 = 50;
/// Rows per INSERT statement when writing a page.
const INSERT_BATCH: usize = 100;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OpRow {
    pub did: String,
    pub cid: String,
    pub created_at: String,
    pub nullified: bool,
    pub operation: String,
    pub handle: String,
    pub pds: String,
}

impl OpRow {
    pub fn from_operation(op: &PlcOperation) -> Result<Self, serde_json::Error> {
        Ok(Self {
            did: op.did.clone(),
            cid: op.cid.clone(),
            created_at: op.created_at_rfc3339(),
            nullified: op.nullified,
            operation: serde_json::to_string(&op.operation)?,
            handle: op.handle().unwrap_or_default().to_string(),
            pds: op.pds_endpoint().unwrap_or_default().to_string(),
        })
    }
}

/// The paginator's resume point. Exactly one row exists and it is rewritten
/// after each successful page.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct Cursor {
    pub did: String,
    pub cid: String,
    pub last_created_at: String,
    pub ops_seen: i64,
}

#[derive(Clone)]
pub struct PlcStore {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl PlcStore {
    pub async fn open(data_dir: &Path) -> Result<Self, sqlx::Error> {
        let path = data_dir.join("plc.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let writer =
            SqlitePoolOptions::new().max_connections(1).connect_with(options.clone()).await?;
        let reader = SqlitePoolOptions::new()
            .max_connections(READER_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        Ok(Self { writer, reader })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plc_ops (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                did TEXT NOT NULL,
                cid TEXT NOT NULL,
                created_at TEXT NOT NULL,
                nullified INTEGER NOT NULL DEFAULT 0,
                operation TEXT NOT NULL,
                handle TEXT NOT NULL DEFAULT '',
                pds TEXT NOT NULL DEFAULT '',
                UNIQUE (did, created_at) ON CONFLICT IGNORE
            )",
        )
        .execute(&self.writer)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_plc_ops_did_created_at
             ON plc_ops (did, created_at DESC)",
        )
        .execute(&self.writer)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_plc_ops_handle ON plc_ops (handle)")
            .execute(&self.writer)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_plc_ops_pds ON plc_ops (pds)")
            .execute(&self.writer)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plc_dids (
                did TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.writer)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plc_cursor (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                did TEXT NOT NULL,
                cid TEXT NOT NULL,
                last_created_at TEXT NOT NULL,
                ops_seen INTEGER NOT NULL
            )",
        )
        .execute(&self.writer)
        .await?;

        Ok(())
    }

    /// Writes a page of operations, batched at [`INSERT_BATCH`] rows per
    /// statement. Replayed `(did, created_at)` pairs are ignored.
    pub async fn insert_ops(&self, ops: &[OpRow]) -> Result<(), sqlx::Error> {
        for chunk in ops.chunks(INSERT_BATCH) {
            let mut qb = QueryBuilder::new(
                "INSERT INTO plc_ops (did, cid, created_at, nullified, operation, handle, pds) ",
            );
            qb.push_values(chunk, |mut b, op| {
                b.push_bind(&op.did)
                    .push_bind(&op.cid)
                    .push_bind(&op.created_at)
                    .push_bind(op.nullified)
                    .push_bind(&op.operation)
                    .push_bind(&op.handle)
                    .push_bind(&op.pds);
            });
            qb.build().execute(&self.writer).await?;
        }
        Ok(())
    }

    /// Writes the subject index for a page with conflict-ignore.
    pub async fn insert_dids(&self, dids: &[(String, String)]) -> Result<(), sqlx::Error> {
        for chunk in dids.chunks(INSERT_BATCH) {
            let mut qb =
                QueryBuilder::new("INSERT OR IGNORE INTO plc_dids (did, created_at) ");
            qb.push_values(chunk, |mut b, (did, created_at)| {
                b.push_bind(did).push_bind(created_at);
            });
            qb.build().execute(&self.writer).await?;
        }
        Ok(())
    }

    pub async fn load_cursor(&self) -> Result<Option<Cursor>, sqlx::Error> {
        sqlx::query_as(
            "SELECT did, cid, last_created_at, ops_seen FROM plc_cursor WHERE id = 0",
        )
        .fetch_optional(&self.writer)
        .await
    }

    pub async fn save_cursor(&self, cursor: &Cursor) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO plc_cursor (id, did, cid, last_created_at, ops_seen)
             VALUES (0, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                 did = excluded.did,
                 cid = excluded.cid,
                 last_created_at = excluded.last_created_at,
                 ops_seen = excluded.ops_seen",
        )
        .bind(&cursor.did)
        .bind(&cursor.cid)
        .bind(&cursor.last_created_at)
        .bind(cursor.ops_seen)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    /// The most recent non-nullified operation for a subject. Nullified
    /// operations are retained but never projected.
    pub async fn latest_op(&self, did: &str) -> Result<Option<OpRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT did, cid, created_at, nullified, operation, handle, pds
             FROM plc_ops WHERE did = ? AND nullified = 0
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(did)
        .fetch_optional(&self.reader)
        .await
    }

    /// Reverse lookup: the subject of the most recent operation carrying
    /// this handle.
    pub async fn did_by_handle(&self, handle: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT did FROM plc_ops WHERE handle = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(handle)
        .fetch_optional(&self.reader)
        .await?;
        Ok(row.map(|(did,)| did))
    }

    /// Reverse lookup: the handle of the subject's most recent operation.
    pub async fn handle_by_did(&self, did: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT handle FROM plc_ops WHERE did = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(did)
        .fetch_optional(&self.reader)
        .await?;
        Ok(row.map(|(handle,)| handle))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{op, temp_store};
    use super::*;

    #[tokio::test]
    async fn cursor_round_trip() {
        let (store, _dir) = temp_store().await;
        assert!(store.load_cursor().await.unwrap().is_none());

        let cursor = Cursor {
            did: "did:plc:xyz".into(),
            cid: "bafy".into(),
            last_created_at: "2023-02-01T12:00:00.123456789Z".into(),
            ops_seen: 1000,
        };
        store.save_cursor(&cursor).await.unwrap();

        let loaded = store.load_cursor().await.unwrap().expect("cursor exists");
        assert_eq!(loaded.last_created_at, cursor.last_created_at);
        assert_eq!(loaded.ops_seen, 1000);

        // Rewritten, not appended.
        store.save_cursor(&Cursor { ops_seen: 2000, ..cursor }).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap().unwrap().ops_seen, 2000);
    }

    #[tokio::test]
    async fn latest_op_ignores_nullified() {
        let (store, _dir) = temp_store().await;
        let mut nullified = op("did:plc:xyz", "2023-02-02T00:00:00.000000000Z", "evil.test");
        nullified.nullified = true;
        store
            .insert_ops(&[
                op("did:plc:xyz", "2023-02-01T00:00:00.000000000Z", "alice.test"),
                nullified,
            ])
            .await
            .unwrap();

        let latest = store.latest_op("did:plc:xyz").await.unwrap().expect("op exists");
        assert_eq!(latest.handle, "alice.test");
    }

    #[tokio::test]
    async fn replayed_page_is_idempotent() {
        let (store, _dir) = temp_store().await;
        let rows = vec![
            op("did:plc:xyz", "2023-02-01T00:00:00.000000000Z", "alice.test"),
            op("did:plc:abc", "2023-02-01T00:00:01.000000000Z", "bob.test"),
        ];
        store.insert_ops(&rows).await.unwrap();
        store.insert_ops(&rows).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM plc_ops")
            .fetch_one(&store.reader)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn reverse_lookups_follow_the_latest_op() {
        let (store, _dir) = temp_store().await;
        store
            .insert_ops(&[
                op("did:plc:xyz", "2023-02-01T00:00:00.000000000Z", "alice.test"),
                op("did:plc:xyz", "2023-02-02T00:00:00.000000000Z", "renamed.test"),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.did_by_handle("renamed.test").await.unwrap().as_deref(),
            Some("did:plc:xyz")
        );
        assert_eq!(
            store.handle_by_did("did:plc:xyz").await.unwrap().as_deref(),
            Some("renamed.test")
        );
        assert_eq!(store.did_by_handle("missing.test").await.unwrap(), None);
        assert_eq!(store.handle_by_did("did:plc:none").await.unwrap(), None);
    }

    #[tokio::test]
    async fn batches_larger_than_the_chunk_size() {
        let (store, _dir) = temp_store().await;
        let rows: Vec<OpRow> = (0..250)
            .map(|n| op(&format!("did:plc:u{n}"), "2023-02-01T00:00:00.000000000Z", "u.test"))
            .collect();
        store.insert_ops(&rows).await.unwrap();
        let dids: Vec<(String, String)> = rows
            .iter()
            .map(|r| (r.did.clone(), r.created_at.clone()))
            .collect();
        store.insert_dids(&dids).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM plc_dids")
            .fetch_one(&store.reader)
            .await
            .unwrap();
        assert_eq!(count, 250);
    }
}
