//! The consumer's embedded store.
//!
//! One SQLite file serves both sides: a single-connection writer pool (the
//! store is single-writer by contract) and a wide reader pool for the query
//! surface. WAL journaling and NORMAL synchronous are set on every
//! connection.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::QueryBuilder;

const READER_MAX_CONNECTIONS: u32 = 50;

#[derive(Debug, Clone)]
pub struct EventRow {
    pub firehose_seq: i64,
    pub repo: String,
    pub event_type: String,
    pub error: String,
    pub time: i64,
    pub since: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordRow {
    pub firehose_seq: i64,
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    pub action: String,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct IdentityRow {
    pub did: String,
    pub handle: String,
    pub pds: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredRecord {
    pub firehose_seq: i64,
    pub repo: String,
    pub collection: String,
    pub rkey: String,
    pub action: String,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub firehose_seq: i64,
    pub repo: String,
    pub event_type: String,
    pub error: String,
    pub time: i64,
    pub since: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredIdentity {
    pub did: String,
    pub handle: String,
    pub pds: String,
    pub updated_at: i64,
}

#[derive(Debug, Default, Clone)]
pub struct RecordsQuery {
    pub did: Option<String>,
    pub collection: Option<String>,
    pub rkey: Option<String>,
    pub seq: Option<i64>,
    pub limit: i64,
}

#[derive(Debug, Default, Clone)]
pub struct EventsQuery {
    pub did: Option<String>,
    pub event_type: Option<String>,
    pub seq: Option<i64>,
    pub limit: i64,
}

#[derive(Debug, Default, Clone)]
pub struct IdentitiesQuery {
    pub did: Option<String>,
    pub handle: Option<String>,
    pub pds: Option<String>,
    pub limit: i64,
}

#[derive(Clone)]
pub struct Store {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Store {
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
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
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                firehose_seq INTEGER NOT NULL,
                repo TEXT NOT NULL,
                event_type TEXT NOT NULL,
                error TEXT NOT NULL DEFAULT '',
                time INTEGER NOT NULL DEFAULT 0,
                since TEXT
            )",
        )
        .execute(&self.writer)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_seq ON events (firehose_seq)")
            .execute(&self.writer)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_repo ON events (repo)")
            .execute(&self.writer)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type)")
            .execute(&self.writer)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at)")
            .execute(&self.writer)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                firehose_seq INTEGER NOT NULL,
                repo TEXT NOT NULL,
                collection TEXT NOT NULL,
                rkey TEXT NOT NULL,
                action TEXT NOT NULL,
                raw BLOB NOT NULL DEFAULT x''
            )",
        )
        .execute(&self.writer)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_seq ON records (firehose_seq)")
            .execute(&self.writer)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_path ON records (repo, collection, rkey)",
        )
        .execute(&self.writer)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_created_at ON records (created_at)")
            .execute(&self.writer)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS identities (
                did TEXT PRIMARY KEY,
                handle TEXT NOT NULL DEFAULT '',
                pds TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.writer)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stream_cursor (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                last_seq INTEGER NOT NULL
            )",
        )
        .execute(&self.writer)
        .await?;

        Ok(())
    }

    pub async fn insert_event(&self, event: &EventRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO events (created_at, firehose_seq, repo, event_type, error, time, since)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(event.firehose_seq)
        .bind(&event.repo)
        .bind(&event.event_type)
        .bind(&event.error)
        .bind(event.time)
        .bind(event.since.as_deref())
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn insert_record(&self, record: &RecordRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO records (created_at, firehose_seq, repo, collection, rkey, action, raw)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(record.firehose_seq)
        .bind(&record.repo)
        .bind(&record.collection)
        .bind(&record.rkey)
        .bind(&record.action)
        .bind(&record.raw)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn upsert_identity(&self, identity: &IdentityRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO identities (did, handle, pds, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (did) DO UPDATE SET
                 handle = excluded.handle,
                 pds = excluded.pds,
                 updated_at = excluded.updated_at",
        )
        .bind(&identity.did)
        .bind(&identity.handle)
        .bind(&identity.pds)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn load_cursor(&self) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_seq FROM stream_cursor WHERE id = 0")
                .fetch_optional(&self.writer)
                .await?;
        Ok(row.map(|(seq,)| seq))
    }

    pub async fn save_cursor(&self, seq: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO stream_cursor (id, last_seq) VALUES (0, ?)
             ON CONFLICT (id) DO UPDATE SET last_seq = excluded.last_seq",
        )
        .bind(seq)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    /// Deletes events and records older than the TTL. Returns the two row
    /// counts.
    pub async fn sweep(&self, ttl: Duration) -> Result<(u64, u64), sqlx::Error> {
        let horizon = Utc::now().timestamp_millis() - ttl.as_millis() as i64;

        let events = sqlx::query("DELETE FROM events WHERE created_at < ?")
            .bind(horizon)
            .execute(&self.writer)
            .await?
            .rows_affected();
        let records = sqlx::query("DELETE FROM records WHERE created_at < ?")
            .bind(horizon)
            .execute(&self.writer)
            .await?
            .rows_affected();

        Ok((events, records))
    }

    pub async fn records(&self, query: &RecordsQuery) -> Result<Vec<StoredRecord>, sqlx::Error> {
        let mut qb = QueryBuilder::new(
            "SELECT firehose_seq, repo, collection, rkey, action, raw FROM records WHERE 1 = 1",
        );
        if let Some(did) = &query.did {
            qb.push(" AND repo = ").push_bind(did);
        }
        if let Some(collection) = &query.collection {
            qb.push(" AND collection = ").push_bind(collection);
        }
        if let Some(rkey) = &query.rkey {
            qb.push(" AND rkey = ").push_bind(rkey);
        }
        if let Some(seq) = query.seq {
            qb.push(" AND firehose_seq = ").push_bind(seq);
        }
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(query.limit);

        qb.build_query_as().fetch_all(&self.reader).await
    }

    pub async fn events(&self, query: &EventsQuery) -> Result<Vec<StoredEvent>, sqlx::Error> {
        let mut qb = QueryBuilder::new(
            "SELECT firehose_seq, repo, event_type, error, time, since FROM events WHERE 1 = 1",
        );
        if let Some(did) = &query.did {
            qb.push(" AND repo = ").push_bind(did);
        }
        if let Some(event_type) = &query.event_type {
            qb.push(" AND event_type = ").push_bind(event_type);
        }
        if let Some(seq) = query.seq {
            qb.push(" AND firehose_seq = ").push_bind(seq);
        }
        qb.push(" ORDER BY firehose_seq DESC LIMIT ").push_bind(query.limit);

        qb.build_query_as().fetch_all(&self.reader).await
    }

    pub async fn identities(
        &self,
        query: &IdentitiesQuery,
    ) -> Result<Vec<StoredIdentity>, sqlx::Error> {
        let mut qb =
            QueryBuilder::new("SELECT did, handle, pds, updated_at FROM identities WHERE 1 = 1");
        if let Some(did) = &query.did {
            qb.push(" AND did = ").push_bind(did);
        }
        if let Some(handle) = &query.handle {
            qb.push(" AND handle = ").push_bind(handle);
        }
        if let Some(pds) = &query.pds {
            qb.push(" AND pds = ").push_bind(pds);
        }
        qb.push(" ORDER BY updated_at DESC LIMIT ").push_bind(query.limit);

        qb.build_query_as().fetch_all(&self.reader).await
    }
}
