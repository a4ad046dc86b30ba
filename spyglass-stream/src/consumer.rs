//! Typed handlers for decoded firehose events.
//!
//! Commit frames are unpacked into record rows; every frame leaves exactly
//! one event row behind, with per-operation failures accumulated into its
//! error column. Local failures never tear down the pipeline.

use std::sync::{Arc, RwLock};

use ipld_core::ipld::Ipld;
use spyglass_firehose::types::{Commit, Handle, Identity};
use spyglass_firehose::{CarIndex, Event, Repository};
use spyglass_types::string::{Did, RecordPath};

use crate::metrics::Metrics;
use crate::resolver::IdentityResolver;
use crate::store::{EventRow, IdentityRow, RecordRow, Store};
use crate::warehouse::{WarehouseHandle, WarehouseRecord};

pub struct Consumer {
    store: Store,
    resolver: Arc<IdentityResolver>,
    warehouse: Option<WarehouseHandle>,
    lookup_on_commit: bool,
    last_seq: Arc<RwLock<i64>>,
    metrics: Arc<Metrics>,
}

fn parse_time(time: &str) -> Result<i64, chrono::ParseError> {
    chrono::DateTime::parse_from_rfc3339(time).map(|t| t.timestamp_nanos_opt().unwrap_or_default())
}

impl Consumer {
    pub fn new(
        store: Store,
        resolver: Arc<IdentityResolver>,
        warehouse: Option<WarehouseHandle>,
        lookup_on_commit: bool,
        last_seq: Arc<RwLock<i64>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, resolver, warehouse, lookup_on_commit, last_seq, metrics }
    }

    fn set_seq(&self, seq: i64) {
        *self.last_seq.write().expect("seq lock poisoned") = seq;
    }

    pub async fn handle_event(&self, event: Event) {
        self.metrics.frames_received.with_label_values(&[event.kind()]).inc();
        match event {
            Event::Commit(commit) => self.handle_commit(commit).await,
            Event::Handle(handle) => self.handle_handle(handle).await,
            Event::Identity(identity) => self.handle_identity(identity).await,
            Event::Migrate(migrate) => {
                self.handle_metadata_event(migrate.seq, &migrate.did, "migrate", &migrate.time)
                    .await;
            }
            Event::Tombstone(tombstone) => {
                self.handle_metadata_event(
                    tombstone.seq,
                    &tombstone.did,
                    "tombstone",
                    &tombstone.time,
                )
                .await;
            }
            Event::Info(info) => {
                tracing::debug!(name = %info.name, message = ?info.message, "info frame");
            }
        }
    }

    async fn write_event(&self, event: &EventRow) {
        match self.store.insert_event(event).await {
            Ok(()) => self.metrics.events_written.inc(),
            Err(err) => {
                self.metrics.write_failures.inc();
                tracing::error!(err = %err, seq = event.firehose_seq, "failed to create event");
            }
        }
    }

    async fn handle_commit(&self, commit: Commit) {
        self.set_seq(commit.seq);

        let mut event = EventRow {
            firehose_seq: commit.seq,
            repo: commit.repo.to_string(),
            event_type: "commit".into(),
            error: String::new(),
            time: 0,
            since: commit.since.clone(),
        };

        if commit.too_big {
            tracing::warn!(repo = commit.repo.as_str(), seq = commit.seq, "commit too big");
            event.error = "commit too big".into();
            self.write_event(&event).await;
            return;
        }

        match parse_time(&commit.time) {
            Ok(ns) => event.time = ns,
            Err(err) => {
                tracing::error!(err = %err, "failed to parse time");
                event.error = format!("failed to parse time: {err}");
                self.write_event(&event).await;
                return;
            }
        }

        let blocks = match CarIndex::parse(&commit.blocks) {
            Ok(blocks) => blocks,
            Err(err) => {
                tracing::error!(err = %err, "failed to read event repo");
                event.error = format!("failed to read event repo: {err}");
                self.write_event(&event).await;
                return;
            }
        };
        let repo = match Repository::open(&blocks, commit.commit.0) {
            Ok(repo) => repo,
            Err(err) => {
                tracing::error!(err = %err, "failed to read event repo");
                event.error = format!("failed to read event repo: {err}");
                self.write_event(&event).await;
                return;
            }
        };

        for op in &commit.ops {
            match op.action.as_str() {
                "create" | "update" => {
                    let Some(declared) = op.cid else {
                        tracing::warn!(path = %op.path, action = %op.action, "op missing cid");
                        event.error.push_str(&format!("op missing cid (path: {:?})", op.path));
                        continue;
                    };

                    let (found, bytes) = match repo.get_record(&op.path) {
                        Ok(Some(pair)) => pair,
                        Ok(None) => {
                            event.error.push_str(&format!(
                                "failed to get record bytes (path: {:?}): not found in tree",
                                op.path
                            ));
                            continue;
                        }
                        Err(err) => {
                            event.error.push_str(&format!(
                                "failed to get record bytes (path: {:?}): {err}",
                                op.path
                            ));
                            continue;
                        }
                    };

                    if declared.0 != found {
                        tracing::warn!(
                            from_event = %declared,
                            from_blocks = %found,
                            "cid mismatch"
                        );
                        event.error.push_str(&format!(
                            "cid mismatch (path: {:?}): from_event {:?}, from_blocks {:?}",
                            op.path,
                            declared.to_string(),
                            found.to_string()
                        ));
                        continue;
                    }

                    if bytes.is_empty() {
                        event.error.push_str(&format!(
                            "record not found (nil bytes loaded from event blocks) path: {:?}",
                            op.path
                        ));
                        continue;
                    }

                    let value: Ipld = match serde_ipld_dagcbor::from_slice(bytes) {
                        Ok(value) => value,
                        Err(err) => {
                            event.error.push_str(&format!(
                                "failed to decode record CBOR (path: {:?}): {err}",
                                op.path
                            ));
                            continue;
                        }
                    };
                    let raw = match serde_ipld_dagjson::to_vec(&value) {
                        Ok(raw) => raw,
                        Err(err) => {
                            event.error.push_str(&format!(
                                "failed to encode record JSON (path: {:?}): {err}",
                                op.path
                            ));
                            continue;
                        }
                    };

                    let path: RecordPath = match op.path.parse() {
                        Ok(path) => path,
                        Err(err) => {
                            event.error.push_str(&format!(
                                "failed to parse record path (path: {:?}): {err}",
                                op.path
                            ));
                            continue;
                        }
                    };

                    let record = RecordRow {
                        firehose_seq: commit.seq,
                        repo: commit.repo.to_string(),
                        collection: String::from(path.collection),
                        rkey: String::from(path.rkey),
                        action: op.action.clone(),
                        raw,
                    };
                    self.write_record(&mut event, op.path.as_str(), record).await;
                }
                "delete" => {
                    let path: RecordPath = match op.path.parse() {
                        Ok(path) => path,
                        Err(err) => {
                            event.error.push_str(&format!(
                                "failed to parse record path (path: {:?}): {err}",
                                op.path
                            ));
                            continue;
                        }
                    };

                    let record = RecordRow {
                        firehose_seq: commit.seq,
                        repo: commit.repo.to_string(),
                        collection: String::from(path.collection),
                        rkey: String::from(path.rkey),
                        action: op.action.clone(),
                        raw: Vec::new(),
                    };
                    self.write_record(&mut event, op.path.as_str(), record).await;
                }
                other => {
                    tracing::warn!(action = other, "unknown action");
                    event
                        .error
                        .push_str(&format!("unknown action (path: {:?}): {:?}", op.path, other));
                }
            }
        }

        self.write_event(&event).await;

        if self.lookup_on_commit {
            self.refresh_identity(&commit.repo, false).await;
        }
    }

    async fn write_record(&self, event: &mut EventRow, path: &str, record: RecordRow) {
        if let Err(err) = self.store.insert_record(&record).await {
            self.metrics.write_failures.inc();
            tracing::error!(err = %err, "failed to create db record");
            event.error.push_str(&format!("failed to create db record (path: {path:?}): {err}"));
            return;
        }
        self.metrics.records_written.inc();

        if let Some(warehouse) = &self.warehouse {
            warehouse.enqueue(WarehouseRecord {
                created_at: chrono::Utc::now().to_rfc3339(),
                firehose_seq: record.firehose_seq,
                repo: record.repo,
                collection: record.collection,
                r_key: record.rkey,
                action: record.action,
                raw: if record.raw.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&record.raw).into_owned())
                },
                error: String::new(),
            });
        }
    }

    async fn handle_handle(&self, handle: Handle) {
        self.set_seq(handle.seq);

        let mut event = EventRow {
            firehose_seq: handle.seq,
            repo: handle.did.to_string(),
            event_type: "handle".into(),
            error: String::new(),
            time: 0,
            since: None,
        };

        // A handle frame is the signal that the cached mapping went stale.
        self.refresh_identity(&handle.did, true).await;

        match parse_time(&handle.time) {
            Ok(ns) => event.time = ns,
            Err(err) => {
                tracing::error!(err = %err, "failed to parse time");
                event.error = format!("failed to parse time: {err}");
            }
        }
        self.write_event(&event).await;
    }

    async fn handle_identity(&self, identity: Identity) {
        self.set_seq(identity.seq);

        let mut event = EventRow {
            firehose_seq: identity.seq,
            repo: identity.did.to_string(),
            event_type: "identity".into(),
            error: String::new(),
            time: 0,
            since: None,
        };

        self.refresh_identity(&identity.did, true).await;

        match parse_time(&identity.time) {
            Ok(ns) => event.time = ns,
            Err(err) => {
                tracing::error!(err = %err, "failed to parse time");
                event.error = format!("failed to parse time: {err}");
            }
        }
        self.write_event(&event).await;
    }

    async fn handle_metadata_event(&self, seq: i64, did: &Did, event_type: &str, time: &str) {
        self.set_seq(seq);

        let mut event = EventRow {
            firehose_seq: seq,
            repo: did.to_string(),
            event_type: event_type.into(),
            error: String::new(),
            time: 0,
            since: None,
        };

        match parse_time(time) {
            Ok(ns) => event.time = ns,
            Err(err) => {
                tracing::error!(err = %err, "failed to parse time");
                event.error = format!("failed to parse time: {err}");
            }
        }
        self.write_event(&event).await;
    }

    /// Resolves the subject and upserts the identity row when the answer is
    /// fresh. `purge_first` drops the cache entry before resolving.
    async fn refresh_identity(&self, did: &Did, purge_first: bool) {
        if purge_first {
            self.resolver.purge(did.as_str()).await;
        }
        match self.resolver.resolve(did.as_str()).await {
            Ok((Some(identity), from_cache)) => {
                if !from_cache {
                    let row = IdentityRow {
                        did: identity.did,
                        handle: identity.handle,
                        pds: identity.pds,
                    };
                    if let Err(err) = self.store.upsert_identity(&row).await {
                        self.metrics.write_failures.inc();
                        tracing::error!(err = %err, "failed to save identity");
                    }
                }
            }
            Ok((None, _)) => tracing::debug!(did = did.as_str(), "identity not found in directory"),
            Err(err) => tracing::error!(did = did.as_str(), err = %err, "failed to lookup DID"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use crate::store::{EventsQuery, IdentitiesQuery, RecordsQuery};
    use ipld_core::cid::{multihash::Multihash, Cid};
    use prometheus::Registry;
    use sha2::Digest;
    use spyglass_firehose::car::{DAG_CBOR, SHA2_256};
    use spyglass_firehose::types::RepoOp;
    use spyglass_types::CidLink;
    use std::collections::BTreeMap;

    fn cid_for(contents: &[u8]) -> Cid {
        let digest = sha2::Sha256::digest(contents);
        let mh = Multihash::wrap(SHA2_256, digest.as_slice()).unwrap();
        Cid::new_v1(DAG_CBOR, mh)
    }

    fn encode_car(root: Cid, blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
        let header = serde_ipld_dagcbor::to_vec(&Ipld::Map(BTreeMap::from([
            ("version".to_string(), Ipld::Integer(1)),
            ("roots".to_string(), Ipld::List(vec![Ipld::Link(root)])),
        ])))
        .unwrap();

        let mut out = Vec::new();
        let mut buf = unsigned_varint::encode::usize_buffer();
        out.extend_from_slice(unsigned_varint::encode::usize(header.len(), &mut buf));
        out.extend_from_slice(&header);

        for (cid, contents) in blocks {
            let mut cid_bytes = Vec::new();
            cid.write_bytes(&mut cid_bytes).unwrap();
            let mut buf = unsigned_varint::encode::u64_buffer();
            out.extend_from_slice(unsigned_varint::encode::u64(
                (cid_bytes.len() + contents.len()) as u64,
                &mut buf,
            ));
            out.extend_from_slice(&cid_bytes);
            out.extend_from_slice(contents);
        }
        out
    }

    /// Builds a commit CAR holding one record at `path`, returning the CAR
    /// bytes, the commit CID and the record CID.
    fn commit_car(did: &str, path: &str, record: &Ipld) -> (Vec<u8>, Cid, Cid) {
        let record_bytes = serde_ipld_dagcbor::to_vec(record).unwrap();
        let record_cid = cid_for(&record_bytes);

        let node = Ipld::Map(BTreeMap::from([
            ("l".to_string(), Ipld::Null),
            (
                "e".to_string(),
                Ipld::List(vec![Ipld::Map(BTreeMap::from([
                    ("p".to_string(), Ipld::Integer(0)),
                    ("k".to_string(), Ipld::Bytes(path.as_bytes().to_vec())),
                    ("v".to_string(), Ipld::Link(record_cid)),
                    ("t".to_string(), Ipld::Null),
                ]))]),
            ),
        ]));
        let node_bytes = serde_ipld_dagcbor::to_vec(&node).unwrap();
        let node_cid = cid_for(&node_bytes);

        let commit = Ipld::Map(BTreeMap::from([
            ("did".to_string(), Ipld::String(did.to_string())),
            ("version".to_string(), Ipld::Integer(3)),
            ("data".to_string(), Ipld::Link(node_cid)),
            ("rev".to_string(), Ipld::String("3jqfcqzm3fo2j".to_string())),
            ("prev".to_string(), Ipld::Null),
            ("sig".to_string(), Ipld::Bytes(vec![0; 64])),
        ]));
        let commit_bytes = serde_ipld_dagcbor::to_vec(&commit).unwrap();
        let commit_cid = cid_for(&commit_bytes);

        let car = encode_car(
            commit_cid,
            &[(commit_cid, commit_bytes), (node_cid, node_bytes), (record_cid, record_bytes)],
        );
        (car, commit_cid, record_cid)
    }

    fn post_record(text: &str) -> Ipld {
        Ipld::Map(BTreeMap::from([
            ("$type".to_string(), Ipld::String("app.bsky.feed.post".to_string())),
            ("text".to_string(), Ipld::String(text.to_string())),
        ]))
    }

    fn base_commit(seq: i64, repo: &str, blocks: Vec<u8>, commit: Cid, ops: Vec<RepoOp>) -> Commit {
        Commit {
            seq,
            rebase: false,
            too_big: false,
            repo: repo.parse().unwrap(),
            commit: CidLink(commit),
            prev: None,
            rev: "3jqfcqzm3fo2j".into(),
            since: None,
            blocks,
            ops,
            blobs: vec![],
            time: "2024-01-01T00:00:00.000Z".into(),
        }
    }

    async fn consumer(store: Store, plc_host: &str, lookup_on_commit: bool) -> Consumer {
        Consumer::new(
            store,
            Arc::new(IdentityResolver::new(plc_host, 1000.0)),
            None,
            lookup_on_commit,
            Arc::new(RwLock::new(0)),
            Arc::new(Metrics::new(&Registry::new()).unwrap()),
        )
    }

    #[tokio::test]
    async fn oversize_commit_writes_only_an_event() {
        let (store, _file) = temp_store().await;
        let consumer = consumer(store.clone(), "http://127.0.0.1:1", false).await;

        let mut commit =
            base_commit(42, "did:plc:aaaa", vec![], cid_for(b"commit"), vec![]);
        commit.too_big = true;
        consumer.handle_event(Event::Commit(commit)).await;

        let events =
            store.events(&EventsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].firehose_seq, 42);
        assert_eq!(events[0].repo, "did:plc:aaaa");
        assert_eq!(events[0].event_type, "commit");
        assert_eq!(events[0].error, "commit too big");

        let records =
            store.records(&RecordsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn cid_mismatch_skips_the_record() {
        let (store, _file) = temp_store().await;
        let consumer = consumer(store.clone(), "http://127.0.0.1:1", false).await;

        let path = "app.bsky.feed.post/3kabc";
        let (car, commit_cid, _) = commit_car("did:plc:aaaa", path, &post_record("hello"));
        let wrong = cid_for(b"some other bytes entirely");
        let ops = vec![RepoOp {
            action: "create".into(),
            path: path.into(),
            cid: Some(CidLink(wrong)),
        }];
        consumer
            .handle_event(Event::Commit(base_commit(7, "did:plc:aaaa", car, commit_cid, ops)))
            .await;

        let records =
            store.records(&RecordsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert!(records.is_empty());

        let events =
            store.events(&EventsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(
            events[0].error.contains(r#"cid mismatch (path: "app.bsky.feed.post/3kabc")"#),
            "unexpected error: {}",
            events[0].error
        );
    }

    #[tokio::test]
    async fn create_op_round_trips_through_canonical_json() {
        let (store, _file) = temp_store().await;
        let consumer = consumer(store.clone(), "http://127.0.0.1:1", false).await;

        let path = "app.bsky.feed.post/3kabc";
        let (car, commit_cid, record_cid) =
            commit_car("did:plc:aaaa", path, &post_record("hello world"));
        let ops = vec![RepoOp {
            action: "create".into(),
            path: path.into(),
            cid: Some(CidLink(record_cid)),
        }];
        consumer
            .handle_event(Event::Commit(base_commit(8, "did:plc:aaaa", car, commit_cid, ops)))
            .await;

        let records =
            store.records(&RecordsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].collection, "app.bsky.feed.post");
        assert_eq!(records[0].rkey, "3kabc");
        assert_eq!(records[0].action, "create");

        // The stored JSON, re-encoded to canonical CBOR, must hash back to
        // the operation's declared CID.
        let value: Ipld = serde_ipld_dagjson::from_slice(&records[0].raw).unwrap();
        let reencoded = serde_ipld_dagcbor::to_vec(&value).unwrap();
        assert_eq!(cid_for(&reencoded), record_cid);

        let events =
            store.events(&EventsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error, "");
        assert_ne!(events[0].time, 0);
    }

    #[tokio::test]
    async fn delete_op_writes_empty_payload() {
        let (store, _file) = temp_store().await;
        let consumer = consumer(store.clone(), "http://127.0.0.1:1", false).await;

        let path = "app.bsky.feed.post/3kabc";
        let (car, commit_cid, _) = commit_car("did:plc:aaaa", path, &post_record("bye"));
        let ops = vec![RepoOp { action: "delete".into(), path: path.into(), cid: None }];
        consumer
            .handle_event(Event::Commit(base_commit(9, "did:plc:aaaa", car, commit_cid, ops)))
            .await;

        let records =
            store.records(&RecordsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "delete");
        assert!(records[0].raw.is_empty());
    }

    #[tokio::test]
    async fn malformed_ops_abort_only_themselves() {
        let (store, _file) = temp_store().await;
        let consumer = consumer(store.clone(), "http://127.0.0.1:1", false).await;

        let path = "app.bsky.feed.post/3kabc";
        let (car, commit_cid, record_cid) = commit_car("did:plc:aaaa", path, &post_record("hi"));
        let ops = vec![
            // Missing CID: skipped with an accumulated error.
            RepoOp { action: "create".into(), path: path.into(), cid: None },
            // Unparseable path: skipped.
            RepoOp {
                action: "create".into(),
                path: "not-a-collection".into(),
                cid: Some(CidLink(record_cid)),
            },
            // Unknown action: skipped.
            RepoOp { action: "conjure".into(), path: path.into(), cid: None },
            // Valid op: still lands.
            RepoOp { action: "create".into(), path: path.into(), cid: Some(CidLink(record_cid)) },
        ];
        consumer
            .handle_event(Event::Commit(base_commit(10, "did:plc:aaaa", car, commit_cid, ops)))
            .await;

        let records =
            store.records(&RecordsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert_eq!(records.len(), 1);

        let events =
            store.events(&EventsQuery { limit: 100, ..Default::default() }).await.unwrap();
        let error = &events[0].error;
        assert!(error.contains("op missing cid"), "unexpected error: {error}");
        assert!(error.contains("failed to get record bytes"), "unexpected error: {error}");
        assert!(error.contains("unknown action"), "unexpected error: {error}");
    }

    #[tokio::test]
    async fn handle_event_refreshes_identity() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/did:plc:aaaa")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r##"{
                    "@context": ["https://www.w3.org/ns/did/v1"],
                    "id": "did:plc:aaaa",
                    "alsoKnownAs": ["at://alice.test"],
                    "service": [{
                        "id": "#atproto_pds",
                        "type": "AtprotoPersonalDataServer",
                        "serviceEndpoint": "https://pds.example"
                    }]
                }"##,
            )
            .create_async()
            .await;

        let (store, _file) = temp_store().await;
        let consumer = consumer(store.clone(), &server.url(), false).await;

        consumer
            .handle_event(Event::Handle(Handle {
                seq: 11,
                did: "did:plc:aaaa".parse().unwrap(),
                handle: "alice.test".into(),
                time: "2024-01-01T00:00:00.000Z".into(),
            }))
            .await;

        let identities =
            store.identities(&IdentitiesQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].handle, "alice.test");
        assert_eq!(identities[0].pds, "https://pds.example");

        let events =
            store.events(&EventsQuery { limit: 100, ..Default::default() }).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "handle");
    }
}
