//! The read-only query surface over the consumer's store.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::store::{EventsQuery, IdentitiesQuery, RecordsQuery, Store};
use spyglass_types::string::{Did, Handle, Nsid, RecordKey};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub registry: Registry,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .route("/records", get(get_records))
        .route("/events", get(get_events))
        .route("/identities", get(get_identities))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    "spyglass"
}

async fn metrics(State(state): State<ApiState>) -> Result<String, StatusCode> {
    TextEncoder::new()
        .encode_to_string(&state.registry.gather())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn parse_limit(raw: &Option<String>) -> Result<i64, String> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_LIMIT);
    };
    let limit: i64 = raw.parse().map_err(|e| format!("invalid limit: {e}"))?;
    if limit < 1 {
        Ok(DEFAULT_LIMIT)
    } else {
        Ok(limit.min(MAX_LIMIT))
    }
}

fn parse_seq(raw: &Option<String>) -> Result<Option<i64>, String> {
    raw.as_ref()
        .map(|raw| raw.parse().map_err(|e| format!("invalid sequence number: {e}")))
        .transpose()
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordsParams {
    did: Option<String>,
    collection: Option<String>,
    rkey: Option<String>,
    seq: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonRecord {
    seq: i64,
    repo: String,
    collection: String,
    rkey: String,
    action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<serde_json::Value>,
}

#[derive(Debug, Default, Serialize)]
struct RecordsResponse {
    records: Vec<JsonRecord>,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

type ApiResult<T> = (StatusCode, Json<T>);

fn bad_request<T: Default + WithError>(error: String) -> ApiResult<T> {
    (StatusCode::BAD_REQUEST, Json(T::default().with_error(error)))
}

fn internal<T: Default + WithError>(error: String) -> ApiResult<T> {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(T::default().with_error(error)))
}

trait WithError {
    fn with_error(self, error: String) -> Self;
}

impl WithError for RecordsResponse {
    fn with_error(mut self, error: String) -> Self {
        self.error = error;
        self
    }
}

async fn get_records(
    State(state): State<ApiState>,
    Query(params): Query<RecordsParams>,
) -> ApiResult<RecordsResponse> {
    let mut query = RecordsQuery::default();

    if let Some(did) = &params.did {
        if let Err(err) = did.parse::<Did>() {
            return bad_request(format!("invalid DID: {err}"));
        }
        query.did = Some(did.clone());
    }
    if let Some(collection) = &params.collection {
        if let Err(err) = collection.parse::<Nsid>() {
            return bad_request(format!("invalid collection: {err}"));
        }
        query.collection = Some(collection.clone());
    }
    if let Some(rkey) = &params.rkey {
        if let Err(err) = rkey.parse::<RecordKey>() {
            return bad_request(format!("invalid record key: {err}"));
        }
        query.rkey = Some(rkey.clone());
    }
    match parse_seq(&params.seq) {
        Ok(seq) => query.seq = seq,
        Err(err) => return bad_request(err),
    }

    // Querying by collection requires a DID; querying by rkey requires both.
    if query.collection.is_some() && query.did.is_none() {
        return bad_request("cannot query by collection without a DID".into());
    }
    if query.rkey.is_some() && (query.did.is_none() || query.collection.is_none()) {
        return bad_request("cannot query by rkey without a DID and collection".into());
    }

    match parse_limit(&params.limit) {
        Ok(limit) => query.limit = limit,
        Err(err) => return bad_request(err),
    }

    let rows = match state.store.records(&query).await {
        Ok(rows) => rows,
        Err(err) => return internal(err.to_string()),
    };

    let records = rows
        .into_iter()
        .map(|r| {
            let raw = if r.raw.is_empty() {
                None
            } else {
                Some(serde_json::from_slice(&r.raw).unwrap_or_else(|err| {
                    serde_json::json!({ "error": err.to_string() })
                }))
            };
            JsonRecord {
                seq: r.firehose_seq,
                repo: r.repo,
                collection: r.collection,
                rkey: r.rkey,
                action: r.action,
                raw,
            }
        })
        .collect();

    (StatusCode::OK, Json(RecordsResponse { records, error: String::new() }))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsParams {
    did: Option<String>,
    event_type: Option<String>,
    seq: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonEvent {
    seq: i64,
    repo: String,
    event_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
    time: i64,
    since: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct EventsResponse {
    events: Vec<JsonEvent>,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

impl WithError for EventsResponse {
    fn with_error(mut self, error: String) -> Self {
        self.error = error;
        self
    }
}

async fn get_events(
    State(state): State<ApiState>,
    Query(params): Query<EventsParams>,
) -> ApiResult<EventsResponse> {
    let mut query = EventsQuery::default();

    if let Some(did) = &params.did {
        if let Err(err) = did.parse::<Did>() {
            return bad_request(format!("invalid DID: {err}"));
        }
        query.did = Some(did.clone());
    }
    query.event_type = params.event_type.clone();
    match parse_seq(&params.seq) {
        Ok(seq) => query.seq = seq,
        Err(err) => return bad_request(err),
    }
    match parse_limit(&params.limit) {
        Ok(limit) => query.limit = limit,
        Err(err) => return bad_request(err),
    }

    let rows = match state.store.events(&query).await {
        Ok(rows) => rows,
        Err(err) => return internal(err.to_string()),
    };

    let events = rows
        .into_iter()
        .map(|e| JsonEvent {
            seq: e.firehose_seq,
            repo: e.repo,
            event_type: e.event_type,
            error: e.error,
            time: e.time,
            since: e.since,
        })
        .collect();

    (StatusCode::OK, Json(EventsResponse { events, error: String::new() }))
}

#[derive(Debug, Default, Deserialize)]
pub struct IdentitiesParams {
    did: Option<String>,
    handle: Option<String>,
    pds: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Serialize)]
struct JsonIdentity {
    did: String,
    handle: String,
    pds: String,
    updated_at: i64,
}

#[derive(Debug, Default, Serialize)]
struct IdentitiesResponse {
    identities: Vec<JsonIdentity>,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

impl WithError for IdentitiesResponse {
    fn with_error(mut self, error: String) -> Self {
        self.error = error;
        self
    }
}

async fn get_identities(
    State(state): State<ApiState>,
    Query(params): Query<IdentitiesParams>,
) -> ApiResult<IdentitiesResponse> {
    let mut query = IdentitiesQuery::default();

    if let Some(did) = &params.did {
        if let Err(err) = did.parse::<Did>() {
            return bad_request(format!("invalid DID: {err}"));
        }
        query.did = Some(did.clone());
    }
    if let Some(handle) = &params.handle {
        if let Err(err) = handle.parse::<Handle>() {
            return bad_request(format!("invalid handle: {err}"));
        }
        query.handle = Some(handle.clone());
    }
    query.pds = params.pds.clone();
    match parse_limit(&params.limit) {
        Ok(limit) => query.limit = limit,
        Err(err) => return bad_request(err),
    }

    let rows = match state.store.identities(&query).await {
        Ok(rows) => rows,
        Err(err) => return internal(err.to_string()),
    };

    let identities = rows
        .into_iter()
        .map(|i| JsonIdentity { did: i.did, handle: i.handle, pds: i.pds, updated_at: i.updated_at })
        .collect();

    (StatusCode::OK, Json(IdentitiesResponse { identities, error: String::new() }))
}
