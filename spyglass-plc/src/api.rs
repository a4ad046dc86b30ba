//! Lookup HTTP surface: DID documents and handle↔DID reverse lookups.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Registry, TextEncoder};
use serde_json::json;

use crate::doc::{self, Error as DocError};
use crate::store::PlcStore;
use spyglass_types::string::AtIdentifier;

#[derive(Clone)]
pub struct ApiState {
    pub store: PlcStore,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/reverse/{handle_or_did}", get(reverse))
        .route("/{did}", get(did_doc))
        .with_state(state)
}

/// A separate router for the metrics listener.
pub fn metrics_router(registry: Registry) -> Router {
    Router::new().route("/metrics", get(move || metrics(registry.clone())))
}

async fn metrics(registry: Registry) -> Result<String, StatusCode> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

type ApiResult = (StatusCode, Json<serde_json::Value>);

fn error(status: StatusCode, message: String) -> ApiResult {
    (status, Json(json!({ "error": message })))
}

async fn did_doc(State(state): State<ApiState>, Path(did): Path<String>) -> ApiResult {
    let did = match did.parse::<spyglass_types::string::Did>() {
        Ok(did) => did,
        Err(err) => return error(StatusCode::BAD_REQUEST, format!("invalid DID: {err}")),
    };

    match doc::did_document(&state.store, did.as_str()).await {
        Ok(document) => match serde_json::to_value(&document) {
            Ok(value) => (StatusCode::OK, Json(value)),
            Err(err) => error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode DID document: {err}"),
            ),
        },
        Err(DocError::NotFound) => {
            error(StatusCode::NOT_FOUND, format!("DID not found: {}", did.as_str()))
        }
        Err(err) => error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get DID document: {err}"),
        ),
    }
}

async fn reverse(
    State(state): State<ApiState>,
    Path(handle_or_did): Path<String>,
) -> ApiResult {
    let identifier = match handle_or_did.parse::<AtIdentifier>() {
        Ok(identifier) => identifier,
        Err(err) => {
            return error(StatusCode::BAD_REQUEST, format!("invalid DID or handle: {err}"));
        }
    };

    match identifier {
        AtIdentifier::Handle(handle) => match state.store.did_by_handle(handle.as_str()).await {
            Ok(Some(did)) => (StatusCode::OK, Json(json!({ "did": did }))),
            Ok(None) => {
                error(StatusCode::NOT_FOUND, format!("handle not found: {}", handle.as_str()))
            }
            Err(err) => error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to get DID by handle: {err}"),
            ),
        },
        AtIdentifier::Did(did) => match state.store.handle_by_did(did.as_str()).await {
            Ok(Some(handle)) => (StatusCode::OK, Json(json!({ "handle": handle }))),
            Ok(None) => {
                error(StatusCode::NOT_FOUND, format!("DID not found: {}", did.as_str()))
            }
            Err(err) => error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to get handle by DID: {err}"),
            ),
        },
    }
}
