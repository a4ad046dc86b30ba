//! Entries of the directory's append-only operation log.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One line of the directory's JSON-lines `export` response. The inner
/// operation object is schema-loose and kept opaque; the fields the mirror
/// needs are derived at ingest through typed accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcOperation {
    pub did: String,
    pub cid: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub nullified: bool,
    pub operation: serde_json::Value,
}

impl PlcOperation {
    /// The handle derived from the first `alsoKnownAs` entry, with the
    /// `at://` scheme stripped.
    pub fn handle(&self) -> Option<&str> {
        self.operation
            .get("alsoKnownAs")?
            .as_array()?
            .iter()
            .find_map(|aka| aka.as_str())
            .map(|aka| aka.strip_prefix("at://").unwrap_or(aka))
    }

    /// The atproto PDS endpoint, from `services.atproto_pds.endpoint`.
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.operation.get("services")?.get("atproto_pds")?.get("endpoint")?.as_str()
    }

    /// The creation timestamp in the RFC3339 nanosecond form used for
    /// storage ordering and the `after` export parameter.
    pub fn created_at_rfc3339(&self) -> String {
        format_created_at(&self.created_at)
    }
}

pub fn format_created_at(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
