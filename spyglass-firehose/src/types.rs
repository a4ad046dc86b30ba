//! Typed payloads for the `com.atproto.sync.subscribeRepos` event stream.

use serde::Deserialize;
use spyglass_types::{string::Did, CidLink};

use crate::frames::Frame;

/// A repository commit: a batch of create/update/delete operations together
/// with the content-addressed block bundle backing them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub seq: i64,
    pub rebase: bool,
    pub too_big: bool,
    pub repo: Did,
    pub commit: CidLink,
    #[serde(default)]
    pub prev: Option<CidLink>,
    pub rev: String,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(with = "serde_bytes")]
    pub blocks: Vec<u8>,
    pub ops: Vec<RepoOp>,
    #[serde(default)]
    pub blobs: Vec<CidLink>,
    pub time: String,
}

/// One operation within a commit.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoOp {
    pub action: String,
    pub path: String,
    #[serde(default)]
    pub cid: Option<CidLink>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handle {
    pub seq: i64,
    pub did: Did,
    pub handle: String,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub seq: i64,
    pub did: Did,
    #[serde(default)]
    pub handle: Option<String>,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migrate {
    pub seq: i64,
    pub did: Did,
    #[serde(default)]
    pub migrate_to: Option<String>,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub seq: i64,
    pub did: Did,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub name: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// The body of an error frame, terminating the stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid DAG-CBOR payload: {0}")]
    Payload(#[from] serde_ipld_dagcbor::DecodeError<std::io::Error>),
}

/// A decoded event-stream payload.
#[derive(Debug, Clone)]
pub enum Event {
    Commit(Commit),
    Handle(Handle),
    Identity(Identity),
    Migrate(Migrate),
    Tombstone(Tombstone),
    Info(Info),
}

impl Event {
    /// Decodes a message frame into a typed event. Frames with unknown `t`
    /// values are ignored, per the event-stream spec.
    pub fn decode(t: &str, data: &[u8]) -> Result<Option<Self>, DecodeError> {
        let event = match t {
            "#commit" => Some(Self::Commit(serde_ipld_dagcbor::from_reader(data)?)),
            "#handle" => Some(Self::Handle(serde_ipld_dagcbor::from_reader(data)?)),
            "#identity" => Some(Self::Identity(serde_ipld_dagcbor::from_reader(data)?)),
            "#migrate" => Some(Self::Migrate(serde_ipld_dagcbor::from_reader(data)?)),
            "#tombstone" => Some(Self::Tombstone(serde_ipld_dagcbor::from_reader(data)?)),
            "#info" => Some(Self::Info(serde_ipld_dagcbor::from_reader(data)?)),
            _ => None,
        };
        Ok(event)
    }

    /// Decodes the payload of a [`Frame::Message`]; error frames yield the
    /// decoded [`ErrorBody`] as an `Err`.
    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, FrameError> {
        match frame {
            Frame::Message { t, payload } => Ok(Self::decode(t, payload)?),
            Frame::Error { payload } => {
                let body: ErrorBody = serde_ipld_dagcbor::from_reader(payload.as_slice())
                    .map_err(DecodeError::Payload)?;
                Err(FrameError::Upstream(body))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Commit(_) => "commit",
            Self::Handle(_) => "handle",
            Self::Identity(_) => "identity",
            Self::Migrate(_) => "migrate",
            Self::Tombstone(_) => "tombstone",
            Self::Info(_) => "info",
        }
    }

    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Commit(c) => Some(c.seq),
            Self::Handle(h) => Some(h.seq),
            Self::Identity(i) => Some(i.seq),
            Self::Migrate(m) => Some(m.seq),
            Self::Tombstone(t) => Some(t.seq),
            Self::Info(_) => None,
        }
    }

    /// The key used to route this event through the scheduler: events for
    /// the same repository must stay in order, so the repository identifier
    /// is the key; frames without one use the frame kind.
    pub fn scheduling_key(&self) -> &str {
        match self {
            Self::Commit(c) => c.repo.as_str(),
            Self::Handle(h) => h.did.as_str(),
            Self::Identity(i) => i.did.as_str(),
            Self::Migrate(m) => m.did.as_str(),
            Self::Tombstone(t) => t.did.as_str(),
            Self::Info(_) => self.kind(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("upstream error frame: {}", .0.error)]
    Upstream(ErrorBody),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipld_core::ipld::Ipld;
    use std::collections::BTreeMap;

    fn commit_payload() -> Ipld {
        let cid = ipld_core::cid::Cid::try_from(
            "bafkreibme22gw2h7y2h7tg2fhqotaqjucnbc24deqo72b6mkl2egezxhvy",
        )
        .unwrap();
        Ipld::Map(BTreeMap::from([
            ("seq".to_string(), Ipld::Integer(42)),
            ("rebase".to_string(), Ipld::Bool(false)),
            ("tooBig".to_string(), Ipld::Bool(true)),
            ("repo".to_string(), Ipld::String("did:plc:aaaa".to_string())),
            ("commit".to_string(), Ipld::Link(cid)),
            ("rev".to_string(), Ipld::String("3kabc".to_string())),
            ("since".to_string(), Ipld::Null),
            ("blocks".to_string(), Ipld::Bytes(vec![])),
            ("ops".to_string(), Ipld::List(vec![])),
            ("blobs".to_string(), Ipld::List(vec![])),
            ("time".to_string(), Ipld::String("2024-01-01T00:00:00.000Z".to_string())),
        ]))
    }

    #[test]
    fn decode_commit() {
        let bytes = serde_ipld_dagcbor::to_vec(&commit_payload()).unwrap();
        let event = Event::decode("#commit", &bytes).expect("decode").expect("known kind");

        assert_eq!(event.kind(), "commit");
        assert_eq!(event.seq(), Some(42));
        assert_eq!(event.scheduling_key(), "did:plc:aaaa");
        match event {
            Event::Commit(commit) => {
                assert!(commit.too_big);
                assert!(commit.since.is_none());
                assert!(commit.ops.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_tombstone() {
        let payload = Ipld::Map(BTreeMap::from([
            ("seq".to_string(), Ipld::Integer(7)),
            ("did".to_string(), Ipld::String("did:plc:bbbb".to_string())),
            ("time".to_string(), Ipld::String("2024-01-01T00:00:00.000Z".to_string())),
        ]));
        let bytes = serde_ipld_dagcbor::to_vec(&payload).unwrap();
        let event = Event::decode("#tombstone", &bytes).expect("decode").expect("known kind");
        assert_eq!(event.kind(), "tombstone");
        assert_eq!(event.scheduling_key(), "did:plc:bbbb");
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let bytes = serde_ipld_dagcbor::to_vec(&Ipld::Map(BTreeMap::new())).unwrap();
        assert!(Event::decode("#labels", &bytes).expect("decode").is_none());
    }

    #[test]
    fn error_frame_surfaces_body() {
        let payload = Ipld::Map(BTreeMap::from([(
            "error".to_string(),
            Ipld::String("FutureCursor".to_string()),
        )]));
        let frame = Frame::Error { payload: serde_ipld_dagcbor::to_vec(&payload).unwrap() };
        match Event::from_frame(&frame) {
            Err(FrameError::Upstream(body)) => assert_eq!(body.error, "FutureCursor"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
