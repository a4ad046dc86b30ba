//! Binary event-stream frames.
//!
//! Every frame carries two DAG-CBOR values back to back: a small header
//! naming the frame kind, then the payload. See the [event-stream spec].
//!
//! [event-stream spec]: https://atproto.com/specs/event-stream

use cbor4ii::core::utils::IoReader;
use serde::Deserialize;
use serde_ipld_dagcbor::de::Deserializer;
use std::io::Cursor;

/// Header `op` for a typed message frame.
const OP_MESSAGE: i64 = 1;
/// Header `op` for a terminal error frame.
const OP_ERROR: i64 = -1;

/// The frame header. `t` is only present on message frames.
#[derive(Debug, Deserialize)]
struct Header {
    op: i64,
    #[serde(default)]
    t: Option<String>,
}

/// Errors that can occur while splitting a frame.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid frame header: {0}")]
    Header(#[source] serde_ipld_dagcbor::DecodeError<std::io::Error>),
    #[error("unsupported frame op {0}")]
    UnsupportedOp(i64),
    #[error("message frame is missing its 't' field")]
    MissingType,
    #[error("frame is missing its payload")]
    MissingPayload,
}

/// A frame received from a subscription, split into kind and raw payload.
/// Payload decoding is left to the caller; see [`crate::types::Event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message { t: String, payload: Vec<u8> },
    Error { payload: Vec<u8> },
}

impl Frame {
    /// Splits a binary message into header and payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(bytes);
        let mut deserializer = Deserializer::from_reader(IoReader::new(&mut cursor));
        let header = Header::deserialize(&mut deserializer).map_err(Error::Header)?;

        // `end()` succeeds only when the header was the sole value in the
        // message, which means there is no payload to hand on.
        if deserializer.end().is_ok() {
            return Err(Error::MissingPayload);
        }
        let payload = bytes[cursor.position() as usize..].to_vec();

        match header.op {
            OP_MESSAGE => {
                let t = header.t.ok_or(Error::MissingType)?;
                Ok(Self::Message { t, payload })
            }
            OP_ERROR => Ok(Self::Error { payload }),
            op => Err(Error::UnsupportedOp(op)),
        }
    }
}
