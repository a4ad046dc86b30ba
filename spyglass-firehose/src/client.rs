//! WebSocket client for the relay's `subscribeRepos` endpoint.

use std::str::FromStr;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        handshake::client::generate_key,
        http::{Request, Uri},
    },
    MaybeTlsStream, WebSocketStream,
};

pub const USER_AGENT: &str = concat!("spyglass/", env!("CARGO_PKG_VERSION"));

/// An enum of possible error kinds for this client.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid uri")]
    InvalidUri,
    #[error("Parsing parameters failed: {0}")]
    ParsingParameters(#[from] serde_html_form::ser::Error),
    #[error("Connection error: {0}")]
    Connection(#[from] tungstenite::Error),
}

#[derive(Serialize)]
struct SubscribeReposParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<i64>,
}

pub type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A client for a relay's repository event stream. When a cursor is present
/// it is appended as the `seq` query parameter so the server resumes at
/// that sequence.
pub struct FirehoseClient {
    uri: String,
    cursor: Option<i64>,
}

impl FirehoseClient {
    pub fn new(uri: impl Into<String>, cursor: Option<i64>) -> Self {
        Self { uri: uri.into(), cursor }
    }

    /// The full request URI, including the resume cursor when present.
    pub fn request_uri(&self) -> Result<String, Error> {
        let mut uri = self.uri.clone();
        if self.cursor.is_some() {
            uri.push('?');
            uri += &serde_html_form::to_string(SubscribeReposParams { seq: self.cursor })?;
        }
        Ok(uri)
    }

    pub async fn connect(&self) -> Result<Stream, Error> {
        let uri = self.request_uri()?;

        // Extract the authority from the URI to set the Host header.
        let uri = Uri::from_str(&uri).map_err(|_| Error::InvalidUri)?;
        let authority = uri.authority().ok_or(Error::InvalidUri)?.as_str();
        let host = authority.find('@').map_or(authority, |idx| authority.split_at(idx + 1).1);
        let host = host.to_owned();

        let request = Request::builder()
            .uri(&uri)
            .method("GET")
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .header("User-Agent", USER_AGENT)
            .body(())
            .map_err(|_| Error::InvalidUri)?;

        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }
}
