//! Firehose plumbing: event-stream frames, `subscribeRepos` payloads, the
//! content-addressed block bundle carried by commit frames, and the
//! WebSocket client used to subscribe to a relay.

pub mod car;
pub mod client;
pub mod frames;
pub mod mst;
pub mod repo;
pub mod types;

pub use car::CarIndex;
pub use client::FirehoseClient;
pub use frames::Frame;
pub use repo::Repository;
pub use types::Event;
