//! Unified error handling for gossamerd.
//!
//! The taxonomy follows the protocol's failure model: protocol violations
//! and parse errors are fatal to the offending connection and leave the
//! store untouched; duplicate gossip and writes to closed transports are
//! silent; invariant violations panic.

use thiserror::Error;

use crate::store::StoreError;

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed JSON or an unknown message type.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A second `Subscribe*` on an already-subscribed connection.
    #[error("already subscribed")]
    AlreadySubscribed,

    /// A patch arrived before any subscription.
    #[error("not subscribed")]
    NotSubscribed,

    /// A message type that is never valid in this direction.
    #[error("unexpected message type: {0}")]
    UnexpectedMessage(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crdt(#[from] gossamer_crdt::CrdtError),
}

/// Errors that prevent an agent from booting.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("bind: {0}")]
    Bind(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Errors from an outbound peer subscription, distinguished so the dial
/// phase can be logged differently from a mid-stream failure.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<StoreError> for PeerError {
    fn from(err: StoreError) -> Self {
        PeerError::Protocol(ProtocolError::Store(err))
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Protocol(ProtocolError::Malformed(err))
    }
}
