//! Crate-wide error type
//!
//! Every fallible client-side operation returns [`Error`]. The variants map
//! onto the failure categories callers need to tell apart: connection
//! problems (retryable), undecodable payloads, failures reported by the
//! server, a server process that would not start, and stale references.

use thiserror::Error;

use crate::codec::{CacheId, CodecError};
use crate::payload::{error_type, RemoteError};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    /// Failed to establish or keep a connection
    #[error("Connection error: {0}")]
    Connect(#[from] TransportError),

    /// Malformed wire payload
    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    /// The server caught an error while executing the request
    #[error("Server-side error: {0}")]
    ServerSide(RemoteError),

    /// The server process could not be started or never became reachable
    #[error("Failed to start server: {0}")]
    Spawn(String),

    /// The reference id is not held by the connected server
    #[error("Unknown reference: {0}")]
    UnknownReference(CacheId),

    /// The proxy has no live connection
    #[error("Not connected to a server")]
    NotConnected,

    /// The peer sent something the protocol does not allow here
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Transport-level failures are the only ones worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::NotConnected)
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match (&err.cache_id, err.error_type.as_str()) {
            (Some(id), error_type::UNKNOWN_REFERENCE) => Error::UnknownReference(id.clone()),
            _ => Error::ServerSide(err),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;
