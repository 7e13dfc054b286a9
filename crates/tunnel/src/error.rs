//! Error types for the relay side of the tunnel.

use thiserror::Error;

use crate::protocol::SessionId;

/// Failures of [`SessionTable::create`](crate::table::SessionTable::create).
#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to resolve target {target}: {reason}")]
    Resolve { target: String, reason: String },

    #[error("failed to allocate socket for {target}: {source}")]
    Socket {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session {0} already exists")]
    DuplicateSession(SessionId),
}

/// Malformed input on the wire or on the command line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("invalid address {0:?}, expected host:port")]
    InvalidAddress(String),

    #[error("missing form field {0:?}")]
    MissingField(&'static str),

    #[error("invalid form field {0:?}")]
    InvalidField(&'static str),
}
