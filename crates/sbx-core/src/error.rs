//! Error types for sbx-core.

use std::io;

use thiserror::Error;

/// Result alias used across the sbx crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sbx operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encode/decode failure on an envelope or digest.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation or malformed frame.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A message would need more packets than the address field can count.
    #[error("message exceeds address length")]
    ExceedsAddrLength,

    /// Envelope carried a data type outside the known set.
    #[error("unknown request type: {0}")]
    UnknownRequestType(String),

    /// The remote end of the connection went away.
    #[error("peer socket closed")]
    PeerClosed,

    /// A request was not answered within the response timeout.
    #[error("operation timed out")]
    Timeout,

    /// A later request tried to change the connection's bound identity.
    #[error("identity rebind rejected: {0}")]
    IdentityRebind(String),

    /// The blob store has no object under this name. Recoverable: callers
    /// treat it as "absent" on first sync.
    #[error("no such key: {0}")]
    NoSuchKey(String),

    /// Blob store failure other than a missing key.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Reference database failure.
    #[error("database error: {message}")]
    Database { message: String },
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Error::Database {
            message: message.into(),
        }
    }

    /// True when the underlying transport reports the remote end went away.
    /// The retry wrapper re-dials before the next attempt on these.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            Error::PeerClosed => true,
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True for the recoverable "no such key" storage outcome.
    pub fn is_no_such_key(&self) -> bool {
        matches!(self, Error::NoSuchKey(_))
    }
}
