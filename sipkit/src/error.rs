use std::fmt;
use std::net::SocketAddr;
use std::str::Utf8Error;

use thiserror::Error;

use crate::transaction::State;

pub type Result<T> = std::result::Result<T, Error>;

/// Error on parsing
#[derive(Debug, PartialEq, Eq, Error)]
pub struct SipParserError {
    /// Message in error
    pub message: String,
}

impl fmt::Display for SipParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[allow(missing_docs)]
impl SipParserError {
    pub fn new<T>(s: T) -> Self
    where
        T: AsRef<str>,
    {
        Self {
            message: s.as_ref().to_string(),
        }
    }
}

impl std::convert::From<&str> for SipParserError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl std::convert::From<String> for SipParserError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl std::convert::From<Utf8Error> for SipParserError {
    fn from(value: Utf8Error) -> Self {
        SipParserError {
            message: format!("{:#?}", value),
        }
    }
}

/// The error type used across the transaction and transport layers.
///
/// Parse errors are recoverable at the message level; malformed messages
/// are fatal for stream connections and cause datagram packets to be
/// dropped. Transport, listener and transaction errors stay isolated to
/// the peer, listener or transaction that produced them.
#[derive(Debug, Error)]
pub enum Error {
    /// Syntactically invalid message. Recoverable on streams (the
    /// message is skipped), drops the packet on datagram transports.
    #[error(transparent)]
    Parse(#[from] SipParserError),

    /// Semantically invalid message (missing Via, missing
    /// Content-Length on a stream, body larger than the datagram).
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A required header is absent.
    #[error("Missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    /// Socket error, dial failure or write failure, surfaced to the
    /// owning transaction and the host error channel.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// A listener could not be established or broke.
    #[error("Failed to listen on {addr}: {cause}")]
    Listen {
        /// The address the listener was bound (or binding) to.
        addr: SocketAddr,
        /// The underlying cause.
        cause: String,
    },

    /// Timer B/F/H fired before the transaction completed.
    #[error("Transaction timed out")]
    TransactionTimeout,

    /// The enclosing layer was shut down while the transaction was live.
    #[error("Transaction aborted by shutdown")]
    Aborted,

    /// Message that cannot be attributed to local activity, e.g. a
    /// response whose top Via does not match the local identity.
    /// Logged and dropped, no upward effect.
    #[error("Unexpected message: {0}")]
    Unexpected(String),

    /// The TU attempted an operation the current transaction state does
    /// not allow. Reported synchronously; the state is unchanged.
    #[error("Operation not allowed in state {state:?}: {op}")]
    StateViolation {
        /// The state the transaction was in.
        state: State,
        /// The rejected operation.
        op: &'static str,
    },

    /// A snapshot with an unknown schema version was offered for restore.
    #[error("Unsupported snapshot schema version {0}")]
    SnapshotVersion(u32),

    /// Snapshot encode/decode failure.
    #[error("Snapshot codec error: {0}")]
    SnapshotCodec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Fmt Error")]
    FmtError(std::fmt::Error),
}

impl Error {
    /// `true` when the error only invalidates a single message, not the
    /// connection it arrived on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Parse(_))
    }
}

impl<T> std::convert::From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<std::fmt::Error> for Error {
    fn from(value: std::fmt::Error) -> Self {
        Self::FmtError(value)
    }
}
