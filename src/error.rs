//! Error types for the shuffle engine

use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JetError>;

#[derive(Error, Debug)]
pub enum JetError {
    #[error("Corrupt channel data: {0}")]
    Corrupt(String),

    #[error("Channel protocol violation: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote error ({kind}): {message}")]
    Remote { kind: String, message: String },

    #[error("{context} failed: {source}")]
    Background {
        context: &'static str,
        #[source]
        source: Arc<JetError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Record of {size} bytes does not fit in a {capacity} byte spill buffer")]
    RecordTooLarge { size: usize, capacity: usize },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JetError {
    /// Get error code for the wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            JetError::Corrupt(_) => "CORRUPT_DATA",
            JetError::Protocol(_) => "PROTOCOL_VIOLATION",
            JetError::Transport(_) => "TRANSPORT",
            JetError::Remote { .. } => "REMOTE",
            JetError::Background { source, .. } => source.code(),
            JetError::Cancelled => "CANCELLED",
            JetError::RecordTooLarge { .. } => "RECORD_TOO_LARGE",
            JetError::Config(_) => "CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Wrap an error captured on a background thread.
    pub fn background(context: &'static str, source: JetError) -> Self {
        JetError::Background {
            context,
            source: Arc::new(source),
        }
    }

    /// Re-raise a failure that is reported to more than one caller.
    pub fn background_shared(context: &'static str, source: &Arc<JetError>) -> Self {
        JetError::Background {
            context,
            source: Arc::clone(source),
        }
    }

    /// Innermost error, looking through background wrappers.
    pub fn root(&self) -> &JetError {
        match self {
            JetError::Background { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for checksum mismatches and truncated framing.
    pub fn is_corruption(&self) -> bool {
        matches!(self.root(), JetError::Corrupt(_))
    }

    /// True for protocol violations.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.root(), JetError::Protocol(_))
    }

    /// Errors the file channel may retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self.root() {
            JetError::Transport(_) => true,
            JetError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Serializable form sent to a TCP channel peer.
    pub fn to_remote(&self) -> RemoteError {
        RemoteError {
            kind: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<io::Error> for JetError {
    fn from(e: io::Error) -> Self {
        let is_corruption = e
            .get_ref()
            .map(|inner| inner.is::<CorruptionMarker>())
            .unwrap_or(false);
        if is_corruption {
            JetError::Corrupt(e.to_string())
        } else {
            JetError::Io(e)
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for JetError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        JetError::InvalidState(format!("lock poisoned: {}", e))
    }
}

// ── Corruption inside std::io ───────────────────────────────────────

/// Payload of an `io::Error` raised by a `Read` impl on corrupt input.
///
/// `JetError::from(io::Error)` looks for this marker so corruption stays
/// distinguishable after passing through `std::io` adapters.
#[derive(Debug)]
pub struct CorruptionMarker(pub String);

impl fmt::Display for CorruptionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CorruptionMarker {}

/// Build an `io::Error` that converts to `JetError::Corrupt`.
pub fn corrupt_io(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, CorruptionMarker(message.into()))
}

// ── Remote Errors ───────────────────────────────────────────────────

/// Error as serialized on the TCP channel's failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl From<RemoteError> for JetError {
    fn from(e: RemoteError) -> Self {
        JetError::Remote {
            kind: e.kind,
            message: e.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_survives_io_conversion() {
        let err: JetError = corrupt_io("checksum mismatch").into();
        assert!(err.is_corruption());
        assert_eq!(err.code(), "CORRUPT_DATA");
    }

    #[test]
    fn test_plain_io_error_is_not_corruption() {
        let err: JetError = io::Error::new(io::ErrorKind::InvalidData, "nope").into();
        assert!(!err.is_corruption());
        assert!(matches!(err, JetError::Io(_)));
    }

    #[test]
    fn test_background_wrapper_preserves_cause() {
        let err = JetError::background("spill", JetError::Protocol("bad header".into()));
        assert!(err.is_protocol_violation());
        assert_eq!(err.code(), "PROTOCOL_VIOLATION");
        assert!(err.to_string().contains("spill failed"));
    }

    #[test]
    fn test_shared_background_reraised_twice() {
        let cause = Arc::new(JetError::Corrupt("crc".into()));
        let first = JetError::background_shared("index load", &cause);
        let second = JetError::background_shared("index load", &cause);
        assert!(first.is_corruption() && second.is_corruption());
    }

    #[test]
    fn test_transient_classification() {
        let refused: JetError = io::Error::new(io::ErrorKind::ConnectionRefused, "x").into();
        assert!(refused.is_transient());
        assert!(JetError::Transport("reset".into()).is_transient());
        assert!(!JetError::Corrupt("crc".into()).is_transient());
    }

    #[test]
    fn test_remote_round_trip() {
        let remote = JetError::Protocol("task 0".into()).to_remote();
        let json = serde_json::to_string(&remote).unwrap();
        let back: RemoteError = serde_json::from_str(&json).unwrap();
        let err: JetError = back.into();
        match err {
            JetError::Remote { kind, message } => {
                assert_eq!(kind, "PROTOCOL_VIOLATION");
                assert!(message.contains("task 0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
