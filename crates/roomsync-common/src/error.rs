//! Error types for roomsync.
//!
//! The taxonomy mirrors how the sync engine reacts to a failure: a
//! structured server error ([`Error::Api`]) is fatal and stops the loop, a
//! cancellation is expected during shutdown, and everything else that comes
//! out of the transport is retriable. Variants carry plain strings so the
//! whole enum stays `Clone`, which lets coalesced pagination futures share
//! one result between callers.

use thiserror::Error;

/// roomsync error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The server returned a structured Matrix error. Never retried.
    #[error("api error {errcode}: {message}")]
    Api { errcode: String, message: String },

    /// The in-flight request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// Transport-level failure (timeout, connection reset). Retriable.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persistence backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The room is not (or no longer) known to the client.
    #[error("unknown room: {0}")]
    UnknownRoom(String),
}

impl Error {
    /// Fatal errors stop the sync loop and are propagated to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Api { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for roomsync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_error_display() {
        let err = Error::Api {
            errcode: "M_UNKNOWN_TOKEN".into(),
            message: "Invalid access token".into(),
        };
        assert_eq!(
            err.to_string(),
            "api error M_UNKNOWN_TOKEN: Invalid access token"
        );

        let err = Error::Transport("connection reset".into());
        assert_eq!(err.to_string(), "transport error: connection reset");
    }

    #[test]
    fn test_fatality_classification() {
        assert!(Error::Api {
            errcode: "M_FORBIDDEN".into(),
            message: "nope".into()
        }
        .is_fatal());
        assert!(!Error::Transport("timeout".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(Error::Cancelled.is_cancelled());
    }

    #[test]
    fn test_serde_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
