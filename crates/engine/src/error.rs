//! Error types for the protocol engine.

use protocol::{ProtocolError, ProtocolId, Uid};
use rusqlite::ErrorCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by the engine.
///
/// Protocol violations are not errors: a step that meets an untrusted peer or
/// a bad signature returns the cancelled state. The variants below are either
/// transient (the dispatch is retried), corrupt stored data (the message is
/// dropped), or propagated to the caller, leaving the inbound message queued
/// for redelivery.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The underlying SQLite store failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Codec, envelope or cryptographic failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A persisted state could not be encoded or decoded.
    #[error("state serialization failed: {0}")]
    StateSerialization(String),

    /// Another dispatch updated the instance first.
    #[error("protocol instance {0} was modified concurrently")]
    StaleInstance(Uid),

    /// A persisted state kind is not known by its protocol.
    #[error("unknown state kind {kind} for protocol {protocol}")]
    UnknownState { protocol: ProtocolId, kind: u32 },

    /// No concrete protocol is registered for this identifier.
    #[error("no concrete protocol registered for {0}")]
    UnsupportedProtocol(ProtocolId),

    /// The received message disappeared before it could be processed.
    #[error("received message {0} not found")]
    MessageNotFound(i64),

    /// An external collaborator (identity, channel, challenge) failed.
    #[error("delegate failure: {0}")]
    Delegate(String),

    /// A programming invariant was violated.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether the failed dispatch may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::StaleInstance(_) => true,
            EngineError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether a stored row could not be read back.
    ///
    /// Retrying cannot help: the same bytes fail the same way every time.
    pub fn is_corrupt_data(&self) -> bool {
        matches!(
            self,
            EngineError::StateSerialization(_)
                | EngineError::UnknownState { .. }
                | EngineError::Database(
                    rusqlite::Error::FromSqlConversionFailure(..)
                        | rusqlite::Error::InvalidColumnType(..)
                        | rusqlite::Error::IntegralValueOutOfRange(..)
                )
        )
    }

    /// Shorthand for delegate failures.
    pub fn delegate(msg: impl Into<String>) -> Self {
        EngineError::Delegate(msg.into())
    }

    /// Shorthand for invariant violations.
    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::Invariant(msg.into())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        EngineError::StateSerialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        EngineError::StateSerialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_error(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_database_is_retryable() {
        let err = EngineError::from(sqlite_error(rusqlite::ffi::SQLITE_BUSY));
        assert!(err.is_retryable());
        let err = EngineError::from(sqlite_error(rusqlite::ffi::SQLITE_LOCKED));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_stale_instance_is_retryable() {
        assert!(EngineError::StaleInstance(Uid::generate()).is_retryable());
    }

    #[test]
    fn test_other_errors_are_not_retryable() {
        assert!(!EngineError::from(sqlite_error(rusqlite::ffi::SQLITE_CORRUPT)).is_retryable());
        assert!(!EngineError::delegate("channel unavailable").is_retryable());
        assert!(!EngineError::invariant("dialog on local channel").is_retryable());
        assert!(!EngineError::MessageNotFound(3).is_retryable());
    }

    #[test]
    fn test_corrupt_data() {
        let unknown = EngineError::UnknownState {
            protocol: ProtocolId::ChannelCreationWithContactDevice,
            kind: 42,
        };
        assert!(unknown.is_corrupt_data());
        assert!(EngineError::StateSerialization("truncated".into()).is_corrupt_data());
        let conversion = rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Blob,
            Box::new(std::fmt::Error),
        );
        assert!(EngineError::from(conversion).is_corrupt_data());

        assert!(!EngineError::from(sqlite_error(rusqlite::ffi::SQLITE_BUSY)).is_corrupt_data());
        assert!(!EngineError::delegate("channel unavailable").is_corrupt_data());
        assert!(!EngineError::from(ProtocolError::UnknownProtocol(7)).is_corrupt_data());
    }

    #[test]
    fn test_display() {
        let err = EngineError::UnknownState {
            protocol: ProtocolId::ChannelCreationWithContactDevice,
            kind: 42,
        };
        assert_eq!(
            err.to_string(),
            "unknown state kind 42 for protocol ChannelCreationWithContactDevice"
        );
        assert_eq!(
            EngineError::delegate("boom").to_string(),
            "delegate failure: boom"
        );
    }

    #[test]
    fn test_protocol_error_is_transparent() {
        let err = EngineError::from(ProtocolError::UnknownProtocol(7));
        assert_eq!(err.to_string(), "unknown protocol id: 7");
    }
}
