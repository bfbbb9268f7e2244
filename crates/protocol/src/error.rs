//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering codec, envelope and cryptographic failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Codec errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// An encoded value did not have the expected type.
    #[error("unexpected encoded value: expected {expected}, got {got}")]
    UnexpectedValue {
        /// Name of the expected value type.
        expected: &'static str,
        /// Name of the value type actually found.
        got: &'static str,
    },

    /// An encoded list did not have the expected number of elements.
    #[error("wrong arity: expected {expected} elements, got {got}")]
    WrongArity {
        /// Expected element count.
        expected: usize,
        /// Actual element count.
        got: usize,
    },

    // Envelope errors
    /// The protocol identifier is not known.
    #[error("unknown protocol id: {0}")]
    UnknownProtocol(i64),

    /// The message kind is not known for the given protocol.
    #[error("unknown message kind {kind} for protocol {protocol}")]
    UnknownMessageKind {
        /// Protocol the message was addressed to.
        protocol: String,
        /// The unrecognised kind tag.
        kind: i64,
    },

    /// A UID had the wrong length.
    #[error("invalid uid length: expected {expected} bytes, got {got}")]
    InvalidUidLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },

    // Cryptographic errors
    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A KEM ciphertext could not be decapsulated.
    #[error("decapsulation failed: {0}")]
    Decapsulation(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for ProtocolError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}
