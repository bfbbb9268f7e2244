//! # Pairlink Protocol Library
//!
//! Wire-level building blocks shared by the Pairlink protocol engine.
//!
//! ## Overview
//!
//! - **Codec**: [`Encoded`] values, written as MessagePack
//! - **Envelopes**: `[protocol id, instance uid, message kind, inputs]` lists
//! - **Identities**: Ed25519 identities and randomised challenge responses
//! - **KEM**: X25519 ephemeral key encapsulation and channel seed derivation
//! - **Channels**: descriptors for outgoing and incoming messages
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Concrete protocol messages       │  typed fields
//! ├─────────────────────────────────────────┤
//! │       GenericProtocolMessage            │  4-element envelope
//! ├─────────────────────────────────────────┤
//! │              Encoded                    │  MessagePack
//! ├─────────────────────────────────────────┤
//! │     Channel abstraction (external)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Encoded, GenericProtocolMessage, ProtocolId, Uid};
//!
//! let message = GenericProtocolMessage {
//!     protocol_id: ProtocolId::ChannelCreationWithContactDevice,
//!     instance_uid: Uid::generate(),
//!     message_kind: 0,
//!     inputs: vec![Encoded::Int(1)],
//! };
//! let bytes = message.to_bytes().unwrap();
//! assert_eq!(GenericProtocolMessage::from_bytes(&bytes).unwrap(), message);
//! ```

pub mod channel;
pub mod crypto;
pub mod encoded;
pub mod envelope;
pub mod error;
pub mod kem;
pub mod uid;

pub use channel::{
    CoreProtocolMessage, DialogMessageToSend, MessageToSend, ProtocolMessageToSend,
    ReceptionChannelInfo, SendChannel, ServerQueryToSend,
};
pub use crypto::{
    Challenge, ChallengeResponse, CryptoIdentity, OwnedCryptoIdentity, CHALLENGE_RESPONSE_LENGTH,
};
pub use encoded::{check_arity, Decode, Encode, Encoded};
pub use envelope::{GenericProtocolMessage, ProtocolId, ReceivedEnvelope, ENVELOPE_ARITY};
pub use error::{ProtocolError, Result};
pub use kem::{
    kem_decrypt, kem_encrypt, Ciphertext, EphemeralKeyPair, EphemeralPrivateKey,
    EphemeralPublicKey, Seed, SymmetricKey,
};
pub use uid::{Uid, UID_LENGTH};
