//! States of the channel creation protocol.

use protocol::{CryptoIdentity, EphemeralPrivateKey, ProtocolId, SymmetricKey, Uid};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::store::StateRecord;

/// State kinds, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Initial,
    PingSent,
    WaitingForK1,
    WaitingForK2,
    WaitForFirstAck,
    WaitForSecondAck,
    ChannelConfirmed,
    Cancelled,
}

impl StateKind {
    pub const ALL: [StateKind; 8] = [
        StateKind::Initial,
        StateKind::PingSent,
        StateKind::WaitingForK1,
        StateKind::WaitingForK2,
        StateKind::WaitForFirstAck,
        StateKind::WaitForSecondAck,
        StateKind::ChannelConfirmed,
        StateKind::Cancelled,
    ];

    pub const fn raw(self) -> u32 {
        match self {
            StateKind::Initial => 0,
            StateKind::PingSent => 1,
            StateKind::WaitingForK1 => 2,
            StateKind::WaitingForK2 => 3,
            StateKind::WaitForFirstAck => 4,
            StateKind::WaitForSecondAck => 5,
            StateKind::ChannelConfirmed => 6,
            StateKind::Cancelled => 7,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.raw() == raw)
            .ok_or(EngineError::UnknownState {
                protocol: ProtocolId::ChannelCreationWithContactDevice,
                kind: raw,
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            StateKind::Initial => "Initial",
            StateKind::PingSent => "PingSent",
            StateKind::WaitingForK1 => "WaitingForK1",
            StateKind::WaitingForK2 => "WaitingForK2",
            StateKind::WaitForFirstAck => "WaitForFirstAck",
            StateKind::WaitForSecondAck => "WaitForSecondAck",
            StateKind::ChannelConfirmed => "ChannelConfirmed",
            StateKind::Cancelled => "Cancelled",
        }
    }

    /// No step leaves a final state.
    ///
    /// `PingSent` is final: the answer to a ping always starts a fresh
    /// instance on the receiving side.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            StateKind::PingSent | StateKind::ChannelConfirmed | StateKind::Cancelled
        )
    }

    /// Record of a state that carries no data.
    pub fn bare(self) -> StateRecord {
        StateRecord::bare(self.raw())
    }
}

/// Sent our ephemeral key, waiting for the contact's key and K1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForK1State {
    pub contact_identity: CryptoIdentity,
    pub contact_device_uid: Uid,
    pub ephemeral_private_key: EphemeralPrivateKey,
}

/// Sent our ephemeral key and K1, waiting for K2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForK2State {
    pub contact_identity: CryptoIdentity,
    pub contact_device_uid: Uid,
    pub ephemeral_private_key: EphemeralPrivateKey,
    pub k1: SymmetricKey,
}

/// Channel created, waiting for the contact to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitForAckState {
    pub contact_identity: CryptoIdentity,
    pub contact_device_uid: Uid,
    pub current_device_uid: Uid,
}

impl WaitingForK1State {
    pub fn to_record(&self) -> Result<StateRecord> {
        StateRecord::encode(StateKind::WaitingForK1.raw(), self)
    }
}

impl WaitingForK2State {
    pub fn to_record(&self) -> Result<StateRecord> {
        StateRecord::encode(StateKind::WaitingForK2.raw(), self)
    }
}

impl WaitForAckState {
    /// Record under `kind`, which is one of the two acknowledgement states.
    pub fn to_record(&self, kind: StateKind) -> Result<StateRecord> {
        debug_assert!(matches!(
            kind,
            StateKind::WaitForFirstAck | StateKind::WaitForSecondAck
        ));
        StateRecord::encode(kind.raw(), self)
    }
}
