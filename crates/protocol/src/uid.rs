//! Fixed-length random identifiers for protocol instances, devices and messages.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::encoded::{Decode, Encode, Encoded};
use crate::error::{ProtocolError, Result};

/// Length of a UID in bytes.
pub const UID_LENGTH: usize = 32;

/// A 256-bit identifier.
///
/// Ordering is the lexicographic order of the raw bytes; the channel creation
/// tie-break relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(#[serde(with = "serde_bytes")] pub [u8; UID_LENGTH]);

impl Uid {
    /// Generates a fresh random UID from the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; UID_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a UID from raw bytes.
    pub fn from_bytes(bytes: [u8; UID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a UID from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; UID_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::InvalidUidLength {
                    expected: UID_LENGTH,
                    got: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Parses a UID from its hex representation.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Returns the raw bytes of this UID.
    pub fn as_bytes(&self) -> &[u8; UID_LENGTH] {
        &self.0
    }

    /// Full lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first eight bytes are enough to tell instances apart in logs.
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl Encode for Uid {
    fn encode(&self) -> Encoded {
        Encoded::bytes(self.0.to_vec())
    }
}

impl Decode for Uid {
    fn decode(value: Encoded) -> Result<Self> {
        Self::from_slice(value.as_bytes()?)
    }
}
