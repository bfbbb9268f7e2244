//! Self-describing value codec used for every envelope and message payload.
//!
//! An [`Encoded`] value is a tagged tree of primitives, byte buffers and
//! lists. On the wire it is written as MessagePack, which carries a type tag
//! and a length prefix for every value, so a decoder can check the arity of a
//! list before it interprets any of its elements.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// A single encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoded {
    /// Signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Raw byte buffer (keys, ciphertexts, signatures, uids).
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// UTF-8 string.
    Str(String),
    /// Nested list of values.
    List(Vec<Encoded>),
}

/// Types that can be turned into an [`Encoded`] value.
pub trait Encode {
    /// Encodes `self`.
    fn encode(&self) -> Encoded;
}

/// Types that can be rebuilt from an [`Encoded`] value.
pub trait Decode: Sized {
    /// Decodes a value, failing on any structural mismatch.
    fn decode(value: Encoded) -> Result<Self>;
}

impl Encoded {
    /// Convenience constructor for byte buffers.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Encoded::Bytes(bytes.into())
    }

    /// Convenience constructor for lists.
    pub fn list(items: impl IntoIterator<Item = Encoded>) -> Self {
        Encoded::List(items.into_iter().collect())
    }

    /// Name of the value type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Encoded::Int(_) => "int",
            Encoded::Bool(_) => "bool",
            Encoded::Bytes(_) => "bytes",
            Encoded::Str(_) => "str",
            Encoded::List(_) => "list",
        }
    }

    /// Serializes this value to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(ProtocolError::from)
    }

    /// Parses a value from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(ProtocolError::from)
    }

    /// Returns the integer payload.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Encoded::Int(v) => Ok(*v),
            other => Err(unexpected("int", other)),
        }
    }

    /// Returns the boolean payload.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Encoded::Bool(v) => Ok(*v),
            other => Err(unexpected("bool", other)),
        }
    }

    /// Returns the byte payload.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Encoded::Bytes(v) => Ok(v),
            other => Err(unexpected("bytes", other)),
        }
    }

    /// Consumes the value and returns its byte payload.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Encoded::Bytes(v) => Ok(v),
            other => Err(unexpected("bytes", &other)),
        }
    }

    /// Consumes the value and returns a fixed-size byte array.
    pub fn into_array<const N: usize>(self) -> Result<[u8; N]> {
        let bytes = self.into_bytes()?;
        let got = bytes.len();
        bytes
            .try_into()
            .map_err(|_| ProtocolError::Deserialization(format!("expected {N} bytes, got {got}")))
    }

    /// Consumes the value and returns its list payload.
    pub fn into_list(self) -> Result<Vec<Encoded>> {
        match self {
            Encoded::List(v) => Ok(v),
            other => Err(unexpected("list", &other)),
        }
    }

    /// Consumes the value and returns its list payload, checking the arity.
    pub fn into_list_of_arity(self, arity: usize) -> Result<Vec<Encoded>> {
        let items = self.into_list()?;
        check_arity(&items, arity)?;
        Ok(items)
    }
}

/// Checks that a decoded input list has exactly `arity` elements.
pub fn check_arity(items: &[Encoded], arity: usize) -> Result<()> {
    if items.len() != arity {
        return Err(ProtocolError::WrongArity {
            expected: arity,
            got: items.len(),
        });
    }
    Ok(())
}

fn unexpected(expected: &'static str, got: &Encoded) -> ProtocolError {
    ProtocolError::UnexpectedValue {
        expected,
        got: got.type_name(),
    }
}

impl Encode for Vec<u8> {
    fn encode(&self) -> Encoded {
        Encoded::Bytes(self.clone())
    }
}

impl Decode for Vec<u8> {
    fn decode(value: Encoded) -> Result<Self> {
        value.into_bytes()
    }
}

impl Encode for bool {
    fn encode(&self) -> Encoded {
        Encoded::Bool(*self)
    }
}

impl Decode for bool {
    fn decode(value: Encoded) -> Result<Self> {
        value.as_bool()
    }
}
