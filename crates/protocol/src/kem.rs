//! Ephemeral key encapsulation and channel seed derivation.
//!
//! The KEM is X25519 in ephemeral-static form: encapsulating against a public
//! key draws a throwaway key pair, and the ciphertext is that throwaway public
//! key. Both sides run the Diffie-Hellman output through HKDF-SHA256 bound to
//! the two public keys.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::encoded::{Decode, Encode, Encoded};
use crate::error::{ProtocolError, Result};

/// Length of X25519 keys and of derived symmetric keys.
pub const KEY_LENGTH: usize = 32;

/// Length of a KEM ciphertext.
pub const CIPHERTEXT_LENGTH: usize = 32;

/// Length of a channel seed.
pub const SEED_LENGTH: usize = 32;

const KEM_INFO: &[u8] = b"pairlink-kem-v1";
const SEED_INFO: &[u8] = b"pairlink-channel-seed-v1";

fn hkdf<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; N]> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|_| ProtocolError::KeyDerivation("arguments too large for hkdf".to_string()))?;
    Ok(okm)
}

/// Public half of an ephemeral key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralPublicKey(#[serde(with = "serde_bytes")] [u8; KEY_LENGTH]);

impl EphemeralPublicKey {
    /// Wraps raw public key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl Encode for EphemeralPublicKey {
    fn encode(&self) -> Encoded {
        Encoded::bytes(self.0.to_vec())
    }
}

impl Decode for EphemeralPublicKey {
    fn decode(value: Encoded) -> Result<Self> {
        Ok(Self(value.into_array()?))
    }
}

/// Private half of an ephemeral key pair.
///
/// Stored inside protocol states between two steps, hence serializable.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralPrivateKey(#[serde(with = "serde_bytes")] [u8; KEY_LENGTH]);

impl EphemeralPrivateKey {
    fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }

    /// Derives the matching public key.
    pub fn public_key(&self) -> EphemeralPublicKey {
        EphemeralPublicKey(PublicKey::from(&self.secret()).to_bytes())
    }
}

impl std::fmt::Debug for EphemeralPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EphemeralPrivateKey([REDACTED])")
    }
}

/// A freshly generated ephemeral key pair.
#[derive(Debug, Clone)]
pub struct EphemeralKeyPair {
    /// Public key, sent to the peer.
    pub public_key: EphemeralPublicKey,
    /// Private key, kept in the protocol state.
    pub private_key: EphemeralPrivateKey,
}

impl EphemeralKeyPair {
    /// Generates a new key pair from the operating system RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_key = EphemeralPublicKey(PublicKey::from(&secret).to_bytes());
        Self {
            public_key,
            private_key: EphemeralPrivateKey(secret.to_bytes()),
        }
    }
}

/// A KEM ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext(#[serde(with = "serde_bytes")] [u8; CIPHERTEXT_LENGTH]);

impl Ciphertext {
    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; CIPHERTEXT_LENGTH] {
        &self.0
    }
}

impl Encode for Ciphertext {
    fn encode(&self) -> Encoded {
        Encoded::bytes(self.0.to_vec())
    }
}

impl Decode for Ciphertext {
    fn decode(value: Encoded) -> Result<Self> {
        Ok(Self(value.into_array()?))
    }
}

/// Symmetric key produced by encapsulation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKey(#[serde(with = "serde_bytes")] [u8; KEY_LENGTH]);

impl SymmetricKey {
    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

fn derive_kem_key(
    shared: &[u8; 32],
    ciphertext: &Ciphertext,
    recipient: &EphemeralPublicKey,
) -> Result<SymmetricKey> {
    let mut salt = Vec::with_capacity(CIPHERTEXT_LENGTH + KEY_LENGTH);
    salt.extend_from_slice(ciphertext.as_bytes());
    salt.extend_from_slice(recipient.as_bytes());
    Ok(SymmetricKey(hkdf(&salt, shared, KEM_INFO)?))
}

/// Encapsulates a fresh symmetric key for the holder of `recipient`.
pub fn kem_encrypt(recipient: &EphemeralPublicKey) -> Result<(Ciphertext, SymmetricKey)> {
    let sender = StaticSecret::random_from_rng(OsRng);
    let ciphertext = Ciphertext(PublicKey::from(&sender).to_bytes());
    let shared = sender.diffie_hellman(&PublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(ProtocolError::InvalidPublicKey(
            "low order ephemeral public key".to_string(),
        ));
    }
    let key = derive_kem_key(shared.as_bytes(), &ciphertext, recipient)?;
    Ok((ciphertext, key))
}

/// Recovers the symmetric key encapsulated in `ciphertext`.
pub fn kem_decrypt(private_key: &EphemeralPrivateKey, ciphertext: &Ciphertext) -> Result<SymmetricKey> {
    let secret = private_key.secret();
    let shared = secret.diffie_hellman(&PublicKey::from(ciphertext.0));
    if !shared.was_contributory() {
        return Err(ProtocolError::Decapsulation(
            "ciphertext is a low order point".to_string(),
        ));
    }
    derive_kem_key(shared.as_bytes(), ciphertext, &private_key.public_key())
}

/// Seed from which both ends of an oblivious channel derive their keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed(#[serde(with = "serde_bytes")] [u8; SEED_LENGTH]);

impl Seed {
    /// Combines the two exchanged keys into a seed.
    ///
    /// The keys are sorted before hashing, so argument order does not matter.
    pub fn from_keys(a: &SymmetricKey, b: &SymmetricKey) -> Result<Self> {
        let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        let mut ikm = [0u8; 2 * KEY_LENGTH];
        ikm[..KEY_LENGTH].copy_from_slice(&first.0);
        ikm[KEY_LENGTH..].copy_from_slice(&second.0);
        Ok(Self(hkdf(&[], &ikm, SEED_INFO)?))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SEED_LENGTH] {
        &self.0
    }

    /// Short, non-secret fingerprint for logs and comparison.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.0)[..8])
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Seed({})", self.fingerprint())
    }
}
