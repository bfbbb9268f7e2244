//! Cryptographic identities and challenge signatures.
//!
//! An identity is an Ed25519 public key. The owned side keeps the signing key
//! and uses it to answer challenges that bind two devices and two identities
//! together, proving to the peer that the signer trusts it.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoded::{Decode, Encode, Encoded};
use crate::error::{ProtocolError, Result};
use crate::uid::Uid;

/// Length of the random nonce prefixed to every challenge response.
pub const CHALLENGE_NONCE_LENGTH: usize = 16;

/// Total length of a challenge response (nonce + Ed25519 signature).
pub const CHALLENGE_RESPONSE_LENGTH: usize = CHALLENGE_NONCE_LENGTH + SIGNATURE_LENGTH;

/// Domain separator for challenge signatures.
const CHALLENGE_DOMAIN: &[u8] = b"pairlink-challenge-v1";

/// A public cryptographic identity.
///
/// Ordering compares the raw key bytes and is used as the secondary key of
/// the channel creation tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CryptoIdentity(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_LENGTH]);

impl CryptoIdentity {
    /// Creates an identity from public key bytes, rejecting invalid points.
    pub fn from_public_key_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self> {
        VerifyingKey::from_bytes(bytes)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        Ok(Self(*bytes))
    }

    /// Creates an identity from a slice of public key bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Self::from_public_key_bytes(&arr)
    }

    /// Parses an identity from its hex representation.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Returns the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// Full lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
    }

    /// Checks a challenge response produced by the owner of this identity.
    ///
    /// Returns `Ok(())` if the response is well formed and the signature is valid.
    pub fn check_response(&self, response: &ChallengeResponse, challenge: &Challenge) -> Result<()> {
        let (nonce, signature) = response.split()?;
        let message = signed_message(nonce, challenge);
        self.verifying_key()?
            .verify(&message, &signature)
            .map_err(ProtocolError::from)
    }
}

impl std::fmt::Display for CryptoIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl Encode for CryptoIdentity {
    fn encode(&self) -> Encoded {
        Encoded::bytes(self.0.to_vec())
    }
}

impl Decode for CryptoIdentity {
    fn decode(value: Encoded) -> Result<Self> {
        Self::from_slice(value.as_bytes()?)
    }
}

/// An identity owned by this device, including the secret key.
#[derive(Clone)]
pub struct OwnedCryptoIdentity {
    signing_key: SigningKey,
    identity: CryptoIdentity,
}

impl OwnedCryptoIdentity {
    /// Generates a new random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restores an identity from its secret key bytes.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let identity = CryptoIdentity(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            identity,
        }
    }

    /// Returns the secret key bytes.
    ///
    /// **Security Warning**: only use this for secure storage.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public identity.
    pub fn identity(&self) -> &CryptoIdentity {
        &self.identity
    }

    /// Answers a challenge.
    ///
    /// A fresh random nonce is mixed into every response, so answering the
    /// same challenge twice never yields the same bytes.
    pub fn solve_challenge(&self, challenge: &Challenge) -> ChallengeResponse {
        let mut nonce = [0u8; CHALLENGE_NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let signature = self.signing_key.sign(&signed_message(&nonce, challenge));

        let mut bytes = Vec::with_capacity(CHALLENGE_RESPONSE_LENGTH);
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&signature.to_bytes());
        ChallengeResponse(bytes)
    }
}

impl std::fmt::Debug for OwnedCryptoIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedCryptoIdentity")
            .field("identity", &self.identity)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Challenges an identity can be asked to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Proves the signer trusts the recipient and holds no channel with it.
    ///
    /// `first_*` designates the recipient of the response, `second_*` the signer.
    ChannelCreation {
        first_device_uid: Uid,
        second_device_uid: Uid,
        first_identity: CryptoIdentity,
        second_identity: CryptoIdentity,
    },
}

impl Challenge {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Challenge::ChannelCreation {
                first_device_uid,
                second_device_uid,
                first_identity,
                second_identity,
            } => {
                let mut out = Vec::with_capacity(16 + 4 * 32);
                out.extend_from_slice(b"channelCreation");
                out.extend_from_slice(first_device_uid.as_bytes());
                out.extend_from_slice(second_device_uid.as_bytes());
                out.extend_from_slice(first_identity.as_bytes());
                out.extend_from_slice(second_identity.as_bytes());
                out
            }
        }
    }
}

fn signed_message(nonce: &[u8], challenge: &Challenge) -> Vec<u8> {
    let digest = Sha256::digest(challenge.to_bytes());
    let mut message = Vec::with_capacity(CHALLENGE_DOMAIN.len() + nonce.len() + digest.len());
    message.extend_from_slice(CHALLENGE_DOMAIN);
    message.extend_from_slice(nonce);
    message.extend_from_slice(&digest);
    message
}

/// A response to a [`Challenge`]: random nonce followed by an Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeResponse(#[serde(with = "serde_bytes")] Vec<u8>);

impl ChallengeResponse {
    /// Wraps raw response bytes. Length is checked on verification.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn split(&self) -> Result<(&[u8], Ed25519Signature)> {
        if self.0.len() != CHALLENGE_RESPONSE_LENGTH {
            return Err(ProtocolError::InvalidSignature(format!(
                "expected {} bytes, got {}",
                CHALLENGE_RESPONSE_LENGTH,
                self.0.len()
            )));
        }
        let (nonce, sig) = self.0.split_at(CHALLENGE_NONCE_LENGTH);
        let sig: [u8; SIGNATURE_LENGTH] = sig
            .try_into()
            .map_err(|_| ProtocolError::InvalidSignature("truncated signature".to_string()))?;
        Ok((nonce, Ed25519Signature::from_bytes(&sig)))
    }
}

impl Encode for ChallengeResponse {
    fn encode(&self) -> Encoded {
        Encoded::bytes(self.0.clone())
    }
}

impl Decode for ChallengeResponse {
    fn decode(value: Encoded) -> Result<Self> {
        Ok(Self(value.into_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_challenge(
        recipient: &CryptoIdentity,
        signer: &CryptoIdentity,
        recipient_device: Uid,
        signer_device: Uid,
    ) -> Challenge {
        Challenge::ChannelCreation {
            first_device_uid: recipient_device,
            second_device_uid: signer_device,
            first_identity: *recipient,
            second_identity: *signer,
        }
    }

    #[test]
    fn test_response_verifies_against_signer() {
        let alice = OwnedCryptoIdentity::generate();
        let bob = OwnedCryptoIdentity::generate();
        let challenge =
            channel_challenge(bob.identity(), alice.identity(), Uid::generate(), Uid::generate());

        let response = alice.solve_challenge(&challenge);

        assert_eq!(response.as_bytes().len(), CHALLENGE_RESPONSE_LENGTH);
        assert!(alice.identity().check_response(&response, &challenge).is_ok());
        assert!(bob.identity().check_response(&response, &challenge).is_err());
    }

    #[test]
    fn test_response_is_bound_to_challenge() {
        let alice = OwnedCryptoIdentity::generate();
        let bob = OwnedCryptoIdentity::generate();
        let (d1, d2) = (Uid::generate(), Uid::generate());
        let challenge = channel_challenge(bob.identity(), alice.identity(), d1, d2);
        let swapped = channel_challenge(bob.identity(), alice.identity(), d2, d1);

        let response = alice.solve_challenge(&challenge);

        assert!(alice.identity().check_response(&response, &swapped).is_err());
    }

    #[test]
    fn test_same_challenge_gives_distinct_responses() {
        let alice = OwnedCryptoIdentity::generate();
        let bob = OwnedCryptoIdentity::generate();
        let challenge =
            channel_challenge(bob.identity(), alice.identity(), Uid::generate(), Uid::generate());

        let r1 = alice.solve_challenge(&challenge);
        let r2 = alice.solve_challenge(&challenge);

        assert_ne!(r1, r2);
    }

    #[test]
    fn test_truncated_response_is_rejected() {
        let alice = OwnedCryptoIdentity::generate();
        let challenge = channel_challenge(
            alice.identity(),
            alice.identity(),
            Uid::generate(),
            Uid::generate(),
        );
        let response = ChallengeResponse::from_bytes(vec![0u8; 10]);
        assert!(matches!(
            alice.identity().check_response(&response, &challenge),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_identity_roundtrip_from_secret() {
        let original = OwnedCryptoIdentity::generate();
        let restored = OwnedCryptoIdentity::from_secret_key_bytes(&original.secret_key_bytes());
        assert_eq!(original.identity(), restored.identity());
    }

    #[test]
    fn test_identity_hex_and_encoding() {
        let identity = *OwnedCryptoIdentity::generate().identity();
        assert_eq!(CryptoIdentity::from_hex(&identity.to_hex()).unwrap(), identity);
        assert_eq!(CryptoIdentity::decode(identity.encode()).unwrap(), identity);
        assert!(CryptoIdentity::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_identity_msgpack_serialization() {
        let identity = *OwnedCryptoIdentity::generate().identity();
        let bytes = rmp_serde::to_vec(&identity).unwrap();
        let restored: CryptoIdentity = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(identity, restored);
    }

    #[test]
    fn test_owned_identity_debug_redacts_secret() {
        let debug = format!("{:?}", OwnedCryptoIdentity::generate());
        assert!(debug.contains("REDACTED"));
    }
}
