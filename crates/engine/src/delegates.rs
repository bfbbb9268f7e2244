//! Collaborators the protocol steps talk to.
//!
//! Each delegate is a narrow trait injected into the engine at construction.
//! Methods that mutate state receive the current [`UnitOfWork`] so their
//! effects commit or roll back together with the step.

use std::sync::Arc;

use dashmap::DashMap;
use protocol::{
    Challenge, ChallengeResponse, CryptoIdentity, MessageToSend, OwnedCryptoIdentity, Seed, Uid,
};

use crate::error::{EngineError, Result};
use crate::store::UnitOfWork;

/// Identity directory of this device: contacts, devices and published details.
pub trait IdentityDelegate: Send + Sync {
    /// Whether `contact` is a contact of `owned`.
    fn is_contact_of(
        &self,
        uow: &UnitOfWork<'_>,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<bool>;

    /// Whether the contact is active, i.e. not revoked.
    fn is_contact_active(
        &self,
        uow: &UnitOfWork<'_>,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<bool>;

    /// Uid of the device this engine runs on, for `owned`.
    fn current_device_uid(&self, uow: &UnitOfWork<'_>, owned: &CryptoIdentity) -> Result<Uid>;

    fn add_device_for_contact(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        device_uid: &Uid,
    ) -> Result<()>;

    /// Encoded identity details `owned` currently publishes.
    fn published_details_of_owned(
        &self,
        uow: &UnitOfWork<'_>,
        owned: &CryptoIdentity,
    ) -> Result<Vec<u8>>;

    fn update_published_details_of_contact(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        details: &[u8],
    ) -> Result<()>;
}

/// The channel abstraction: outgoing messages and oblivious channel lifecycle.
pub trait ChannelDelegate: Send + Sync {
    /// Hands a message over for transmission and returns its message id.
    ///
    /// Transmission must not start before `uow` commits.
    fn post(&self, uow: &mut UnitOfWork<'_>, message: MessageToSend) -> Result<Uid>;

    fn create_oblivious_channel(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
        remote_device_uid: &Uid,
        seed: &Seed,
        suite_version: u32,
    ) -> Result<()>;

    fn confirm_oblivious_channel(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
        remote_device_uid: &Uid,
    ) -> Result<()>;

    /// Deletes the channel with this remote device. Deleting a missing
    /// channel is not an error.
    fn delete_oblivious_channel(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
        remote_device_uid: &Uid,
    ) -> Result<()>;
}

/// Produces and checks challenge responses.
pub trait SolveChallengeDelegate: Send + Sync {
    fn solve_challenge(&self, challenge: &Challenge, owned: &CryptoIdentity) -> Result<ChallengeResponse>;

    fn check_response(
        &self,
        response: &ChallengeResponse,
        challenge: &Challenge,
        from: &CryptoIdentity,
    ) -> bool;
}

/// Challenge solver backed by in-memory secret keys.
#[derive(Default)]
pub struct KeyringChallengeSolver {
    keys: DashMap<CryptoIdentity, OwnedCryptoIdentity>,
}

impl KeyringChallengeSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the secret key of an owned identity available for signing.
    pub fn add(&self, owned: OwnedCryptoIdentity) {
        self.keys.insert(*owned.identity(), owned);
    }

    pub fn remove(&self, identity: &CryptoIdentity) -> bool {
        self.keys.remove(identity).is_some()
    }
}

impl SolveChallengeDelegate for KeyringChallengeSolver {
    fn solve_challenge(&self, challenge: &Challenge, owned: &CryptoIdentity) -> Result<ChallengeResponse> {
        let key = self
            .keys
            .get(owned)
            .ok_or_else(|| EngineError::delegate(format!("no secret key for owned identity {owned}")))?;
        Ok(key.solve_challenge(challenge))
    }

    fn check_response(
        &self,
        response: &ChallengeResponse,
        challenge: &Challenge,
        from: &CryptoIdentity,
    ) -> bool {
        from.check_response(response, challenge).is_ok()
    }
}

/// The set of collaborators handed to every step.
#[derive(Clone)]
pub struct Delegates {
    pub identity: Arc<dyn IdentityDelegate>,
    pub channel: Arc<dyn ChannelDelegate>,
    pub challenges: Arc<dyn SolveChallengeDelegate>,
}

impl std::fmt::Debug for Delegates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegates").finish_non_exhaustive()
    }
}
