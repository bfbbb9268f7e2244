//! Steps of the channel creation protocol.
//!
//! A step that meets an untrusted contact, a bad signature, a replayed
//! signature or key material it cannot use returns [`StateKind::Cancelled`];
//! whatever it wrote before that still commits. Failures of the delegates or
//! the store are returned as errors and roll the whole step back.

use protocol::{
    kem_decrypt, kem_encrypt, Challenge, CryptoIdentity, EphemeralKeyPair, MessageToSend,
    ReceptionChannelInfo, Seed, SendChannel, Uid,
};
use tracing::{debug, info, warn};

use super::initial_message;
use super::messages::{
    AliceIdentityAndEphemeralKeyMessage, BobEphemeralKeyAndK1Message, ChannelCreationMessage,
    FirstAckMessage, InitialMessage, K2Message, PingMessage, SecondAckMessage,
};
use super::states::{StateKind, WaitForAckState, WaitingForK1State, WaitingForK2State};
use crate::catalogue::{ProtocolStep, StepContext};
use crate::error::Result;
use crate::protocols::children;
use crate::store::{AntiReplayStore, ChannelCreationInstances, ReceivedMessage, StateRecord};

/// Suite version of the oblivious channels this protocol creates.
pub const CRYPTO_SUITE_VERSION: u32 = 0;

/// Whether this device drives the key exchange with the contact device.
///
/// Compares `(device uid, identity)` tuples; the strictly smaller one is in
/// charge, so exactly one of two distinct devices is.
pub fn is_in_charge(
    current_device_uid: &Uid,
    owned: &CryptoIdentity,
    contact_device_uid: &Uid,
    contact: &CryptoIdentity,
) -> bool {
    (current_device_uid, owned) < (contact_device_uid, contact)
}

/// Challenge signed by `signer` for `recipient`.
fn channel_creation_challenge(
    recipient_device_uid: Uid,
    signer_device_uid: Uid,
    recipient: CryptoIdentity,
    signer: CryptoIdentity,
) -> Challenge {
    Challenge::ChannelCreation {
        first_device_uid: recipient_device_uid,
        second_device_uid: signer_device_uid,
        first_identity: recipient,
        second_identity: signer,
    }
}

fn decode<M: ChannelCreationMessage>(received: &ReceivedMessage) -> Result<M> {
    Ok(M::decode_inputs(received.message.inputs.clone())?)
}

fn cancel(ctx: &StepContext<'_, '_>, step: &'static str, reason: &'static str) -> Result<StateRecord> {
    info!(
        instance_uid = %ctx.instance_uid,
        step,
        reason,
        "Channel creation cancelled"
    );
    Ok(StateKind::Cancelled.bare())
}

fn asymmetric(owned: CryptoIdentity, contact: CryptoIdentity, device: Uid) -> SendChannel {
    SendChannel::AsymmetricChannel {
        to: contact,
        remote_device_uids: vec![device],
        from: owned,
    }
}

fn oblivious(
    owned: CryptoIdentity,
    contact: CryptoIdentity,
    device: Uid,
    necessarily_confirmed: bool,
) -> SendChannel {
    SendChannel::ObliviousChannel {
        to: contact,
        remote_device_uids: vec![device],
        from: owned,
        necessarily_confirmed,
    }
}

fn contact_is_trusted(ctx: &StepContext<'_, '_>, contact: &CryptoIdentity) -> Result<bool> {
    let identity = &ctx.delegates.identity;
    Ok(identity.is_contact_of(ctx.uow(), &ctx.owned_identity, contact)?
        && identity.is_contact_active(ctx.uow(), &ctx.owned_identity, contact)?)
}

/// Aborts the instance currently creating a channel with this device, if any.
fn clean_ongoing_instance(
    ctx: &mut StepContext<'_, '_>,
    contact: &CryptoIdentity,
    device: &Uid,
) -> Result<Option<Uid>> {
    let owned = ctx.owned_identity;
    let stale = ChannelCreationInstances::delete(ctx.uow.conn(), &owned, contact, device)?;
    if let Some(uid) = stale {
        debug!(
            instance_uid = %ctx.instance_uid,
            stale_instance_uid = %uid,
            "Cleaning ongoing channel creation"
        );
        ctx.abort_protocol(&uid)?;
    }
    Ok(stale)
}

/// Posts the initial message of a child protocol. Transmission failures do
/// not stop the handshake.
fn post_child(ctx: &mut StepContext<'_, '_>, message: Option<MessageToSend>) -> Result<()> {
    match message {
        None => ctx.post(None).map(drop),
        Some(message) => {
            if let Err(err) = ctx.post(Some(message)) {
                warn!(instance_uid = %ctx.instance_uid, %err, "Could not start child protocol");
            }
            Ok(())
        }
    }
}

/// `Initial` in `Initial`: clean up and ping the contact device.
pub struct SendPingStep {
    message: InitialMessage,
}

impl SendPingStep {
    pub fn build(_state: &StateRecord, received: &ReceivedMessage) -> Result<Box<dyn ProtocolStep>> {
        Ok(Box::new(Self {
            message: decode(received)?,
        }))
    }
}

impl ProtocolStep for SendPingStep {
    fn name(&self) -> &'static str {
        "SendPing"
    }

    fn expected_reception_channel(&self) -> ReceptionChannelInfo {
        ReceptionChannelInfo::Local
    }

    fn execute(self: Box<Self>, ctx: &mut StepContext<'_, '_>) -> Result<StateRecord> {
        let name = self.name();
        let InitialMessage {
            contact_identity: contact,
            contact_device_uid: device,
        } = self.message;
        let owned = ctx.owned_identity;
        let delegates = ctx.delegates;

        if !contact_is_trusted(ctx, &contact)? {
            return cancel(ctx, name, "contact is not trusted or not active");
        }

        clean_ongoing_instance(ctx, &contact, &device)?;
        delegates
            .channel
            .delete_oblivious_channel(ctx.uow, &owned, &contact, &device)?;

        let current = delegates.identity.current_device_uid(ctx.uow(), &owned)?;
        let signature = delegates.challenges.solve_challenge(
            &channel_creation_challenge(device, current, contact, owned),
            &owned,
        )?;

        let ping = PingMessage {
            contact_identity: owned,
            contact_device_uid: current,
            signature,
        };
        let core = ctx.core_message(asymmetric(owned, contact, device));
        ctx.post(ping.to_send(&core))?;

        Ok(StateKind::PingSent.bare())
    }
}

/// `Ping` in `Initial`: authenticate the contact device, then either ping
/// back or, when in charge, start the key exchange.
pub struct SendPingOrEphemeralKeyStep {
    message: PingMessage,
}

impl SendPingOrEphemeralKeyStep {
    pub fn build(_state: &StateRecord, received: &ReceivedMessage) -> Result<Box<dyn ProtocolStep>> {
        Ok(Box::new(Self {
            message: decode(received)?,
        }))
    }
}

impl ProtocolStep for SendPingOrEphemeralKeyStep {
    fn name(&self) -> &'static str {
        "SendPingOrEphemeralKey"
    }

    fn expected_reception_channel(&self) -> ReceptionChannelInfo {
        ReceptionChannelInfo::AsymmetricChannel
    }

    fn execute(self: Box<Self>, ctx: &mut StepContext<'_, '_>) -> Result<StateRecord> {
        let name = self.name();
        let PingMessage {
            contact_identity: contact,
            contact_device_uid: device,
            signature,
        } = self.message;
        let owned = ctx.owned_identity;
        let delegates = ctx.delegates;

        if !contact_is_trusted(ctx, &contact)? {
            return cancel(ctx, name, "contact is not trusted or not active");
        }

        let current = delegates.identity.current_device_uid(ctx.uow(), &owned)?;
        let challenge = channel_creation_challenge(current, device, owned, contact);
        if !delegates.challenges.check_response(&signature, &challenge, &contact) {
            return cancel(ctx, name, "invalid ping signature");
        }

        if AntiReplayStore::exists(ctx.uow.conn(), &owned, &signature)? {
            return cancel(ctx, name, "ping signature already received");
        }
        AntiReplayStore::insert(ctx.uow.conn(), &owned, &signature)?;

        clean_ongoing_instance(ctx, &contact, &device)?;
        delegates
            .channel
            .delete_oblivious_channel(ctx.uow, &owned, &contact, &device)?;

        let own_signature = delegates.challenges.solve_challenge(
            &channel_creation_challenge(device, current, contact, owned),
            &owned,
        )?;

        if !is_in_charge(&current, &owned, &device, &contact) {
            debug!(instance_uid = %ctx.instance_uid, "Not in charge, answering with a ping");
            let ping = PingMessage {
                contact_identity: owned,
                contact_device_uid: current,
                signature: own_signature,
            };
            let core = ctx.core_message(asymmetric(owned, contact, device));
            ctx.post(ping.to_send(&core))?;
            return Ok(StateKind::PingSent.bare());
        }

        debug!(instance_uid = %ctx.instance_uid, "In charge, sending ephemeral key");
        ChannelCreationInstances::insert(
            ctx.uow.conn(),
            &owned,
            &contact,
            &device,
            &ctx.instance_uid,
        )?;

        let EphemeralKeyPair {
            public_key,
            private_key,
        } = EphemeralKeyPair::generate();
        let alice = AliceIdentityAndEphemeralKeyMessage {
            contact_identity: owned,
            contact_device_uid: current,
            signature: own_signature,
            contact_ephemeral_public_key: public_key,
        };
        let core = ctx.core_message(asymmetric(owned, contact, device));
        ctx.post(alice.to_send(&core))?;

        WaitingForK1State {
            contact_identity: contact,
            contact_device_uid: device,
            ephemeral_private_key: private_key,
        }
        .to_record()
    }
}

/// `AliceIdentityAndEphemeralKey` in `Initial`: encapsulate K1 for the
/// contact and send our own ephemeral key.
pub struct SendEphemeralKeyAndK1Step {
    message: AliceIdentityAndEphemeralKeyMessage,
}

impl SendEphemeralKeyAndK1Step {
    pub fn build(_state: &StateRecord, received: &ReceivedMessage) -> Result<Box<dyn ProtocolStep>> {
        Ok(Box::new(Self {
            message: decode(received)?,
        }))
    }
}

impl ProtocolStep for SendEphemeralKeyAndK1Step {
    fn name(&self) -> &'static str {
        "SendEphemeralKeyAndK1"
    }

    fn expected_reception_channel(&self) -> ReceptionChannelInfo {
        ReceptionChannelInfo::AsymmetricChannel
    }

    fn execute(self: Box<Self>, ctx: &mut StepContext<'_, '_>) -> Result<StateRecord> {
        let name = self.name();
        let AliceIdentityAndEphemeralKeyMessage {
            contact_identity: contact,
            contact_device_uid: device,
            signature,
            contact_ephemeral_public_key,
        } = self.message;
        let owned = ctx.owned_identity;
        let delegates = ctx.delegates;

        if !contact_is_trusted(ctx, &contact)? {
            return cancel(ctx, name, "contact is not trusted or not active");
        }

        let current = delegates.identity.current_device_uid(ctx.uow(), &owned)?;
        let challenge = channel_creation_challenge(current, device, owned, contact);
        if !delegates.challenges.check_response(&signature, &challenge, &contact) {
            return cancel(ctx, name, "invalid signature");
        }
        if AntiReplayStore::exists(ctx.uow.conn(), &owned, &signature)? {
            return cancel(ctx, name, "signature already received");
        }
        AntiReplayStore::insert(ctx.uow.conn(), &owned, &signature)?;

        // A running creation with this device means both sides lost track of
        // each other: drop it and start over from a clean slate.
        if clean_ongoing_instance(ctx, &contact, &device)?.is_some() {
            ctx.post(initial_message(&owned, &contact, &device))?;
            return cancel(ctx, name, "stale channel creation found, restarting");
        }

        let (c1, k1) = match kem_encrypt(&contact_ephemeral_public_key) {
            Ok(encapsulated) => encapsulated,
            Err(err) => {
                debug!(instance_uid = %ctx.instance_uid, %err, "Encapsulation failed");
                return cancel(ctx, name, "unusable ephemeral key");
            }
        };

        ChannelCreationInstances::insert(
            ctx.uow.conn(),
            &owned,
            &contact,
            &device,
            &ctx.instance_uid,
        )?;

        let EphemeralKeyPair {
            public_key,
            private_key,
        } = EphemeralKeyPair::generate();
        let bob = BobEphemeralKeyAndK1Message {
            contact_ephemeral_public_key: public_key,
            c1,
        };
        let core = ctx.core_message(asymmetric(owned, contact, device));
        ctx.post(bob.to_send(&core))?;

        WaitingForK2State {
            contact_identity: contact,
            contact_device_uid: device,
            ephemeral_private_key: private_key,
            k1,
        }
        .to_record()
    }
}

/// `BobEphemeralKeyAndK1` in `WaitingForK1`: recover K1, encapsulate K2,
/// create the channel and send K2.
pub struct RecoverK1AndSendK2AndCreateChannelStep {
    state: WaitingForK1State,
    message: BobEphemeralKeyAndK1Message,
}

impl RecoverK1AndSendK2AndCreateChannelStep {
    pub fn build(state: &StateRecord, received: &ReceivedMessage) -> Result<Box<dyn ProtocolStep>> {
        Ok(Box::new(Self {
            message: decode(received)?,
            state: state.decode()?,
        }))
    }
}

impl ProtocolStep for RecoverK1AndSendK2AndCreateChannelStep {
    fn name(&self) -> &'static str {
        "RecoverK1AndSendK2AndCreateChannel"
    }

    fn expected_reception_channel(&self) -> ReceptionChannelInfo {
        ReceptionChannelInfo::AsymmetricChannel
    }

    fn execute(self: Box<Self>, ctx: &mut StepContext<'_, '_>) -> Result<StateRecord> {
        let name = self.name();
        let Self { state, message } = *self;
        let contact = state.contact_identity;
        let device = state.contact_device_uid;
        let owned = ctx.owned_identity;
        let delegates = ctx.delegates;

        let Ok(k1) = kem_decrypt(&state.ephemeral_private_key, &message.c1) else {
            return cancel(ctx, name, "could not recover K1");
        };
        let Ok((c2, k2)) = kem_encrypt(&message.contact_ephemeral_public_key) else {
            return cancel(ctx, name, "unusable ephemeral key");
        };

        if !delegates
            .identity
            .is_contact_active(ctx.uow(), &owned, &contact)?
        {
            return cancel(ctx, name, "contact is not active");
        }

        if let Err(err) = delegates
            .identity
            .add_device_for_contact(ctx.uow, &owned, &contact, &device)
        {
            warn!(instance_uid = %ctx.instance_uid, %err, "Could not add contact device");
        }
        post_child(ctx, children::device_discovery(&owned, &contact))?;

        let Ok(seed) = Seed::from_keys(&k1, &k2) else {
            return cancel(ctx, name, "could not derive channel seed");
        };
        delegates.channel.create_oblivious_channel(
            ctx.uow,
            &owned,
            &contact,
            &device,
            &seed,
            CRYPTO_SUITE_VERSION,
        )?;

        let core = ctx.core_message(asymmetric(owned, contact, device));
        ctx.post(K2Message { c2 }.to_send(&core))?;

        let current = delegates.identity.current_device_uid(ctx.uow(), &owned)?;
        WaitForAckState {
            contact_identity: contact,
            contact_device_uid: device,
            current_device_uid: current,
        }
        .to_record(StateKind::WaitForFirstAck)
    }
}

/// `K2` in `WaitingForK2`: recover K2, create the channel and acknowledge
/// over it.
pub struct RecoverK2CreateChannelAndSendAckStep {
    state: WaitingForK2State,
    message: K2Message,
}

impl RecoverK2CreateChannelAndSendAckStep {
    pub fn build(state: &StateRecord, received: &ReceivedMessage) -> Result<Box<dyn ProtocolStep>> {
        Ok(Box::new(Self {
            message: decode(received)?,
            state: state.decode()?,
        }))
    }
}

impl ProtocolStep for RecoverK2CreateChannelAndSendAckStep {
    fn name(&self) -> &'static str {
        "RecoverK2CreateChannelAndSendAck"
    }

    fn expected_reception_channel(&self) -> ReceptionChannelInfo {
        ReceptionChannelInfo::AsymmetricChannel
    }

    fn execute(self: Box<Self>, ctx: &mut StepContext<'_, '_>) -> Result<StateRecord> {
        let name = self.name();
        let Self { state, message } = *self;
        let contact = state.contact_identity;
        let device = state.contact_device_uid;
        let owned = ctx.owned_identity;
        let delegates = ctx.delegates;

        let Ok(k2) = kem_decrypt(&state.ephemeral_private_key, &message.c2) else {
            return cancel(ctx, name, "could not recover K2");
        };

        if !delegates
            .identity
            .is_contact_active(ctx.uow(), &owned, &contact)?
        {
            return cancel(ctx, name, "contact is not active");
        }
        delegates
            .identity
            .add_device_for_contact(ctx.uow, &owned, &contact, &device)?;

        let Ok(seed) = Seed::from_keys(&state.k1, &k2) else {
            return cancel(ctx, name, "could not derive channel seed");
        };
        delegates.channel.create_oblivious_channel(
            ctx.uow,
            &owned,
            &contact,
            &device,
            &seed,
            CRYPTO_SUITE_VERSION,
        )?;

        let details = delegates.identity.published_details_of_owned(ctx.uow(), &owned)?;
        let ack = FirstAckMessage {
            contact_identity_details: details,
        };
        let core = ctx.core_message(oblivious(owned, contact, device, false));
        ctx.post(ack.to_send(&core))?;

        let current = delegates.identity.current_device_uid(ctx.uow(), &owned)?;
        WaitForAckState {
            contact_identity: contact,
            contact_device_uid: device,
            current_device_uid: current,
        }
        .to_record(StateKind::WaitForSecondAck)
    }
}

/// `FirstAck` in `WaitForFirstAck`: confirm the channel, acknowledge back and
/// start the child protocols.
pub struct ConfirmChannelAndSendAckStep {
    state: WaitForAckState,
    message: FirstAckMessage,
}

impl ConfirmChannelAndSendAckStep {
    pub fn build(state: &StateRecord, received: &ReceivedMessage) -> Result<Box<dyn ProtocolStep>> {
        Ok(Box::new(Self {
            message: decode(received)?,
            state: state.decode()?,
        }))
    }
}

impl ProtocolStep for ConfirmChannelAndSendAckStep {
    fn name(&self) -> &'static str {
        "ConfirmChannelAndSendAck"
    }

    fn expected_reception_channel(&self) -> ReceptionChannelInfo {
        ReceptionChannelInfo::ObliviousChannel {
            remote_identity: self.state.contact_identity,
            remote_device_uid: self.state.contact_device_uid,
        }
    }

    fn execute(self: Box<Self>, ctx: &mut StepContext<'_, '_>) -> Result<StateRecord> {
        let Self { state, message } = *self;
        let contact = state.contact_identity;
        let device = state.contact_device_uid;
        let owned = ctx.owned_identity;
        let delegates = ctx.delegates;

        delegates
            .channel
            .confirm_oblivious_channel(ctx.uow, &owned, &contact, &device)?;
        delegates.identity.update_published_details_of_contact(
            ctx.uow,
            &owned,
            &contact,
            &message.contact_identity_details,
        )?;
        ChannelCreationInstances::delete(ctx.uow.conn(), &owned, &contact, &device)?;

        let details = delegates.identity.published_details_of_owned(ctx.uow(), &owned)?;
        let ack = SecondAckMessage {
            contact_identity_details: details,
        };
        let core = ctx.core_message(oblivious(owned, contact, device, true));
        ctx.post(ack.to_send(&core))?;

        post_child(ctx, children::capabilities_discovery(&owned, &contact, &device))?;
        post_child(ctx, children::one_to_one_status_sync(&owned, &[contact]))?;

        info!(instance_uid = %ctx.instance_uid, contact = %contact, "Channel confirmed");
        Ok(StateKind::ChannelConfirmed.bare())
    }
}

/// `SecondAck` in `WaitForSecondAck`: confirm the channel.
pub struct ConfirmChannelStep {
    state: WaitForAckState,
    message: SecondAckMessage,
}

impl ConfirmChannelStep {
    pub fn build(state: &StateRecord, received: &ReceivedMessage) -> Result<Box<dyn ProtocolStep>> {
        Ok(Box::new(Self {
            message: decode(received)?,
            state: state.decode()?,
        }))
    }
}

impl ProtocolStep for ConfirmChannelStep {
    fn name(&self) -> &'static str {
        "ConfirmChannel"
    }

    fn expected_reception_channel(&self) -> ReceptionChannelInfo {
        ReceptionChannelInfo::ObliviousChannel {
            remote_identity: self.state.contact_identity,
            remote_device_uid: self.state.contact_device_uid,
        }
    }

    fn execute(self: Box<Self>, ctx: &mut StepContext<'_, '_>) -> Result<StateRecord> {
        let Self { state, message } = *self;
        let contact = state.contact_identity;
        let device = state.contact_device_uid;
        let owned = ctx.owned_identity;
        let delegates = ctx.delegates;

        delegates
            .channel
            .confirm_oblivious_channel(ctx.uow, &owned, &contact, &device)?;
        delegates.identity.update_published_details_of_contact(
            ctx.uow,
            &owned,
            &contact,
            &message.contact_identity_details,
        )?;
        ChannelCreationInstances::delete(ctx.uow.conn(), &owned, &contact, &device)?;

        post_child(ctx, children::capabilities_discovery(&owned, &contact, &device))?;

        info!(instance_uid = %ctx.instance_uid, contact = %contact, "Channel confirmed");
        Ok(StateKind::ChannelConfirmed.bare())
    }
}
