//! Creation of an oblivious channel with one device of a contact.
//!
//! ## Handshake
//!
//! ```text
//!   A (in charge)                                  B
//!   ─────────────                                  ─
//!                  ◄──────── Ping ────────────     (signed)
//!   AliceIdentityAndEphemeralKey ─────────►        (signed, pk_A)
//!                  ◄──── BobEphemeralKeyAndK1 ──   (pk_B, c1 = KEM(pk_A))
//!   create channel from seed(K1, K2)
//!   K2 ───────────────────────────────────►        (c2 = KEM(pk_B))
//!                                                  create channel
//!                  ◄──────── FirstAck ────────     (oblivious channel)
//!   confirm channel
//!   SecondAck ────────────────────────────►        confirm channel
//! ```
//!
//! Either side may start with `Initial`, which sends a ping. The side that is
//! not in charge answers a ping with its own ping, in a fresh instance on the
//! receiving side.

mod messages;
mod states;
mod steps;

use protocol::{
    CoreProtocolMessage, CryptoIdentity, MessageToSend, ProtocolError, ProtocolId, SendChannel,
    Uid,
};

use crate::catalogue::{lookup_step, ConcreteProtocol, ProtocolStep, StepEntry};
use crate::error::Result;
use crate::store::{ReceivedMessage, StateRecord};

pub use messages::{
    AliceIdentityAndEphemeralKeyMessage, BobEphemeralKeyAndK1Message, ChannelCreationMessage,
    FirstAckMessage, InitialMessage, K2Message, MessageKind, PingMessage, SecondAckMessage,
};
pub use states::{StateKind, WaitForAckState, WaitingForK1State, WaitingForK2State};
pub use steps::{is_in_charge, CRYPTO_SUITE_VERSION};

use steps::{
    ConfirmChannelAndSendAckStep, ConfirmChannelStep, RecoverK1AndSendK2AndCreateChannelStep,
    RecoverK2CreateChannelAndSendAckStep, SendEphemeralKeyAndK1Step, SendPingOrEphemeralKeyStep,
    SendPingStep,
};

const STEPS: &[StepEntry] = &[
    StepEntry {
        state_kind: StateKind::Initial.raw(),
        message_kind: MessageKind::Initial.raw(),
        build: SendPingStep::build,
    },
    StepEntry {
        state_kind: StateKind::Initial.raw(),
        message_kind: MessageKind::Ping.raw(),
        build: SendPingOrEphemeralKeyStep::build,
    },
    StepEntry {
        state_kind: StateKind::Initial.raw(),
        message_kind: MessageKind::AliceIdentityAndEphemeralKey.raw(),
        build: SendEphemeralKeyAndK1Step::build,
    },
    StepEntry {
        state_kind: StateKind::WaitingForK1.raw(),
        message_kind: MessageKind::BobEphemeralKeyAndK1.raw(),
        build: RecoverK1AndSendK2AndCreateChannelStep::build,
    },
    StepEntry {
        state_kind: StateKind::WaitingForK2.raw(),
        message_kind: MessageKind::K2.raw(),
        build: RecoverK2CreateChannelAndSendAckStep::build,
    },
    StepEntry {
        state_kind: StateKind::WaitForFirstAck.raw(),
        message_kind: MessageKind::FirstAck.raw(),
        build: ConfirmChannelAndSendAckStep::build,
    },
    StepEntry {
        state_kind: StateKind::WaitForSecondAck.raw(),
        message_kind: MessageKind::SecondAck.raw(),
        build: ConfirmChannelStep::build,
    },
];

/// The channel creation protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCreationProtocol;

impl ConcreteProtocol for ChannelCreationProtocol {
    fn id(&self) -> ProtocolId {
        ProtocolId::ChannelCreationWithContactDevice
    }

    fn initial_state(&self) -> StateRecord {
        StateKind::Initial.bare()
    }

    fn is_instance_creating(&self, message_kind: i64) -> bool {
        matches!(
            MessageKind::from_raw(message_kind),
            Some(
                MessageKind::Initial
                    | MessageKind::Ping
                    | MessageKind::AliceIdentityAndEphemeralKey
            )
        )
    }

    fn is_final_state(&self, state: &StateRecord) -> bool {
        StateKind::from_raw(state.kind).is_ok_and(StateKind::is_final)
    }

    fn state_name(&self, state: &StateRecord) -> &'static str {
        StateKind::from_raw(state.kind).map_or("Unknown", StateKind::name)
    }

    fn step_for(
        &self,
        state: &StateRecord,
        message: &ReceivedMessage,
    ) -> Result<Option<Box<dyn ProtocolStep>>> {
        let state_kind = StateKind::from_raw(state.kind)?;
        let raw_kind = message.message.message_kind;
        let Some(message_kind) = MessageKind::from_raw(raw_kind) else {
            return Err(ProtocolError::UnknownMessageKind {
                protocol: self.id().to_string(),
                kind: raw_kind,
            }
            .into());
        };
        match lookup_step(STEPS, state_kind.raw(), message_kind.raw()) {
            Some(build) => build(state, message).map(Some),
            None => Ok(None),
        }
    }
}

/// The local message starting a channel creation with one contact device,
/// addressed to a fresh instance.
pub fn initial_message(
    owned: &CryptoIdentity,
    contact: &CryptoIdentity,
    contact_device_uid: &Uid,
) -> Option<MessageToSend> {
    let core = CoreProtocolMessage::new(
        SendChannel::Local { owned: *owned },
        ProtocolId::ChannelCreationWithContactDevice,
        Uid::generate(),
    );
    InitialMessage {
        contact_identity: *contact,
        contact_device_uid: *contact_device_uid,
    }
    .to_send(&core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::store::ReceivedMessageId;
    use protocol::{Encoded, GenericProtocolMessage, OwnedCryptoIdentity, ReceptionChannelInfo};

    fn received(kind: MessageKind, inputs: Vec<Encoded>) -> ReceivedMessage {
        ReceivedMessage {
            id: ReceivedMessageId(1),
            owned_identity: *OwnedCryptoIdentity::generate().identity(),
            message: GenericProtocolMessage {
                protocol_id: ProtocolId::ChannelCreationWithContactDevice,
                instance_uid: Uid::generate(),
                message_kind: kind.raw(),
                inputs,
            },
            reception: ReceptionChannelInfo::Local,
            dialog_uuid: None,
            user_response: None,
            received_at: 0,
        }
    }

    fn initial_inputs() -> Vec<Encoded> {
        InitialMessage {
            contact_identity: *OwnedCryptoIdentity::generate().identity(),
            contact_device_uid: Uid::generate(),
        }
        .encode_inputs()
    }

    #[test]
    fn test_instance_creating_kinds() {
        let protocol = ChannelCreationProtocol;
        let creating: Vec<_> = MessageKind::ALL
            .into_iter()
            .filter(|kind| protocol.is_instance_creating(kind.raw()))
            .collect();
        assert_eq!(
            creating,
            vec![
                MessageKind::Initial,
                MessageKind::Ping,
                MessageKind::AliceIdentityAndEphemeralKey
            ]
        );
        assert!(!protocol.is_instance_creating(42));
    }

    #[test]
    fn test_initial_matches_send_ping_in_initial_state() {
        let protocol = ChannelCreationProtocol;
        let step = protocol
            .step_for(
                &protocol.initial_state(),
                &received(MessageKind::Initial, initial_inputs()),
            )
            .unwrap()
            .unwrap();
        assert_eq!(step.name(), "SendPing");
        assert_eq!(step.expected_reception_channel(), ReceptionChannelInfo::Local);
    }

    #[test]
    fn test_message_out_of_phase_has_no_step() {
        let protocol = ChannelCreationProtocol;
        let k2 = received(MessageKind::K2, vec![Encoded::bytes(vec![0u8; 32])]);
        assert!(protocol
            .step_for(&protocol.initial_state(), &k2)
            .unwrap()
            .is_none());
        assert!(protocol
            .step_for(&StateKind::PingSent.bare(), &k2)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_undecodable_inputs_are_protocol_errors() {
        let protocol = ChannelCreationProtocol;
        let garbage = received(MessageKind::Initial, vec![Encoded::Int(3)]);
        assert!(matches!(
            protocol.step_for(&protocol.initial_state(), &garbage),
            Err(EngineError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_state_kind_is_reported() {
        let protocol = ChannelCreationProtocol;
        let message = received(MessageKind::Initial, initial_inputs());
        assert!(matches!(
            protocol.step_for(&StateRecord::bare(99), &message),
            Err(EngineError::UnknownState { kind: 99, .. })
        ));
        assert_eq!(protocol.state_name(&StateRecord::bare(99)), "Unknown");
        assert!(!protocol.is_final_state(&StateRecord::bare(99)));
    }

    #[test]
    fn test_initial_message_is_local() {
        let owned = *OwnedCryptoIdentity::generate().identity();
        let contact = *OwnedCryptoIdentity::generate().identity();
        let device = Uid::generate();
        let Some(MessageToSend::Protocol(sent)) = initial_message(&owned, &contact, &device) else {
            panic!("expected a protocol message");
        };
        assert_eq!(sent.channel, SendChannel::Local { owned });
        assert_eq!(sent.envelope.message_kind, MessageKind::Initial.raw());
        assert_eq!(
            InitialMessage::decode_inputs(sent.envelope.inputs).unwrap(),
            InitialMessage {
                contact_identity: contact,
                contact_device_uid: device
            }
        );
    }
}
