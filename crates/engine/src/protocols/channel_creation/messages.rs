//! Messages of the channel creation protocol.

use protocol::{
    check_arity, ChallengeResponse, Ciphertext, CoreProtocolMessage, CryptoIdentity, Decode,
    Encode, Encoded, EphemeralPublicKey, MessageToSend, ProtocolError, Uid,
};

/// Message kinds, as written in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Initial,
    Ping,
    AliceIdentityAndEphemeralKey,
    BobEphemeralKeyAndK1,
    K2,
    FirstAck,
    SecondAck,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Initial,
        MessageKind::Ping,
        MessageKind::AliceIdentityAndEphemeralKey,
        MessageKind::BobEphemeralKeyAndK1,
        MessageKind::K2,
        MessageKind::FirstAck,
        MessageKind::SecondAck,
    ];

    pub const fn raw(self) -> i64 {
        match self {
            MessageKind::Initial => 0,
            MessageKind::Ping => 1,
            MessageKind::AliceIdentityAndEphemeralKey => 2,
            MessageKind::BobEphemeralKeyAndK1 => 3,
            MessageKind::K2 => 4,
            MessageKind::FirstAck => 5,
            MessageKind::SecondAck => 6,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.raw() == raw)
    }
}

/// A typed message of this protocol.
pub trait ChannelCreationMessage: Sized {
    const KIND: MessageKind;

    fn encode_inputs(&self) -> Vec<Encoded>;

    fn decode_inputs(inputs: Vec<Encoded>) -> protocol::Result<Self>;

    /// Builds the message to post with `core` addressing.
    fn to_send(&self, core: &CoreProtocolMessage) -> Option<MessageToSend> {
        core.generate_message_to_send(Self::KIND.raw(), self.encode_inputs())
    }
}

fn take<const N: usize>(inputs: Vec<Encoded>) -> protocol::Result<[Encoded; N]> {
    check_arity(&inputs, N)?;
    inputs
        .try_into()
        .map_err(|rest: Vec<Encoded>| ProtocolError::WrongArity {
            expected: N,
            got: rest.len(),
        })
}

/// Local trigger starting a handshake with one contact device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialMessage {
    pub contact_identity: CryptoIdentity,
    pub contact_device_uid: Uid,
}

impl ChannelCreationMessage for InitialMessage {
    const KIND: MessageKind = MessageKind::Initial;

    fn encode_inputs(&self) -> Vec<Encoded> {
        vec![self.contact_identity.encode(), self.contact_device_uid.encode()]
    }

    fn decode_inputs(inputs: Vec<Encoded>) -> protocol::Result<Self> {
        let [identity, device] = take(inputs)?;
        Ok(Self {
            contact_identity: CryptoIdentity::decode(identity)?,
            contact_device_uid: Uid::decode(device)?,
        })
    }
}

/// Signed announcement of the sender device. The `contact_*` fields describe
/// the sender, as seen by the recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingMessage {
    pub contact_identity: CryptoIdentity,
    pub contact_device_uid: Uid,
    pub signature: ChallengeResponse,
}

impl ChannelCreationMessage for PingMessage {
    const KIND: MessageKind = MessageKind::Ping;

    fn encode_inputs(&self) -> Vec<Encoded> {
        vec![
            self.contact_identity.encode(),
            self.contact_device_uid.encode(),
            self.signature.encode(),
        ]
    }

    fn decode_inputs(inputs: Vec<Encoded>) -> protocol::Result<Self> {
        let [identity, device, signature] = take(inputs)?;
        Ok(Self {
            contact_identity: CryptoIdentity::decode(identity)?,
            contact_device_uid: Uid::decode(device)?,
            signature: ChallengeResponse::decode(signature)?,
        })
    }
}

/// Sent by the side in charge: a fresh signature and its ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliceIdentityAndEphemeralKeyMessage {
    pub contact_identity: CryptoIdentity,
    pub contact_device_uid: Uid,
    pub signature: ChallengeResponse,
    pub contact_ephemeral_public_key: EphemeralPublicKey,
}

impl ChannelCreationMessage for AliceIdentityAndEphemeralKeyMessage {
    const KIND: MessageKind = MessageKind::AliceIdentityAndEphemeralKey;

    fn encode_inputs(&self) -> Vec<Encoded> {
        vec![
            self.contact_identity.encode(),
            self.contact_device_uid.encode(),
            self.signature.encode(),
            self.contact_ephemeral_public_key.encode(),
        ]
    }

    fn decode_inputs(inputs: Vec<Encoded>) -> protocol::Result<Self> {
        let [identity, device, signature, public_key] = take(inputs)?;
        Ok(Self {
            contact_identity: CryptoIdentity::decode(identity)?,
            contact_device_uid: Uid::decode(device)?,
            signature: ChallengeResponse::decode(signature)?,
            contact_ephemeral_public_key: EphemeralPublicKey::decode(public_key)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BobEphemeralKeyAndK1Message {
    pub contact_ephemeral_public_key: EphemeralPublicKey,
    pub c1: Ciphertext,
}

impl ChannelCreationMessage for BobEphemeralKeyAndK1Message {
    const KIND: MessageKind = MessageKind::BobEphemeralKeyAndK1;

    fn encode_inputs(&self) -> Vec<Encoded> {
        vec![self.contact_ephemeral_public_key.encode(), self.c1.encode()]
    }

    fn decode_inputs(inputs: Vec<Encoded>) -> protocol::Result<Self> {
        let [public_key, c1] = take(inputs)?;
        Ok(Self {
            contact_ephemeral_public_key: EphemeralPublicKey::decode(public_key)?,
            c1: Ciphertext::decode(c1)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K2Message {
    pub c2: Ciphertext,
}

impl ChannelCreationMessage for K2Message {
    const KIND: MessageKind = MessageKind::K2;

    fn encode_inputs(&self) -> Vec<Encoded> {
        vec![self.c2.encode()]
    }

    fn decode_inputs(inputs: Vec<Encoded>) -> protocol::Result<Self> {
        let [c2] = take(inputs)?;
        Ok(Self {
            c2: Ciphertext::decode(c2)?,
        })
    }
}

/// First message over the new channel, with the sender's published details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstAckMessage {
    pub contact_identity_details: Vec<u8>,
}

impl ChannelCreationMessage for FirstAckMessage {
    const KIND: MessageKind = MessageKind::FirstAck;

    fn encode_inputs(&self) -> Vec<Encoded> {
        vec![self.contact_identity_details.encode()]
    }

    fn decode_inputs(inputs: Vec<Encoded>) -> protocol::Result<Self> {
        let [details] = take(inputs)?;
        Ok(Self {
            contact_identity_details: Vec::<u8>::decode(details)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondAckMessage {
    pub contact_identity_details: Vec<u8>,
}

impl ChannelCreationMessage for SecondAckMessage {
    const KIND: MessageKind = MessageKind::SecondAck;

    fn encode_inputs(&self) -> Vec<Encoded> {
        vec![self.contact_identity_details.encode()]
    }

    fn decode_inputs(inputs: Vec<Encoded>) -> protocol::Result<Self> {
        let [details] = take(inputs)?;
        Ok(Self {
            contact_identity_details: Vec::<u8>::decode(details)?,
        })
    }
}
