//! Protocol envelopes.
//!
//! Every protocol message travels as a single encoded list:
//!
//! ```text
//! [Int(protocol_id), Bytes(instance_uid), Int(message_kind), List(inputs)]
//! ```
//!
//! Decoding is pure: it either yields a [`GenericProtocolMessage`] or an
//! error, and never touches any state. Callers drop undecodable envelopes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoded::{Decode, Encode, Encoded};
use crate::error::{ProtocolError, Result};
use crate::uid::Uid;

/// Number of elements in an envelope list.
pub const ENVELOPE_ARITY: usize = 4;

/// Identifiers of the protocols known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolId {
    /// Discovery of the devices of a contact identity.
    DeviceDiscoveryForContactIdentity,
    /// Creation of an oblivious channel with one device of a contact.
    ChannelCreationWithContactDevice,
    /// Exchange of device capabilities over a fresh channel.
    DeviceCapabilitiesDiscovery,
    /// One-to-one contact invitation and status synchronisation.
    OneToOneContactInvitation,
}

impl ProtocolId {
    /// All known protocols.
    pub const ALL: [ProtocolId; 4] = [
        ProtocolId::DeviceDiscoveryForContactIdentity,
        ProtocolId::ChannelCreationWithContactDevice,
        ProtocolId::DeviceCapabilitiesDiscovery,
        ProtocolId::OneToOneContactInvitation,
    ];

    /// Numeric tag written on the wire.
    pub fn raw(self) -> i64 {
        match self {
            ProtocolId::DeviceDiscoveryForContactIdentity => 0,
            ProtocolId::ChannelCreationWithContactDevice => 1,
            ProtocolId::DeviceCapabilitiesDiscovery => 2,
            ProtocolId::OneToOneContactInvitation => 3,
        }
    }

    /// Parses a numeric tag.
    pub fn from_raw(raw: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.raw() == raw)
            .ok_or(ProtocolError::UnknownProtocol(raw))
    }

    /// Highest message kind defined by this protocol.
    ///
    /// Message kinds of a protocol are numbered contiguously from zero.
    pub fn max_message_kind(self) -> i64 {
        match self {
            ProtocolId::DeviceDiscoveryForContactIdentity => 3,
            ProtocolId::ChannelCreationWithContactDevice => 6,
            ProtocolId::DeviceCapabilitiesDiscovery => 3,
            ProtocolId::OneToOneContactInvitation => 9,
        }
    }

    /// Checks that `kind` is defined by this protocol.
    pub fn check_message_kind(self, kind: i64) -> Result<()> {
        if (0..=self.max_message_kind()).contains(&kind) {
            Ok(())
        } else {
            Err(ProtocolError::UnknownMessageKind {
                protocol: self.to_string(),
                kind,
            })
        }
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolId::DeviceDiscoveryForContactIdentity => "DeviceDiscoveryForContactIdentity",
            ProtocolId::ChannelCreationWithContactDevice => "ChannelCreationWithContactDevice",
            ProtocolId::DeviceCapabilitiesDiscovery => "DeviceCapabilitiesDiscovery",
            ProtocolId::OneToOneContactInvitation => "OneToOneContactInvitation",
        };
        f.write_str(name)
    }
}

/// A decoded envelope, before its inputs are interpreted by a concrete protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericProtocolMessage {
    /// Protocol the message belongs to.
    pub protocol_id: ProtocolId,
    /// Instance the message is addressed to.
    pub instance_uid: Uid,
    /// Protocol-specific message kind.
    pub message_kind: i64,
    /// Raw encoded inputs.
    pub inputs: Vec<Encoded>,
}

impl GenericProtocolMessage {
    /// Parses an envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(Encoded::from_bytes(bytes)?)
    }

    /// Serializes the envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.encode().to_bytes()
    }
}

impl Encode for GenericProtocolMessage {
    fn encode(&self) -> Encoded {
        Encoded::list([
            Encoded::Int(self.protocol_id.raw()),
            self.instance_uid.encode(),
            Encoded::Int(self.message_kind),
            Encoded::List(self.inputs.clone()),
        ])
    }
}

impl Decode for GenericProtocolMessage {
    fn decode(value: Encoded) -> Result<Self> {
        let mut items = value.into_list_of_arity(ENVELOPE_ARITY)?.into_iter();
        // Arity was checked above.
        let (Some(protocol), Some(uid), Some(kind), Some(inputs)) =
            (items.next(), items.next(), items.next(), items.next())
        else {
            return Err(ProtocolError::WrongArity {
                expected: ENVELOPE_ARITY,
                got: 0,
            });
        };

        let protocol_id = ProtocolId::from_raw(protocol.as_int()?)?;
        let instance_uid = Uid::decode(uid)?;
        let message_kind = kind.as_int()?;
        protocol_id.check_message_kind(message_kind)?;
        let inputs = inputs.into_list()?;

        Ok(Self {
            protocol_id,
            instance_uid,
            message_kind,
            inputs,
        })
    }
}

/// An inbound envelope, in one of its three flavors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedEnvelope {
    /// A protocol message received from a channel.
    Protocol(GenericProtocolMessage),
    /// The answer of the user to a dialog a protocol step displayed.
    DialogResponse {
        /// The envelope the dialog was created with.
        message: GenericProtocolMessage,
        /// Correlates the response with the dialog.
        dialog_uuid: Uuid,
        /// The encoded answer, absent when the dialog was dismissed.
        user_response: Option<Encoded>,
    },
    /// The result of a server query a protocol step issued.
    ServerQueryResponse {
        /// The envelope the query was created with, server fields appended.
        message: GenericProtocolMessage,
    },
}

impl ReceivedEnvelope {
    /// Decodes a plain protocol envelope.
    pub fn decode_protocol(value: Encoded) -> Result<Self> {
        Ok(Self::Protocol(GenericProtocolMessage::decode(value)?))
    }

    /// Decodes the envelope attached to a dialog response.
    pub fn decode_dialog_response(
        value: Encoded,
        dialog_uuid: Uuid,
        user_response: Option<Encoded>,
    ) -> Result<Self> {
        Ok(Self::DialogResponse {
            message: GenericProtocolMessage::decode(value)?,
            dialog_uuid,
            user_response,
        })
    }

    /// Decodes the envelope attached to a server query, appending the
    /// server-provided fields to its inputs.
    pub fn decode_server_query_response(value: Encoded, server_fields: Vec<Encoded>) -> Result<Self> {
        let mut message = GenericProtocolMessage::decode(value)?;
        message.inputs.extend(server_fields);
        Ok(Self::ServerQueryResponse { message })
    }

    /// The generic message carried by this envelope.
    pub fn message(&self) -> &GenericProtocolMessage {
        match self {
            Self::Protocol(message)
            | Self::DialogResponse { message, .. }
            | Self::ServerQueryResponse { message } => message,
        }
    }

    /// Dialog correlation id, for dialog responses.
    pub fn dialog_uuid(&self) -> Option<Uuid> {
        match self {
            Self::DialogResponse { dialog_uuid, .. } => Some(*dialog_uuid),
            _ => None,
        }
    }

    /// Splits into the generic message and the optional dialog response.
    pub fn into_parts(self) -> (GenericProtocolMessage, Option<Uuid>, Option<Encoded>) {
        match self {
            Self::Protocol(message) | Self::ServerQueryResponse { message } => (message, None, None),
            Self::DialogResponse {
                message,
                dialog_uuid,
                user_response,
            } => (message, Some(dialog_uuid), user_response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GenericProtocolMessage {
        GenericProtocolMessage {
            protocol_id: ProtocolId::ChannelCreationWithContactDevice,
            instance_uid: Uid::generate(),
            message_kind: 2,
            inputs: vec![Encoded::bytes(vec![9; 4]), Encoded::Int(5)],
        }
    }

    #[test]
    fn test_envelope_wire_roundtrip() {
        let message = sample();
        let bytes = message.to_bytes().unwrap();
        assert_eq!(GenericProtocolMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let message = sample();
        let items = message.encode().into_list().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Encoded::Int(1));
        assert_eq!(items[1].as_bytes().unwrap(), message.instance_uid.as_bytes());
        assert_eq!(items[2], Encoded::Int(2));
        assert!(matches!(items[3], Encoded::List(_)));
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        let value = Encoded::list([Encoded::Int(1), Uid::generate().encode(), Encoded::Int(0)]);
        assert!(matches!(
            GenericProtocolMessage::decode(value),
            Err(ProtocolError::WrongArity { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let value = Encoded::list([
            Encoded::Int(99),
            Uid::generate().encode(),
            Encoded::Int(0),
            Encoded::list([]),
        ]);
        assert!(matches!(
            GenericProtocolMessage::decode(value),
            Err(ProtocolError::UnknownProtocol(99))
        ));
    }

    #[test]
    fn test_unknown_message_kind_is_rejected() {
        let value = Encoded::list([
            Encoded::Int(1),
            Uid::generate().encode(),
            Encoded::Int(7),
            Encoded::list([]),
        ]);
        assert!(matches!(
            GenericProtocolMessage::decode(value),
            Err(ProtocolError::UnknownMessageKind { kind: 7, .. })
        ));
    }

    #[test]
    fn test_short_instance_uid_is_rejected() {
        let value = Encoded::list([
            Encoded::Int(1),
            Encoded::bytes(vec![0u8; 8]),
            Encoded::Int(0),
            Encoded::list([]),
        ]);
        assert!(matches!(
            GenericProtocolMessage::decode(value),
            Err(ProtocolError::InvalidUidLength { .. })
        ));
    }

    #[test]
    fn test_inputs_must_be_a_list() {
        let value = Encoded::list([
            Encoded::Int(1),
            Uid::generate().encode(),
            Encoded::Int(0),
            Encoded::Int(0),
        ]);
        assert!(GenericProtocolMessage::decode(value).is_err());
    }

    #[test]
    fn test_server_query_response_appends_fields() {
        let message = sample();
        let envelope = ReceivedEnvelope::decode_server_query_response(
            message.encode(),
            vec![Encoded::Bool(true)],
        )
        .unwrap();
        assert_eq!(envelope.message().inputs.len(), 3);
        assert_eq!(envelope.message().inputs[2], Encoded::Bool(true));
        assert_eq!(envelope.dialog_uuid(), None);
    }

    #[test]
    fn test_dialog_response_keeps_uuid_and_answer() {
        let uuid = Uuid::new_v4();
        let envelope = ReceivedEnvelope::decode_dialog_response(
            sample().encode(),
            uuid,
            Some(Encoded::Bool(false)),
        )
        .unwrap();
        let (message, dialog_uuid, response) = envelope.into_parts();
        assert_eq!(message.inputs.len(), 2);
        assert_eq!(dialog_uuid, Some(uuid));
        assert_eq!(response, Some(Encoded::Bool(false)));
    }

    #[test]
    fn test_protocol_id_raw_values() {
        for id in ProtocolId::ALL {
            assert_eq!(ProtocolId::from_raw(id.raw()).unwrap(), id);
        }
        assert!(ProtocolId::from_raw(-1).is_err());
    }
}
