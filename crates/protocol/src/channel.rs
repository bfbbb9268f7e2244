//! Channel descriptors for outgoing and incoming protocol messages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::CryptoIdentity;
use crate::encoded::Encoded;
use crate::envelope::{GenericProtocolMessage, ProtocolId};
use crate::uid::Uid;

/// How an outgoing message must be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendChannel {
    /// Authenticated, ratcheted channel with specific remote devices.
    ObliviousChannel {
        to: CryptoIdentity,
        remote_device_uids: Vec<Uid>,
        from: CryptoIdentity,
        /// Refuse to send over a channel that is not confirmed yet.
        necessarily_confirmed: bool,
    },
    /// Unauthenticated channel with specific remote devices.
    AsymmetricChannel {
        to: CryptoIdentity,
        remote_device_uids: Vec<Uid>,
        from: CryptoIdentity,
    },
    /// Unauthenticated broadcast to every device of a remote identity.
    AsymmetricBroadcast {
        to: CryptoIdentity,
        from: CryptoIdentity,
    },
    /// Loopback to the engine of this device.
    Local { owned: CryptoIdentity },
    /// A dialog shown to the user of this device.
    UserInterface { uuid: Uuid, owned: CryptoIdentity },
    /// A query to the server.
    ServerQuery { owned: CryptoIdentity },
}

impl SendChannel {
    /// Identity on whose behalf the message is sent.
    pub fn owned_identity(&self) -> &CryptoIdentity {
        match self {
            SendChannel::ObliviousChannel { from, .. }
            | SendChannel::AsymmetricChannel { from, .. }
            | SendChannel::AsymmetricBroadcast { from, .. } => from,
            SendChannel::Local { owned }
            | SendChannel::UserInterface { owned, .. }
            | SendChannel::ServerQuery { owned } => owned,
        }
    }

    /// Short name for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SendChannel::ObliviousChannel { .. } => "oblivious",
            SendChannel::AsymmetricChannel { .. } => "asymmetric",
            SendChannel::AsymmetricBroadcast { .. } => "asymmetric-broadcast",
            SendChannel::Local { .. } => "local",
            SendChannel::UserInterface { .. } => "user-interface",
            SendChannel::ServerQuery { .. } => "server-query",
        }
    }
}

/// How an inbound message arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionChannelInfo {
    /// Loopback from this device.
    Local,
    /// Unauthenticated channel; the sender is not proven.
    AsymmetricChannel,
    /// Authenticated channel with a known remote device.
    ObliviousChannel {
        remote_identity: CryptoIdentity,
        remote_device_uid: Uid,
    },
}

impl ReceptionChannelInfo {
    /// Short name for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ReceptionChannelInfo::Local => "local",
            ReceptionChannelInfo::AsymmetricChannel => "asymmetric",
            ReceptionChannelInfo::ObliviousChannel { .. } => "oblivious",
        }
    }
}

/// Protocol message ready to be posted on an oblivious, asymmetric or local channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessageToSend {
    pub channel: SendChannel,
    pub envelope: GenericProtocolMessage,
}

/// Dialog to display, carrying the envelope its response must come back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogMessageToSend {
    pub uuid: Uuid,
    pub owned: CryptoIdentity,
    pub dialog: Encoded,
    pub envelope: GenericProtocolMessage,
}

/// Server query, carrying the envelope its response must come back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerQueryToSend {
    pub owned: CryptoIdentity,
    pub query: Encoded,
    pub envelope: GenericProtocolMessage,
}

/// A message handed to the channel abstraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageToSend {
    Protocol(ProtocolMessageToSend),
    Dialog(DialogMessageToSend),
    ServerQuery(ServerQueryToSend),
}

impl MessageToSend {
    /// The envelope carried by this message.
    pub fn envelope(&self) -> &GenericProtocolMessage {
        match self {
            MessageToSend::Protocol(m) => &m.envelope,
            MessageToSend::Dialog(m) => &m.envelope,
            MessageToSend::ServerQuery(m) => &m.envelope,
        }
    }
}

/// Addressing shared by every concrete message a protocol step emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreProtocolMessage {
    pub channel: SendChannel,
    pub protocol_id: ProtocolId,
    pub instance_uid: Uid,
}

impl CoreProtocolMessage {
    pub fn new(channel: SendChannel, protocol_id: ProtocolId, instance_uid: Uid) -> Self {
        Self {
            channel,
            protocol_id,
            instance_uid,
        }
    }

    fn envelope(&self, message_kind: i64, inputs: Vec<Encoded>) -> GenericProtocolMessage {
        GenericProtocolMessage {
            protocol_id: self.protocol_id,
            instance_uid: self.instance_uid,
            message_kind,
            inputs,
        }
    }

    /// Builds a plain protocol message.
    ///
    /// Returns `None` when the channel has dialog or server-query semantics;
    /// callers must treat that as a logic error.
    pub fn generate_message_to_send(
        &self,
        message_kind: i64,
        inputs: Vec<Encoded>,
    ) -> Option<MessageToSend> {
        match &self.channel {
            SendChannel::ObliviousChannel { .. }
            | SendChannel::AsymmetricChannel { .. }
            | SendChannel::AsymmetricBroadcast { .. }
            | SendChannel::Local { .. } => Some(MessageToSend::Protocol(ProtocolMessageToSend {
                channel: self.channel.clone(),
                envelope: self.envelope(message_kind, inputs),
            })),
            SendChannel::UserInterface { .. } | SendChannel::ServerQuery { .. } => None,
        }
    }

    /// Builds a dialog. Returns `None` unless the channel is a user interface.
    pub fn generate_dialog_to_send(
        &self,
        message_kind: i64,
        inputs: Vec<Encoded>,
        dialog: Encoded,
    ) -> Option<MessageToSend> {
        match &self.channel {
            SendChannel::UserInterface { uuid, owned } => {
                Some(MessageToSend::Dialog(DialogMessageToSend {
                    uuid: *uuid,
                    owned: *owned,
                    dialog,
                    envelope: self.envelope(message_kind, inputs),
                }))
            }
            _ => None,
        }
    }

    /// Builds a server query. Returns `None` unless the channel is a server query.
    pub fn generate_server_query_to_send(
        &self,
        message_kind: i64,
        inputs: Vec<Encoded>,
        query: Encoded,
    ) -> Option<MessageToSend> {
        match &self.channel {
            SendChannel::ServerQuery { owned } => Some(MessageToSend::ServerQuery(ServerQueryToSend {
                owned: *owned,
                query,
                envelope: self.envelope(message_kind, inputs),
            })),
            _ => None,
        }
    }
}
