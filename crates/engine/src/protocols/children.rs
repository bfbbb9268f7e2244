//! Initial messages of the protocols started once a channel exists.
//!
//! Each child runs as its own instance with a fresh uid and is delivered over
//! the local channel, so the engine dispatches it like any other message.

use protocol::{
    CoreProtocolMessage, CryptoIdentity, Encode, Encoded, MessageToSend, ProtocolId, SendChannel,
    Uid,
};

/// `Initial` of the device discovery protocol.
pub const DEVICE_DISCOVERY_INITIAL: i64 = 0;

/// `InitialSingleContactDevice` of the capabilities discovery protocol.
pub const CAPABILITIES_INITIAL_SINGLE_CONTACT_DEVICE: i64 = 1;

/// `InitialOneToOneStatusSyncRequest` of the one-to-one invitation protocol.
pub const ONE_TO_ONE_STATUS_SYNC_REQUEST: i64 = 8;

fn local_core(owned: &CryptoIdentity, protocol_id: ProtocolId) -> CoreProtocolMessage {
    CoreProtocolMessage::new(
        SendChannel::Local { owned: *owned },
        protocol_id,
        Uid::generate(),
    )
}

/// Discovers the devices of `contact`.
pub fn device_discovery(owned: &CryptoIdentity, contact: &CryptoIdentity) -> Option<MessageToSend> {
    local_core(owned, ProtocolId::DeviceDiscoveryForContactIdentity)
        .generate_message_to_send(DEVICE_DISCOVERY_INITIAL, vec![contact.encode()])
}

/// Exchanges capabilities with one contact device.
pub fn capabilities_discovery(
    owned: &CryptoIdentity,
    contact: &CryptoIdentity,
    contact_device_uid: &Uid,
) -> Option<MessageToSend> {
    local_core(owned, ProtocolId::DeviceCapabilitiesDiscovery).generate_message_to_send(
        CAPABILITIES_INITIAL_SINGLE_CONTACT_DEVICE,
        vec![
            contact.encode(),
            contact_device_uid.encode(),
            Encoded::Bool(false),
        ],
    )
}

/// Asks the one-to-one status of `contacts` to be synchronised.
pub fn one_to_one_status_sync(
    owned: &CryptoIdentity,
    contacts: &[CryptoIdentity],
) -> Option<MessageToSend> {
    local_core(owned, ProtocolId::OneToOneContactInvitation).generate_message_to_send(
        ONE_TO_ONE_STATUS_SYNC_REQUEST,
        vec![Encoded::list(contacts.iter().map(|contact| contact.encode()))],
    )
}
