//! Registry of concrete protocols and the step contract.
//!
//! A concrete protocol resolves `(state kind, message kind)` to a step through
//! a static table of constructors. No match is the normal outcome for a
//! message that arrives before its instance reaches the expected state.

use std::collections::HashMap;
use std::sync::Arc;

use protocol::{
    CoreProtocolMessage, CryptoIdentity, MessageToSend, ProtocolId, ReceptionChannelInfo,
    SendChannel, Uid,
};
use tracing::{debug, error};

use crate::delegates::Delegates;
use crate::error::{EngineError, Result};
use crate::protocols::channel_creation::ChannelCreationProtocol;
use crate::store::{ProtocolInstances, ReceivedMessage, ReceivedMessages, StateRecord, UnitOfWork};

/// A protocol the engine can run.
pub trait ConcreteProtocol: Send + Sync {
    fn id(&self) -> ProtocolId;

    /// State of an instance that does not exist yet.
    fn initial_state(&self) -> StateRecord;

    /// Whether a message of this kind may start a new instance.
    fn is_instance_creating(&self, message_kind: i64) -> bool;

    /// Final states end the instance: it is deleted with its queued messages.
    fn is_final_state(&self, state: &StateRecord) -> bool;

    fn state_name(&self, state: &StateRecord) -> &'static str;

    /// Resolves the step for a message in a state.
    ///
    /// `Ok(None)` means the message does not fit the current state. A
    /// [`EngineError::Protocol`] error means the message inputs do not decode.
    fn step_for(
        &self,
        state: &StateRecord,
        message: &ReceivedMessage,
    ) -> Result<Option<Box<dyn ProtocolStep>>>;
}

/// One transition of a protocol instance.
pub trait ProtocolStep: Send {
    fn name(&self) -> &'static str;

    /// The only reception channel this step accepts its message from.
    fn expected_reception_channel(&self) -> ReceptionChannelInfo;

    /// Runs the step and returns the next state.
    ///
    /// Protocol violations yield a cancelled state. Errors roll the whole
    /// dispatch back and leave the message queued.
    fn execute(self: Box<Self>, ctx: &mut StepContext<'_, '_>) -> Result<StateRecord>;
}

/// Builds a step from a stored state and a received message.
pub type StepConstructor = fn(&StateRecord, &ReceivedMessage) -> Result<Box<dyn ProtocolStep>>;

/// One row of a protocol's static step table.
pub struct StepEntry {
    pub state_kind: u32,
    pub message_kind: i64,
    pub build: StepConstructor,
}

/// Looks the constructor for `(state_kind, message_kind)` up in a step table.
pub fn lookup_step(table: &[StepEntry], state_kind: u32, message_kind: i64) -> Option<StepConstructor> {
    table
        .iter()
        .find(|entry| entry.state_kind == state_kind && entry.message_kind == message_kind)
        .map(|entry| entry.build)
}

/// Everything a step may touch while it runs.
pub struct StepContext<'a, 'conn> {
    pub owned_identity: CryptoIdentity,
    pub protocol_id: ProtocolId,
    pub instance_uid: Uid,
    pub uow: &'a mut UnitOfWork<'conn>,
    pub delegates: &'a Delegates,
}

impl<'a, 'conn> StepContext<'a, 'conn> {
    /// Read access to the unit of work.
    pub fn uow(&self) -> &UnitOfWork<'conn> {
        &*self.uow
    }

    /// Addressing for a message of this instance on `channel`.
    pub fn core_message(&self, channel: SendChannel) -> CoreProtocolMessage {
        CoreProtocolMessage::new(channel, self.protocol_id, self.instance_uid)
    }

    /// Posts a message built by `generate_*_to_send`.
    ///
    /// `None` means the message was built for an incompatible channel, which
    /// is a bug in the calling step.
    pub fn post(&mut self, message: Option<MessageToSend>) -> Result<Uid> {
        let Some(message) = message else {
            error!(
                protocol_id = %self.protocol_id,
                instance_uid = %self.instance_uid,
                "Step built a message for an incompatible channel"
            );
            return Err(EngineError::invariant(
                "message generated for an incompatible channel",
            ));
        };
        self.delegates.channel.post(&mut *self.uow, message)
    }

    /// Deletes another instance of this owned identity and its queued messages.
    pub fn abort_protocol(&mut self, instance_uid: &Uid) -> Result<()> {
        abort_in(self.uow, &self.owned_identity, instance_uid)
    }
}

/// Deletes every instance with this uid and the messages queued for it.
pub(crate) fn abort_in(uow: &UnitOfWork<'_>, owned: &CryptoIdentity, instance_uid: &Uid) -> Result<()> {
    let instances = ProtocolInstances::delete_by_uid(uow.conn(), owned, instance_uid)?;
    let messages = ReceivedMessages::delete_for_instance(uow.conn(), owned, instance_uid)?;
    debug!(
        instance_uid = %instance_uid,
        instances,
        messages,
        "Aborted protocol instance"
    );
    Ok(())
}

/// The protocols this engine runs, by identifier.
#[derive(Clone, Default)]
pub struct Catalogue {
    protocols: HashMap<ProtocolId, Arc<dyn ConcreteProtocol>>,
}

impl Catalogue {
    /// A catalogue with no protocol.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The protocols implemented by this crate.
    pub fn standard() -> Self {
        let mut catalogue = Self::empty();
        catalogue.register(Arc::new(ChannelCreationProtocol));
        catalogue
    }

    /// Registers a protocol, replacing any previous one with the same id.
    pub fn register(&mut self, protocol: Arc<dyn ConcreteProtocol>) {
        self.protocols.insert(protocol.id(), protocol);
    }

    pub fn get(&self, id: ProtocolId) -> Option<&dyn ConcreteProtocol> {
        self.protocols.get(&id).map(|p| p.as_ref())
    }

    pub fn contains(&self, id: ProtocolId) -> bool {
        self.protocols.contains_key(&id)
    }
}

impl std::fmt::Debug for Catalogue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.protocols.keys().collect();
        ids.sort();
        f.debug_struct("Catalogue").field("protocols", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: &StateRecord, _: &ReceivedMessage) -> Result<Box<dyn ProtocolStep>> {
        Err(EngineError::invariant("not built in tests"))
    }

    #[test]
    fn test_lookup_step_matches_both_kinds() {
        let table = [
            StepEntry {
                state_kind: 0,
                message_kind: 1,
                build: never,
            },
            StepEntry {
                state_kind: 2,
                message_kind: 3,
                build: never,
            },
        ];
        assert!(lookup_step(&table, 0, 1).is_some());
        assert!(lookup_step(&table, 2, 3).is_some());
        assert!(lookup_step(&table, 0, 3).is_none());
        assert!(lookup_step(&table, 2, 1).is_none());
    }

    #[test]
    fn test_standard_catalogue() {
        let catalogue = Catalogue::standard();
        assert!(catalogue.contains(ProtocolId::ChannelCreationWithContactDevice));
        assert!(!catalogue.contains(ProtocolId::DeviceDiscoveryForContactIdentity));
        let protocol = catalogue
            .get(ProtocolId::ChannelCreationWithContactDevice)
            .unwrap();
        assert_eq!(protocol.id(), ProtocolId::ChannelCreationWithContactDevice);
        assert!(Catalogue::empty()
            .get(ProtocolId::ChannelCreationWithContactDevice)
            .is_none());
    }
}
