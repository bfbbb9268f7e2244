//! Dispatch of received messages to protocol steps.
//!
//! One dispatch takes one queued message through:
//!
//! ```text
//! received_messages ──► catalogue ──► instance (or initial state)
//!                                          │
//!                        step_for(state, message) ──► none: held
//!                                          │
//!                          reception channel check ──► mismatch: cancel
//!                                          │
//!                           execute in unit of work ──► commit ──► hooks
//! ```
//!
//! A message row that cannot be read back is dropped, and an instance whose
//! state cannot be read back is aborted, both with an error log.
//!
//! Dispatches of the same instance are serialised by a per-key lock. Step
//! transactions of different instances are serialised by the database write
//! lock, so only their reads and lookups overlap. Busy and stale-version
//! conflicts are retried here, never inside a step.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use protocol::{CryptoIdentity, Uid};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::catalogue::{abort_in, Catalogue, StepContext};
use crate::delegates::Delegates;
use crate::error::{EngineError, Result};
use crate::store::{
    Database, InstanceKey, NewReceivedMessage, ProtocolInstances, ReceivedMessage,
    ReceivedMessageId, ReceivedMessages, UnitOfWork,
};

/// Capacity of the engine event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events published once the change they describe has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A received message is queued and may be dispatched.
    MessageReadyToProcess(ReceivedMessageId),
    /// An instance reached a final state and was deleted.
    InstanceFinished {
        key: InstanceKey,
        state: &'static str,
    },
}

/// What a dispatch did with its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A step ran and the instance moved to `state`.
    Transitioned { state: &'static str, terminal: bool },
    /// No step matches yet; the message stays queued.
    Held,
    /// The message was deleted without running a step.
    Dropped,
    /// The message arrived on the wrong channel; its instance was aborted.
    Cancelled,
    /// The message is no longer queued.
    Missing,
}

impl DispatchOutcome {
    /// Whether the dispatch consumed its message.
    pub fn made_progress(&self) -> bool {
        !matches!(self, DispatchOutcome::Held | DispatchOutcome::Missing)
    }
}

/// Runs received messages through the catalogue.
pub struct Dispatcher {
    database: Database,
    catalogue: Catalogue,
    delegates: Delegates,
    events: broadcast::Sender<EngineEvent>,
    locks: DashMap<InstanceKey, Arc<Mutex<()>>>,
    max_commit_retries: u32,
}

impl Dispatcher {
    pub fn new(
        database: Database,
        catalogue: Catalogue,
        delegates: Delegates,
        max_commit_retries: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            database,
            catalogue,
            delegates,
            events,
            locks: DashMap::new(),
            max_commit_retries: max_commit_retries.max(1),
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    pub fn delegates(&self) -> &Delegates {
        &self.delegates
    }

    /// Returns a receiver for engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Queues a received message and announces it once committed.
    pub fn enqueue(&self, new: &NewReceivedMessage) -> Result<ReceivedMessageId> {
        let mut conn = self.database.connect()?;
        let mut uow = UnitOfWork::begin(&mut conn)?;
        let id = ReceivedMessages::insert(uow.conn(), new)?;
        let events = self.events.clone();
        uow.on_commit(move || {
            let _ = events.send(EngineEvent::MessageReadyToProcess(id));
        });
        uow.commit()?;
        debug!(
            message_id = %id,
            protocol_id = %new.message.protocol_id,
            instance_uid = %new.message.instance_uid,
            message_kind = new.message.message_kind,
            reception = new.reception.kind_name(),
            "Queued received message"
        );
        Ok(id)
    }

    /// Dispatches one queued message.
    ///
    /// Errors leave the message queued. Commit conflicts are retried up to
    /// the configured number of attempts first.
    pub fn process(&self, id: ReceivedMessageId) -> Result<DispatchOutcome> {
        let key = match self.instance_key_of(id) {
            Ok(Some(key)) => key,
            Ok(None) => return Ok(DispatchOutcome::Missing),
            Err(err) if err.is_corrupt_data() => {
                let mut conn = self.database.connect()?;
                return discard_message(UnitOfWork::begin(&mut conn)?, id, &err);
            }
            Err(err) => return Err(err),
        };

        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.process_with_retries(id)
        };
        drop(lock);
        self.locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }

    /// Deletes an instance and every message queued for it.
    pub fn abort_protocol(&self, owned: &CryptoIdentity, instance_uid: &Uid) -> Result<()> {
        let mut conn = self.database.connect()?;
        let uow = UnitOfWork::begin(&mut conn)?;
        abort_in(&uow, owned, instance_uid)?;
        uow.commit()
    }

    fn instance_key_of(&self, id: ReceivedMessageId) -> Result<Option<InstanceKey>> {
        let conn = self.database.connect()?;
        Ok(ReceivedMessages::get(&conn, id)?.map(|received| instance_key(&received)))
    }

    fn process_with_retries(&self, id: ReceivedMessageId) -> Result<DispatchOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_process(id) {
                Err(err) if err.is_retryable() && attempt < self.max_commit_retries => {
                    warn!(message_id = %id, attempt, %err, "Commit conflict, retrying dispatch");
                }
                Err(err) => {
                    warn!(message_id = %id, attempt, %err, "Dispatch failed, message stays queued");
                    return Err(err);
                }
                outcome => return outcome,
            }
        }
    }

    fn try_process(&self, id: ReceivedMessageId) -> Result<DispatchOutcome> {
        let mut conn = self.database.connect()?;
        let mut uow = UnitOfWork::begin(&mut conn)?;

        let received = match ReceivedMessages::get(uow.conn(), id) {
            Ok(Some(received)) => received,
            Ok(None) => return Ok(DispatchOutcome::Missing),
            Err(err) if err.is_corrupt_data() => return discard_message(uow, id, &err),
            Err(err) => return Err(err),
        };
        let key = instance_key(&received);
        let message_kind = received.message.message_kind;

        let Some(protocol) = self.catalogue.get(key.protocol_id) else {
            warn!(
                message_id = %id,
                protocol_id = %key.protocol_id,
                "No concrete protocol registered, dropping message"
            );
            return drop_message(uow, id);
        };

        let record = match ProtocolInstances::get(uow.conn(), &key) {
            Ok(record) => record,
            Err(err) if err.is_corrupt_data() => return discard_instance(uow, id, &key, &err),
            Err(err) => return Err(err),
        };
        let (state, version) = match record {
            Some(record) => (record.state, Some(record.version)),
            None if protocol.is_instance_creating(message_kind) => (protocol.initial_state(), None),
            None => {
                debug!(
                    message_id = %id,
                    protocol_id = %key.protocol_id,
                    instance_uid = %key.instance_uid,
                    message_kind,
                    "No instance for message yet, holding"
                );
                return Ok(DispatchOutcome::Held);
            }
        };

        let step = match protocol.step_for(&state, &received) {
            Ok(Some(step)) => step,
            Ok(None) if received.dialog_uuid.is_some() => {
                debug!(message_id = %id, "Dialog response matches no step, dropping");
                return drop_message(uow, id);
            }
            Ok(None) => {
                debug!(
                    message_id = %id,
                    instance_uid = %key.instance_uid,
                    message_kind,
                    state = protocol.state_name(&state),
                    "No step for message in current state, holding"
                );
                return Ok(DispatchOutcome::Held);
            }
            Err(EngineError::Protocol(err)) => {
                warn!(
                    message_id = %id,
                    instance_uid = %key.instance_uid,
                    message_kind,
                    %err,
                    "Undecodable message inputs, dropping"
                );
                return drop_message(uow, id);
            }
            Err(err) if err.is_corrupt_data() => return discard_instance(uow, id, &key, &err),
            Err(err) => return Err(err),
        };

        let step_name = step.name();
        if step.expected_reception_channel() != received.reception {
            info!(
                message_id = %id,
                instance_uid = %key.instance_uid,
                step = step_name,
                reception = received.reception.kind_name(),
                "Message received on an unexpected channel, cancelling instance"
            );
            abort_in(&uow, &key.owned_identity, &key.instance_uid)?;
            ReceivedMessages::delete(uow.conn(), id)?;
            uow.commit()?;
            return Ok(DispatchOutcome::Cancelled);
        }

        let next = {
            let mut ctx = StepContext {
                owned_identity: key.owned_identity,
                protocol_id: key.protocol_id,
                instance_uid: key.instance_uid,
                uow: &mut uow,
                delegates: &self.delegates,
            };
            step.execute(&mut ctx)?
        };
        let state_name = protocol.state_name(&next);
        let terminal = protocol.is_final_state(&next);

        if terminal {
            ProtocolInstances::delete(uow.conn(), &key)?;
            ReceivedMessages::delete_for_instance(uow.conn(), &key.owned_identity, &key.instance_uid)?;
            let events = self.events.clone();
            uow.on_commit(move || {
                let _ = events.send(EngineEvent::InstanceFinished {
                    key,
                    state: state_name,
                });
            });
        } else {
            match version {
                Some(version) => ProtocolInstances::update(uow.conn(), &key, &next, version)?,
                None => ProtocolInstances::insert(uow.conn(), &key, &next)?,
            }
            ReceivedMessages::delete(uow.conn(), id)?;
            let held =
                ReceivedMessages::ids_for_instance(uow.conn(), &key.owned_identity, &key.instance_uid)?;
            if !held.is_empty() {
                let events = self.events.clone();
                uow.on_commit(move || {
                    for id in held {
                        let _ = events.send(EngineEvent::MessageReadyToProcess(id));
                    }
                });
            }
        }

        uow.commit()?;
        debug!(
            message_id = %id,
            protocol_id = %key.protocol_id,
            instance_uid = %key.instance_uid,
            step = step_name,
            state = state_name,
            terminal,
            "Step executed"
        );
        Ok(DispatchOutcome::Transitioned {
            state: state_name,
            terminal,
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("database", &self.database)
            .field("catalogue", &self.catalogue)
            .field("max_commit_retries", &self.max_commit_retries)
            .finish_non_exhaustive()
    }
}

fn instance_key(received: &ReceivedMessage) -> InstanceKey {
    InstanceKey {
        owned_identity: received.owned_identity,
        protocol_id: received.message.protocol_id,
        instance_uid: received.message.instance_uid,
    }
}

fn drop_message(uow: UnitOfWork<'_>, id: ReceivedMessageId) -> Result<DispatchOutcome> {
    ReceivedMessages::delete(uow.conn(), id)?;
    uow.commit()?;
    Ok(DispatchOutcome::Dropped)
}

fn discard_message(
    uow: UnitOfWork<'_>,
    id: ReceivedMessageId,
    err: &EngineError,
) -> Result<DispatchOutcome> {
    error!(message_id = %id, %err, "Unreadable received message, dropping");
    drop_message(uow, id)
}

fn discard_instance(
    uow: UnitOfWork<'_>,
    id: ReceivedMessageId,
    key: &InstanceKey,
    err: &EngineError,
) -> Result<DispatchOutcome> {
    error!(
        message_id = %id,
        protocol_id = %key.protocol_id,
        instance_uid = %key.instance_uid,
        %err,
        "Unreadable protocol instance, aborting it and dropping message"
    );
    abort_in(&uow, &key.owned_identity, &key.instance_uid)?;
    drop_message(uow, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{ConcreteProtocol, ProtocolStep};
    use crate::delegates::{ChannelDelegate, IdentityDelegate, KeyringChallengeSolver};
    use crate::store::StateRecord;
    use protocol::{
        Encoded, GenericProtocolMessage, MessageToSend, OwnedCryptoIdentity, ProtocolId,
        ReceptionChannelInfo, Seed,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Counter protocol: kind 0 starts at 1, kind 1 increments, reaching 3 ends.
    /// States above 3 are unknown.
    struct Counter;

    struct Increment {
        from: u32,
        fail: bool,
    }

    impl ProtocolStep for Increment {
        fn name(&self) -> &'static str {
            "Increment"
        }

        fn expected_reception_channel(&self) -> ReceptionChannelInfo {
            ReceptionChannelInfo::Local
        }

        fn execute(self: Box<Self>, _ctx: &mut StepContext<'_, '_>) -> Result<StateRecord> {
            if self.fail {
                return Err(EngineError::delegate("transport down"));
            }
            Ok(StateRecord::bare(self.from + 1))
        }
    }

    impl ConcreteProtocol for Counter {
        fn id(&self) -> ProtocolId {
            ProtocolId::DeviceCapabilitiesDiscovery
        }

        fn initial_state(&self) -> StateRecord {
            StateRecord::bare(0)
        }

        fn is_instance_creating(&self, message_kind: i64) -> bool {
            message_kind == 0
        }

        fn is_final_state(&self, state: &StateRecord) -> bool {
            state.kind >= 3
        }

        fn state_name(&self, state: &StateRecord) -> &'static str {
            match state.kind {
                0 => "Zero",
                1 => "One",
                2 => "Two",
                _ => "Done",
            }
        }

        fn step_for(
            &self,
            state: &StateRecord,
            message: &ReceivedMessage,
        ) -> Result<Option<Box<dyn ProtocolStep>>> {
            let fail = match message.message.inputs.first() {
                Some(Encoded::Bool(fail)) => *fail,
                Some(_) => return Err(protocol::ProtocolError::WrongArity { expected: 1, got: 0 }.into()),
                None => false,
            };
            if state.kind > 3 {
                return Err(EngineError::UnknownState {
                    protocol: self.id(),
                    kind: state.kind,
                });
            }
            let matches = match message.message.message_kind {
                0 => state.kind == 0,
                1 => state.kind >= 1,
                _ => false,
            };
            Ok(matches.then(|| {
                Box::new(Increment {
                    from: state.kind,
                    fail,
                }) as Box<dyn ProtocolStep>
            }))
        }
    }

    struct Unused;

    impl IdentityDelegate for Unused {
        fn is_contact_of(&self, _: &UnitOfWork<'_>, _: &CryptoIdentity, _: &CryptoIdentity) -> Result<bool> {
            Ok(false)
        }
        fn is_contact_active(&self, _: &UnitOfWork<'_>, _: &CryptoIdentity, _: &CryptoIdentity) -> Result<bool> {
            Ok(false)
        }
        fn current_device_uid(&self, _: &UnitOfWork<'_>, _: &CryptoIdentity) -> Result<Uid> {
            Ok(Uid::from_bytes([0; 32]))
        }
        fn add_device_for_contact(
            &self,
            _: &mut UnitOfWork<'_>,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
            _: &Uid,
        ) -> Result<()> {
            Ok(())
        }
        fn published_details_of_owned(&self, _: &UnitOfWork<'_>, _: &CryptoIdentity) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn update_published_details_of_contact(
            &self,
            _: &mut UnitOfWork<'_>,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
            _: &[u8],
        ) -> Result<()> {
            Ok(())
        }
    }

    impl ChannelDelegate for Unused {
        fn post(&self, _: &mut UnitOfWork<'_>, _: MessageToSend) -> Result<Uid> {
            Ok(Uid::generate())
        }
        fn create_oblivious_channel(
            &self,
            _: &mut UnitOfWork<'_>,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
            _: &Uid,
            _: &Seed,
            _: u32,
        ) -> Result<()> {
            Ok(())
        }
        fn confirm_oblivious_channel(
            &self,
            _: &mut UnitOfWork<'_>,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
            _: &Uid,
        ) -> Result<()> {
            Ok(())
        }
        fn delete_oblivious_channel(
            &self,
            _: &mut UnitOfWork<'_>,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
            _: &Uid,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        dispatcher: Dispatcher,
        owned: CryptoIdentity,
        instance_uid: Uid,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let database = Database::open(dir.path().join("engine.sqlite"), Duration::from_secs(1)).unwrap();
        let mut catalogue = Catalogue::empty();
        catalogue.register(Arc::new(Counter));
        let delegates = Delegates {
            identity: Arc::new(Unused),
            channel: Arc::new(Unused),
            challenges: Arc::new(KeyringChallengeSolver::new()),
        };
        Fixture {
            _dir: dir,
            dispatcher: Dispatcher::new(database, catalogue, delegates, 3),
            owned: *OwnedCryptoIdentity::generate().identity(),
            instance_uid: Uid::generate(),
        }
    }

    impl Fixture {
        fn receive(&self, kind: i64, inputs: Vec<Encoded>, reception: ReceptionChannelInfo) -> ReceivedMessageId {
            self.receive_for(ProtocolId::DeviceCapabilitiesDiscovery, kind, inputs, reception)
        }

        fn receive_for(
            &self,
            protocol_id: ProtocolId,
            kind: i64,
            inputs: Vec<Encoded>,
            reception: ReceptionChannelInfo,
        ) -> ReceivedMessageId {
            self.dispatcher
                .enqueue(&NewReceivedMessage {
                    owned_identity: self.owned,
                    message: GenericProtocolMessage {
                        protocol_id,
                        instance_uid: self.instance_uid,
                        message_kind: kind,
                        inputs,
                    },
                    reception,
                    dialog_uuid: None,
                    user_response: None,
                })
                .unwrap()
        }

        fn key(&self) -> InstanceKey {
            InstanceKey {
                owned_identity: self.owned,
                protocol_id: ProtocolId::DeviceCapabilitiesDiscovery,
                instance_uid: self.instance_uid,
            }
        }

        fn state_kind(&self) -> Option<u32> {
            let conn = self.dispatcher.database().connect().unwrap();
            ProtocolInstances::get(&conn, &self.key())
                .unwrap()
                .map(|record| record.state.kind)
        }

        fn corrupt(&self, sql: &str) {
            let conn = self.dispatcher.database().connect().unwrap();
            assert!(conn.execute(sql, []).unwrap() > 0);
        }

        fn pending(&self) -> Vec<ReceivedMessageId> {
            let conn = self.dispatcher.database().connect().unwrap();
            ReceivedMessages::pending_ids(&conn).unwrap()
        }
    }

    #[test]
    fn test_creating_message_starts_instance() {
        let f = fixture();
        let id = f.receive(0, vec![], ReceptionChannelInfo::Local);

        let outcome = f.dispatcher.process(id).unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Transitioned {
                state: "One",
                terminal: false
            }
        );
        assert_eq!(f.state_kind(), Some(1));
        assert!(f.pending().is_empty());
        assert_eq!(f.dispatcher.process(id).unwrap(), DispatchOutcome::Missing);
    }

    #[test]
    fn test_message_without_instance_is_held_then_reannounced() {
        let f = fixture();
        let mut events = f.dispatcher.subscribe();
        let early = f.receive(1, vec![], ReceptionChannelInfo::Local);
        assert_eq!(f.dispatcher.process(early).unwrap(), DispatchOutcome::Held);
        assert_eq!(f.pending(), vec![early]);
        assert_eq!(f.state_kind(), None);

        let start = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(start).unwrap();

        let mut announced = Vec::new();
        while let Ok(event) = events.try_recv() {
            announced.push(event);
        }
        assert_eq!(
            announced,
            vec![
                EngineEvent::MessageReadyToProcess(early),
                EngineEvent::MessageReadyToProcess(start),
                EngineEvent::MessageReadyToProcess(early),
            ]
        );
        assert_eq!(
            f.dispatcher.process(early).unwrap(),
            DispatchOutcome::Transitioned {
                state: "Two",
                terminal: false
            }
        );
    }

    #[test]
    fn test_final_state_deletes_instance_and_its_messages() {
        let f = fixture();
        let mut events = f.dispatcher.subscribe();
        let start = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(start).unwrap();
        let second = f.receive(1, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(second).unwrap();
        let third = f.receive(1, vec![], ReceptionChannelInfo::Local);
        let straggler = f.receive(2, vec![], ReceptionChannelInfo::Local);

        assert_eq!(
            f.dispatcher.process(third).unwrap(),
            DispatchOutcome::Transitioned {
                state: "Done",
                terminal: true
            }
        );
        assert_eq!(f.state_kind(), None);
        assert!(f.pending().is_empty());
        assert_eq!(f.dispatcher.process(straggler).unwrap(), DispatchOutcome::Missing);

        let finished = std::iter::from_fn(|| events.try_recv().ok())
            .find(|event| matches!(event, EngineEvent::InstanceFinished { .. }));
        assert_eq!(
            finished,
            Some(EngineEvent::InstanceFinished {
                key: f.key(),
                state: "Done"
            })
        );
    }

    #[test]
    fn test_wrong_reception_channel_cancels_instance() {
        let f = fixture();
        let start = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(start).unwrap();
        let held = f.receive(2, vec![], ReceptionChannelInfo::Local);

        let forged = f.receive(1, vec![], ReceptionChannelInfo::AsymmetricChannel);
        assert_eq!(f.dispatcher.process(forged).unwrap(), DispatchOutcome::Cancelled);
        assert_eq!(f.state_kind(), None);
        assert!(!f.pending().contains(&held));
    }

    #[test]
    fn test_step_error_rolls_back_and_keeps_message() {
        let f = fixture();
        let start = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(start).unwrap();

        let failing = f.receive(1, vec![Encoded::Bool(true)], ReceptionChannelInfo::Local);
        assert!(matches!(
            f.dispatcher.process(failing),
            Err(EngineError::Delegate(_))
        ));
        assert_eq!(f.state_kind(), Some(1));
        assert_eq!(f.pending(), vec![failing]);
    }

    #[test]
    fn test_undecodable_inputs_are_dropped() {
        let f = fixture();
        let id = f.receive(0, vec![Encoded::Int(1)], ReceptionChannelInfo::Local);
        assert_eq!(f.dispatcher.process(id).unwrap(), DispatchOutcome::Dropped);
        assert!(f.pending().is_empty());
        assert_eq!(f.state_kind(), None);
    }

    #[test]
    fn test_unreadable_message_row_is_dropped() {
        let f = fixture();
        let id = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.corrupt("UPDATE received_messages SET reception_channel = X'C1'");

        assert_eq!(f.dispatcher.process(id).unwrap(), DispatchOutcome::Dropped);
        assert!(f.pending().is_empty());
        assert_eq!(f.state_kind(), None);
    }

    #[test]
    fn test_unreadable_instance_row_aborts_instance() {
        let f = fixture();
        let start = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(start).unwrap();
        let held = f.receive(2, vec![], ReceptionChannelInfo::Local);
        assert_eq!(f.dispatcher.process(held).unwrap(), DispatchOutcome::Held);
        f.corrupt("UPDATE protocol_instances SET state_kind = 'broken'");

        let next = f.receive(1, vec![], ReceptionChannelInfo::Local);
        assert_eq!(f.dispatcher.process(next).unwrap(), DispatchOutcome::Dropped);
        assert_eq!(f.state_kind(), None);
        assert!(f.pending().is_empty());
    }

    #[test]
    fn test_unknown_state_aborts_instance() {
        let f = fixture();
        let start = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(start).unwrap();
        f.corrupt("UPDATE protocol_instances SET state_kind = 42");

        let next = f.receive(1, vec![], ReceptionChannelInfo::Local);
        assert_eq!(f.dispatcher.process(next).unwrap(), DispatchOutcome::Dropped);
        assert_eq!(f.state_kind(), None);
        assert!(f.pending().is_empty());
    }

    #[test]
    fn test_unregistered_protocol_is_dropped() {
        let f = fixture();
        let id = f.receive_for(
            ProtocolId::OneToOneContactInvitation,
            8,
            vec![],
            ReceptionChannelInfo::Local,
        );
        assert_eq!(f.dispatcher.process(id).unwrap(), DispatchOutcome::Dropped);
        assert!(f.pending().is_empty());
    }

    #[test]
    fn test_abort_protocol() {
        let f = fixture();
        let start = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(start).unwrap();
        f.receive(2, vec![], ReceptionChannelInfo::Local);

        f.dispatcher.abort_protocol(&f.owned, &f.instance_uid).unwrap();

        assert_eq!(f.state_kind(), None);
        assert!(f.pending().is_empty());
    }

    #[test]
    fn test_concurrent_dispatches_of_one_instance_are_serialised() {
        let f = fixture();
        let start = f.receive(0, vec![], ReceptionChannelInfo::Local);
        f.dispatcher.process(start).unwrap();
        let ids: Vec<_> = (0..2)
            .map(|_| f.receive(1, vec![], ReceptionChannelInfo::Local))
            .collect();

        let transitions = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for id in &ids {
                let dispatcher = &f.dispatcher;
                let transitions = &transitions;
                scope.spawn(move || {
                    if let Ok(DispatchOutcome::Transitioned { .. }) = dispatcher.process(*id) {
                        transitions.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(transitions.load(Ordering::SeqCst), 2);
        assert_eq!(f.state_kind(), None);
        assert!(f.dispatcher.locks.is_empty());
    }
}
