//! Engine facade: reception, dispatch and housekeeping entry points.

use std::sync::Arc;
use std::time::Duration;

use protocol::{
    CryptoIdentity, GenericProtocolMessage, ReceivedEnvelope, ReceptionChannelInfo, Uid,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::catalogue::Catalogue;
use crate::config::Config;
use crate::delegates::Delegates;
use crate::dispatcher::{DispatchOutcome, Dispatcher, EngineEvent};
use crate::error::{EngineError, Result};
use crate::protocols::channel_creation;
use crate::store::{
    unix_now, AntiReplayStore, ChannelCreationInstances, Database, NewReceivedMessage,
    ProtocolInstanceRecord, ProtocolInstances, ReceivedMessage, ReceivedMessageId,
    ReceivedMessages, UnitOfWork,
};

/// Rows removed by [`Engine::delete_owned_identity_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub instances: usize,
    pub received_messages: usize,
    pub channel_creations: usize,
    pub signatures: usize,
}

/// Handle on a protocol engine. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    worker_threads: usize,
    orphan_max_age: Duration,
}

impl Engine {
    /// Opens the engine database and runs the standard protocols.
    pub fn open(config: &Config, delegates: Delegates) -> Result<Self> {
        Self::open_with_catalogue(config, delegates, Catalogue::standard())
    }

    pub fn open_with_catalogue(
        config: &Config,
        delegates: Delegates,
        catalogue: Catalogue,
    ) -> Result<Self> {
        config.validate()?;
        let database = Database::open(
            config.database_path(),
            Duration::from_millis(config.store.busy_timeout_ms),
        )?;
        info!(path = %database.path().display(), "Protocol engine opened");
        let engine = Self {
            dispatcher: Arc::new(Dispatcher::new(
                database,
                catalogue,
                delegates,
                config.dispatch.max_commit_retries,
            )),
            worker_threads: config.dispatch.worker_threads,
            orphan_max_age: Duration::from_secs(config.dispatch.orphan_message_max_age_secs),
        };
        engine.purge_orphan_messages()?;
        Ok(engine)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Maximum number of dispatches the scheduler runs at once.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Returns a receiver for engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.dispatcher.subscribe()
    }

    /// Queues a decoded envelope received for `owned`.
    pub fn receive(
        &self,
        owned: &CryptoIdentity,
        envelope: ReceivedEnvelope,
        reception: ReceptionChannelInfo,
    ) -> Result<ReceivedMessageId> {
        let (message, dialog_uuid, user_response) = envelope.into_parts();
        self.dispatcher.enqueue(&NewReceivedMessage {
            owned_identity: *owned,
            message,
            reception,
            dialog_uuid,
            user_response,
        })
    }

    /// Decodes and queues a raw protocol envelope.
    ///
    /// Envelopes that do not decode are dropped: `Ok(None)`.
    pub fn receive_bytes(
        &self,
        owned: &CryptoIdentity,
        bytes: &[u8],
        reception: ReceptionChannelInfo,
    ) -> Result<Option<ReceivedMessageId>> {
        let message = match GenericProtocolMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    owned_identity = %owned,
                    reception = reception.kind_name(),
                    len = bytes.len(),
                    %err,
                    "Dropping undecodable envelope"
                );
                return Ok(None);
            }
        };
        self.receive(owned, ReceivedEnvelope::Protocol(message), reception)
            .map(Some)
    }

    /// Dispatches one queued message.
    pub fn process(&self, id: ReceivedMessageId) -> Result<DispatchOutcome> {
        self.dispatcher.process(id)
    }

    /// Dispatches queued messages until none makes progress.
    ///
    /// Returns the number of messages consumed. A message whose dispatch
    /// fails stays queued and does not stop the others.
    pub fn process_pending(&self) -> Result<usize> {
        let mut consumed = 0;
        loop {
            let mut progressed = 0;
            for id in self.pending_ids()? {
                match self.dispatcher.process(id) {
                    Ok(outcome) if outcome.made_progress() => progressed += 1,
                    Ok(_) => {}
                    Err(err) => warn!(message_id = %id, %err, "Message left queued"),
                }
            }
            if progressed == 0 {
                return Ok(consumed);
            }
            consumed += progressed;
        }
    }

    /// Starts creating a channel with one device of a contact.
    ///
    /// Returns the uid of the new protocol instance.
    pub fn start_channel_creation(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        contact_device_uid: &Uid,
    ) -> Result<Uid> {
        let message = channel_creation::initial_message(owned, contact, contact_device_uid)
            .ok_or_else(|| EngineError::invariant("initial message on a non-local channel"))?;
        let instance_uid = message.envelope().instance_uid;

        let mut conn = self.dispatcher.database().connect()?;
        let mut uow = UnitOfWork::begin(&mut conn)?;
        self.dispatcher.delegates().channel.post(&mut uow, message)?;
        uow.commit()?;

        info!(
            owned_identity = %owned,
            contact = %contact,
            contact_device_uid = %contact_device_uid,
            instance_uid = %instance_uid,
            "Channel creation requested"
        );
        Ok(instance_uid)
    }

    /// Deletes an instance and every message queued for it.
    pub fn abort_protocol(&self, owned: &CryptoIdentity, instance_uid: &Uid) -> Result<()> {
        self.dispatcher.abort_protocol(owned, instance_uid)
    }

    /// Deletes everything the engine stores for an owned identity.
    pub fn delete_owned_identity_data(&self, owned: &CryptoIdentity) -> Result<PurgeSummary> {
        let mut conn = self.dispatcher.database().connect()?;
        let uow = UnitOfWork::begin(&mut conn)?;
        let summary = PurgeSummary {
            instances: ProtocolInstances::delete_all_for_owned(uow.conn(), owned)?,
            received_messages: ReceivedMessages::delete_all_for_owned(uow.conn(), owned)?,
            channel_creations: ChannelCreationInstances::delete_all_for_owned(uow.conn(), owned)?,
            signatures: AntiReplayStore::delete_all(uow.conn(), owned)?,
        };
        uow.commit()?;
        info!(owned_identity = %owned, ?summary, "Deleted owned identity data");
        Ok(summary)
    }

    /// Deletes queued messages older than the configured orphan age whose
    /// protocol instance does not exist.
    ///
    /// Such messages arrived after their instance finished, or name an
    /// instance that was never created; no step will ever consume them.
    pub fn purge_orphan_messages(&self) -> Result<usize> {
        let cutoff = unix_now().saturating_sub(self.orphan_max_age.as_secs() as i64);
        let mut conn = self.dispatcher.database().connect()?;
        let uow = UnitOfWork::begin(&mut conn)?;
        let deleted = ReceivedMessages::delete_orphans_older_than(uow.conn(), cutoff)?;
        uow.commit()?;
        if deleted > 0 {
            info!(deleted, cutoff, "Purged orphan received messages");
        }
        Ok(deleted)
    }

    /// Live protocol instances, oldest first.
    pub fn list_instances(&self) -> Result<Vec<ProtocolInstanceRecord>> {
        let conn = self.dispatcher.database().connect()?;
        ProtocolInstances::list(&conn)
    }

    /// Queued received messages, oldest first.
    pub fn pending_messages(&self) -> Result<Vec<ReceivedMessage>> {
        let conn = self.dispatcher.database().connect()?;
        ReceivedMessages::list(&conn)
    }

    pub fn pending_ids(&self) -> Result<Vec<ReceivedMessageId>> {
        let conn = self.dispatcher.database().connect()?;
        ReceivedMessages::pending_ids(&conn)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dispatcher", &self.dispatcher)
            .field("worker_threads", &self.worker_threads)
            .field("orphan_max_age", &self.orphan_max_age)
            .finish()
    }
}
