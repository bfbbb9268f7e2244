//! In-process network of engines.
//!
//! [`LoopbackNetwork`] stands in for the transport: every engine attached to
//! it gets a [`LoopbackChannel`] as its channel delegate, and messages posted
//! on one engine are delivered to the engines of their recipients once the
//! posting unit of work commits. [`MemoryIdentityDirectory`] is the matching
//! identity delegate. The `pairlink demo` command and the integration tests
//! run full handshakes through them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use protocol::{
    CryptoIdentity, MessageToSend, ProtocolId, ProtocolMessageToSend, ReceptionChannelInfo, Seed,
    SendChannel, Uid,
};
use tracing::{debug, error, info, warn};

use crate::delegates::{ChannelDelegate, IdentityDelegate};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::store::UnitOfWork;

/// When posted messages reach their recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept until [`LoopbackNetwork::run_until_idle`] delivers them.
    Queued,
    /// Handed to the recipient engine as soon as the sender commits.
    Immediate,
}

/// A remote message that went through the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEnvelope {
    pub from: CryptoIdentity,
    pub from_device_uid: Uid,
    pub to: CryptoIdentity,
    pub to_device_uid: Uid,
    pub channel: &'static str,
    pub protocol_id: ProtocolId,
    pub message_kind: i64,
}

type Address = (CryptoIdentity, Uid);

struct Delivery {
    from: Address,
    to: Address,
    bytes: Vec<u8>,
    reception: ReceptionChannelInfo,
    /// Set for oblivious deliveries: whether the channel must be confirmed.
    oblivious: Option<bool>,
}

#[derive(Clone)]
struct Endpoint {
    engine: Engine,
    channel: Arc<LoopbackChannel>,
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes messages between attached engines.
pub struct LoopbackNetwork {
    mode: DeliveryMode,
    endpoints: DashMap<Address, Endpoint>,
    queue: Mutex<VecDeque<Delivery>>,
    sent: Mutex<Vec<SentEnvelope>>,
}

impl LoopbackNetwork {
    pub fn new(mode: DeliveryMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            endpoints: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Creates the channel delegate of the device `device_uid`.
    pub fn channel(self: &Arc<Self>, device_uid: Uid) -> Arc<LoopbackChannel> {
        Arc::new(LoopbackChannel {
            network: Arc::downgrade(self),
            device_uid,
            channels: Arc::new(DashMap::new()),
        })
    }

    /// Makes `owned` on `channel`'s device reachable through `engine`.
    pub fn attach(&self, owned: CryptoIdentity, engine: Engine, channel: Arc<LoopbackChannel>) {
        let address = (owned, channel.device_uid);
        debug!(owned_identity = %owned, device_uid = %channel.device_uid, "Engine attached");
        self.endpoints.insert(address, Endpoint { engine, channel });
    }

    /// Remote messages routed so far, in order.
    pub fn sent(&self) -> Vec<SentEnvelope> {
        locked(&self.sent).clone()
    }

    /// Deliveries waiting in the queue.
    pub fn queued(&self) -> usize {
        locked(&self.queue).len()
    }

    /// Delivers queued messages and dispatches them on every engine until
    /// nothing moves. Returns the number of deliveries made.
    pub fn run_until_idle(&self) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            while let Some(delivery) = self.pop() {
                self.deliver(delivery)?;
                delivered += 1;
                progressed = true;
            }
            for engine in self.engines() {
                if engine.process_pending()? > 0 {
                    progressed = true;
                }
            }
            if !progressed && self.queued() == 0 {
                return Ok(delivered);
            }
        }
    }

    fn pop(&self) -> Option<Delivery> {
        locked(&self.queue).pop_front()
    }

    /// Distinct engines, by their database.
    fn engines(&self) -> Vec<Engine> {
        let mut seen = HashMap::new();
        for endpoint in self.endpoints.iter() {
            let path = endpoint.engine.dispatcher().database().path().to_path_buf();
            seen.entry(path).or_insert_with(|| endpoint.engine.clone());
        }
        seen.into_values().collect()
    }

    fn devices_of(&self, identity: &CryptoIdentity) -> Vec<Uid> {
        self.endpoints
            .iter()
            .filter(|entry| &entry.key().0 == identity)
            .map(|entry| entry.key().1)
            .collect()
    }

    fn endpoint(&self, address: &Address) -> Option<Endpoint> {
        self.endpoints.get(address).map(|entry| entry.value().clone())
    }

    fn route(&self, from_device_uid: Uid, message: MessageToSend) {
        let ProtocolMessageToSend { channel, envelope } = match message {
            MessageToSend::Protocol(message) => message,
            MessageToSend::Dialog(dialog) => {
                info!(owned_identity = %dialog.owned, uuid = %dialog.uuid, "Dialog not displayed");
                return;
            }
            MessageToSend::ServerQuery(query) => {
                info!(owned_identity = %query.owned, "Server query not sent");
                return;
            }
        };
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(%err, "Could not encode outgoing envelope");
                return;
            }
        };

        let from = (*channel.owned_identity(), from_device_uid);
        let (to, devices, reception, oblivious) = match channel {
            SendChannel::Local { owned } => {
                let delivery = Delivery {
                    from,
                    to: (owned, from_device_uid),
                    bytes,
                    reception: ReceptionChannelInfo::Local,
                    oblivious: None,
                };
                self.enqueue(delivery);
                return;
            }
            SendChannel::AsymmetricChannel {
                to,
                remote_device_uids,
                ..
            } => (to, remote_device_uids, ReceptionChannelInfo::AsymmetricChannel, None),
            SendChannel::AsymmetricBroadcast { to, .. } => {
                let devices = self.devices_of(&to);
                (to, devices, ReceptionChannelInfo::AsymmetricChannel, None)
            }
            SendChannel::ObliviousChannel {
                to,
                remote_device_uids,
                necessarily_confirmed,
                ..
            } => (
                to,
                remote_device_uids,
                ReceptionChannelInfo::ObliviousChannel {
                    remote_identity: from.0,
                    remote_device_uid: from_device_uid,
                },
                Some(necessarily_confirmed),
            ),
            SendChannel::UserInterface { .. } | SendChannel::ServerQuery { .. } => {
                warn!(protocol_id = %envelope.protocol_id, "Protocol message on a non-transport channel");
                return;
            }
        };

        let channel_name = match oblivious {
            Some(_) => "oblivious",
            None => "asymmetric",
        };
        for device in devices {
            locked(&self.sent).push(SentEnvelope {
                from: from.0,
                from_device_uid,
                to,
                to_device_uid: device,
                channel: channel_name,
                protocol_id: envelope.protocol_id,
                message_kind: envelope.message_kind,
            });
            self.enqueue(Delivery {
                from,
                to: (to, device),
                bytes: bytes.clone(),
                reception: reception.clone(),
                oblivious,
            });
        }
    }

    fn enqueue(&self, delivery: Delivery) {
        match self.mode {
            DeliveryMode::Queued => locked(&self.queue).push_back(delivery),
            DeliveryMode::Immediate => {
                if let Err(err) = self.deliver(delivery) {
                    error!(%err, "Immediate delivery failed");
                }
            }
        }
    }

    fn deliver(&self, delivery: Delivery) -> Result<()> {
        let Some(recipient) = self.endpoint(&delivery.to) else {
            warn!(to = %delivery.to.0, device_uid = %delivery.to.1, "No engine for recipient, dropping");
            return Ok(());
        };
        if let Some(necessarily_confirmed) = delivery.oblivious {
            if !self.oblivious_channel_usable(&delivery, &recipient, necessarily_confirmed) {
                return Ok(());
            }
        }
        recipient
            .engine
            .receive_bytes(&delivery.to.0, &delivery.bytes, delivery.reception)?;
        Ok(())
    }

    /// Both ends must hold a channel with the same seed, confirmed on the
    /// sending side when required.
    fn oblivious_channel_usable(
        &self,
        delivery: &Delivery,
        recipient: &Endpoint,
        necessarily_confirmed: bool,
    ) -> bool {
        let Some(sender) = self.endpoint(&delivery.from) else {
            warn!(from = %delivery.from.0, "No engine for sender, dropping");
            return false;
        };
        let (from, from_device) = delivery.from;
        let (to, to_device) = delivery.to;
        let Some(outbound) = sender.channel.state(&from, &to, &to_device) else {
            warn!(from = %from, to = %to, "No oblivious channel on sending side, dropping");
            return false;
        };
        if necessarily_confirmed && !outbound.confirmed {
            warn!(from = %from, to = %to, "Oblivious channel not confirmed, dropping");
            return false;
        }
        match recipient.channel.state(&to, &from, &from_device) {
            Some(inbound) if inbound.seed == outbound.seed => true,
            Some(_) => {
                warn!(from = %from, to = %to, "Oblivious channel seeds differ, dropping");
                false
            }
            None => {
                warn!(from = %from, to = %to, "No oblivious channel on receiving side, dropping");
                false
            }
        }
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("mode", &self.mode)
            .field("endpoints", &self.endpoints.len())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Key of an oblivious channel: owned identity, remote identity, remote device.
type ChannelKey = (CryptoIdentity, CryptoIdentity, Uid);

#[derive(Debug, Clone, PartialEq, Eq)]
struct ObliviousChannelState {
    seed: Seed,
    suite_version: u32,
    confirmed: bool,
}

/// Channel delegate of one device on a [`LoopbackNetwork`].
///
/// Every effect is deferred until the unit of work commits.
pub struct LoopbackChannel {
    network: Weak<LoopbackNetwork>,
    device_uid: Uid,
    channels: Arc<DashMap<ChannelKey, ObliviousChannelState>>,
}

impl LoopbackChannel {
    pub fn device_uid(&self) -> Uid {
        self.device_uid
    }

    /// Seed of the oblivious channel with a remote device, if one exists.
    pub fn channel_seed(
        &self,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
        remote_device_uid: &Uid,
    ) -> Option<Seed> {
        self.state(owned, remote, remote_device_uid)
            .map(|state| state.seed)
    }

    pub fn is_confirmed(
        &self,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
        remote_device_uid: &Uid,
    ) -> bool {
        self.state(owned, remote, remote_device_uid)
            .is_some_and(|state| state.confirmed)
    }

    fn state(
        &self,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
        remote_device_uid: &Uid,
    ) -> Option<ObliviousChannelState> {
        self.channels
            .get(&(*owned, *remote, *remote_device_uid))
            .map(|entry| entry.value().clone())
    }
}

impl ChannelDelegate for LoopbackChannel {
    fn post(&self, uow: &mut UnitOfWork<'_>, message: MessageToSend) -> Result<Uid> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| EngineError::delegate("loopback network is gone"))?;
        let device_uid = self.device_uid;
        uow.on_commit(move || network.route(device_uid, message));
        Ok(Uid::generate())
    }

    fn create_oblivious_channel(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
        remote_device_uid: &Uid,
        seed: &Seed,
        suite_version: u32,
    ) -> Result<()> {
        let channels = Arc::clone(&self.channels);
        let key = (*owned, *remote_identity, *remote_device_uid);
        let state = ObliviousChannelState {
            seed: seed.clone(),
            suite_version,
            confirmed: false,
        };
        uow.on_commit(move || {
            debug!(
                remote_identity = %key.1,
                remote_device_uid = %key.2,
                seed = %state.seed.fingerprint(),
                suite_version = state.suite_version,
                "Oblivious channel created"
            );
            channels.insert(key, state);
        });
        Ok(())
    }

    fn confirm_oblivious_channel(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
        remote_device_uid: &Uid,
    ) -> Result<()> {
        let channels = Arc::clone(&self.channels);
        let key = (*owned, *remote_identity, *remote_device_uid);
        uow.on_commit(move || match channels.get_mut(&key) {
            Some(mut state) => state.confirmed = true,
            None => warn!(remote_identity = %key.1, "Confirming a missing oblivious channel"),
        });
        Ok(())
    }

    fn delete_oblivious_channel(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        remote_identity: &CryptoIdentity,
        remote_device_uid: &Uid,
    ) -> Result<()> {
        let channels = Arc::clone(&self.channels);
        let key = (*owned, *remote_identity, *remote_device_uid);
        uow.on_commit(move || {
            channels.remove(&key);
        });
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("device_uid", &self.device_uid)
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// What a directory knows about one contact of an owned identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub active: bool,
    pub devices: Vec<Uid>,
    pub published_details: Option<Vec<u8>>,
}

#[derive(Default)]
struct DirectoryState {
    current_devices: DashMap<CryptoIdentity, Uid>,
    contacts: DashMap<(CryptoIdentity, CryptoIdentity), ContactRecord>,
    published_details: DashMap<CryptoIdentity, Vec<u8>>,
}

/// Identity delegate keeping contacts in memory.
///
/// Writes made through the delegate apply once the unit of work commits.
#[derive(Clone, Default)]
pub struct MemoryIdentityDirectory {
    state: Arc<DirectoryState>,
}

impl MemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the device this engine runs on for `owned`.
    pub fn set_current_device(&self, owned: CryptoIdentity, device_uid: Uid) {
        self.state.current_devices.insert(owned, device_uid);
    }

    /// Adds an active contact.
    pub fn add_contact(&self, owned: CryptoIdentity, contact: CryptoIdentity) {
        self.state.contacts.insert(
            (owned, contact),
            ContactRecord {
                active: true,
                devices: Vec::new(),
                published_details: None,
            },
        );
    }

    /// Marks a contact as revoked or active again.
    pub fn set_contact_active(&self, owned: &CryptoIdentity, contact: &CryptoIdentity, active: bool) {
        if let Some(mut record) = self.state.contacts.get_mut(&(*owned, *contact)) {
            record.active = active;
        }
    }

    pub fn set_published_details(&self, owned: CryptoIdentity, details: Vec<u8>) {
        self.state.published_details.insert(owned, details);
    }

    pub fn contact(&self, owned: &CryptoIdentity, contact: &CryptoIdentity) -> Option<ContactRecord> {
        self.state
            .contacts
            .get(&(*owned, *contact))
            .map(|entry| entry.value().clone())
    }
}

impl IdentityDelegate for MemoryIdentityDirectory {
    fn is_contact_of(
        &self,
        _uow: &UnitOfWork<'_>,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<bool> {
        Ok(self.state.contacts.contains_key(&(*owned, *contact)))
    }

    fn is_contact_active(
        &self,
        _uow: &UnitOfWork<'_>,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<bool> {
        Ok(self
            .state
            .contacts
            .get(&(*owned, *contact))
            .is_some_and(|record| record.active))
    }

    fn current_device_uid(&self, _uow: &UnitOfWork<'_>, owned: &CryptoIdentity) -> Result<Uid> {
        self.state
            .current_devices
            .get(owned)
            .map(|entry| *entry.value())
            .ok_or_else(|| EngineError::delegate(format!("no current device for {owned}")))
    }

    fn add_device_for_contact(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        device_uid: &Uid,
    ) -> Result<()> {
        let state = Arc::clone(&self.state);
        let key = (*owned, *contact);
        let device_uid = *device_uid;
        uow.on_commit(move || {
            if let Some(mut record) = state.contacts.get_mut(&key) {
                if !record.devices.contains(&device_uid) {
                    record.devices.push(device_uid);
                }
            }
        });
        Ok(())
    }

    fn published_details_of_owned(
        &self,
        _uow: &UnitOfWork<'_>,
        owned: &CryptoIdentity,
    ) -> Result<Vec<u8>> {
        Ok(self
            .state
            .published_details
            .get(owned)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    fn update_published_details_of_contact(
        &self,
        uow: &mut UnitOfWork<'_>,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        details: &[u8],
    ) -> Result<()> {
        let state = Arc::clone(&self.state);
        let key = (*owned, *contact);
        let details = details.to_vec();
        uow.on_commit(move || {
            if let Some(mut record) = state.contacts.get_mut(&key) {
                record.published_details = Some(details);
            }
        });
        Ok(())
    }
}

impl std::fmt::Debug for MemoryIdentityDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryIdentityDirectory")
            .field("contacts", &self.state.contacts.len())
            .finish_non_exhaustive()
    }
}
