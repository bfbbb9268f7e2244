//! Durable store for the protocol engine.
//!
//! This module provides SQLite-based persistence for:
//! - Protocol instances and their current state
//! - The queue of received protocol messages
//! - Running channel creations, by contact device
//! - Anti-replay receipts of challenge signatures
//!
//! All writes of a dispatch go through one [`UnitOfWork`].

mod anti_replay;
mod channel_creation;
mod database;
mod instances;
mod received;
mod unit_of_work;

pub use anti_replay::AntiReplayStore;
pub use channel_creation::ChannelCreationInstances;
pub use database::{migrate, schema_version, Database, CURRENT_SCHEMA_VERSION};
pub use instances::{InstanceKey, ProtocolInstanceRecord, ProtocolInstances, StateRecord};
pub use received::{NewReceivedMessage, ReceivedMessage, ReceivedMessageId, ReceivedMessages};
pub use unit_of_work::{CommitHook, UnitOfWork};

pub(crate) use database::unix_now;

#[cfg(test)]
pub(crate) use database::open_in_memory;
