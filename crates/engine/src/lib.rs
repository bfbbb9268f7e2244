//! # Pairlink Protocol Engine
//!
//! Durable execution of multi-round cryptographic protocols between devices
//! of mutually trusting identities.
//!
//! ## Overview
//!
//! - **Received queue**: inbound envelopes are persisted before anything runs
//! - **Catalogue**: static `(state kind, message kind)` step tables per protocol
//! - **Dispatcher**: runs one step per message inside a SQLite transaction,
//!   serialised per protocol instance
//! - **Scheduler**: tokio task dispatching queued messages on the blocking pool
//! - **Channel creation**: the seven-message handshake that sets up an
//!   oblivious channel with one device of a contact
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  receive ──► received_messages ──► EngineEvent ──► Scheduler │
//! │                                                      │       │
//! │  ┌────────────────┐   ┌──────────────────────────────▼─────┐ │
//! │  │   Catalogue    │◄──│             Dispatcher             │ │
//! │  └────────────────┘   └──────────────┬─────────────────────┘ │
//! │                                      │ UnitOfWork            │
//! │  ┌────────────────┐   ┌──────────────▼─────────────────────┐ │
//! │  │   Delegates    │◄──│       Protocol step execution      │ │
//! │  └────────────────┘   └────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use engine::loopback::{DeliveryMode, LoopbackNetwork, MemoryIdentityDirectory};
//! use engine::{Config, Delegates, Engine, KeyringChallengeSolver, Scheduler};
//! use protocol::Uid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let network = LoopbackNetwork::new(DeliveryMode::Immediate);
//!     let delegates = Delegates {
//!         identity: Arc::new(MemoryIdentityDirectory::new()),
//!         channel: network.channel(Uid::generate()),
//!         challenges: Arc::new(KeyringChallengeSolver::new()),
//!     };
//!
//!     let engine = Engine::open(&config, delegates)?;
//!     let scheduler = Scheduler::spawn(engine.clone());
//!
//!     // Receive envelopes with `engine.receive_bytes(...)`.
//!
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`store`]: SQLite tables and the unit of work
//! - [`delegates`]: Identity, channel and challenge collaborators
//! - [`catalogue`]: Protocol and step contracts
//! - [`dispatcher`]: Per-message step execution
//! - [`scheduler`]: Background dispatch
//! - [`protocols`]: Concrete protocols
//! - [`loopback`]: In-process network for demos and tests

pub mod catalogue;
pub mod config;
pub mod delegates;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod protocols;
pub mod scheduler;
pub mod store;

// Re-export protocol for convenience
pub use protocol;

pub use catalogue::{Catalogue, ConcreteProtocol, ProtocolStep, StepContext};
pub use config::Config;
pub use delegates::{
    ChannelDelegate, Delegates, IdentityDelegate, KeyringChallengeSolver, SolveChallengeDelegate,
};
pub use dispatcher::{DispatchOutcome, Dispatcher, EngineEvent};
pub use engine::{Engine, PurgeSummary};
pub use error::{EngineError, Result};
pub use scheduler::Scheduler;
pub use store::{InstanceKey, ReceivedMessageId, StateRecord, UnitOfWork};
