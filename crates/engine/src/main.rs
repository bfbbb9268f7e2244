//! Pairlink engine command line.
//!
//! Inspects and maintains the engine database, and runs an in-process
//! channel creation between two devices.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::config::default_config_path;
use engine::loopback::{DeliveryMode, LoopbackChannel, LoopbackNetwork, MemoryIdentityDirectory};
use engine::protocols::channel_creation::MessageKind;
use engine::{Catalogue, Config, Delegates, Engine, KeyringChallengeSolver, Scheduler};
use protocol::{CryptoIdentity, OwnedCryptoIdentity, ProtocolId, Uid};
use tracing_subscriber::EnvFilter;

/// Pairlink protocol engine.
#[derive(Parser, Debug)]
#[command(name = "pairlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// List live protocol instances
    Instances,

    /// List received messages waiting for their instance
    Pending,

    /// Delete everything stored for an owned identity
    Purge {
        /// Owned identity, hex encoded
        #[arg(long)]
        owned: String,
    },

    /// Create a channel between two in-process devices
    Demo {
        /// Seconds to wait for both channels to be confirmed
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.engine.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Init { force } = cli.command {
        return init_config(&config_path, force);
    }

    config.validate()?;

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Instances => list_instances(&config),
        Commands::Pending => list_pending(&config),
        Commands::Purge { owned } => purge(&config, &owned),
        Commands::Demo { timeout } => run_demo(&config, Duration::from_secs(timeout)).await,
    }
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// An engine for maintenance commands, which never dispatch.
fn offline_engine(config: &Config) -> anyhow::Result<Engine> {
    let network = LoopbackNetwork::new(DeliveryMode::Queued);
    let delegates = Delegates {
        identity: Arc::new(MemoryIdentityDirectory::new()),
        channel: network.channel(Uid::from_bytes([0; 32])),
        challenges: Arc::new(KeyringChallengeSolver::new()),
    };
    Engine::open(config, delegates).context("Failed to open engine database")
}

fn list_instances(config: &Config) -> anyhow::Result<()> {
    let engine = offline_engine(config)?;
    let catalogue = Catalogue::standard();
    let instances = engine.list_instances()?;
    if instances.is_empty() {
        println!("No protocol instances.");
        return Ok(());
    }

    println!(
        "{:<34} {:<18} {:<20} {:>7}  {}",
        "PROTOCOL", "INSTANCE", "STATE", "VERSION", "OWNED"
    );
    for record in instances {
        let state = catalogue
            .get(record.key.protocol_id)
            .map_or("Unknown", |protocol| protocol.state_name(&record.state));
        println!(
            "{:<34} {:<18} {:<20} {:>7}  {}",
            record.key.protocol_id.to_string(),
            short_hex(&record.key.instance_uid.to_hex()),
            state,
            record.version,
            short_hex(&record.key.owned_identity.to_hex()),
        );
    }
    Ok(())
}

fn list_pending(config: &Config) -> anyhow::Result<()> {
    let engine = offline_engine(config)?;
    let messages = engine.pending_messages()?;
    if messages.is_empty() {
        println!("No pending messages.");
        return Ok(());
    }

    println!(
        "{:<8} {:<34} {:>4} {:<18} {:<10}",
        "ID", "PROTOCOL", "KIND", "INSTANCE", "CHANNEL"
    );
    for message in messages {
        println!(
            "{:<8} {:<34} {:>4} {:<18} {:<10}",
            message.id.to_string(),
            message.message.protocol_id.to_string(),
            message.message.message_kind,
            short_hex(&message.message.instance_uid.to_hex()),
            message.reception.kind_name(),
        );
    }
    Ok(())
}

fn purge(config: &Config, owned: &str) -> anyhow::Result<()> {
    let owned = CryptoIdentity::from_hex(owned).context("Invalid owned identity")?;
    let engine = offline_engine(config)?;
    let summary = engine.delete_owned_identity_data(&owned)?;
    println!("Deleted data of {}", short_hex(&owned.to_hex()));
    println!("  Instances:          {}", summary.instances);
    println!("  Received messages:  {}", summary.received_messages);
    println!("  Channel creations:  {}", summary.channel_creations);
    println!("  Ping signatures:    {}", summary.signatures);
    Ok(())
}

fn short_hex(hex: &str) -> String {
    if hex.len() > 16 {
        format!("{}..", &hex[..16])
    } else {
        hex.to_string()
    }
}

/// One side of the demo.
struct DemoDevice {
    identity: CryptoIdentity,
    device_uid: Uid,
    engine: Engine,
    channel: Arc<LoopbackChannel>,
}

fn demo_device(
    network: &Arc<LoopbackNetwork>,
    config: &Config,
    data_dir: PathBuf,
    owned: OwnedCryptoIdentity,
    contact: CryptoIdentity,
    device_uid: Uid,
) -> anyhow::Result<DemoDevice> {
    let identity = *owned.identity();
    let directory = MemoryIdentityDirectory::new();
    directory.set_current_device(identity, device_uid);
    directory.add_contact(identity, contact);
    let keyring = KeyringChallengeSolver::new();
    keyring.add(owned);
    let channel = network.channel(device_uid);

    let mut config = config.clone();
    config.engine.data_dir = data_dir;
    let engine = Engine::open(
        &config,
        Delegates {
            identity: Arc::new(directory),
            channel: channel.clone(),
            challenges: Arc::new(keyring),
        },
    )?;
    network.attach(identity, engine.clone(), channel.clone());
    Ok(DemoDevice {
        identity,
        device_uid,
        engine,
        channel,
    })
}

async fn run_demo(config: &Config, timeout: Duration) -> anyhow::Result<()> {
    let dir = config
        .engine
        .data_dir
        .join(format!("demo-{}", uuid::Uuid::new_v4()));
    let result = demo_in(&dir, config, timeout).await;
    if let Err(err) = std::fs::remove_dir_all(&dir) {
        tracing::warn!("Failed to remove demo directory {}: {}", dir.display(), err);
    }
    result
}

async fn demo_in(dir: &Path, config: &Config, timeout: Duration) -> anyhow::Result<()> {
    let network = LoopbackNetwork::new(DeliveryMode::Immediate);
    let alice = OwnedCryptoIdentity::generate();
    let bob = OwnedCryptoIdentity::generate();
    let (alice_id, bob_id) = (*alice.identity(), *bob.identity());

    let a = demo_device(
        &network,
        config,
        dir.join("alice"),
        alice,
        bob_id,
        Uid::from_bytes([0x01; 32]),
    )?;
    let b = demo_device(
        &network,
        config,
        dir.join("bob"),
        bob,
        alice_id,
        Uid::from_bytes([0x02; 32]),
    )?;

    let schedulers = [
        Scheduler::spawn(a.engine.clone()),
        Scheduler::spawn(b.engine.clone()),
    ];

    let instance_uid = a
        .engine
        .start_channel_creation(&a.identity, &b.identity, &b.device_uid)?;
    tracing::info!("Started channel creation {}", instance_uid);

    let confirmed = tokio::time::timeout(timeout, async {
        loop {
            if a.channel.is_confirmed(&a.identity, &b.identity, &b.device_uid)
                && b.channel.is_confirmed(&b.identity, &a.identity, &a.device_uid)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok();

    for scheduler in schedulers {
        scheduler.shutdown().await;
    }

    if !confirmed {
        anyhow::bail!("Channel was not confirmed within {:?}", timeout);
    }

    let seed_a = a
        .channel
        .channel_seed(&a.identity, &b.identity, &b.device_uid)
        .context("Missing channel on the first device")?;
    let seed_b = b
        .channel
        .channel_seed(&b.identity, &a.identity, &a.device_uid)
        .context("Missing channel on the second device")?;

    let handshake: Vec<_> = network
        .sent()
        .into_iter()
        .filter(|sent| sent.protocol_id == ProtocolId::ChannelCreationWithContactDevice)
        .collect();

    println!("Channel confirmed on both devices");
    println!("  Device {}: seed {}", short_hex(&a.device_uid.to_hex()), seed_a.fingerprint());
    println!("  Device {}: seed {}", short_hex(&b.device_uid.to_hex()), seed_b.fingerprint());
    println!("  Seeds match: {}", seed_a == seed_b);
    println!("  Handshake messages: {}", handshake.len());
    for sent in handshake {
        let kind = MessageKind::from_raw(sent.message_kind)
            .map_or_else(|| sent.message_kind.to_string(), |kind| format!("{kind:?}"));
        println!(
            "    {} -> {} {:<30} over {}",
            short_hex(&sent.from_device_uid.to_hex()),
            short_hex(&sent.to_device_uid.to_hex()),
            kind,
            sent.channel
        );
    }
    Ok(())
}
