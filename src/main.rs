use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mpc_relay::{
    bus::MemoryBus,
    cluster::LocalCluster,
    config::{RelayArgs, RelayConfig},
    engine::{verify_signature, ProtocolEngine, SchnorrEngine},
    store::{KeyStore, MemoryKeyStore},
    types::ParticipantId,
    Orchestrator, Participant, RelayError, Result,
};

#[derive(Parser)]
#[command(name = "mpc-relay")]
#[command(about = "Relay and coordinator for threshold signing protocols", long_about = None)]
struct Cli {
    #[command(flatten)]
    relay: RelayArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Signers {
    /// Comma separated participant ids
    #[arg(long, value_delimiter = ',', required = true)]
    participants: Vec<String>,
}

impl Signers {
    fn ids(&self) -> Vec<ParticipantId> {
        self.participants.iter().map(ParticipantId::new).collect()
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve protocol requests as one participant until interrupted
    Participant {
        #[arg(long)]
        id: String,
    },

    /// Generate a new threshold key
    Keygen {
        #[command(flatten)]
        signers: Signers,

        /// Signers needed to sign, minus one
        #[arg(long, default_value_t = 1)]
        threshold: usize,
    },

    /// Replace every share of a key without changing the key
    Refresh {
        #[command(flatten)]
        signers: Signers,

        #[arg(long)]
        address: String,
    },

    /// Sign the SHA-256 hash of a message
    Sign {
        #[command(flatten)]
        signers: Signers,

        #[arg(long)]
        address: String,

        #[arg(long)]
        message: String,
    },

    /// Prepare a pre-signature for a later sign-online
    Presign {
        #[command(flatten)]
        signers: Signers,

        #[arg(long)]
        address: String,
    },

    /// Sign with a previously prepared pre-signature
    SignOnline {
        #[command(flatten)]
        signers: Signers,

        #[arg(long)]
        address: String,

        #[arg(long)]
        message: String,
    },

    /// Report which participants answer
    Online {
        #[command(flatten)]
        signers: Signers,
    },

    /// List the keys every holder still has
    Configs {
        #[command(flatten)]
        signers: Signers,
    },

    /// Print audit events as they are published
    Audit,

    /// Run participants and an orchestrator in this process, without a broker
    Demo {
        #[arg(long, value_delimiter = ',', default_value = "alice,bob,carol")]
        participants: Vec<String>,

        #[arg(long, default_value_t = 1)]
        threshold: usize,

        #[arg(long, default_value = "hello")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = RelayConfig::from(cli.relay);

    match cli.command {
        Command::Participant { id } => run_participant(&config, ParticipantId::new(id)).await,
        Command::Audit => follow_audit(&config).await,
        Command::Demo {
            participants,
            threshold,
            message,
        } => {
            let ids: Vec<_> = participants.iter().map(ParticipantId::new).collect();
            demo(&config, &ids, threshold, &message).await
        }
        command => orchestrate(&config, command).await,
    }
}

fn message_hash(message: &str) -> Vec<u8> {
    Sha256::digest(message.as_bytes()).to_vec()
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for interrupts: {}", err);
            return;
        }
        info!("interrupted, shutting down");
        tx.send_replace(true);
    });
    rx
}

async fn run_participant(config: &RelayConfig, id: ParticipantId) -> Result<()> {
    let registry = config.registry();
    let store: Arc<dyn KeyStore> = Arc::new(config.key_store(&id)?);
    let engine: Arc<dyn ProtocolEngine> = Arc::new(SchnorrEngine);
    let participant = Participant::activate(
        id,
        registry.clone(),
        engine,
        store,
        config.session_deadline,
    )
    .await?;
    let served = participant.run(interrupt()).await;
    registry.shutdown().await;
    served
}

async fn follow_audit(config: &RelayConfig) -> Result<()> {
    let registry = config.registry();
    let events = registry.audit_inbox().await?;
    let mut stop = interrupt();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
        }
    }
    registry.shutdown().await;
    Ok(())
}

async fn orchestrate(config: &RelayConfig, command: Command) -> Result<()> {
    let registry = config.registry();
    let orchestrator = Orchestrator::new(registry.clone(), config.session_deadline);
    let outcome = run_command(&orchestrator, command).await;
    registry.shutdown().await;
    outcome
}

async fn run_command(orchestrator: &Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::Keygen { signers, threshold } => {
            print(&orchestrator.generate_keys(&signers.ids(), threshold).await?)
        }
        Command::Refresh { signers, address } => {
            print(&orchestrator.refresh_keys(&signers.ids(), &address).await?)
        }
        Command::Sign {
            signers,
            address,
            message,
        } => print(
            &orchestrator
                .sign(&signers.ids(), &address, &message_hash(&message))
                .await?,
        ),
        Command::Presign { signers, address } => {
            print(&orchestrator.pre_sign(&signers.ids(), &address).await?)
        }
        Command::SignOnline {
            signers,
            address,
            message,
        } => print(
            &orchestrator
                .sign_online(&signers.ids(), &address, &message_hash(&message))
                .await?,
        ),
        Command::Online { signers } => print(&orchestrator.get_online(&signers.ids()).await?),
        Command::Configs { signers } => print(&orchestrator.get_configs(&signers.ids()).await?),
        Command::Participant { .. } | Command::Audit | Command::Demo { .. } => Err(
            RelayError::InvalidRequest("not an orchestrator command".into()),
        ),
    }
}

async fn demo(
    config: &RelayConfig,
    participants: &[ParticipantId],
    threshold: usize,
    message: &str,
) -> Result<()> {
    let cluster = LocalCluster::start(
        Arc::new(MemoryBus::new()),
        participants,
        config.session_deadline,
        |_| Arc::new(MemoryKeyStore::new()),
    )
    .await?;
    let orchestrator = cluster.orchestrator();
    let outcome = demo_flow(&orchestrator, participants, threshold, message).await;
    cluster.shutdown().await?;
    outcome
}

async fn demo_flow(
    orchestrator: &Orchestrator,
    participants: &[ParticipantId],
    threshold: usize,
    message: &str,
) -> Result<()> {
    let hash = message_hash(message);
    let key = orchestrator.generate_keys(participants, threshold).await?;
    info!("generated key {}", key.address);
    print(&key)?;

    let refreshed = orchestrator.refresh_keys(participants, &key.address).await?;
    info!("refreshed key {}", refreshed.address);

    // the smallest quorum signs
    let signers = &participants[..threshold.max(1) + 1];
    let signature = orchestrator.sign(signers, &key.address, &hash).await?;
    print(&signature)?;
    info!(
        "signature verifies: {}",
        verify_signature(&key.public_key, &hash, &signature.signature)
    );

    let presignature = orchestrator.pre_sign(signers, &key.address).await?;
    print(&presignature)?;
    let online = orchestrator
        .sign_online(signers, &key.address, &hash)
        .await?;
    print(&online)?;

    print(&orchestrator.get_online(participants).await?)?;
    print(&orchestrator.get_configs(participants).await?)?;
    Ok(())
}
