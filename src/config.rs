//! Process configuration from command line flags and the environment.
use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Args;

use crate::{
    bus::{RedisBus, DEFAULT_REDIS_ADDR},
    registry::ChannelRegistry,
    session::DEFAULT_SESSION_DEADLINE,
    store::FileKeyStore,
    types::ParticipantId,
    Result,
};

#[derive(Debug, Clone, Args)]
pub struct RelayArgs {
    /// Address of the Redis broker
    #[arg(long, env = "REDIS_ADDR", default_value = DEFAULT_REDIS_ADDR)]
    pub redis_addr: String,

    /// Directory holding the participants' key files
    #[arg(long, env = "MPC_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// Seconds a session may take before it is abandoned
    #[arg(
        long,
        env = "MPC_SESSION_TIMEOUT_SECS",
        default_value_t = DEFAULT_SESSION_DEADLINE.as_secs()
    )]
    pub session_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub redis_addr: String,
    pub data_dir: PathBuf,
    pub session_deadline: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redis_addr: DEFAULT_REDIS_ADDR.to_string(),
            data_dir: PathBuf::from("."),
            session_deadline: DEFAULT_SESSION_DEADLINE,
        }
    }
}

impl From<RelayArgs> for RelayConfig {
    fn from(args: RelayArgs) -> Self {
        Self {
            redis_addr: args.redis_addr,
            data_dir: args.data_dir,
            // a zero deadline would fail every session on the spot
            session_deadline: Duration::from_secs(args.session_timeout_secs.max(1)),
        }
    }
}

impl RelayConfig {
    /// A registry over the configured Redis broker. Nothing is dialled yet.
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::new(ChannelRegistry::new(Arc::new(RedisBus::new(
            self.redis_addr.clone(),
        ))))
    }

    pub fn key_store(&self, participant: &ParticipantId) -> Result<FileKeyStore> {
        FileKeyStore::new(&self.data_dir, participant)
    }
}
