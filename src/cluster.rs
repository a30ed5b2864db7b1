//! Several participants in one process.
//!
//! Each participant gets its own [`ChannelRegistry`] on a shared bus, as if
//! it ran in a process of its own. Used by the `demo` command and by tests.
use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tracing::warn;

use crate::{
    bus::Bus,
    engine::{ProtocolEngine, SchnorrEngine},
    orchestrator::Orchestrator,
    participant::Participant,
    registry::ChannelRegistry,
    store::KeyStore,
    types::ParticipantId,
    Result,
};

struct Member {
    id: ParticipantId,
    registry: Arc<ChannelRegistry>,
    task: JoinHandle<Result<()>>,
}

pub struct LocalCluster {
    bus: Arc<dyn Bus>,
    deadline: Duration,
    shutdown: watch::Sender<bool>,
    members: Vec<Member>,
}

impl LocalCluster {
    /// Activates every participant in `ids` and leaves them serving requests.
    pub async fn start<F>(
        bus: Arc<dyn Bus>,
        ids: &[ParticipantId],
        deadline: Duration,
        store_for: F,
    ) -> Result<Self>
    where
        F: Fn(&ParticipantId) -> Arc<dyn KeyStore>,
    {
        let (shutdown, _) = watch::channel(false);
        let engine: Arc<dyn ProtocolEngine> = Arc::new(SchnorrEngine);
        let mut members = Vec::new();
        for id in ids {
            let registry = Arc::new(ChannelRegistry::new(bus.clone()));
            let participant = Participant::activate(
                id.clone(),
                registry.clone(),
                engine.clone(),
                store_for(id),
                deadline,
            )
            .await?;
            let task = tokio::spawn(participant.run(shutdown.subscribe()));
            members.push(Member {
                id: id.clone(),
                registry,
                task,
            });
        }
        return Ok(Self {
            bus,
            deadline,
            shutdown,
            members,
        });
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        self.members.iter().map(|member| member.id.clone()).collect()
    }

    /// An orchestrator with a registry of its own on the cluster's bus.
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::new(ChannelRegistry::new(self.bus.clone())),
            self.deadline,
        )
    }

    /// Stops every participant and its channels.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.send_replace(true);
        let mut first_error = None;
        for member in self.members {
            match member.task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!("participant {} ended with {}", member.id, err);
                    first_error.get_or_insert(err);
                }
                Err(err) => warn!("participant {} task failed: {}", member.id, err),
            }
            member.registry.shutdown().await;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
