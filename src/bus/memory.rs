use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Bus, Subscription};
use crate::Result;

/// In-process broker with pub/sub semantics.
///
/// A payload reaches every subscriber that exists at publish time and is
/// dropped when nobody listens, exactly like Redis `PUBLISH`.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscribers(&self, channel: &str) -> usize {
        let subscribers = self.subscribers.lock().expect("got lock");
        subscribers
            .get(channel)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Bus for MemoryBus {
    async fn ready(&self, _channel: &str) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let mut subscribers = self.subscribers.lock().expect("got lock");
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|tx| tx.send(payload.clone()).is_ok());
            trace!("published to {} subscriber(s) of {}", senders.len(), channel);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("got lock")
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        Ok(Box::pin(stream))
    }
}
