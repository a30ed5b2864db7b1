use bytes::Bytes;
use mini_redis::client::{self, Client};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::{Bus, Subscription};
use crate::{RelayError, Result};

pub const DEFAULT_REDIS_ADDR: &str = "127.0.0.1:6379";

/// Redis pub/sub transport.
///
/// All publishes share one lazily created connection. A connection in
/// subscribe mode cannot issue other commands, so every subscription dials
/// its own.
pub struct RedisBus {
    addr: String,
    publisher: OnceCell<Mutex<Client>>,
}

impl RedisBus {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            publisher: OnceCell::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn publisher(&self, channel: &str) -> Result<&Mutex<Client>> {
        self.publisher
            .get_or_try_init(|| async {
                let client = client::connect(self.addr.as_str())
                    .await
                    .map_err(|err| RelayError::transport(channel, err))?;
                info!("connected to broker at {}", self.addr);
                Ok::<_, RelayError>(Mutex::new(client))
            })
            .await
    }
}

#[async_trait::async_trait]
impl Bus for RedisBus {
    async fn ready(&self, channel: &str) -> Result<()> {
        self.publisher(channel).await.map(|_| ())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let mut client = self.publisher(channel).await?.lock().await;
        let receivers = client
            .publish(channel, payload)
            .await
            .map_err(|err| RelayError::transport(channel, err))?;
        debug!("published on {} to {} receiver(s)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let client = client::connect(self.addr.as_str())
            .await
            .map_err(|err| RelayError::transport(channel, err))?;
        let subscriber = client
            .subscribe(vec![channel.to_string()])
            .await
            .map_err(|err| RelayError::transport(channel, err))?;
        debug!("subscribed to {}", channel);

        let channel = channel.to_string();
        let stream = futures::stream::unfold(subscriber, move |mut subscriber| {
            let channel = channel.clone();
            async move {
                match subscriber.next_message().await {
                    Ok(Some(message)) => Some((message.content, subscriber)),
                    Ok(None) => {
                        warn!("broker closed subscription {}", channel);
                        None
                    }
                    Err(err) => {
                        warn!("subscription {} failed: {}", channel, err);
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
