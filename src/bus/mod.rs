//! Named publish/subscribe channels over a message broker.
//!
//! A [`Bus`] moves opaque bytes. Channel identity lives entirely in the
//! channel name; typing and caching happen one layer up in
//! [`crate::registry`].
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::Result;

mod memory;
mod redis;

pub use memory::MemoryBus;
pub use redis::{RedisBus, DEFAULT_REDIS_ADDR};

/// Infinite sequence of raw payloads published on one channel.
///
/// Ends only when the underlying connection goes away.
pub type Subscription = BoxStream<'static, Bytes>;

#[async_trait::async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Makes sure the broker is reachable before a channel is handed out.
    async fn ready(&self, channel: &str) -> Result<()>;

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
