//! Typed, cached logical channels on top of a [`Bus`].
//!
//! Every message family gets its own channel per participant (and, for
//! session results, per session). A channel is opened on first use and
//! shared afterwards; a background pump converts between typed values and
//! the JSON bytes the bus carries.
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex as StdMutex},
};

use bytes::Bytes;
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{
    bus::{Bus, Subscription},
    types::{
        AuditEvent, InfoQuery, InfoResponse, ParticipantId, ProtocolRequest, RoundMessage,
        SessionId, SessionResult,
    },
    RelayError, Result,
};

/// Message categories, each with its own channel namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Protocol,
    Round,
    Session,
    InfoRequest,
    InfoResponse,
    Audit,
}

impl Family {
    pub fn prefix(&self) -> &'static str {
        match self {
            Family::Protocol => "protocol:messages",
            Family::Round => "internal:messages",
            Family::Session => "session:messages",
            Family::InfoRequest => "info:request:messages",
            Family::InfoResponse => "info:response:messages",
            Family::Audit => "log:messages",
        }
    }

    pub fn channel(&self, participant: &ParticipantId) -> String {
        format!("{}:{}", self.prefix(), participant)
    }
}

pub fn session_channel(session: &SessionId, participant: &ParticipantId) -> String {
    format!("{}:{}:{}", Family::Session.prefix(), session, participant)
}

/// Sending half of a logical channel. Sends never wait for the peer.
pub struct Outbox<T> {
    channel: Arc<str>,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<T> Outbox<T> {
    pub fn send(&self, value: T) -> Result<()> {
        self.tx
            .send(value)
            .map_err(|_| RelayError::ChannelClosed(self.channel.to_string()))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Receiving half of a logical channel.
///
/// Clones share one queue: every value goes to exactly one `recv` caller.
pub struct Inbox<T> {
    channel: Arc<str>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Inbox<T> {
    /// Waits for the next value. `None` once the channel has been torn down.
    ///
    /// Cancel safe: a value is never lost when the future is dropped.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

struct Pair<K, T> {
    inboxes: HashMap<K, Inbox<T>>,
    outboxes: HashMap<K, Outbox<T>>,
}

impl<K, T> Default for Pair<K, T> {
    fn default() -> Self {
        Self {
            inboxes: HashMap::new(),
            outboxes: HashMap::new(),
        }
    }
}

struct SessionChannels {
    results: Pair<ParticipantId, SessionResult>,
    shutdown: watch::Sender<bool>,
}

impl SessionChannels {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            results: Pair::default(),
            shutdown,
        }
    }
}

#[derive(Default)]
struct Channels {
    requests: Pair<ParticipantId, ProtocolRequest>,
    rounds: Pair<ParticipantId, RoundMessage>,
    info_queries: Pair<ParticipantId, InfoQuery>,
    info_responses: Pair<ParticipantId, InfoResponse>,
    sessions: HashMap<SessionId, SessionChannels>,
    audit: Pair<(), AuditEvent>,
}

/// Stop signal observed by a pump: the registry-wide shutdown plus, for
/// session channels, the session's own eviction.
struct Stop {
    root: watch::Receiver<bool>,
    scope: Option<watch::Receiver<bool>>,
}

impl Stop {
    async fn wait(&mut self) {
        match &mut self.scope {
            Some(scope) => {
                tokio::select! {
                    _ = stopped(&mut self.root) => {}
                    _ = stopped(scope) => {}
                }
            }
            None => stopped(&mut self.root).await,
        }
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        // sender gone counts as a stop
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Process-wide owner of every open channel.
///
/// Check-and-create for all families runs under one mutex, so concurrent
/// first use of the same key opens exactly one channel. Bus calls happen
/// outside it; a stalled dial holds up only its own caller.
pub struct ChannelRegistry {
    bus: Arc<dyn Bus>,
    channels: Mutex<Channels>,
    shutdown: watch::Sender<bool>,
    pumps: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChannelRegistry {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus,
            channels: Mutex::new(Channels::default()),
            shutdown,
            pumps: StdMutex::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub async fn request_outbox(&self, to: &ParticipantId) -> Result<Outbox<ProtocolRequest>> {
        let channel = Family::Protocol.channel(to);
        self.bus.ready(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_outbox(&mut channels.requests.outboxes, to.clone(), channel, stop))
    }

    pub async fn request_inbox(&self, me: &ParticipantId) -> Result<Inbox<ProtocolRequest>> {
        if let Some(inbox) = self.cached(|c| c.requests.inboxes.get(me)).await {
            return Ok(inbox);
        }
        let channel = Family::Protocol.channel(me);
        let subscription = self.bus.subscribe(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_inbox(
            &mut channels.requests.inboxes,
            me.clone(),
            channel,
            subscription,
            stop,
        ))
    }

    pub async fn round_outbox(&self, to: &ParticipantId) -> Result<Outbox<RoundMessage>> {
        let channel = Family::Round.channel(to);
        self.bus.ready(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_outbox(&mut channels.rounds.outboxes, to.clone(), channel, stop))
    }

    pub async fn round_inbox(&self, me: &ParticipantId) -> Result<Inbox<RoundMessage>> {
        if let Some(inbox) = self.cached(|c| c.rounds.inboxes.get(me)).await {
            return Ok(inbox);
        }
        let channel = Family::Round.channel(me);
        let subscription = self.bus.subscribe(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_inbox(
            &mut channels.rounds.inboxes,
            me.clone(),
            channel,
            subscription,
            stop,
        ))
    }

    pub async fn info_query_outbox(&self, to: &ParticipantId) -> Result<Outbox<InfoQuery>> {
        let channel = Family::InfoRequest.channel(to);
        self.bus.ready(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_outbox(&mut channels.info_queries.outboxes, to.clone(), channel, stop))
    }

    pub async fn info_query_inbox(&self, me: &ParticipantId) -> Result<Inbox<InfoQuery>> {
        if let Some(inbox) = self.cached(|c| c.info_queries.inboxes.get(me)).await {
            return Ok(inbox);
        }
        let channel = Family::InfoRequest.channel(me);
        let subscription = self.bus.subscribe(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_inbox(
            &mut channels.info_queries.inboxes,
            me.clone(),
            channel,
            subscription,
            stop,
        ))
    }

    pub async fn info_response_outbox(&self, me: &ParticipantId) -> Result<Outbox<InfoResponse>> {
        let channel = Family::InfoResponse.channel(me);
        self.bus.ready(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_outbox(&mut channels.info_responses.outboxes, me.clone(), channel, stop))
    }

    pub async fn info_response_inbox(
        &self,
        from: &ParticipantId,
    ) -> Result<Inbox<InfoResponse>> {
        if let Some(inbox) = self.cached(|c| c.info_responses.inboxes.get(from)).await {
            return Ok(inbox);
        }
        let channel = Family::InfoResponse.channel(from);
        let subscription = self.bus.subscribe(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_inbox(
            &mut channels.info_responses.inboxes,
            from.clone(),
            channel,
            subscription,
            stop,
        ))
    }

    pub async fn result_outbox(
        &self,
        session: &SessionId,
        me: &ParticipantId,
    ) -> Result<Outbox<SessionResult>> {
        let channel = session_channel(session, me);
        self.bus.ready(&channel).await?;
        let mut channels = self.channels.lock().await;
        let scope = channels
            .sessions
            .entry(session.clone())
            .or_insert_with(SessionChannels::new);
        let stop = self.stop(Some(scope.shutdown.subscribe()));
        Ok(self.open_outbox(&mut scope.results.outboxes, me.clone(), channel, stop))
    }

    pub async fn result_inbox(
        &self,
        session: &SessionId,
        from: &ParticipantId,
    ) -> Result<Inbox<SessionResult>> {
        let cached = self
            .cached(|c| c.sessions.get(session)?.results.inboxes.get(from))
            .await;
        if let Some(inbox) = cached {
            return Ok(inbox);
        }
        let channel = session_channel(session, from);
        let subscription = self.bus.subscribe(&channel).await?;
        let mut channels = self.channels.lock().await;
        let scope = channels
            .sessions
            .entry(session.clone())
            .or_insert_with(SessionChannels::new);
        let stop = self.stop(Some(scope.shutdown.subscribe()));
        Ok(self.open_inbox(
            &mut scope.results.inboxes,
            from.clone(),
            channel,
            subscription,
            stop,
        ))
    }

    pub async fn audit_outbox(&self) -> Result<Outbox<AuditEvent>> {
        let channel = Family::Audit.prefix().to_string();
        self.bus.ready(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_outbox(&mut channels.audit.outboxes, (), channel, stop))
    }

    pub async fn audit_inbox(&self) -> Result<Inbox<AuditEvent>> {
        if let Some(inbox) = self.cached(|c| c.audit.inboxes.get(&())).await {
            return Ok(inbox);
        }
        let channel = Family::Audit.prefix().to_string();
        let subscription = self.bus.subscribe(&channel).await?;
        let mut channels = self.channels.lock().await;
        let stop = self.stop(None);
        Ok(self.open_inbox(&mut channels.audit.inboxes, (), channel, subscription, stop))
    }

    /// Drops every cached result channel of `session` and stops their pumps.
    ///
    /// Queued outgoing results are still flushed to the bus.
    pub async fn evict_session(&self, session: &SessionId) {
        let scope = self.channels.lock().await.sessions.remove(session);
        if let Some(scope) = scope {
            scope.shutdown.send_replace(true);
            debug!("evicted channels of session {}", session);
        }
    }

    pub async fn has_session(&self, session: &SessionId) -> bool {
        self.channels.lock().await.sessions.contains_key(session)
    }

    /// Stops every pump and waits for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let pumps: Vec<_> = self.pumps.lock().expect("got lock").drain(..).collect();
        for pump in pumps {
            if let Err(err) = pump.await {
                warn!("channel pump ended abnormally: {}", err);
            }
        }
        let mut channels = self.channels.lock().await;
        *channels = Channels::default();
    }

    fn stop(&self, scope: Option<watch::Receiver<bool>>) -> Stop {
        Stop {
            root: self.shutdown.subscribe(),
            scope,
        }
    }

    fn track(&self, pump: JoinHandle<()>) {
        let mut pumps = self.pumps.lock().expect("got lock");
        pumps.retain(|pump| !pump.is_finished());
        pumps.push(pump);
    }

    async fn cached<T>(
        &self,
        lookup: impl FnOnce(&Channels) -> Option<&Inbox<T>>,
    ) -> Option<Inbox<T>> {
        let channels = self.channels.lock().await;
        lookup(&channels).cloned()
    }

    /// Caller holds the channels lock; the bus has already been readied.
    fn open_outbox<K, T>(
        &self,
        cache: &mut HashMap<K, Outbox<T>>,
        key: K,
        channel: String,
        stop: Stop,
    ) -> Outbox<T>
    where
        K: Eq + Hash,
        T: Serialize + Send + Sync + 'static,
    {
        if let Some(outbox) = cache.get(&key) {
            return outbox.clone();
        }
        debug!("opening output channel {}", channel);

        let (tx, rx) = mpsc::unbounded_channel();
        self.track(tokio::spawn(publish_pump(
            self.bus.clone(),
            channel.clone(),
            rx,
            stop,
        )));

        let outbox = Outbox {
            channel: channel.into(),
            tx,
        };
        cache.insert(key, outbox.clone());
        outbox
    }

    /// Caller holds the channels lock. A racing caller that got there first
    /// wins and `subscription` is dropped.
    fn open_inbox<K, T>(
        &self,
        cache: &mut HashMap<K, Inbox<T>>,
        key: K,
        channel: String,
        subscription: Subscription,
        stop: Stop,
    ) -> Inbox<T>
    where
        K: Eq + Hash,
        T: DeserializeOwned + Send + 'static,
    {
        if let Some(inbox) = cache.get(&key) {
            return inbox.clone();
        }
        debug!("opening input channel {}", channel);

        let (tx, rx) = mpsc::unbounded_channel();
        self.track(tokio::spawn(decode_pump(
            channel.clone(),
            subscription,
            tx,
            stop,
        )));

        let inbox = Inbox {
            channel: channel.into(),
            rx: Arc::new(Mutex::new(rx)),
        };
        cache.insert(key, inbox.clone());
        inbox
    }
}

async fn publish_pump<T: Serialize>(
    bus: Arc<dyn Bus>,
    channel: String,
    mut rx: mpsc::UnboundedReceiver<T>,
    mut stop: Stop,
) {
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            value = rx.recv() => match value {
                Some(value) => publish_one(bus.as_ref(), &channel, &value).await,
                None => return,
            },
        }
    }
    // flush what was queued before the stop
    while let Ok(value) = rx.try_recv() {
        publish_one(bus.as_ref(), &channel, &value).await;
    }
}

async fn publish_one<T: Serialize>(bus: &dyn Bus, channel: &str, value: &T) {
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("could not encode value for {}: {}", channel, err);
            return;
        }
    };
    if let Err(err) = bus.publish(channel, Bytes::from(bytes)).await {
        error!("{}", err);
    }
}

async fn decode_pump<T: DeserializeOwned>(
    channel: String,
    mut subscription: Subscription,
    tx: mpsc::UnboundedSender<T>,
    mut stop: Stop,
) {
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            raw = subscription.next() => {
                let Some(raw) = raw else {
                    warn!("input channel {} lost its subscription", channel);
                    break;
                };
                match serde_json::from_slice::<T>(&raw) {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    // a poison message must not stall the channel
                    Err(err) => debug!("dropping malformed payload on {}: {}", channel, err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::MemoryBus;
    use crate::types::{Artifact, SessionOutcome};

    fn registry() -> (MemoryBus, Arc<ChannelRegistry>) {
        let bus = MemoryBus::new();
        let registry = Arc::new(ChannelRegistry::new(Arc::new(bus.clone())));
        (bus, registry)
    }

    fn round(from: &str, to: Option<&str>, round: u16) -> RoundMessage {
        RoundMessage {
            session_id: SessionId::new("s1"),
            from: from.into(),
            to: to.map(ParticipantId::from),
            round,
            payload: vec![round as u8],
        }
    }

    #[test]
    fn channel_names() {
        let a = ParticipantId::from("a");
        assert_eq!(Family::Round.channel(&a), "internal:messages:a");
        assert_eq!(Family::Protocol.channel(&a), "protocol:messages:a");
        assert_eq!(
            session_channel(&SessionId::new("xyz"), &a),
            "session:messages:xyz:a"
        );
    }

    #[tokio::test]
    async fn typed_values_cross_the_bus() {
        let (_bus, registry) = registry();
        let a = ParticipantId::from("a");
        let inbox = registry.round_inbox(&a).await.unwrap();
        let outbox = registry.round_outbox(&a).await.unwrap();

        for r in 1..=3 {
            outbox.send(round("b", Some("a"), r)).unwrap();
        }
        for r in 1..=3 {
            assert_eq!(inbox.recv().await.unwrap().round, r);
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_opens_one_channel() {
        let (bus, registry) = registry();
        let a = ParticipantId::from("a");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let a = a.clone();
                tokio::spawn(async move { registry.round_inbox(&a).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(bus.subscribers(&Family::Round.channel(&a)), 1);
    }

    /// Memory bus whose dials to one channel never complete.
    struct StalledBus {
        inner: MemoryBus,
        stalled: String,
    }

    #[async_trait::async_trait]
    impl Bus for StalledBus {
        async fn ready(&self, channel: &str) -> Result<()> {
            if channel == self.stalled {
                std::future::pending::<()>().await;
            }
            self.inner.ready(channel).await
        }

        async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription> {
            if channel == self.stalled {
                std::future::pending::<()>().await;
            }
            self.inner.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn stalled_dial_does_not_block_other_channels() {
        let slow = ParticipantId::from("slow");
        let fast = ParticipantId::from("fast");
        let registry = Arc::new(ChannelRegistry::new(Arc::new(StalledBus {
            inner: MemoryBus::new(),
            stalled: Family::Round.channel(&slow),
        })));

        let stuck_inbox = tokio::spawn({
            let registry = registry.clone();
            let slow = slow.clone();
            async move { registry.round_inbox(&slow).await.map(|_| ()) }
        });
        let stuck_outbox = tokio::spawn({
            let registry = registry.clone();
            let slow = slow.clone();
            async move { registry.round_outbox(&slow).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let opened = tokio::time::timeout(Duration::from_secs(1), async {
            let inbox = registry.round_inbox(&fast).await.unwrap();
            let outbox = registry.round_outbox(&fast).await.unwrap();
            outbox.send(round("slow", Some("fast"), 1)).unwrap();
            inbox.recv().await
        })
        .await
        .unwrap();
        assert_eq!(opened, Some(round("slow", Some("fast"), 1)));
        assert!(!stuck_inbox.is_finished());
        assert!(!stuck_outbox.is_finished());
        stuck_inbox.abort();
        stuck_outbox.abort();
    }

    #[tokio::test]
    async fn malformed_payloads_are_skipped() {
        let (bus, registry) = registry();
        let a = ParticipantId::from("a");
        let inbox = registry.round_inbox(&a).await.unwrap();
        let channel = Family::Round.channel(&a);

        bus.publish(&channel, Bytes::from_static(b"not json"))
            .await
            .unwrap();
        bus.publish(&channel, Bytes::from_static(b"{\"round\":1}"))
            .await
            .unwrap();
        let valid = serde_json::to_vec(&round("b", None, 7)).unwrap();
        bus.publish(&channel, Bytes::from(valid)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, round("b", None, 7));
    }

    #[tokio::test]
    async fn racing_waiters_consume_a_result_once() {
        let (_bus, registry) = registry();
        let session = SessionId::new("s1");
        let a = ParticipantId::from("a");
        let inbox = registry.result_inbox(&session, &a).await.unwrap();
        let outbox = registry.result_outbox(&session, &a).await.unwrap();

        let result = SessionResult {
            session_id: session.clone(),
            participant: a.clone(),
            outcome: SessionOutcome::Completed(Artifact::Key {
                address: "0xaa".to_string(),
                public_key: vec![1; 32],
            }),
        };
        outbox.send(result.clone()).unwrap();
        outbox.send(result.clone()).unwrap();

        let first = inbox.clone();
        let second = inbox.clone();
        let (x, y) = tokio::join!(
            tokio::time::timeout(Duration::from_secs(1), first.recv()),
            tokio::time::timeout(Duration::from_secs(1), second.recv()),
        );
        // each publish is seen by exactly one waiter, and both see the same value
        assert_eq!(x.unwrap().unwrap(), result);
        assert_eq!(y.unwrap().unwrap(), result);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), inbox.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn eviction_releases_session_channels() {
        let (bus, registry) = registry();
        let session = SessionId::new("s9");
        let a = ParticipantId::from("a");
        let inbox = registry.result_inbox(&session, &a).await.unwrap();
        assert!(registry.has_session(&session).await);

        registry.evict_session(&session).await;
        assert!(!registry.has_session(&session).await);

        // the pump exits and drops its subscription
        assert_eq!(inbox.recv().await, None);
        assert_eq!(bus.subscribers(&session_channel(&session, &a)), 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_and_stops_pumps() {
        let (bus, registry) = registry();
        let a = ParticipantId::from("a");
        let mut raw = bus.subscribe(Family::Audit.prefix()).await.unwrap();
        let audit = registry.audit_outbox().await.unwrap();
        let inbox = registry.round_inbox(&a).await.unwrap();

        audit
            .send(AuditEvent::new(
                &SessionId::new("s1"),
                "a",
                crate::types::ProtocolKind::Keygen,
                0,
                "protocol initialized",
            ))
            .unwrap();
        registry.shutdown().await;

        assert!(raw.next().await.is_some());
        assert_eq!(inbox.recv().await, None);
        assert!(audit.send(AuditEvent::new(
            &SessionId::new("s1"),
            "a",
            crate::types::ProtocolKind::Keygen,
            0,
            "late",
        ))
        .is_err());
    }
}
