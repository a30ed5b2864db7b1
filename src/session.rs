//! Session loop: pumps one protocol instance of one participant.
//!
//! The loop selects between the engine's outgoing messages and the
//! participant's round inbox until the engine reports it is done or the
//! session deadline passes. Whatever happens, exactly one [`SessionResult`]
//! is published for the session.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    engine::{ProtocolHandler, ProtocolOutput, SessionScope},
    registry::{ChannelRegistry, Inbox, Outbox},
    types::{
        Artifact, AuditEvent, ParticipantId, ProtocolKind, RoundMessage, SessionId,
        SessionOutcome, SessionResult,
    },
    RelayError, Result,
};

pub const DEFAULT_SESSION_DEADLINE: Duration = Duration::from_secs(60);

pub const DEADLINE_EXCEEDED: &str = "session deadline exceeded";

const FINISHED_SESSIONS_KEPT: usize = 256;

/// Sessions held back at once, and messages held back per session.
const PENDING_SESSIONS_KEPT: usize = 64;
const PENDING_MESSAGES_KEPT: usize = 256;

#[derive(Default)]
struct Backlog {
    pending: HashMap<SessionId, Vec<RoundMessage>>,
    pending_order: VecDeque<SessionId>,
    finished: HashSet<SessionId>,
    finished_order: VecDeque<SessionId>,
}

impl Backlog {
    fn hold(&mut self, msg: RoundMessage) {
        let session = msg.session_id.clone();
        if !self.pending.contains_key(&session) {
            // the oldest session nobody started makes room
            while self.pending_order.len() >= PENDING_SESSIONS_KEPT {
                if let Some(oldest) = self.pending_order.pop_front() {
                    debug!("dropping backlog of session {} that never started", oldest);
                    self.pending.remove(&oldest);
                }
            }
            self.pending_order.push_back(session.clone());
        }
        let held = self.pending.entry(session).or_default();
        if held.len() < PENDING_MESSAGES_KEPT {
            held.push(msg);
        } else {
            debug!("backlog of session {} is full", msg.session_id);
        }
    }

    fn release(&mut self, session: &SessionId) {
        self.pending.remove(session);
        self.pending_order.retain(|pending| pending != session);
    }
}

/// A participant's round inbox, shared by its consecutive sessions.
///
/// Peers may start a session before this participant does, and stragglers
/// of a finished session keep arriving after it ended. Messages for a
/// session that has not started yet are held back until it does; messages
/// for a finished session are dropped.
pub struct RoundMailbox {
    inbox: Inbox<RoundMessage>,
    backlog: Mutex<Backlog>,
}

impl RoundMailbox {
    pub fn new(inbox: Inbox<RoundMessage>) -> Self {
        return Self {
            inbox,
            backlog: Mutex::new(Backlog::default()),
        };
    }

    pub fn channel(&self) -> &str {
        self.inbox.channel()
    }

    /// Next round message of `session`. `None` once the inbox is gone.
    ///
    /// Cancel safe.
    pub async fn next_for(&self, session: &SessionId) -> Option<RoundMessage> {
        if let Some(msg) = self.take_pending(session) {
            return Some(msg);
        }
        loop {
            let msg = self.inbox.recv().await?;
            if &msg.session_id == session {
                return Some(msg);
            }
            let mut backlog = self.backlog.lock().expect("got lock");
            if backlog.finished.contains(&msg.session_id) {
                debug!(
                    "dropping round {} message of finished session {}",
                    msg.round, msg.session_id
                );
            } else {
                backlog.hold(msg);
            }
        }
    }

    /// Marks `session` as done and discards what it left behind.
    pub fn finish(&self, session: &SessionId) {
        let mut backlog = self.backlog.lock().expect("got lock");
        backlog.release(session);
        if backlog.finished.insert(session.clone()) {
            backlog.finished_order.push_back(session.clone());
        }
        while backlog.finished_order.len() > FINISHED_SESSIONS_KEPT {
            if let Some(oldest) = backlog.finished_order.pop_front() {
                backlog.finished.remove(&oldest);
            }
        }
    }

    /// Number of held back messages across all sessions.
    pub fn backlog_len(&self) -> usize {
        let backlog = self.backlog.lock().expect("got lock");
        backlog.pending.values().map(Vec::len).sum()
    }

    fn take_pending(&self, session: &SessionId) -> Option<RoundMessage> {
        let mut backlog = self.backlog.lock().expect("got lock");
        let pending = backlog.pending.get_mut(session)?;
        let msg = if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        };
        if pending.is_empty() {
            backlog.release(session);
        }
        msg
    }
}

/// One participant's run of one protocol instance.
pub struct Session {
    registry: Arc<ChannelRegistry>,
    scope: SessionScope,
    kind: ProtocolKind,
    deadline: Duration,
}

impl Session {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        scope: SessionScope,
        kind: ProtocolKind,
        deadline: Duration,
    ) -> Self {
        return Self {
            registry,
            scope,
            kind,
            deadline,
        };
    }

    pub fn id(&self) -> &SessionId {
        &self.scope.session_id
    }

    /// Drives `handler` to termination and publishes the session result.
    ///
    /// `finish` turns the engine output into the reported artifact (and may
    /// persist it); an error from it fails the session. Only a failure to
    /// open or use the result channel is returned as an error.
    pub async fn run<F>(
        self,
        mailbox: &RoundMailbox,
        mut handler: Box<dyn ProtocolHandler>,
        finish: F,
    ) -> Result<SessionOutcome>
    where
        F: FnOnce(ProtocolOutput) -> std::result::Result<Artifact, String>,
    {
        let span = info_span!(
            "session",
            session = %self.scope.session_id,
            participant = %self.scope.me,
            protocol = %self.kind,
        );
        async move {
            let results = self
                .registry
                .result_outbox(&self.scope.session_id, &self.scope.me)
                .await?;
            let audit = self.registry.audit_outbox().await?;
            self.audit(&audit, 0, "protocol initialized");

            let driven =
                tokio::time::timeout(self.deadline, self.drive(mailbox, &mut handler, &audit))
                    .await;
            let timed_out = driven.is_err();
            let outcome = match driven {
                Ok(Ok(())) => match handler.result() {
                    Ok(output) => match finish(output) {
                        Ok(artifact) => SessionOutcome::Completed(artifact),
                        Err(reason) => SessionOutcome::Failed(reason),
                    },
                    Err(err) => SessionOutcome::Failed(err.to_string()),
                },
                Ok(Err(err)) => SessionOutcome::Failed(err.to_string()),
                Err(_) => SessionOutcome::Failed(DEADLINE_EXCEEDED.to_string()),
            };
            mailbox.finish(&self.scope.session_id);

            match &outcome {
                SessionOutcome::Completed(_) => info!("session completed"),
                SessionOutcome::Failed(reason) => warn!("session failed: {}", reason),
            }
            results.send(SessionResult {
                session_id: self.scope.session_id.clone(),
                participant: self.scope.me.clone(),
                outcome: outcome.clone(),
            })?;
            if timed_out {
                self.registry.evict_session(&self.scope.session_id).await;
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Publishes a failure for a session whose engine never started.
    pub async fn reject(self, mailbox: &RoundMailbox, reason: String) -> Result<SessionOutcome> {
        let span = info_span!(
            "session",
            session = %self.scope.session_id,
            participant = %self.scope.me,
            protocol = %self.kind,
        );
        async move {
            warn!("cannot start session: {}", reason);
            let results = self
                .registry
                .result_outbox(&self.scope.session_id, &self.scope.me)
                .await?;
            mailbox.finish(&self.scope.session_id);
            let outcome = SessionOutcome::Failed(reason);
            results.send(SessionResult {
                session_id: self.scope.session_id.clone(),
                participant: self.scope.me.clone(),
                outcome: outcome.clone(),
            })?;
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        mailbox: &RoundMailbox,
        handler: &mut Box<dyn ProtocolHandler>,
        audit: &Outbox<AuditEvent>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                outgoing = handler.outgoing() => match outgoing {
                    Some(msg) => self.deliver(msg, audit).await?,
                    None => {
                        self.audit(audit, 0, "all rounds completed");
                        return Ok(());
                    }
                },
                incoming = mailbox.next_for(&self.scope.session_id) => match incoming {
                    Some(msg) => {
                        let entry = format!("received message from: {}", msg.from);
                        self.audit(audit, msg.round, entry);
                        handler.accept(msg);
                    }
                    None => return Err(RelayError::ChannelClosed(mailbox.channel().to_string())),
                },
            }
        }
    }

    fn recipients(&self, msg: &RoundMessage) -> Vec<ParticipantId> {
        match &msg.to {
            Some(to) => vec![to.clone()],
            None => self
                .scope
                .participants
                .iter()
                .filter(|p| **p != self.scope.me)
                .cloned()
                .collect(),
        }
    }

    async fn deliver(&self, msg: RoundMessage, audit: &Outbox<AuditEvent>) -> Result<()> {
        let target = match &msg.to {
            Some(to) => to.to_string(),
            None => "all".to_string(),
        };
        for to in self.recipients(&msg) {
            self.registry.round_outbox(&to).await?.send(msg.clone())?;
        }
        self.audit(audit, msg.round, format!("sending message to: {}", target));
        Ok(())
    }

    fn audit(&self, audit: &Outbox<AuditEvent>, round: u16, message: impl Into<String>) {
        let message = message.into();
        debug!(round, "{}", message);
        let event = AuditEvent::new(
            &self.scope.session_id,
            self.scope.me.as_str(),
            self.kind,
            round,
            message,
        );
        if let Err(err) = audit.send(event) {
            debug!("audit event lost: {}", err);
        }
    }
}
