//! Protocol engine seam.
//!
//! The relay never looks inside a protocol: it starts a [`ProtocolHandler`],
//! pumps [`RoundMessage`]s in and out of it and finally asks for its
//! [`ProtocolOutput`]. [`SchnorrEngine`] is the engine shipped with the
//! crate: threshold Schnorr signatures over Ristretto255.
use std::collections::VecDeque;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{ParticipantId, ProtocolKind, RoundMessage, SessionId};

mod dkg;
mod keys;
mod sign;

pub use keys::{address_of, verify_signature, KeyShare, PreSignature, Signature};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("malformed payload from {0}")]
    MalformedPayload(ParticipantId),

    #[error("unexpected message from {from} in round {round}")]
    UnexpectedMessage { from: ParticipantId, round: u16 },

    #[error("invalid proof of knowledge from {0}")]
    InvalidProof(ParticipantId),

    #[error("share from {0} does not match its commitments")]
    InvalidShare(ParticipantId),

    #[error("partial signature from {0} does not verify")]
    InvalidPartialSignature(ParticipantId),

    #[error("aggregated signature does not verify")]
    InvalidSignature,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("protocol ended before producing a result")]
    Incomplete,
}

/// Terminal artifact of a protocol run, one variant per family of protocol kinds.
#[derive(Debug, Clone)]
pub enum ProtocolOutput {
    Key(KeyShare),
    Signature(Signature),
    PreSignature(PreSignature),
}

/// Everything a protocol instance needs to know about its session.
#[derive(Debug, Clone)]
pub struct SessionScope {
    pub session_id: SessionId,
    pub me: ParticipantId,
    /// canonical participant set of the session
    pub participants: Vec<ParticipantId>,
}

/// Protocol kind plus its kind-specific inputs.
#[derive(Debug, Clone)]
pub enum Start {
    Keygen {
        threshold: usize,
    },
    Refresh {
        key: KeyShare,
    },
    Sign {
        key: KeyShare,
        message_hash: Vec<u8>,
    },
    PreSign {
        key: KeyShare,
    },
    SignOnline {
        key: KeyShare,
        presignature: PreSignature,
        message_hash: Vec<u8>,
    },
}

impl Start {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Start::Keygen { .. } => ProtocolKind::Keygen,
            Start::Refresh { .. } => ProtocolKind::Refresh,
            Start::Sign { .. } => ProtocolKind::Sign,
            Start::PreSign { .. } => ProtocolKind::PreSign,
            Start::SignOnline { .. } => ProtocolKind::SignOnline,
        }
    }
}

/// One running protocol instance.
#[async_trait::async_trait]
pub trait ProtocolHandler: Send {
    /// Next message to deliver, or `None` once the instance has terminated
    /// and every queued message has been handed out.
    ///
    /// Must be cancel safe.
    async fn outgoing(&mut self) -> Option<RoundMessage>;

    /// Feeds a peer message. Validation failures are reported by [`result`](Self::result).
    fn accept(&mut self, msg: RoundMessage);

    fn result(self: Box<Self>) -> Result<ProtocolOutput, EngineError>;
}

pub trait ProtocolEngine: Send + Sync {
    fn start(
        &self,
        scope: SessionScope,
        start: Start,
    ) -> Result<Box<dyn ProtocolHandler>, EngineError>;
}

/// Threshold Schnorr over Ristretto255.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchnorrEngine;

impl ProtocolEngine for SchnorrEngine {
    fn start(
        &self,
        scope: SessionScope,
        start: Start,
    ) -> Result<Box<dyn ProtocolHandler>, EngineError> {
        if !scope.participants.contains(&scope.me) {
            return Err(EngineError::InvalidParameters(format!(
                "{} is not a session participant",
                scope.me
            )));
        }
        match start {
            Start::Keygen { threshold } => {
                Driver::start(scope.clone(), dkg::Dkg::keygen(&scope, threshold)?)
            }
            Start::Refresh { key } => Driver::start(scope.clone(), dkg::Dkg::refresh(&scope, key)?),
            Start::Sign { key, message_hash } => {
                Driver::start(scope.clone(), sign::Signing::sign(&scope, key, message_hash)?)
            }
            Start::PreSign { key } => {
                Driver::start(scope.clone(), sign::Signing::presign(&scope, key)?)
            }
            Start::SignOnline {
                key,
                presignature,
                message_hash,
            } => Driver::start(
                scope.clone(),
                sign::Signing::online(&scope, key, presignature, message_hash)?,
            ),
        }
    }
}

/// A message to emit: recipient (`None` = broadcast), round and body.
pub(crate) struct Outgoing<M> {
    to: Option<ParticipantId>,
    round: u16,
    body: M,
}

impl<M> Outgoing<M> {
    pub(crate) fn broadcast(round: u16, body: M) -> Self {
        Outgoing {
            to: None,
            round,
            body,
        }
    }

    pub(crate) fn to(to: ParticipantId, round: u16, body: M) -> Self {
        Outgoing {
            to: Some(to),
            round,
            body,
        }
    }
}

pub(crate) enum Step<M> {
    Continue(Vec<Outgoing<M>>),
    Done(Vec<Outgoing<M>>, ProtocolOutput),
}

/// Round logic of one protocol, independent of message plumbing.
pub(crate) trait Rounds: Send + 'static {
    type Message: Serialize + DeserializeOwned + Send;

    fn start(&mut self, scope: &SessionScope) -> Result<Step<Self::Message>, EngineError>;

    fn receive(
        &mut self,
        scope: &SessionScope,
        from: &ParticipantId,
        msg: Self::Message,
    ) -> Result<Step<Self::Message>, EngineError>;
}

/// Adapts a [`Rounds`] implementation to [`ProtocolHandler`]: queues encoded
/// messages, drops foreign traffic and remembers the terminal outcome.
struct Driver<R: Rounds> {
    scope: SessionScope,
    rounds: R,
    queue: VecDeque<RoundMessage>,
    outcome: Option<Result<ProtocolOutput, EngineError>>,
}

impl<R: Rounds> Driver<R> {
    fn start(scope: SessionScope, mut rounds: R) -> Result<Box<dyn ProtocolHandler>, EngineError> {
        let step = rounds.start(&scope)?;
        let mut driver = Driver {
            scope,
            rounds,
            queue: VecDeque::new(),
            outcome: None,
        };
        driver.apply(Ok(step));
        Ok(Box::new(driver))
    }

    fn apply(&mut self, step: Result<Step<R::Message>, EngineError>) {
        match step {
            Ok(Step::Continue(out)) => self.enqueue(out),
            Ok(Step::Done(out, output)) => {
                self.enqueue(out);
                self.outcome = Some(Ok(output));
            }
            Err(err) => {
                // nothing further is sent once the instance has failed
                self.queue.clear();
                self.outcome = Some(Err(err));
            }
        }
    }

    fn enqueue(&mut self, out: Vec<Outgoing<R::Message>>) {
        for Outgoing { to, round, body } in out {
            match serde_json::to_vec(&body) {
                Ok(payload) => self.queue.push_back(RoundMessage {
                    session_id: self.scope.session_id.clone(),
                    from: self.scope.me.clone(),
                    to,
                    round,
                    payload,
                }),
                Err(_) => {
                    self.outcome = Some(Err(EngineError::MalformedPayload(self.scope.me.clone())));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<R: Rounds> ProtocolHandler for Driver<R> {
    async fn outgoing(&mut self) -> Option<RoundMessage> {
        if let Some(msg) = self.queue.pop_front() {
            return Some(msg);
        }
        if self.outcome.is_some() {
            return None;
        }
        // woken up only by the caller dropping this future
        std::future::pending::<()>().await;
        None
    }

    fn accept(&mut self, msg: RoundMessage) {
        if self.outcome.is_some() {
            return;
        }
        if msg.session_id != self.scope.session_id
            || msg.from == self.scope.me
            || !self.scope.participants.contains(&msg.from)
            || !msg.is_for(&self.scope.me)
        {
            debug!(
                "engine ignores message from {} in round {}",
                msg.from, msg.round
            );
            return;
        }
        let step = match serde_json::from_slice::<R::Message>(&msg.payload) {
            Ok(body) => self.rounds.receive(&self.scope, &msg.from, body),
            Err(_) => Err(EngineError::MalformedPayload(msg.from.clone())),
        };
        self.apply(step);
    }

    fn result(self: Box<Self>) -> Result<ProtocolOutput, EngineError> {
        self.outcome.unwrap_or(Err(EngineError::Incomplete))
    }
}
