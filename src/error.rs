use thiserror::Error;

use crate::engine::EngineError;
use crate::types::{ParticipantId, SessionId};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Transport error on `{channel}`: {reason}")]
    Transport { channel: String, reason: String },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Channel `{0}` closed")]
    ChannelClosed(String),

    #[error("Session {session} timed out waiting for {missing:?}")]
    Timeout {
        session: SessionId,
        missing: Vec<ParticipantId>,
    },

    #[error("Participant {participant} failed session {session}: {reason}")]
    ParticipantFailed {
        session: SessionId,
        participant: ParticipantId,
        reason: String,
    },

    #[error("Participants disagree on the result of session {0}")]
    InconsistentResults(SessionId),

    #[error("Signature from session {0} does not verify")]
    InvalidSignature(SessionId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown key handle {0}")]
    UnknownKey(String),

    #[error("Store error: {0}")]
    Store(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl RelayError {
    pub(crate) fn transport(channel: &str, err: impl std::fmt::Display) -> Self {
        RelayError::Transport {
            channel: channel.to_string(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
