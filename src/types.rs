//! Envelope types exchanged over the bus.
//!
//! Every value here crosses process boundaries as JSON, so each type derives
//! `Serialize`/`Deserialize` and must round-trip losslessly.
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

pub const SESSION_ID_LEN: usize = 22;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        ParticipantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        ParticipantId::new(id)
    }
}

/// Sorts and deduplicates a participant set.
///
/// Share indices are derived from positions in this ordering, so every party
/// has to see the same list.
pub fn canonical_participants(
    participants: impl IntoIterator<Item = ParticipantId>,
) -> Vec<ParticipantId> {
    let mut participants: Vec<_> = participants.into_iter().collect();
    participants.sort();
    participants.dedup();
    participants
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mints a fresh short token for one protocol invocation.
    pub fn generate() -> Self {
        let token = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_ID_LEN)
            .map(char::from)
            .collect();
        SessionId(token)
    }

    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    #[serde(rename = "protocol/dkg")]
    Keygen,
    #[serde(rename = "protocol/dkf")]
    Refresh,
    #[serde(rename = "protocol/sign")]
    Sign,
    #[serde(rename = "protocol/presign")]
    PreSign,
    #[serde(rename = "protocol/signonline")]
    SignOnline,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::Keygen => "keygen",
            ProtocolKind::Refresh => "refresh",
            ProtocolKind::Sign => "sign",
            ProtocolKind::PreSign => "presign",
            ProtocolKind::SignOnline => "sign-online",
        };
        f.write_str(name)
    }
}

/// Start instruction multicast identically to every participant of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRequest {
    pub kind: ProtocolKind,
    pub participants: Vec<ParticipantId>,
    pub threshold: usize,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub message_hash: Option<Vec<u8>>,
}

/// One unit of engine output. An empty `to` is a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMessage {
    pub session_id: SessionId,
    pub from: ParticipantId,
    pub to: Option<ParticipantId>,
    pub round: u16,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
}

impl RoundMessage {
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Whether `id` should receive this message.
    pub fn is_for(&self, id: &ParticipantId) -> bool {
        match &self.to {
            Some(to) => to == id,
            None => &self.from != id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Artifact {
    Key {
        address: String,
        #[serde(with = "hex::serde")]
        public_key: Vec<u8>,
    },
    Signature {
        #[serde(with = "hex::serde")]
        signature: Vec<u8>,
        #[serde(with = "hex::serde")]
        public_key: Vec<u8>,
    },
    PreSignature {
        address: String,
        signers: Vec<ParticipantId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    Completed(Artifact),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: SessionId,
    pub participant: ParticipantId,
    pub outcome: SessionOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InfoKind {
    #[serde(rename = "info/online")]
    Online,
    #[serde(rename = "info/configs")]
    Configs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoQuery {
    pub request_id: String,
    pub kind: InfoKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub request_id: String,
    pub kind: InfoKind,
    pub participant: ParticipantId,
    pub online: bool,
    #[serde(default)]
    pub configs: Vec<ConfigMessage>,
}

/// One key handle as reported in an inventory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigMessage {
    pub address: String,
    pub participants: Vec<ParticipantId>,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub session_id: SessionId,
    pub participant: String,
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub round: u16,
    pub message: String,
    pub timestamp: u64,
}

impl AuditEvent {
    pub fn new(
        session_id: &SessionId,
        participant: impl Into<String>,
        protocol: ProtocolKind,
        round: u16,
        message: impl Into<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        AuditEvent {
            session_id: session_id.clone(),
            participant: participant.into(),
            protocol,
            round,
            message: message.into(),
            timestamp,
        }
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
