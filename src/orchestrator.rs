//! Orchestrator
//!
//! Starts protocol sessions across a participant set and collects what every
//! participant reports. A session only yields a result once every participant
//! has published one (or the deadline passes), and signing results are
//! checked before they are handed out.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    engine::verify_signature,
    registry::ChannelRegistry,
    types::{
        canonical_participants, Artifact, AuditEvent, ConfigMessage, InfoKind, InfoQuery,
        InfoResponse, ParticipantId, ProtocolKind, ProtocolRequest, SessionId, SessionOutcome,
        SessionResult,
    },
    RelayError, Result,
};

/// Participant name used on audit events the orchestrator emits.
pub const INITIATOR: &str = "initiator";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyOutput {
    pub session_id: SessionId,
    pub address: String,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureOutput {
    pub session_id: SessionId,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreSignOutput {
    pub session_id: SessionId,
    pub address: String,
    pub signers: Vec<ParticipantId>,
}

struct KeyRecord {
    public_key: Vec<u8>,
    threshold: usize,
}

#[derive(Default)]
struct OrchestratorState {
    keys: HashMap<String, KeyRecord>,
}

pub struct Orchestrator {
    registry: Arc<ChannelRegistry>,
    deadline: Duration,
    state: Arc<Mutex<OrchestratorState>>,
    // one info query in flight at a time; responders share one channel each
    queries: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ChannelRegistry>, deadline: Duration) -> Self {
        return Self {
            registry,
            deadline,
            state: Arc::new(Mutex::new(OrchestratorState::default())),
            queries: tokio::sync::Mutex::new(()),
        };
    }

    /// Public key recorded for `address` by an earlier key generation.
    pub fn recorded_key(&self, address: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().expect("got lock");
        state.keys.get(address).map(|record| record.public_key.clone())
    }

    pub async fn generate_keys(
        &self,
        participants: &[ParticipantId],
        threshold: usize,
    ) -> Result<KeyOutput> {
        let participants = participant_set(participants)?;
        let threshold = threshold.max(1);
        if threshold >= participants.len() {
            return Err(RelayError::InvalidRequest(format!(
                "threshold {} needs more than {} participants",
                threshold,
                participants.len()
            )));
        }
        let (session_id, results) = self
            .run_protocol(ProtocolKind::Keygen, &participants, threshold, None, None)
            .await?;
        let (address, public_key) = match agreed_artifact(&session_id, &results)? {
            Artifact::Key {
                address,
                public_key,
            } => (address, public_key),
            _ => return Err(RelayError::InconsistentResults(session_id)),
        };

        let mut state = self.state.lock().expect("got lock");
        state.keys.insert(
            address.clone(),
            KeyRecord {
                public_key: public_key.clone(),
                threshold,
            },
        );
        Ok(KeyOutput {
            session_id,
            address,
            public_key,
        })
    }

    /// Re-randomises every share of `address`. Only completion is checked.
    pub async fn refresh_keys(
        &self,
        participants: &[ParticipantId],
        address: &str,
    ) -> Result<KeyOutput> {
        let participants = participant_set(participants)?;
        let address = key_address(address)?;
        let threshold = self.threshold_of(address);
        let (session_id, results) = self
            .run_protocol(
                ProtocolKind::Refresh,
                &participants,
                threshold,
                Some(address),
                None,
            )
            .await?;
        match first_artifact(&results) {
            Some(Artifact::Key {
                address,
                public_key,
            }) => Ok(KeyOutput {
                session_id,
                address: address.clone(),
                public_key: public_key.clone(),
            }),
            _ => Err(RelayError::InconsistentResults(session_id)),
        }
    }

    pub async fn sign(
        &self,
        participants: &[ParticipantId],
        address: &str,
        message_hash: &[u8],
    ) -> Result<SignatureOutput> {
        self.signature_session(ProtocolKind::Sign, participants, address, message_hash)
            .await
    }

    /// Runs the nonce round of a signature ahead of time.
    pub async fn pre_sign(
        &self,
        participants: &[ParticipantId],
        address: &str,
    ) -> Result<PreSignOutput> {
        let participants = participant_set(participants)?;
        let address = key_address(address)?;
        let threshold = self.threshold_of(address);
        let (session_id, results) = self
            .run_protocol(
                ProtocolKind::PreSign,
                &participants,
                threshold,
                Some(address),
                None,
            )
            .await?;
        match first_artifact(&results) {
            Some(Artifact::PreSignature { address, signers }) => Ok(PreSignOutput {
                session_id,
                address: address.clone(),
                signers: signers.clone(),
            }),
            _ => Err(RelayError::InconsistentResults(session_id)),
        }
    }

    /// Completes a signature over the pre-signature the participants hold for `address`.
    pub async fn sign_online(
        &self,
        participants: &[ParticipantId],
        address: &str,
        message_hash: &[u8],
    ) -> Result<SignatureOutput> {
        self.signature_session(ProtocolKind::SignOnline, participants, address, message_hash)
            .await
    }

    /// Liveness of each participant. Silence until the deadline counts as offline.
    pub async fn get_online(
        &self,
        participants: &[ParticipantId],
    ) -> Result<BTreeMap<ParticipantId, bool>> {
        let participants = participant_set(participants)?;
        let responses = self.ask(&participants, InfoKind::Online).await?;
        Ok(participants
            .into_iter()
            .map(|p| {
                let online = responses.get(&p).map_or(false, |r| r.online);
                (p, online)
            })
            .collect())
    }

    /// Key handles that every one of their holders still reports.
    pub async fn get_configs(&self, participants: &[ParticipantId]) -> Result<Vec<ConfigMessage>> {
        let participants = participant_set(participants)?;
        let responses = self.ask(&participants, InfoKind::Configs).await?;
        let reports: Vec<_> = responses
            .into_iter()
            .map(|(participant, response)| (participant, response.configs))
            .collect();
        Ok(reconcile_configs(&reports))
    }

    async fn signature_session(
        &self,
        kind: ProtocolKind,
        participants: &[ParticipantId],
        address: &str,
        message_hash: &[u8],
    ) -> Result<SignatureOutput> {
        let participants = participant_set(participants)?;
        let address = key_address(address)?;
        let threshold = self.threshold_of(address);
        let (session_id, results) = self
            .run_protocol(
                kind,
                &participants,
                threshold,
                Some(address),
                Some(message_hash.to_vec()),
            )
            .await?;
        let (signature, public_key) = match agreed_artifact(&session_id, &results)? {
            Artifact::Signature {
                signature,
                public_key,
            } => (signature, public_key),
            _ => return Err(RelayError::InconsistentResults(session_id)),
        };

        if !verify_signature(&public_key, message_hash, &signature) {
            return Err(RelayError::InvalidSignature(session_id));
        }
        if let Some(recorded) = self.recorded_key(address) {
            if recorded != public_key {
                warn!("session {} signed under an unexpected key", session_id);
                return Err(RelayError::InvalidSignature(session_id));
            }
        }
        Ok(SignatureOutput {
            session_id,
            signature,
            public_key,
        })
    }

    fn threshold_of(&self, address: &str) -> usize {
        let state = self.state.lock().expect("got lock");
        state.keys.get(address).map_or(0, |record| record.threshold)
    }

    /// Publishes the request to every participant and waits for all results.
    ///
    /// Every returned result completed. The first failure to arrive ends the
    /// wait and is returned as an error instead.
    async fn run_protocol(
        &self,
        kind: ProtocolKind,
        participants: &[ParticipantId],
        threshold: usize,
        address: Option<&str>,
        message_hash: Option<Vec<u8>>,
    ) -> Result<(SessionId, BTreeMap<ParticipantId, SessionResult>)> {
        let session_id = SessionId::generate();
        let request = ProtocolRequest {
            kind,
            participants: participants.to_vec(),
            threshold,
            session_id: session_id.clone(),
            address: address.map(str::to_string),
            message_hash,
        };
        let span = info_span!("orchestrate", session = %session_id, protocol = %kind);
        async move {
            let collected = self.barrier(&request).await;
            self.registry.evict_session(&session_id).await;
            let results = collected?;
            info!("all {} participant(s) completed", results.len());
            self.audit(&session_id, kind, "protocol successfully completed")
                .await;
            Ok((session_id, results))
        }
        .instrument(span)
        .await
    }

    async fn barrier(
        &self,
        request: &ProtocolRequest,
    ) -> Result<BTreeMap<ParticipantId, SessionResult>> {
        self.audit(&request.session_id, request.kind, "started protocol initialization")
            .await;
        let deadline = Instant::now() + self.deadline;
        let mut legs: FuturesUnordered<_> = request
            .participants
            .iter()
            .map(|participant| async move {
                (participant.clone(), self.leg(request, participant).await)
            })
            .collect();

        let mut results = BTreeMap::new();
        while results.len() < request.participants.len() {
            match tokio::time::timeout_at(deadline, legs.next()).await {
                Ok(Some((participant, Ok(result)))) => {
                    debug!("result from {}", participant);
                    // peers of a failed participant cannot finish, so stop waiting
                    if let SessionOutcome::Failed(reason) = result.outcome {
                        warn!("{} failed: {}", participant, reason);
                        return Err(RelayError::ParticipantFailed {
                            session: request.session_id.clone(),
                            participant,
                            reason,
                        });
                    }
                    results.insert(participant, result);
                }
                Ok(Some((_, Err(err)))) => return Err(err),
                Ok(None) => break,
                Err(_) => {
                    let missing: Vec<_> = request
                        .participants
                        .iter()
                        .filter(|p| !results.contains_key(*p))
                        .cloned()
                        .collect();
                    warn!("deadline passed without results from {:?}", missing);
                    return Err(RelayError::Timeout {
                        session: request.session_id.clone(),
                        missing,
                    });
                }
            }
        }
        Ok(results)
    }

    async fn leg(
        &self,
        request: &ProtocolRequest,
        participant: &ParticipantId,
    ) -> Result<SessionResult> {
        // subscribe first: a result published before that would be lost
        let inbox = self
            .registry
            .result_inbox(&request.session_id, participant)
            .await?;
        self.registry
            .request_outbox(participant)
            .await?
            .send(request.clone())?;
        loop {
            let result = inbox
                .recv()
                .await
                .ok_or_else(|| RelayError::ChannelClosed(inbox.channel().to_string()))?;
            if result.session_id == request.session_id && &result.participant == participant {
                return Ok(result);
            }
            debug!("ignoring misrouted result on {}", inbox.channel());
        }
    }

    async fn ask(
        &self,
        participants: &[ParticipantId],
        kind: InfoKind,
    ) -> Result<BTreeMap<ParticipantId, InfoResponse>> {
        let _serialized = self.queries.lock().await;
        let query = InfoQuery {
            request_id: SessionId::generate().to_string(),
            kind,
        };
        let deadline = Instant::now() + self.deadline;

        let mut asks: FuturesUnordered<_> = participants
            .iter()
            .map(|participant| self.ask_one(participant, &query, deadline))
            .collect();
        let mut responses = BTreeMap::new();
        while let Some(answer) = asks.next().await {
            if let Some(response) = answer? {
                responses.insert(response.participant.clone(), response);
            }
        }
        Ok(responses)
    }

    /// `None` when `participant` stays silent until `deadline`.
    async fn ask_one(
        &self,
        participant: &ParticipantId,
        query: &InfoQuery,
        deadline: Instant,
    ) -> Result<Option<InfoResponse>> {
        let inbox = self.registry.info_response_inbox(participant).await?;
        self.registry
            .info_query_outbox(participant)
            .await?
            .send(query.clone())?;
        loop {
            match tokio::time::timeout_at(deadline, inbox.recv()).await {
                Ok(Some(response)) if response.request_id == query.request_id => {
                    return Ok(Some(response));
                }
                Ok(Some(stale)) => debug!("discarding stale response {}", stale.request_id),
                Ok(None) | Err(_) => return Ok(None),
            }
        }
    }

    async fn audit(&self, session_id: &SessionId, kind: ProtocolKind, message: &str) {
        info!("{}", message);
        let event = AuditEvent::new(session_id, INITIATOR, kind, 0, message);
        match self.registry.audit_outbox().await {
            Ok(outbox) => {
                if let Err(err) = outbox.send(event) {
                    debug!("audit event lost: {}", err);
                }
            }
            Err(err) => debug!("audit channel unavailable: {}", err),
        }
    }
}

/// Keeps the entries whose every recorded participant reported them.
///
/// Entries are grouped by (address, session); the result is sorted.
pub fn reconcile_configs(reports: &[(ParticipantId, Vec<ConfigMessage>)]) -> Vec<ConfigMessage> {
    let mut groups: BTreeMap<(String, SessionId), (ConfigMessage, BTreeSet<ParticipantId>)> =
        BTreeMap::new();
    for (reporter, configs) in reports {
        for config in configs {
            let key = (config.address.clone(), config.session_id.clone());
            groups
                .entry(key)
                .or_insert_with(|| (config.clone(), BTreeSet::new()))
                .1
                .insert(reporter.clone());
        }
    }
    groups
        .into_values()
        .filter(|(config, reporters)| config.participants.iter().all(|p| reporters.contains(p)))
        .map(|(config, _)| config)
        .collect()
}

fn participant_set(participants: &[ParticipantId]) -> Result<Vec<ParticipantId>> {
    let participants = canonical_participants(participants.iter().cloned());
    if participants.is_empty() {
        return Err(RelayError::InvalidRequest("no participants".into()));
    }
    if participants.iter().any(|p| p.as_str().is_empty()) {
        return Err(RelayError::InvalidRequest("empty participant id".into()));
    }
    Ok(participants)
}

fn key_address(address: &str) -> Result<&str> {
    if address.is_empty() {
        return Err(RelayError::InvalidRequest("empty key address".into()));
    }
    Ok(address)
}

fn first_artifact(results: &BTreeMap<ParticipantId, SessionResult>) -> Option<&Artifact> {
    results.values().find_map(|result| match &result.outcome {
        SessionOutcome::Completed(artifact) => Some(artifact),
        SessionOutcome::Failed(_) => None,
    })
}

/// The artifact every participant reported, taken from the first in order.
fn agreed_artifact(
    session_id: &SessionId,
    results: &BTreeMap<ParticipantId, SessionResult>,
) -> Result<Artifact> {
    let first = first_artifact(results)
        .ok_or_else(|| RelayError::InconsistentResults(session_id.clone()))?;
    let agreed = results
        .values()
        .all(|result| matches!(&result.outcome, SessionOutcome::Completed(a) if a == first));
    if !agreed {
        return Err(RelayError::InconsistentResults(session_id.clone()));
    }
    Ok(first.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(address: &str, session: &str, participants: &[&str]) -> ConfigMessage {
        ConfigMessage {
            address: address.into(),
            participants: participants.iter().map(|p| ParticipantId::from(*p)).collect(),
            session_id: SessionId::new(session),
        }
    }

    #[test]
    fn configs_need_every_holder() {
        let full = config("0xaa", "s1", &["a", "b"]);
        let partial = config("0xbb", "s2", &["a", "b", "c"]);
        let reports = vec![
            ("a".into(), vec![full.clone(), partial.clone()]),
            ("b".into(), vec![full.clone(), partial.clone()]),
        ];
        assert_eq!(reconcile_configs(&reports), vec![full]);
    }

    #[test]
    fn configs_group_by_session_too() {
        let old = config("0xaa", "s1", &["a", "b"]);
        let new = config("0xaa", "s2", &["a", "b"]);
        let reports = vec![
            ("a".into(), vec![old.clone()]),
            ("b".into(), vec![new.clone()]),
        ];
        assert!(reconcile_configs(&reports).is_empty());

        let reports = vec![
            ("a".into(), vec![old.clone(), new.clone()]),
            ("b".into(), vec![new.clone()]),
        ];
        assert_eq!(reconcile_configs(&reports), vec![new]);
    }

    fn result(participant: &str, outcome: SessionOutcome) -> (ParticipantId, SessionResult) {
        (
            participant.into(),
            SessionResult {
                session_id: SessionId::new("s"),
                participant: participant.into(),
                outcome,
            },
        )
    }

    #[test]
    fn disagreeing_results_are_rejected() {
        let key = |byte: u8| {
            SessionOutcome::Completed(Artifact::Key {
                address: "0xaa".into(),
                public_key: vec![byte; 32],
            })
        };
        let session = SessionId::new("s");

        let same: BTreeMap<_, _> = vec![result("a", key(1)), result("b", key(1))]
            .into_iter()
            .collect();
        assert!(agreed_artifact(&session, &same).is_ok());

        let split: BTreeMap<_, _> = vec![result("a", key(1)), result("b", key(2))]
            .into_iter()
            .collect();
        assert!(matches!(
            agreed_artifact(&session, &split),
            Err(RelayError::InconsistentResults(_))
        ));
    }

    #[test]
    fn participant_sets_are_validated() {
        assert!(matches!(
            participant_set(&[]),
            Err(RelayError::InvalidRequest(_))
        ));
        assert!(matches!(
            participant_set(&["".into()]),
            Err(RelayError::InvalidRequest(_))
        ));
        assert_eq!(
            participant_set(&["b".into(), "a".into(), "b".into()]).unwrap(),
            vec![ParticipantId::from("a"), ParticipantId::from("b")]
        );
        assert!(matches!(key_address(""), Err(RelayError::InvalidRequest(_))));
    }
}
