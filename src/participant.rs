//! Participant runtime.
//!
//! A long-lived party that owns key handles. It waits for protocol requests
//! and info queries and serves them one at a time; every protocol request
//! becomes a [`Session`] whose result the orchestrator collects.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    engine::{PreSignature, ProtocolEngine, ProtocolOutput, SessionScope, Start},
    registry::{ChannelRegistry, Inbox},
    session::{RoundMailbox, Session},
    store::{KeyHandle, KeyStore},
    types::{
        canonical_participants, Artifact, ConfigMessage, InfoKind, InfoQuery, InfoResponse,
        ParticipantId, ProtocolKind, ProtocolRequest, SessionOutcome,
    },
    RelayError, Result,
};

pub struct Participant {
    id: ParticipantId,
    registry: Arc<ChannelRegistry>,
    engine: Arc<dyn ProtocolEngine>,
    store: Arc<dyn KeyStore>,
    deadline: Duration,
    keys: BTreeMap<String, KeyHandle>,
    presignatures: BTreeMap<String, PreSignature>,
    mailbox: RoundMailbox,
    requests: Inbox<ProtocolRequest>,
    queries: Inbox<InfoQuery>,
}

impl Participant {
    /// Reloads persisted keys and subscribes to every inbox of `id`.
    ///
    /// Requests published before this returns are not seen.
    pub async fn activate(
        id: ParticipantId,
        registry: Arc<ChannelRegistry>,
        engine: Arc<dyn ProtocolEngine>,
        store: Arc<dyn KeyStore>,
        deadline: Duration,
    ) -> Result<Self> {
        let keys: BTreeMap<_, _> = store
            .load_all()?
            .into_iter()
            .map(|handle| (handle.address(), handle))
            .collect();
        info!("participant {} loaded {} key(s)", id, keys.len());

        let mailbox = RoundMailbox::new(registry.round_inbox(&id).await?);
        let requests = registry.request_inbox(&id).await?;
        let queries = registry.info_query_inbox(&id).await?;
        return Ok(Self {
            id,
            registry,
            engine,
            store,
            deadline,
            keys,
            presignatures: BTreeMap::new(),
            mailbox,
            requests,
            queries,
        });
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn configs(&self) -> Vec<ConfigMessage> {
        self.keys.values().map(KeyHandle::config).collect()
    }

    pub fn has_presignature(&self, address: &str) -> bool {
        self.presignatures.contains_key(address)
    }

    /// Serves requests and queries until `shutdown` flips or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("participant {} is listening", self.id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                request = self.requests.recv() => match request {
                    Some(request) => {
                        self.start_protocol(request).await?;
                    }
                    None => {
                        let channel = self.requests.channel().to_string();
                        return Err(RelayError::ChannelClosed(channel));
                    }
                },
                query = self.queries.recv() => match query {
                    Some(query) => self.get_info(query).await?,
                    None => {
                        let channel = self.queries.channel().to_string();
                        return Err(RelayError::ChannelClosed(channel));
                    }
                },
            }
        }
        info!("participant {} stopped", self.id);
        Ok(())
    }

    /// Runs one protocol session to completion.
    ///
    /// Returns `None` when the request does not concern this participant.
    pub async fn start_protocol(
        &mut self,
        request: ProtocolRequest,
    ) -> Result<Option<SessionOutcome>> {
        if !request.participants.contains(&self.id) {
            warn!(
                "ignoring {} request {} that does not include {}",
                request.kind, request.session_id, self.id
            );
            return Ok(None);
        }
        let session_id = request.session_id.clone();
        let scope = SessionScope {
            session_id: session_id.clone(),
            me: self.id.clone(),
            participants: canonical_participants(request.participants.clone()),
        };
        let session = Session::new(
            self.registry.clone(),
            scope.clone(),
            request.kind,
            self.deadline,
        );
        info!("{} starting {} session {}", self.id, request.kind, session_id);

        let started = self
            .prepare(&request)
            .and_then(|start| {
                self.engine
                    .start(scope, start)
                    .map_err(|err| RelayError::from(err).to_string())
            });
        let handler = match started {
            Ok(handler) => handler,
            Err(reason) => {
                let outcome = session.reject(&self.mailbox, reason).await?;
                self.registry.evict_session(&session_id).await;
                return Ok(Some(outcome));
            }
        };

        let kind = request.kind;
        let public_key = request
            .address
            .as_ref()
            .and_then(|address| self.keys.get(address))
            .map(|handle| handle.key.public_key());
        let keys = &mut self.keys;
        let presignatures = &mut self.presignatures;
        let store = &self.store;
        let outcome = session
            .run(&self.mailbox, handler, |output| match (kind, output) {
                (ProtocolKind::Keygen | ProtocolKind::Refresh, ProtocolOutput::Key(key)) => {
                    let handle = KeyHandle {
                        session_id: session_id.clone(),
                        key,
                    };
                    store.save(&handle).map_err(|err| err.to_string())?;
                    let artifact = Artifact::Key {
                        address: handle.address(),
                        public_key: handle.key.public_key(),
                    };
                    keys.insert(handle.address(), handle);
                    Ok(artifact)
                }
                (ProtocolKind::Sign | ProtocolKind::SignOnline, ProtocolOutput::Signature(sig)) => {
                    Ok(Artifact::Signature {
                        signature: sig.to_bytes().to_vec(),
                        public_key: public_key.unwrap_or_default(),
                    })
                }
                (ProtocolKind::PreSign, ProtocolOutput::PreSignature(presignature)) => {
                    let artifact = Artifact::PreSignature {
                        address: presignature.address.clone(),
                        signers: presignature.signers.clone(),
                    };
                    presignatures.insert(presignature.address.clone(), presignature);
                    Ok(artifact)
                }
                (kind, output) => Err(format!("{} produced unexpected output {:?}", kind, output)),
            })
            .await?;
        self.registry.evict_session(&session_id).await;
        Ok(Some(outcome))
    }

    /// Answers one info query on this participant's response channel.
    pub async fn get_info(&self, query: InfoQuery) -> Result<()> {
        debug!("{} answering {:?} query {}", self.id, query.kind, query.request_id);
        let configs = match query.kind {
            InfoKind::Online => Vec::new(),
            InfoKind::Configs => self.configs(),
        };
        let response = InfoResponse {
            request_id: query.request_id,
            kind: query.kind,
            participant: self.id.clone(),
            online: true,
            configs,
        };
        self.registry
            .info_response_outbox(&self.id)
            .await?
            .send(response)
    }

    /// Engine inputs for `request`, or why it cannot run here.
    fn prepare(&mut self, request: &ProtocolRequest) -> std::result::Result<Start, String> {
        match request.kind {
            ProtocolKind::Keygen => Ok(Start::Keygen {
                threshold: request.threshold,
            }),
            ProtocolKind::Refresh => Ok(Start::Refresh {
                key: self.key_for(request)?.key,
            }),
            ProtocolKind::Sign => Ok(Start::Sign {
                key: self.key_for(request)?.key,
                message_hash: message_hash(request)?,
            }),
            ProtocolKind::PreSign => Ok(Start::PreSign {
                key: self.key_for(request)?.key,
            }),
            ProtocolKind::SignOnline => {
                let handle = self.key_for(request)?;
                let message_hash = message_hash(request)?;
                // single use, gone even if the session fails
                let presignature = self
                    .presignatures
                    .remove(&handle.address())
                    .ok_or_else(|| format!("no pre-signature for {}", handle.address()))?;
                Ok(Start::SignOnline {
                    key: handle.key,
                    presignature,
                    message_hash,
                })
            }
        }
    }

    fn key_for(&self, request: &ProtocolRequest) -> std::result::Result<KeyHandle, String> {
        let address = request
            .address
            .as_deref()
            .ok_or_else(|| format!("{} request names no key", request.kind))?;
        self.keys
            .get(address)
            .cloned()
            .ok_or_else(|| RelayError::UnknownKey(address.to_string()).to_string())
    }
}

fn message_hash(request: &ProtocolRequest) -> std::result::Result<Vec<u8>, String> {
    request
        .message_hash
        .clone()
        .ok_or_else(|| format!("{} request carries no message", request.kind))
}
