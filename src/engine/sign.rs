//! Threshold signing.
//!
//! Signing takes two rounds: nonce commitments, then partial signatures.
//! A pre-signature is the first round run ahead of time; signing online
//! with it is the second round alone.
use std::collections::BTreeMap;

use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use super::{
    keys::{challenge, lagrange, KeyShare, PreSignature, Signature, G},
    EngineError, Outgoing, ProtocolOutput, Rounds, SessionScope, Step,
};
use crate::types::ParticipantId;

#[derive(Serialize, Deserialize)]
pub(crate) enum SignMessage {
    Nonce(RistrettoPoint),
    Partial(Scalar),
}

enum Goal {
    Sign(Vec<u8>),
    PreSign,
}

pub(crate) struct Signing {
    key: KeyShare,
    goal: Goal,
    nonce: Scalar,
    commitments: BTreeMap<ParticipantId, RistrettoPoint>,
    partials: BTreeMap<ParticipantId, Scalar>,
    partial_round: u16,
    partial_sent: bool,
}

impl Signing {
    pub(crate) fn sign(
        scope: &SessionScope,
        key: KeyShare,
        message_hash: Vec<u8>,
    ) -> Result<Self, EngineError> {
        check_signers(scope, &key)?;
        Ok(Self::fresh(key, Goal::Sign(message_hash)))
    }

    pub(crate) fn presign(scope: &SessionScope, key: KeyShare) -> Result<Self, EngineError> {
        check_signers(scope, &key)?;
        Ok(Self::fresh(key, Goal::PreSign))
    }

    pub(crate) fn online(
        scope: &SessionScope,
        key: KeyShare,
        presignature: PreSignature,
        message_hash: Vec<u8>,
    ) -> Result<Self, EngineError> {
        check_signers(scope, &key)?;
        if presignature.signers != scope.participants || presignature.address != key.address() {
            return Err(EngineError::InvalidParameters(format!(
                "pre-signature {} was made for other signers",
                presignature.session_id
            )));
        }
        Ok(Signing {
            key,
            goal: Goal::Sign(message_hash),
            nonce: presignature.nonce,
            commitments: presignature.commitments,
            partials: BTreeMap::new(),
            partial_round: 1,
            partial_sent: false,
        })
    }

    fn fresh(key: KeyShare, goal: Goal) -> Self {
        Signing {
            key,
            goal,
            nonce: Scalar::random(&mut OsRng),
            commitments: BTreeMap::new(),
            partials: BTreeMap::new(),
            partial_round: 2,
            partial_sent: false,
        }
    }

    fn lagrange_of(&self, scope: &SessionScope, id: &ParticipantId) -> Result<Scalar, EngineError> {
        let xs = scope
            .participants
            .iter()
            .map(|p| index(&self.key, p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lagrange(index(&self.key, id)?, &xs))
    }

    fn progress(
        &mut self,
        scope: &SessionScope,
        mut out: Vec<Outgoing<SignMessage>>,
    ) -> Result<Step<SignMessage>, EngineError> {
        if self.commitments.len() < scope.participants.len() {
            return Ok(Step::Continue(out));
        }
        let message = match &self.goal {
            Goal::PreSign => {
                let presignature = PreSignature {
                    session_id: scope.session_id.clone(),
                    address: self.key.address(),
                    signers: scope.participants.clone(),
                    nonce: self.nonce,
                    commitments: self.commitments.clone(),
                };
                return Ok(Step::Done(out, ProtocolOutput::PreSignature(presignature)));
            }
            Goal::Sign(message) => message.clone(),
        };

        let r: RistrettoPoint = self.commitments.values().sum();
        let c = challenge(&r, &self.key.group_key, &message);
        if !self.partial_sent {
            let z = self.nonce + c * self.lagrange_of(scope, &scope.me)? * self.key.secret;
            self.partials.insert(scope.me.clone(), z);
            out.push(Outgoing::broadcast(self.partial_round, SignMessage::Partial(z)));
            self.partial_sent = true;
        }
        if self.partials.len() < scope.participants.len() {
            return Ok(Step::Continue(out));
        }

        for (signer, z) in &self.partials {
            let share = self
                .key
                .verification_shares
                .get(signer)
                .ok_or_else(|| EngineError::InvalidPartialSignature(signer.clone()))?;
            let expected = self.commitments[signer] + c * self.lagrange_of(scope, signer)? * share;
            if z * G != expected {
                return Err(EngineError::InvalidPartialSignature(signer.clone()));
            }
        }
        let signature = Signature {
            r,
            z: self.partials.values().sum(),
        };
        if !signature.verify(&self.key.group_key, &message) {
            return Err(EngineError::InvalidSignature);
        }
        Ok(Step::Done(out, ProtocolOutput::Signature(signature)))
    }
}

impl Rounds for Signing {
    type Message = SignMessage;

    fn start(&mut self, scope: &SessionScope) -> Result<Step<SignMessage>, EngineError> {
        let mut out = Vec::new();
        if self.commitments.is_empty() {
            let commitment = self.nonce * G;
            self.commitments.insert(scope.me.clone(), commitment);
            out.push(Outgoing::broadcast(1, SignMessage::Nonce(commitment)));
        }
        self.progress(scope, out)
    }

    fn receive(
        &mut self,
        scope: &SessionScope,
        from: &ParticipantId,
        msg: SignMessage,
    ) -> Result<Step<SignMessage>, EngineError> {
        match msg {
            SignMessage::Nonce(commitment) => {
                if self.commitments.contains_key(from) {
                    return Err(EngineError::UnexpectedMessage {
                        from: from.clone(),
                        round: 1,
                    });
                }
                self.commitments.insert(from.clone(), commitment);
            }
            SignMessage::Partial(z) => {
                if matches!(self.goal, Goal::PreSign) || self.partials.contains_key(from) {
                    return Err(EngineError::UnexpectedMessage {
                        from: from.clone(),
                        round: self.partial_round,
                    });
                }
                self.partials.insert(from.clone(), z);
            }
        }
        self.progress(scope, Vec::new())
    }
}

fn index(key: &KeyShare, id: &ParticipantId) -> Result<Scalar, EngineError> {
    key.index_of(id)
        .ok_or_else(|| EngineError::InvalidParameters(format!("{} does not hold a share", id)))
}

fn check_signers(scope: &SessionScope, key: &KeyShare) -> Result<(), EngineError> {
    if key.me != scope.me {
        return Err(EngineError::InvalidParameters(format!(
            "key share belongs to {}",
            key.me
        )));
    }
    if let Some(outsider) = scope
        .participants
        .iter()
        .find(|p| !key.participants.contains(p))
    {
        return Err(EngineError::InvalidParameters(format!(
            "{} does not hold a share of {}",
            outsider,
            key.address()
        )));
    }
    if scope.participants.len() <= key.threshold {
        return Err(EngineError::InvalidParameters(format!(
            "{} signers cannot meet threshold {}",
            scope.participants.len(),
            key.threshold
        )));
    }
    Ok(())
}
