//! Distributed key generation and proactive share refresh.
//!
//! Both are Pedersen style: every party deals a Feldman-committed polynomial
//! of degree `threshold` and sends each peer its evaluation. For a refresh
//! the dealt polynomials have a zero constant term, so the group key stays
//! put while every share moves.
use std::collections::BTreeMap;

use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar, traits::Identity};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use super::{
    keys::{evaluate, evaluate_commitments, hash_to_scalar, share_index, KeyShare, G},
    EngineError, Outgoing, ProtocolOutput, Rounds, SessionScope, Step,
};
use crate::types::ParticipantId;

#[derive(Serialize, Deserialize)]
pub(crate) enum DkgMessage {
    Commitments {
        commitments: Vec<RistrettoPoint>,
        /// Schnorr proof of knowledge of the constant term, absent on refresh.
        proof: Option<(RistrettoPoint, Scalar)>,
    },
    Share(Scalar),
}

pub(crate) struct Dkg {
    previous: Option<KeyShare>,
    threshold: usize,
    coefficients: Vec<Scalar>,
    commitments: BTreeMap<ParticipantId, Vec<RistrettoPoint>>,
    shares: BTreeMap<ParticipantId, Scalar>,
    shares_sent: bool,
}

impl Dkg {
    pub(crate) fn keygen(scope: &SessionScope, threshold: usize) -> Result<Self, EngineError> {
        if threshold >= scope.participants.len() {
            return Err(EngineError::InvalidParameters(format!(
                "threshold {} needs more than {} participants",
                threshold,
                scope.participants.len()
            )));
        }
        Ok(Self::new(None, threshold))
    }

    pub(crate) fn refresh(scope: &SessionScope, key: KeyShare) -> Result<Self, EngineError> {
        if key.participants != scope.participants || key.me != scope.me {
            return Err(EngineError::InvalidParameters(format!(
                "key {} is not held by this participant set",
                key.address()
            )));
        }
        let threshold = key.threshold;
        Ok(Self::new(Some(key), threshold))
    }

    fn new(previous: Option<KeyShare>, threshold: usize) -> Self {
        Dkg {
            previous,
            threshold,
            coefficients: Vec::new(),
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
            shares_sent: false,
        }
    }

    fn progress(
        &mut self,
        scope: &SessionScope,
        mut out: Vec<Outgoing<DkgMessage>>,
    ) -> Result<Step<DkgMessage>, EngineError> {
        let n = scope.participants.len();
        // shares go out only once every dealer has committed
        if !self.shares_sent && self.commitments.len() == n {
            for peer in scope.participants.iter().filter(|p| **p != scope.me) {
                let share = evaluate(&self.coefficients, index(scope, peer)?);
                out.push(Outgoing::to(peer.clone(), 2, DkgMessage::Share(share)));
            }
            self.shares_sent = true;
        }
        if self.shares_sent && self.shares.len() == n {
            let key = self.finish(scope)?;
            return Ok(Step::Done(out, ProtocolOutput::Key(key)));
        }
        Ok(Step::Continue(out))
    }

    fn finish(&self, scope: &SessionScope) -> Result<KeyShare, EngineError> {
        let x_me = index(scope, &scope.me)?;
        for (dealer, share) in &self.shares {
            if share * G != evaluate_commitments(&self.commitments[dealer], x_me) {
                return Err(EngineError::InvalidShare(dealer.clone()));
            }
        }

        let mut secret: Scalar = self.shares.values().sum();
        let mut verification_shares = BTreeMap::new();
        for participant in &scope.participants {
            let x = index(scope, participant)?;
            let point: RistrettoPoint = self
                .commitments
                .values()
                .map(|commitments| evaluate_commitments(commitments, x))
                .sum();
            verification_shares.insert(participant.clone(), point);
        }

        let group_key = match &self.previous {
            None => self.commitments.values().map(|c| c[0]).sum::<RistrettoPoint>(),
            Some(previous) => {
                secret += previous.secret;
                for (participant, point) in verification_shares.iter_mut() {
                    if let Some(old) = previous.verification_shares.get(participant) {
                        *point += old;
                    }
                }
                previous.group_key
            }
        };

        Ok(KeyShare {
            participants: scope.participants.clone(),
            threshold: self.threshold,
            me: scope.me.clone(),
            secret,
            group_key,
            verification_shares,
        })
    }
}

impl Rounds for Dkg {
    type Message = DkgMessage;

    fn start(&mut self, scope: &SessionScope) -> Result<Step<DkgMessage>, EngineError> {
        let constant = match self.previous {
            Some(_) => Scalar::ZERO,
            None => Scalar::random(&mut OsRng),
        };
        self.coefficients = std::iter::once(constant)
            .chain((0..self.threshold).map(|_| Scalar::random(&mut OsRng)))
            .collect();
        let commitments: Vec<RistrettoPoint> = self.coefficients.iter().map(|a| a * G).collect();
        let proof = match self.previous {
            Some(_) => None,
            None => Some(prove(scope, &scope.me, constant, &commitments[0])),
        };

        let x_me = index(scope, &scope.me)?;
        self.shares
            .insert(scope.me.clone(), evaluate(&self.coefficients, x_me));
        self.commitments.insert(scope.me.clone(), commitments.clone());

        let out = vec![Outgoing::broadcast(
            1,
            DkgMessage::Commitments { commitments, proof },
        )];
        self.progress(scope, out)
    }

    fn receive(
        &mut self,
        scope: &SessionScope,
        from: &ParticipantId,
        msg: DkgMessage,
    ) -> Result<Step<DkgMessage>, EngineError> {
        match msg {
            DkgMessage::Commitments { commitments, proof } => {
                if self.commitments.contains_key(from) || commitments.len() != self.threshold + 1 {
                    return Err(EngineError::UnexpectedMessage {
                        from: from.clone(),
                        round: 1,
                    });
                }
                match (&self.previous, proof) {
                    (None, Some(proof)) => {
                        if !verify_proof(scope, from, &commitments[0], proof) {
                            return Err(EngineError::InvalidProof(from.clone()));
                        }
                    }
                    (None, None) => return Err(EngineError::InvalidProof(from.clone())),
                    // a refresh polynomial must not move the group key
                    (Some(_), _) => {
                        if commitments[0] != RistrettoPoint::identity() {
                            return Err(EngineError::InvalidShare(from.clone()));
                        }
                    }
                }
                self.commitments.insert(from.clone(), commitments);
            }
            DkgMessage::Share(share) => {
                if self.shares.contains_key(from) {
                    return Err(EngineError::UnexpectedMessage {
                        from: from.clone(),
                        round: 2,
                    });
                }
                self.shares.insert(from.clone(), share);
            }
        }
        self.progress(scope, Vec::new())
    }
}

fn index(scope: &SessionScope, id: &ParticipantId) -> Result<Scalar, EngineError> {
    share_index(&scope.participants, id)
        .ok_or_else(|| EngineError::InvalidParameters(format!("{} has no share index", id)))
}

fn proof_challenge(
    scope: &SessionScope,
    dealer: &ParticipantId,
    commitment: &RistrettoPoint,
    nonce: &RistrettoPoint,
) -> Scalar {
    hash_to_scalar(
        b"mpc-relay/dkg-pok",
        &[
            scope.session_id.as_str().as_bytes(),
            &[0],
            dealer.as_str().as_bytes(),
            &[0],
            commitment.compress().as_bytes(),
            nonce.compress().as_bytes(),
        ],
    )
}

fn prove(
    scope: &SessionScope,
    dealer: &ParticipantId,
    secret: Scalar,
    commitment: &RistrettoPoint,
) -> (RistrettoPoint, Scalar) {
    let k = Scalar::random(&mut OsRng);
    let nonce = k * G;
    let c = proof_challenge(scope, dealer, commitment, &nonce);
    (nonce, k + c * secret)
}

fn verify_proof(
    scope: &SessionScope,
    dealer: &ParticipantId,
    commitment: &RistrettoPoint,
    (nonce, s): (RistrettoPoint, Scalar),
) -> bool {
    let c = proof_challenge(scope, dealer, commitment, &nonce);
    s * G == nonce + c * commitment
}
