//! Key material and the Schnorr arithmetic shared by every protocol.
use std::{collections::BTreeMap, fmt};

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
    traits::Identity,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::types::{ParticipantId, SessionId};

pub(crate) const G: RistrettoPoint = RISTRETTO_BASEPOINT_POINT;

/// One participant's share of a threshold key.
///
/// Any `threshold + 1` holders of the same group key can sign together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    pub participants: Vec<ParticipantId>,
    pub threshold: usize,
    pub me: ParticipantId,
    pub(crate) secret: Scalar,
    pub group_key: RistrettoPoint,
    /// `x_j·G` for every participant's share `x_j`
    pub verification_shares: BTreeMap<ParticipantId, RistrettoPoint>,
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("address", &self.address())
            .field("participants", &self.participants)
            .field("threshold", &self.threshold)
            .field("me", &self.me)
            .finish_non_exhaustive()
    }
}

impl KeyShare {
    pub fn address(&self) -> String {
        address_of(&self.group_key)
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.group_key.compress().to_bytes().to_vec()
    }

    pub(crate) fn index_of(&self, id: &ParticipantId) -> Option<Scalar> {
        share_index(&self.participants, id)
    }
}

/// Consumed nonce state of a pre-signing session.
///
/// Only usable once: signing twice with the same nonce leaks the share.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreSignature {
    pub session_id: SessionId,
    pub address: String,
    pub signers: Vec<ParticipantId>,
    pub(crate) nonce: Scalar,
    pub(crate) commitments: BTreeMap<ParticipantId, RistrettoPoint>,
}

impl fmt::Debug for PreSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreSignature")
            .field("session_id", &self.session_id)
            .field("address", &self.address)
            .field("signers", &self.signers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub(crate) r: RistrettoPoint,
    pub(crate) z: Scalar,
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.r.compress().as_bytes());
        bytes[32..].copy_from_slice(self.z.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 64 {
            return None;
        }
        let r = point_from_bytes(&bytes[..32])?;
        let mut z = [0u8; 32];
        z.copy_from_slice(&bytes[32..]);
        let z = Option::<Scalar>::from(Scalar::from_canonical_bytes(z))?;
        Some(Signature { r, z })
    }

    pub fn verify(&self, public_key: &RistrettoPoint, message: &[u8]) -> bool {
        let c = challenge(&self.r, public_key, message);
        self.z * G == self.r + c * public_key
    }
}

/// Checks a 64 byte signature against a compressed 32 byte public key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match (point_from_bytes(public_key), Signature::from_bytes(signature)) {
        (Some(key), Some(signature)) => signature.verify(&key, message),
        _ => false,
    }
}

/// `0x` followed by the first 20 bytes of SHA-256 over the compressed key.
pub fn address_of(public_key: &RistrettoPoint) -> String {
    let digest = Sha256::digest(public_key.compress().as_bytes());
    format!("0x{}", hex::encode(&digest[..20]))
}

pub(crate) fn point_from_bytes(bytes: &[u8]) -> Option<RistrettoPoint> {
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    CompressedRistretto(bytes).decompress()
}

/// Share indices start at one; zero is where the secret lives.
pub(crate) fn share_index(participants: &[ParticipantId], id: &ParticipantId) -> Option<Scalar> {
    participants
        .iter()
        .position(|p| p == id)
        .map(|position| Scalar::from(position as u64 + 1))
}

/// Lagrange coefficient at zero of `x_i` within `xs`.
pub(crate) fn lagrange(x_i: Scalar, xs: &[Scalar]) -> Scalar {
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for x_j in xs.iter().filter(|x_j| **x_j != x_i) {
        num *= x_j;
        den *= x_j - x_i;
    }
    num * den.invert()
}

pub(crate) fn hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

pub(crate) fn challenge(r: &RistrettoPoint, public_key: &RistrettoPoint, message: &[u8]) -> Scalar {
    hash_to_scalar(
        b"mpc-relay/challenge",
        &[
            r.compress().as_bytes(),
            public_key.compress().as_bytes(),
            message,
        ],
    )
}

/// `f(x)` for coefficients `a_0..a_t`.
pub(crate) fn evaluate(coefficients: &[Scalar], x: Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, a| acc * x + a)
}

/// `f(x)·G` from the commitments `a_k·G`.
pub(crate) fn evaluate_commitments(commitments: &[RistrettoPoint], x: Scalar) -> RistrettoPoint {
    commitments
        .iter()
        .rev()
        .fold(RistrettoPoint::identity(), |acc, c| acc * x + c)
}
