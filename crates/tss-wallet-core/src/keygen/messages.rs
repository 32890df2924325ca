//! DKG protocol messages

use crate::PartyId;
use crate::paillier::PaillierPublicKey;
use crate::types::scalar_serde;
use k256::Scalar;
use serde::{Deserialize, Serialize};

/// Schnorr proof of knowledge of a discrete logarithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchnorrProof {
    /// Nonce commitment R = k * G (compressed EC point)
    pub commitment: Vec<u8>,
    /// z = k + c * a
    #[serde(with = "scalar_serde")]
    pub response: Scalar,
}

/// Round 1 DKG message: commitments to secret polynomial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgRound1Message {
    /// Sender's party ID
    pub party_id: PartyId,
    /// Commitments to polynomial coefficients (each commitment is a compressed EC point)
    pub commitments: Vec<Vec<u8>>,
    /// Proof that the sender knows the constant term behind `commitments[0]`
    pub proof: SchnorrProof,
    /// Sender's Paillier public key, used later by the signing engine
    pub paillier_key: PaillierPublicKey,
}

/// Round 2 DKG message: secret share for a specific party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgRound2Message {
    /// Sender's party ID
    pub from: PartyId,
    /// Recipient's party ID
    pub to: PartyId,
    /// The secret share (32 bytes)
    pub share: Vec<u8>,
}
