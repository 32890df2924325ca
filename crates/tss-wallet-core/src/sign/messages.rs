//! DSG protocol messages

use crate::PartyId;
use crate::paillier::Ciphertext;
use crate::types::scalar_serde;
use k256::Scalar;
use serde::{Deserialize, Serialize};

/// Round 1 DSG message: commitment to Γ_i and the encrypted nonce share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsgRound1Message {
    /// Sender's party ID
    pub party_id: PartyId,
    /// SHA-256 commitment to Γ_i = γ_i * G
    pub gamma_commitment: [u8; 32],
    /// Enc(k_i) under the sender's Paillier key
    pub encrypted_k: Ciphertext,
}

/// Round 2 DSG message: MtA responses addressed to one party
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsgRound2Message {
    /// Sender's party ID
    pub from: PartyId,
    /// Recipient's party ID
    pub to: PartyId,
    /// Enc(k_to * γ_from + β') under the recipient's key
    pub gamma_response: Ciphertext,
    /// Enc(k_to * w_from + ν') under the recipient's key
    pub w_response: Ciphertext,
}

/// Round 3 DSG message: the sender's share of δ = k * γ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsgRound3Message {
    pub party_id: PartyId,
    #[serde(with = "scalar_serde")]
    pub delta_share: Scalar,
}

/// Round 4 DSG message: opening of the round 1 commitment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsgRound4Message {
    pub party_id: PartyId,
    /// Γ_i (compressed EC point)
    pub gamma_point: Vec<u8>,
    /// Commitment blinding
    pub blind: [u8; 32],
}

/// Round 5 DSG message: partial signature s_i = m * k_i + r * σ_i
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsgPartialMessage {
    /// Sender's party ID
    pub party_id: PartyId,
    #[serde(with = "scalar_serde")]
    pub sigma_share: Scalar,
}
