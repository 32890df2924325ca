//! Distributed Key Generation (DKG)
//!
//! t-of-n Feldman VSS over secp256k1. Every party:
//! - generates its Paillier pre-parameters on the blocking pool
//! - broadcasts polynomial commitments, a proof of knowledge of its constant
//!   term and its Paillier public key
//! - sends each peer the evaluation of its polynomial at the peer's index
//! - verifies everything it received and sums its shares
//!
//! No party ever learns the joint secret; the joint public key is the sum of
//! the constant-term commitments.

mod dkg;
mod messages;
mod preparams;

pub use dkg::run_dkg;
pub use messages::{DkgRound1Message, DkgRound2Message, SchnorrProof};
pub use preparams::generate_preparams;

use crate::paillier::PaillierSecretKey;
use crate::{Error, Result, ShareData};
use std::time::Duration;

/// Default bit length of Paillier moduli
pub const DEFAULT_PAILLIER_BITS: u64 = 2048;

/// Default bound on pre-parameter generation
pub const DEFAULT_PREPARAMS_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-party DKG parameters.
///
/// Session id, party id and the participant list come from the relay.
#[derive(Debug, Clone)]
pub struct KeygenConfig {
    /// Parties required to sign
    pub threshold: usize,
    /// Chain the key is generated for
    pub chain_id: String,
    /// Paillier modulus size
    pub paillier_bits: u64,
    /// Bound on pre-parameter generation
    pub preparams_timeout: Duration,
    /// Pre-generated Paillier key; generated on demand when absent
    pub preparams: Option<PaillierSecretKey>,
}

impl KeygenConfig {
    pub fn new(threshold: usize, chain_id: impl Into<String>) -> Self {
        Self {
            threshold,
            chain_id: chain_id.into(),
            paillier_bits: DEFAULT_PAILLIER_BITS,
            preparams_timeout: DEFAULT_PREPARAMS_TIMEOUT,
            preparams: None,
        }
    }

    pub fn with_paillier_bits(mut self, bits: u64) -> Self {
        self.paillier_bits = bits;
        self
    }

    pub fn with_preparams_timeout(mut self, timeout: Duration) -> Self {
        self.preparams_timeout = timeout;
        self
    }

    pub fn with_preparams(mut self, key: PaillierSecretKey) -> Self {
        self.preparams = Some(key);
        self
    }
}

/// Result of distributed key generation
#[derive(Debug)]
pub struct KeygenResult {
    /// The generated key share for this party
    pub share: ShareData,
    /// The aggregated public key (same for all parties)
    pub public_key: Vec<u8>,
}

impl KeygenResult {
    /// Create a new keygen result
    pub fn new(share: ShareData) -> Result<Self> {
        if share.public_key.is_empty() {
            return Err(Error::Internal("keygen produced an empty public key".into()));
        }
        let public_key = share.public_key.clone();
        Ok(Self { share, public_key })
    }
}
