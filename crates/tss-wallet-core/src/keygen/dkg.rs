//! DKG protocol implementation

use super::{
    DkgRound1Message, DkgRound2Message, KeygenConfig, KeygenResult, SchnorrProof,
    generate_preparams,
};
use crate::mpc::Relay;
use crate::paillier::PaillierPublicKey;
use crate::types::{decode_point, encode_point};
use crate::{Error, PartyId, Result, ShareData};
use k256::{
    ProjectivePoint, Scalar,
    elliptic_curve::{Field, bigint::U256, ops::Reduce},
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use zeroize::Zeroize;

const POK_DOMAIN: &[u8] = b"tss-wallet/dkg/pok/v1";

/// Run the distributed key generation protocol for one party
///
/// Implements a Feldman VSS-based DKG where each party:
/// 1. Generates Paillier pre-parameters
/// 2. Generates a random polynomial of degree t-1 and commits to it
/// 3. Proves knowledge of its constant term
/// 4. Sends secret shares to other parties
/// 5. Verifies received shares against commitments
/// 6. Combines shares to get its final secret share
///
/// The relay's participant list must be exactly `0..n`.
#[instrument(skip(config, relay, cancel), fields(party_id = relay.party_id(), session_id = %relay.session_id()))]
pub async fn run_dkg<R: Relay>(
    config: &KeygenConfig,
    relay: &R,
    cancel: &CancellationToken,
) -> Result<KeygenResult> {
    let party_id = relay.party_id();
    let n_parties = relay.parties().len();
    validate_parameters(config, relay.parties(), party_id)?;

    info!(
        n_parties,
        threshold = config.threshold,
        chain_id = %config.chain_id,
        "Starting DKG"
    );

    let paillier_key = match &config.preparams {
        Some(key) => key.clone(),
        None => generate_preparams(config.paillier_bits, config.preparams_timeout, cancel).await?,
    };

    // ============ Round 1: Commitment ============
    debug!("DKG Round 1: Generating secret polynomial and commitments");

    let mut secret_poly = generate_secret_polynomial(config.threshold);
    let commitments: Vec<Vec<u8>> = secret_poly
        .iter()
        .map(|c| encode_point(&(ProjectivePoint::GENERATOR * c)))
        .collect();
    let proof = prove_knowledge(relay.session_id(), party_id, &secret_poly[0]);

    let round1 = DkgRound1Message {
        party_id,
        commitments,
        proof,
        paillier_key: paillier_key.public_key().clone(),
    };
    relay.broadcast(1, &round1).await?;

    let received = relay.collect_broadcasts::<DkgRound1Message>(1).await?;

    let mut sorted_commitments: Vec<DkgRound1Message> = Vec::with_capacity(n_parties);
    for (from, msg) in received {
        verify_round1(relay.session_id(), from, &msg, config.threshold)?;
        sorted_commitments.push(msg);
    }
    sorted_commitments.push(round1);
    sorted_commitments.sort_by_key(|m| m.party_id);

    // ============ Round 2: Secret Sharing ============
    debug!("DKG Round 2: Sending secret shares to other parties");

    for peer in relay.peers() {
        let mut share = evaluate_polynomial(&secret_poly, peer as u64 + 1);
        let share_msg = DkgRound2Message {
            from: party_id,
            to: peer,
            share: share.to_bytes().to_vec(),
        };
        share.zeroize();
        relay.send_direct(2, peer, &share_msg).await?;
    }

    let received_shares = relay.collect_direct::<DkgRound2Message>(2).await?;

    // ============ Round 3: Verification and Combination ============
    debug!("DKG Round 3: Verifying shares and computing final key share");

    let mut final_secret = evaluate_polynomial(&secret_poly, party_id as u64 + 1);
    secret_poly.iter_mut().for_each(Zeroize::zeroize);

    for (from, share_msg) in &received_shares {
        if share_msg.from != *from || share_msg.to != party_id {
            return Err(Error::Protocol(format!(
                "share from party {} is mislabelled ({} -> {})",
                from, share_msg.from, share_msg.to
            )));
        }
        let sender = &sorted_commitments[*from];
        let share = verify_share(share_msg, &sender.commitments, party_id)?;
        final_secret += share;
    }

    let public_key_point = compute_public_key(&sorted_commitments)?;
    let public_shares = compute_public_shares(&sorted_commitments, n_parties)?;

    if encode_point(&(ProjectivePoint::GENERATOR * final_secret)) != public_shares[party_id] {
        return Err(Error::VerificationFailed(
            "combined share does not match its public share".into(),
        ));
    }

    let paillier_public_keys: Vec<PaillierPublicKey> = sorted_commitments
        .iter()
        .map(|m| m.paillier_key.clone())
        .collect();

    let public_key = encode_point(&public_key_point);
    let share = ShareData {
        party_id,
        share_index: party_id as u64 + 1,
        n_parties,
        threshold: config.threshold,
        secret_share: final_secret,
        public_key: public_key.clone(),
        public_shares,
        paillier_key,
        paillier_public_keys,
        chain_id: config.chain_id.clone(),
    };

    info!(public_key = hex::encode(&public_key), "DKG completed successfully");

    KeygenResult::new(share)
}

fn validate_parameters(config: &KeygenConfig, parties: &[PartyId], party_id: PartyId) -> Result<()> {
    let n = parties.len();
    if n < 2 {
        return Err(Error::InvalidConfig(format!(
            "DKG requires at least 2 parties, got {}",
            n
        )));
    }
    if config.threshold == 0 || config.threshold > n {
        return Err(Error::InvalidConfig(format!(
            "threshold {} is not within 1..={}",
            config.threshold, n
        )));
    }
    if parties.iter().enumerate().any(|(i, p)| *p != i) {
        return Err(Error::InvalidConfig(format!(
            "DKG parties must be numbered 0..{}, got {:?}",
            n, parties
        )));
    }
    if party_id >= n {
        return Err(Error::InvalidPartyId(party_id));
    }
    if config.chain_id.trim().is_empty() {
        return Err(Error::InvalidConfig("chain id is empty".into()));
    }
    Ok(())
}

/// Generate a random secret polynomial of degree t-1
fn generate_secret_polynomial(threshold: usize) -> Vec<Scalar> {
    let mut rng = OsRng;
    (0..threshold).map(|_| Scalar::random(&mut rng)).collect()
}

/// Evaluate polynomial at a point using Horner's method
fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x = Scalar::from(x);
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coef| acc * x + *coef)
}

/// Evaluate committed polynomial in the exponent: sum of C_j * x^j
fn evaluate_commitments(commitments: &[ProjectivePoint], x: u64) -> ProjectivePoint {
    let x = Scalar::from(x);
    commitments
        .iter()
        .rev()
        .fold(ProjectivePoint::IDENTITY, |acc, c| acc * x + *c)
}

fn decode_commitments(commitments: &[Vec<u8>]) -> Result<Vec<ProjectivePoint>> {
    commitments
        .iter()
        .map(|bytes| {
            decode_point(bytes)
                .map_err(|_| Error::VerificationFailed("Invalid commitment point".into()))
        })
        .collect()
}

fn challenge(session_id: &str, party_id: PartyId, public: &[u8], nonce: &[u8]) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(POK_DOMAIN);
    hasher.update((session_id.len() as u64).to_be_bytes());
    hasher.update(session_id.as_bytes());
    hasher.update((party_id as u64).to_be_bytes());
    hasher.update(public);
    hasher.update(nonce);
    let digest: [u8; 32] = hasher.finalize().into();
    <Scalar as Reduce<U256>>::reduce_bytes(&digest.into())
}

/// Schnorr proof of knowledge of `secret` bound to the session and prover
fn prove_knowledge(session_id: &str, party_id: PartyId, secret: &Scalar) -> SchnorrProof {
    let mut nonce = Scalar::random(&mut OsRng);
    let commitment = encode_point(&(ProjectivePoint::GENERATOR * nonce));
    let public = encode_point(&(ProjectivePoint::GENERATOR * secret));
    let c = challenge(session_id, party_id, &public, &commitment);
    let response = nonce + c * secret;
    nonce.zeroize();
    SchnorrProof {
        commitment,
        response,
    }
}

fn verify_knowledge(
    session_id: &str,
    party_id: PartyId,
    public: &[u8],
    proof: &SchnorrProof,
) -> Result<()> {
    let public_point = decode_point(public)?;
    let nonce_point = decode_point(&proof.commitment)
        .map_err(|_| Error::VerificationFailed("Invalid proof commitment".into()))?;
    let c = challenge(session_id, party_id, public, &proof.commitment);

    if ProjectivePoint::GENERATOR * proof.response != nonce_point + public_point * c {
        return Err(Error::VerificationFailed(format!(
            "proof of knowledge from party {} is invalid",
            party_id
        )));
    }
    Ok(())
}

fn verify_round1(session_id: &str, from: PartyId, msg: &DkgRound1Message, threshold: usize) -> Result<()> {
    if msg.party_id != from {
        return Err(Error::Protocol(format!(
            "round 1 message from party {} claims to be from {}",
            from, msg.party_id
        )));
    }
    if msg.commitments.len() != threshold {
        return Err(Error::VerificationFailed(format!(
            "party {} committed to {} coefficients, expected {}",
            from,
            msg.commitments.len(),
            threshold
        )));
    }
    verify_knowledge(session_id, from, &msg.commitments[0], &msg.proof)?;
    msg.paillier_key.validate()?;
    Ok(())
}

/// Verify a received share against the sender's commitments
fn verify_share(share_msg: &DkgRound2Message, commitments: &[Vec<u8>], my_id: PartyId) -> Result<Scalar> {
    let share_bytes: [u8; 32] = share_msg
        .share
        .as_slice()
        .try_into()
        .map_err(|_| Error::Protocol("Invalid share length".into()))?;
    let share = <Scalar as Reduce<U256>>::reduce_bytes(&share_bytes.into());

    let expected = ProjectivePoint::GENERATOR * share;
    let actual = evaluate_commitments(&decode_commitments(commitments)?, my_id as u64 + 1);

    if expected != actual {
        return Err(Error::VerificationFailed(format!(
            "Share from party {} does not match commitment",
            share_msg.from
        )));
    }
    Ok(share)
}

/// Compute the aggregated public key from all parties' commitments
fn compute_public_key(all_commitments: &[DkgRound1Message]) -> Result<ProjectivePoint> {
    let mut public_key = ProjectivePoint::IDENTITY;
    for msg in all_commitments {
        public_key += decode_point(&msg.commitments[0])?;
    }
    if public_key == ProjectivePoint::IDENTITY {
        return Err(Error::VerificationFailed("joint public key is the identity".into()));
    }
    Ok(public_key)
}

/// Compute public shares x_k * G for all parties
fn compute_public_shares(all_commitments: &[DkgRound1Message], n_parties: usize) -> Result<Vec<Vec<u8>>> {
    let decoded = all_commitments
        .iter()
        .map(|m| decode_commitments(&m.commitments))
        .collect::<Result<Vec<_>>>()?;

    Ok((0..n_parties)
        .map(|k| {
            let point = decoded
                .iter()
                .fold(ProjectivePoint::IDENTITY, |acc, c| {
                    acc + evaluate_commitments(c, k as u64 + 1)
                });
            encode_point(&point)
        })
        .collect())
}
