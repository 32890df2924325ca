//! DSG protocol implementation

use super::mta;
use super::{
    DsgPartialMessage, DsgRound1Message, DsgRound2Message, DsgRound3Message, DsgRound4Message,
};
use crate::mpc::Relay;
use crate::types::{decode_point, encode_point};
use crate::{Error, PartyId, Result, ShareData, SignatureResult};
use k256::{
    AffinePoint, ProjectivePoint, Scalar,
    ecdsa::{RecoveryId, Signature, VerifyingKey, signature::hazmat::PrehashVerifier},
    elliptic_curve::{Field, bigint::U256, ops::Reduce, point::AffineCoordinates, scalar::IsHigh},
};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroize;

const COMMIT_DOMAIN: &[u8] = b"tss-wallet/dsg/gamma/v1";

/// Run the threshold signing protocol for one party of the quorum
///
/// The relay's participant list is the signing quorum; it must hold at least
/// `share.threshold` distinct parties of the key's party set.
///
/// # Protocol
/// 1. Broadcast a commitment to Γ_i = γ_i * G and Enc(k_i)
/// 2. Pairwise MtA for k_i * γ_j and k_i * w_j
/// 3. Broadcast δ_i; δ = k * γ
/// 4. Open Γ_i; R = δ⁻¹ * Σ Γ_j
/// 5. Broadcast s_i = m * k_i + r * σ_i; s = Σ s_i
///
/// The combined signature is normalised to low-S and verified against the
/// joint public key before it is returned.
#[instrument(skip(share, message_hash, relay), fields(party_id = relay.party_id(), session_id = %relay.session_id()))]
pub async fn run_dsg<R: Relay>(
    share: &ShareData,
    message_hash: &[u8; 32],
    relay: &R,
) -> Result<SignatureResult> {
    let party_id = relay.party_id();
    let quorum = relay.parties().to_vec();
    validate_quorum(share, party_id, &quorum)?;

    info!(quorum = ?quorum, "Starting threshold signing");

    let session_id = relay.session_id().clone();
    let mut rng = OsRng;
    let mut w_i = lagrange_coefficient(party_id, &quorum)? * share.secret_share;
    let mut k_i = Scalar::random(&mut rng);
    let mut gamma_i = Scalar::random(&mut rng);
    let gamma_point = ProjectivePoint::GENERATOR * gamma_i;

    // ============ Round 1: Commit to Γ_i, encrypt k_i ============
    debug!("DSG Round 1: Committing to gamma and encrypting nonce share");

    let mut blind = [0u8; 32];
    rng.fill_bytes(&mut blind);
    let gamma_commitment = commit_gamma(&session_id, party_id, &gamma_point, &blind);

    let round1 = DsgRound1Message {
        party_id,
        gamma_commitment,
        encrypted_k: mta::encrypt_secret(&share.paillier_key, &k_i)?,
    };
    relay.broadcast(1, &round1).await?;

    let round1_msgs = relay.collect_broadcasts::<DsgRound1Message>(1).await?;
    for (from, msg) in &round1_msgs {
        check_sender(*from, msg.party_id, 1)?;
    }

    // ============ Round 2: MtA ============
    debug!("DSG Round 2: Running MtA with each peer");

    let mut delta_i = k_i * gamma_i;
    let mut sigma_i = k_i * w_i;

    for (peer, msg) in &round1_msgs {
        let peer_key = &share.paillier_public_keys[*peer];
        let (gamma_response, beta) = mta::respond(peer_key, &msg.encrypted_k, &gamma_i)?;
        let (w_response, nu) = mta::respond(peer_key, &msg.encrypted_k, &w_i)?;
        delta_i += beta;
        sigma_i += nu;

        let response = DsgRound2Message {
            from: party_id,
            to: *peer,
            gamma_response,
            w_response,
        };
        relay.send_direct(2, *peer, &response).await?;
    }

    let round2_msgs = relay.collect_direct::<DsgRound2Message>(2).await?;
    for (from, msg) in &round2_msgs {
        if msg.from != *from || msg.to != party_id {
            return Err(Error::Protocol(format!(
                "MtA response from party {} is mislabelled ({} -> {})",
                from, msg.from, msg.to
            )));
        }
        delta_i += mta::finish(&share.paillier_key, &msg.gamma_response)?;
        sigma_i += mta::finish(&share.paillier_key, &msg.w_response)?;
    }
    w_i.zeroize();
    gamma_i.zeroize();

    // ============ Round 3: δ ============
    debug!("DSG Round 3: Combining delta");

    relay
        .broadcast(3, &DsgRound3Message {
            party_id,
            delta_share: delta_i,
        })
        .await?;

    let mut delta = delta_i;
    for (from, msg) in relay.collect_broadcasts::<DsgRound3Message>(3).await? {
        check_sender(from, msg.party_id, 3)?;
        delta += msg.delta_share;
    }
    let delta_inv = Option::<Scalar>::from(delta.invert())
        .ok_or_else(|| Error::Protocol("delta is zero".into()))?;

    // ============ Round 4: Open Γ_i, compute R ============
    debug!("DSG Round 4: Opening gamma commitments");

    relay
        .broadcast(4, &DsgRound4Message {
            party_id,
            gamma_point: encode_point(&gamma_point),
            blind,
        })
        .await?;

    let mut gamma_sum = gamma_point;
    for (from, msg) in relay.collect_broadcasts::<DsgRound4Message>(4).await? {
        check_sender(from, msg.party_id, 4)?;
        let committed = round1_msgs
            .iter()
            .find(|(p, _)| *p == from)
            .map(|(_, m)| m.gamma_commitment)
            .ok_or_else(|| Error::Protocol(format!("no round 1 commitment from party {}", from)))?;
        let point = decode_point(&msg.gamma_point)?;
        if commit_gamma(&session_id, from, &point, &msg.blind) != committed {
            return Err(Error::VerificationFailed(format!(
                "gamma decommitment from party {} does not match",
                from
            )));
        }
        gamma_sum += point;
    }

    let big_r = (gamma_sum * delta_inv).to_affine();
    if big_r == AffinePoint::IDENTITY {
        return Err(Error::Protocol("nonce point is the identity".into()));
    }
    let r_bytes = big_r.x();
    let r = <Scalar as Reduce<U256>>::reduce_bytes(&r_bytes);
    if bool::from(r.is_zero()) {
        return Err(Error::Protocol("r is zero".into()));
    }
    let x_reduced = r.to_bytes() != r_bytes;
    let mut y_odd = bool::from(big_r.y_is_odd());

    // ============ Round 5: Partial signatures ============
    debug!("DSG Round 5: Exchanging partial signatures");

    let m = <Scalar as Reduce<U256>>::reduce_bytes(&(*message_hash).into());
    let s_i = m * k_i + r * sigma_i;
    k_i.zeroize();
    sigma_i.zeroize();

    relay
        .broadcast(5, &DsgPartialMessage {
            party_id,
            sigma_share: s_i,
        })
        .await?;

    let mut s = s_i;
    for (from, msg) in relay.collect_broadcasts::<DsgPartialMessage>(5).await? {
        check_sender(from, msg.party_id, 5)?;
        s += msg.sigma_share;
    }
    if bool::from(s.is_zero()) {
        return Err(Error::Protocol("s is zero".into()));
    }

    // Low-S: negating s mirrors R, flipping its y parity
    if bool::from(s.is_high()) {
        s = -s;
        y_odd = !y_odd;
    }

    let recovery_id = RecoveryId::new(y_odd, x_reduced);
    self_verify(share, message_hash, &r, &s, recovery_id)?;

    info!(
        r = hex::encode(r.to_bytes()),
        recovery_id = recovery_id.to_byte(),
        "Threshold signature produced"
    );

    Ok(SignatureResult::new(
        r.to_bytes().to_vec(),
        s.to_bytes().to_vec(),
        Some(recovery_id.to_byte()),
    ))
}

fn validate_quorum(share: &ShareData, party_id: PartyId, quorum: &[PartyId]) -> Result<()> {
    if party_id != share.party_id {
        return Err(Error::InvalidPartyId(party_id));
    }
    if quorum.len() < share.threshold {
        return Err(Error::ThresholdNotMet {
            required: share.threshold,
            actual: quorum.len(),
        });
    }
    let mut seen = HashSet::with_capacity(quorum.len());
    for p in quorum {
        if *p >= share.n_parties || !seen.insert(*p) {
            return Err(Error::InvalidPartyId(*p));
        }
    }
    if share.paillier_public_keys.len() != share.n_parties {
        return Err(Error::InvalidConfig(format!(
            "share carries {} Paillier keys for {} parties",
            share.paillier_public_keys.len(),
            share.n_parties
        )));
    }
    Ok(())
}

fn check_sender(from: PartyId, claimed: PartyId, round: u32) -> Result<()> {
    if from != claimed {
        return Err(Error::Protocol(format!(
            "round {} message from party {} claims to be from {}",
            round, from, claimed
        )));
    }
    Ok(())
}

/// Lagrange coefficient of `party_id` at zero over `quorum` (x_j = j + 1)
pub(crate) fn lagrange_coefficient(party_id: PartyId, quorum: &[PartyId]) -> Result<Scalar> {
    let x_i = Scalar::from(party_id as u64 + 1);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for j in quorum.iter().filter(|j| **j != party_id) {
        let x_j = Scalar::from(*j as u64 + 1);
        numerator *= x_j;
        denominator *= x_j - x_i;
    }

    let inv = Option::<Scalar>::from(denominator.invert())
        .ok_or_else(|| Error::InvalidConfig("quorum evaluation points collide".into()))?;
    Ok(numerator * inv)
}

fn commit_gamma(session_id: &str, party_id: PartyId, point: &ProjectivePoint, blind: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(COMMIT_DOMAIN);
    hasher.update((session_id.len() as u64).to_be_bytes());
    hasher.update(session_id.as_bytes());
    hasher.update((party_id as u64).to_be_bytes());
    hasher.update(encode_point(point));
    hasher.update(blind);
    hasher.finalize().into()
}

/// Check the combined signature against the joint key
fn self_verify(
    share: &ShareData,
    message_hash: &[u8; 32],
    r: &Scalar,
    s: &Scalar,
    recovery_id: RecoveryId,
) -> Result<()> {
    let verifying_key = VerifyingKey::from_sec1_bytes(&share.public_key)
        .map_err(|e| Error::Crypto(format!("invalid joint public key: {}", e)))?;
    let signature = Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|e| Error::SelfCheckFailed(e.to_string()))?;

    if let Err(e) = verifying_key.verify_prehash(message_hash, &signature) {
        warn!(error = %e, "Combined signature failed verification");
        return Err(Error::SelfCheckFailed(e.to_string()));
    }

    let recovered = VerifyingKey::recover_from_prehash(message_hash, &signature, recovery_id)
        .map_err(|e| Error::SelfCheckFailed(format!("recovery failed: {}", e)))?;
    if recovered != verifying_key {
        return Err(Error::SelfCheckFailed("recovery id does not recover the joint key".into()));
    }
    Ok(())
}
