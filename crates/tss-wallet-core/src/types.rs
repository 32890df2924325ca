//! Core types for the threshold wallet engine
//!
//! Wallet records, key metadata, permissions, signing artifacts and the
//! per-party [`ShareData`] produced by distributed key generation.

use crate::paillier::{PaillierPublicKey, PaillierSecretKey};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use k256::{
    AffinePoint, ProjectivePoint, Scalar,
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroize;

/// Index of a party inside a protocol session (0-based)
pub type PartyId = usize;

/// Unique identifier for a session
pub type SessionId = String;

/// Wallet identifier (the wallet address)
pub type WalletId = String;

/// Security level of a wallet's key material.
///
/// Determines the party count, the signing quorum and how often shares must
/// be rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Not set; rejected for key generation and never rotated
    #[default]
    Unspecified,
    /// 2-of-2, rotated every 90 days
    Standard,
    /// 2-of-3, rotated every 30 days
    High,
    /// 3-of-3, rotated every 180 days
    Enterprise,
}

impl SecurityLevel {
    /// Number of parties holding a share
    pub fn parties(&self) -> usize {
        match self {
            SecurityLevel::Unspecified => 0,
            SecurityLevel::Standard => 2,
            SecurityLevel::High | SecurityLevel::Enterprise => 3,
        }
    }

    /// Number of parties required to sign (the quorum)
    pub fn threshold(&self) -> usize {
        match self {
            SecurityLevel::Unspecified => 0,
            SecurityLevel::Standard | SecurityLevel::High => 2,
            SecurityLevel::Enterprise => 3,
        }
    }

    /// Maximum share age before rotation is due
    pub fn rotation_interval(&self) -> Option<Duration> {
        match self {
            SecurityLevel::Unspecified => None,
            SecurityLevel::High => Some(Duration::days(30)),
            SecurityLevel::Standard => Some(Duration::days(90)),
            SecurityLevel::Enterprise => Some(Duration::days(180)),
        }
    }

    /// Reject the unspecified level
    pub fn ensure_specified(&self) -> Result<()> {
        if *self == SecurityLevel::Unspecified {
            return Err(Error::UnspecifiedSecurityLevel);
        }
        Ok(())
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Unspecified => write!(f, "unspecified"),
            SecurityLevel::Standard => write!(f, "standard"),
            SecurityLevel::High => write!(f, "high"),
            SecurityLevel::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Lifecycle status of a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    Inactive,
    /// Ownership transfer through recovery is under way
    Recovering,
}

/// A custodial wallet backed by threshold key shares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet address (unique)
    pub address: WalletId,
    /// Identity reference (DID) of the owner
    pub owner: String,
    /// Chain the wallet signs for
    pub chain_id: String,
    pub status: WalletStatus,
    /// Joint public key (compressed SEC1, hex)
    pub public_key: String,
    /// Version of the current share set
    pub key_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of signatures produced
    pub usage_count: u64,
}

/// Backup state of a wallet's key material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    #[default]
    None,
    Pending,
    Completed,
    Failed,
}

/// Metadata attached to a wallet's key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub wallet_id: WalletId,
    pub chain_id: String,
    pub security_level: SecurityLevel,
    pub key_version: u64,
    pub created_at: DateTime<Utc>,
    pub last_rotated: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub backup_status: BackupStatus,
}

impl KeyMetadata {
    /// Fresh metadata for a newly generated key (version 1)
    pub fn new(
        wallet_id: impl Into<WalletId>,
        chain_id: impl Into<String>,
        security_level: SecurityLevel,
    ) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            chain_id: chain_id.into(),
            security_level,
            key_version: 1,
            created_at: Utc::now(),
            last_rotated: None,
            last_used: None,
            usage_count: 0,
            backup_status: BackupStatus::None,
        }
    }

    /// Reference point for rotation age: last rotation, else creation
    pub fn rotation_anchor(&self) -> DateTime<Utc> {
        self.last_rotated.unwrap_or(self.created_at)
    }

    /// Record one signing operation
    pub fn record_usage(&mut self, at: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used = Some(at);
    }
}

/// Actions a grantee may be permitted to perform on a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Sign,
    Rotate,
    Recover,
    View,
}

impl std::str::FromStr for PermissionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sign" => Ok(PermissionKind::Sign),
            "rotate" => Ok(PermissionKind::Rotate),
            "recover" => Ok(PermissionKind::Recover),
            "view" => Ok(PermissionKind::View),
            other => Err(Error::InvalidPermission(format!(
                "unknown permission '{}'",
                other
            ))),
        }
    }
}

/// Delegated access to a wallet for a non-owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub wallet_address: WalletId,
    pub grantee: String,
    pub permissions: Vec<PermissionKind>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Permission {
    /// Check that the permission is live and covers `kind`
    pub fn authorize(&self, kind: PermissionKind, now: DateTime<Utc>) -> Result<()> {
        if self.revoked {
            return Err(Error::PermissionRevoked {
                wallet: self.wallet_address.clone(),
                grantee: self.grantee.clone(),
            });
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return Err(Error::PermissionExpired {
                    wallet: self.wallet_address.clone(),
                    grantee: self.grantee.clone(),
                });
            }
        }
        if !self.permissions.contains(&kind) {
            return Err(Error::Unauthorized(format!(
                "{} lacks {:?} on {}",
                self.grantee, kind, self.wallet_address
            )));
        }
        Ok(())
    }
}

/// A finished threshold signature.
///
/// Immutable once produced: components are only readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureResult {
    r: Vec<u8>,
    s: Vec<u8>,
    v: Option<u8>,
    raw: Vec<u8>,
}

impl SignatureResult {
    /// Build from R and S big-endian integers and an optional recovery byte.
    /// Raw bytes default to the fixed-width `R || S` concatenation.
    pub fn new(r: Vec<u8>, s: Vec<u8>, v: Option<u8>) -> Self {
        let mut raw = Vec::with_capacity(64);
        raw.extend_from_slice(&left_pad_32(&r));
        raw.extend_from_slice(&left_pad_32(&s));
        Self { r, s, v, raw }
    }

    /// Same signature carrying chain-specific wire bytes
    pub fn with_wire_bytes(mut self, raw: Vec<u8>) -> Self {
        self.raw = raw;
        self
    }

    pub fn r(&self) -> &[u8] {
        &self.r
    }

    pub fn s(&self) -> &[u8] {
        &self.s
    }

    /// Recovery byte (0 or 1 for secp256k1)
    pub fn v(&self) -> Option<u8> {
        self.v
    }

    /// Encoded bytes as last produced
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Left-pad (or keep) a big-endian integer to 32 bytes; longer input keeps its
/// low 32 bytes, callers validate lengths beforehand.
pub(crate) fn left_pad_32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let src = if bytes.len() > 32 {
        &bytes[bytes.len() - 32..]
    } else {
        bytes
    };
    out[32 - src.len()..].copy_from_slice(src);
    out
}

/// A contribution submitted by a party to a keygen session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyContribution {
    pub party_id: String,
    /// Joint public key as computed by this party (compressed SEC1)
    pub public_key: Vec<u8>,
    pub chain_id: String,
}

impl PartyContribution {
    pub fn validate(&self) -> Result<()> {
        if self.party_id.trim().is_empty() {
            return Err(Error::InvalidPartyData("party id is empty".into()));
        }
        if self.public_key.is_empty() {
            return Err(Error::InvalidPartyData(format!(
                "public key from {} is empty",
                self.party_id
            )));
        }
        if self.chain_id.trim().is_empty() {
            return Err(Error::InvalidPartyData(format!(
                "chain id from {} is not set",
                self.party_id
            )));
        }
        Ok(())
    }
}

pub(crate) mod scalar_serde {
    use k256::{
        Scalar,
        elliptic_curve::{bigint::U256, ops::Reduce},
    };
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(scalar.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(encoded).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid scalar length"))?;
        Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
    }
}

/// One party's output of distributed key generation.
///
/// Treated as an opaque blob outside the protocol engines: it is serialized
/// with [`ShareData::to_bytes`] and only ever persisted encrypted.
#[derive(Clone, Serialize, Deserialize)]
pub struct ShareData {
    /// This party's index in the session
    pub party_id: PartyId,
    /// Evaluation point of this share (party_id + 1)
    pub share_index: u64,
    /// Total number of parties
    pub n_parties: usize,
    /// Parties required to sign
    pub threshold: usize,
    /// Secret share x_i of the joint key
    #[serde(with = "scalar_serde")]
    pub secret_share: Scalar,
    /// Joint public key (compressed, 33 bytes)
    pub public_key: Vec<u8>,
    /// x_j * G for every party j
    pub public_shares: Vec<Vec<u8>>,
    /// This party's Paillier key (pre-parameters)
    pub paillier_key: PaillierSecretKey,
    /// Paillier public keys of every party, indexed by party id
    pub paillier_public_keys: Vec<PaillierPublicKey>,
    pub chain_id: String,
}

impl ShareData {
    /// Serialize into an opaque byte blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse an opaque blob produced by [`ShareData::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// The joint public key as a curve point
    pub fn public_key_point(&self) -> Result<ProjectivePoint> {
        decode_point(&self.public_key)
    }
}

impl Drop for ShareData {
    fn drop(&mut self) {
        self.secret_share.zeroize();
    }
}

impl fmt::Debug for ShareData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShareData")
            .field("party_id", &self.party_id)
            .field("share_index", &self.share_index)
            .field("threshold", &self.threshold)
            .field("n_parties", &self.n_parties)
            .field("secret_share", &"[REDACTED]")
            .field("public_key", &hex::encode(&self.public_key))
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

/// Decode a SEC1-encoded secp256k1 point
pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded =
        k256::EncodedPoint::from_bytes(bytes).map_err(|e| Error::Crypto(e.to_string()))?;
    let affine_opt = AffinePoint::from_encoded_point(&encoded);
    let affine: AffinePoint = Option::<AffinePoint>::from(affine_opt)
        .ok_or_else(|| Error::Crypto("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Compressed SEC1 encoding of a point
pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// SHA-256 digest of a message
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
