//! Identity and authorization capability
//!
//! The engine never verifies credentials itself. Every signing, rotation,
//! recovery and permission change goes through an [`IdentityVerifier`], and
//! every outcome is reported back to it as an [`AuditEvent`].

use crate::{Error, Result, WalletId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// The authenticated party behind a request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Decentralized identifier of the caller
    pub did: String,
    /// OAuth / MFA token presented with the request
    pub auth_token: String,
}

impl Caller {
    pub fn new(did: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            auth_token: auth_token.into(),
        }
    }
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("did", &self.did)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

/// Audited operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    KeyGenerated,
    SignatureRequested,
    KeyRotated,
    PermissionGranted,
    PermissionRevoked,
    WalletRecovered,
    /// A stored share failed authentication
    DecryptionFailure,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::KeyGenerated => "key_generated",
            AuditAction::SignatureRequested => "signature_requested",
            AuditAction::KeyRotated => "key_rotated",
            AuditAction::PermissionGranted => "permission_granted",
            AuditAction::PermissionRevoked => "permission_revoked",
            AuditAction::WalletRecovered => "wallet_recovered",
            AuditAction::DecryptionFailure => "decryption_failure",
        };
        f.write_str(name)
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    /// DID of the caller, or `system` for scheduled work
    pub actor: String,
    pub wallet_id: WalletId,
    pub success: bool,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn success(action: AuditAction, actor: impl Into<String>, wallet_id: impl Into<WalletId>) -> Self {
        Self {
            action,
            actor: actor.into(),
            wallet_id: wallet_id.into(),
            success: true,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        action: AuditAction,
        actor: impl Into<String>,
        wallet_id: impl Into<WalletId>,
        error: &Error,
    ) -> Self {
        Self {
            success: false,
            detail: Some(error.to_string()),
            ..Self::success(action, actor, wallet_id)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Whether this event should page someone
    pub fn is_alert(&self) -> bool {
        self.action == AuditAction::DecryptionFailure
    }
}

/// Identity, authorization and audit capability
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Check that `did` is controlled by whoever presented `proof`
    async fn verify_did_ownership(&self, did: &str, proof: &[u8]) -> Result<()>;

    /// Check an OAuth / MFA token for `did`
    async fn verify_auth_token(&self, did: &str, token: &str) -> Result<()>;

    /// Fail with `RateLimited` once `did` exceeds its budget
    async fn check_rate_limit(&self, did: &str, action: AuditAction) -> Result<()>;

    /// Record an audit event
    async fn log_audit_event(&self, event: AuditEvent);
}

/// Default requests allowed per identity and window
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// In-memory [`IdentityVerifier`] with registered identities, a fixed-window
/// rate limiter and an audit log.
pub struct MemoryIdentityVerifier {
    tokens: DashMap<String, String>,
    proofs: DashMap<String, Vec<u8>>,
    windows: DashMap<String, (DateTime<Utc>, u32)>,
    limit: u32,
    window: Duration,
    events: Mutex<Vec<AuditEvent>>,
}

impl Default for MemoryIdentityVerifier {
    fn default() -> Self {
        Self {
            tokens: DashMap::new(),
            proofs: DashMap::new(),
            windows: DashMap::new(),
            limit: DEFAULT_RATE_LIMIT,
            window: Duration::minutes(1),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow at most `limit` requests per identity in each `window`
    pub fn with_rate_limit(mut self, limit: u32, window: Duration) -> Self {
        self.limit = limit;
        self.window = window;
        self
    }

    /// Register an identity with its auth token and ownership proof
    pub fn register(&self, did: &str, token: &str, proof: &[u8]) {
        self.tokens.insert(did.to_string(), token.to_string());
        self.proofs.insert(did.to_string(), proof.to_vec());
    }

    /// Invalidate an identity's token
    pub fn revoke_token(&self, did: &str) {
        self.tokens.remove(did);
    }

    /// Audit events recorded so far
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Recorded alerts
    pub fn alerts(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().filter(|e| e.is_alert()).cloned().collect()
    }
}

impl fmt::Debug for MemoryIdentityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryIdentityVerifier")
            .field("identities", &self.tokens.len())
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish()
    }
}

#[async_trait]
impl IdentityVerifier for MemoryIdentityVerifier {
    async fn verify_did_ownership(&self, did: &str, proof: &[u8]) -> Result<()> {
        match self.proofs.get(did) {
            Some(expected) if expected.as_slice() == proof => Ok(()),
            Some(_) => Err(Error::Unauthorized(format!("ownership proof rejected for {}", did))),
            None => Err(Error::Unauthorized(format!("unknown identity {}", did))),
        }
    }

    async fn verify_auth_token(&self, did: &str, token: &str) -> Result<()> {
        match self.tokens.get(did) {
            Some(expected) if expected.as_str() == token => Ok(()),
            _ => Err(Error::Unauthorized(format!("invalid auth token for {}", did))),
        }
    }

    async fn check_rate_limit(&self, did: &str, action: AuditAction) -> Result<()> {
        let now = Utc::now();
        let mut entry = self.windows.entry(did.to_string()).or_insert((now, 0));
        let (started, count) = entry.value_mut();
        if now - *started >= self.window {
            *started = now;
            *count = 0;
        }
        if *count >= self.limit {
            return Err(Error::RateLimited(format!(
                "{} exceeded {} requests per {}s ({})",
                did,
                self.limit,
                self.window.num_seconds(),
                action
            )));
        }
        *count += 1;
        Ok(())
    }

    async fn log_audit_event(&self, event: AuditEvent) {
        if event.is_alert() {
            warn!(
                action = %event.action,
                actor = %event.actor,
                wallet_id = %event.wallet_id,
                detail = ?event.detail,
                "Audit alert"
            );
        } else {
            info!(
                action = %event.action,
                actor = %event.actor,
                wallet_id = %event.wallet_id,
                success = event.success,
                "Audit event"
            );
        }
        self.events.lock().push(event);
    }
}
