//! Wallet service
//!
//! [`TssWalletService`] implements the request/response contracts on top of
//! the session manager, share storage, rotation manager and identity
//! capability. Every state-changing call is authorized through the
//! [`IdentityVerifier`] and audited, successful or not.

use crate::config::TssConfig;
use crate::format::SignatureFormatAdapter;
use crate::identity::{AuditAction, AuditEvent, Caller, IdentityVerifier};
use crate::network::NetworkRegistry;
use crate::rotation::RotationManager;
use crate::session::{MemorySessionStore, SessionManager, SessionStore};
use crate::storage::{KeyManager, KvShareStore, KvStore, ShareCipher, ShareStore};
use crate::types::{KeyMetadata, Permission, PermissionKind, Wallet, WalletStatus};
use crate::{Error, Result, SecurityLevel, ShareData, SignatureResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Request to create a wallet's key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateKeySharesRequest {
    pub wallet_address: String,
    pub chain_id: String,
    pub security_level: SecurityLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateKeySharesResponse {
    /// Joint public key (compressed SEC1)
    pub public_key: Vec<u8>,
    pub metadata: KeyMetadata,
}

/// Request to sign a 32-byte message digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub wallet_id: String,
    pub message_hash: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningResponse {
    /// Signature with the chain's wire encoding as raw bytes
    pub signature: SignatureResult,
    pub metadata: KeyMetadata,
}

/// Request to delegate access to a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantPermissionRequest {
    pub wallet_id: String,
    pub grantee: String,
    /// Permission names: `sign`, `rotate`, `recover`, `view`
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Custodial threshold wallet service
pub struct TssWalletService {
    sessions: Arc<SessionManager>,
    store: Arc<dyn ShareStore>,
    cipher: ShareCipher,
    rotation: Arc<RotationManager>,
    identity: Arc<dyn IdentityVerifier>,
    adapter: SignatureFormatAdapter,
}

impl TssWalletService {
    /// Service over a key-value store with in-memory session tracking and
    /// the built-in network registry
    pub fn new(
        config: TssConfig,
        kv: Arc<dyn KvStore>,
        keys: Arc<dyn KeyManager>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Result<Self> {
        Self::from_parts(
            config,
            NetworkRegistry::default(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(KvShareStore::new(kv)),
            keys,
            identity,
        )
    }

    /// Service over explicit collaborators
    pub fn from_parts(
        config: TssConfig,
        registry: NetworkRegistry,
        session_store: Arc<dyn SessionStore>,
        store: Arc<dyn ShareStore>,
        keys: Arc<dyn KeyManager>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Result<Self> {
        config.validate()?;
        let sessions = Arc::new(SessionManager::new(session_store, registry, config));
        let cipher = ShareCipher::new(keys);
        let rotation = Arc::new(RotationManager::new(
            Arc::clone(&sessions),
            Arc::clone(&store),
            cipher.clone(),
        ));
        Ok(Self {
            sessions,
            store,
            cipher,
            rotation,
            identity,
            adapter: SignatureFormatAdapter::new(registry),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn rotation(&self) -> &Arc<RotationManager> {
        &self.rotation
    }

    /// Start the session sweeper and the rotation scheduler
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.sessions.spawn_sweeper(shutdown.clone()),
            self.rotation.spawn_scheduler(shutdown),
        ]
    }

    // ============ Key generation ============

    /// Create a wallet owned by the caller and generate its key shares
    #[instrument(skip(self, caller, request), fields(wallet_id = %request.wallet_address, chain_id = %request.chain_id))]
    pub async fn generate_key_shares(
        &self,
        caller: &Caller,
        request: GenerateKeySharesRequest,
    ) -> Result<GenerateKeySharesResponse> {
        let wallet_id = request.wallet_address.trim();
        if wallet_id.is_empty() {
            return Err(Error::InvalidRequest("wallet address is empty".into()));
        }
        if wallet_id.chars().any(char::is_control) {
            return Err(Error::InvalidRequest(
                "wallet address contains control characters".into(),
            ));
        }
        request.security_level.ensure_specified()?;
        self.sessions
            .registry()
            .get(&request.chain_id)?
            .ensure_threshold_ecdsa()?;

        self.authenticate(caller, wallet_id, AuditAction::KeyGenerated)
            .await?;

        let result = self.generate_inner(caller, wallet_id, &request).await;
        self.audit(AuditAction::KeyGenerated, &caller.did, wallet_id, &result)
            .await;
        result
    }

    async fn generate_inner(
        &self,
        caller: &Caller,
        wallet_id: &str,
        request: &GenerateKeySharesRequest,
    ) -> Result<GenerateKeySharesResponse> {
        let lease = self.sessions.reserve_wallet(wallet_id)?;
        if self.store.get_wallet(wallet_id).await?.is_some()
            || self.store.get_metadata(wallet_id).await?.is_some()
        {
            return Err(Error::InvalidRequest(format!(
                "wallet {} already exists",
                wallet_id
            )));
        }

        let metadata = KeyMetadata::new(wallet_id, &request.chain_id, request.security_level);
        let key = self
            .rotation
            .provision(
                &lease,
                &request.chain_id,
                request.security_level,
                metadata.key_version,
            )
            .await?;
        let public_key = key.public_key.clone();
        self.rotation.persist(key, &metadata).await?;

        let now = Utc::now();
        self.store
            .put_wallet(&Wallet {
                address: wallet_id.to_string(),
                owner: caller.did.clone(),
                chain_id: request.chain_id.clone(),
                status: WalletStatus::Active,
                public_key: hex::encode(&public_key),
                key_version: metadata.key_version,
                created_at: now,
                updated_at: now,
                usage_count: 0,
            })
            .await?;

        info!(
            wallet_id,
            security_level = %request.security_level,
            public_key = %hex::encode(&public_key),
            "Wallet key shares generated"
        );
        Ok(GenerateKeySharesResponse {
            public_key,
            metadata,
        })
    }

    // ============ Signing ============

    /// Sign a 32-byte digest with the wallet's quorum
    #[instrument(skip(self, caller, request), fields(wallet_id = %request.wallet_id))]
    pub async fn initiate_signing(
        &self,
        caller: &Caller,
        request: SigningRequest,
    ) -> Result<SigningResponse> {
        let wallet = self.active_wallet(&request.wallet_id).await?;
        self.authorize(caller, &wallet, PermissionKind::Sign, AuditAction::SignatureRequested)
            .await?;

        let result = self.sign_inner(&wallet.address, &request.message_hash).await;
        self.audit(
            AuditAction::SignatureRequested,
            &caller.did,
            &request.wallet_id,
            &result,
        )
        .await;
        result
    }

    /// Hash `message` the way the wallet's chain expects, then sign it
    pub async fn sign_message(
        &self,
        caller: &Caller,
        wallet_id: &str,
        message: &[u8],
    ) -> Result<SigningResponse> {
        let wallet = self.get_wallet(wallet_id).await?;
        let network = self.sessions.registry().get(&wallet.chain_id)?;
        self.initiate_signing(caller, SigningRequest {
            wallet_id: wallet_id.to_string(),
            message_hash: network.signing.hash.digest(message),
        })
        .await
    }

    async fn sign_inner(&self, wallet_id: &str, message_hash: &[u8; 32]) -> Result<SigningResponse> {
        let lease = self.sessions.reserve_wallet(wallet_id)?;
        // Re-read under the lease; a rotation may have finished meanwhile
        let mut wallet = self.active_wallet(wallet_id).await?;
        let mut metadata = self.metadata(wallet_id).await?;

        let shares = self
            .load_quorum(wallet_id, metadata.security_level.threshold())
            .await?;
        let deadline = Instant::now() + self.sessions.config().session_timeout();
        let session_id = self.sessions.start_signing(&lease, *message_hash, shares)?;
        let session = self.sessions.await_session(&session_id, deadline).await?;
        let signature = session
            .signature()
            .cloned()
            .ok_or_else(|| Error::Internal(format!("signing session {} has no signature", session_id)))?;
        let signature = self.adapter.apply(&wallet.chain_id, signature)?;

        let now = Utc::now();
        metadata.record_usage(now);
        self.store.put_metadata(&metadata).await?;
        wallet.usage_count += 1;
        wallet.updated_at = now;
        self.store.put_wallet(&wallet).await?;

        Ok(SigningResponse {
            signature,
            metadata,
        })
    }

    /// Decrypt the first `threshold` shares of the current set
    async fn load_quorum(&self, wallet_id: &str, threshold: usize) -> Result<Vec<ShareData>> {
        let stored = self.store.load_shares(wallet_id).await?;
        if stored.len() < threshold {
            return Err(Error::ThresholdNotMet {
                required: threshold,
                actual: stored.len(),
            });
        }

        let mut shares = Vec::with_capacity(threshold);
        for share in stored.iter().take(threshold) {
            let bytes = match self
                .cipher
                .decrypt_share(&share.encrypted.ciphertext, &share.encrypted.key_id)
                .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    if e.is_audit_alert() {
                        error!(
                            wallet_id,
                            party_id = share.party_id,
                            version = share.version(),
                            error = %e,
                            "Stored share failed to decrypt"
                        );
                        self.identity
                            .log_audit_event(
                                AuditEvent::failure(
                                    AuditAction::DecryptionFailure,
                                    "system",
                                    wallet_id,
                                    &e,
                                )
                                .with_detail(format!(
                                    "party {} share v{}: {}",
                                    share.party_id,
                                    share.version(),
                                    e
                                )),
                            )
                            .await;
                    }
                    return Err(e);
                }
            };
            shares.push(ShareData::from_bytes(&bytes)?);
        }
        Ok(shares)
    }

    // ============ Rotation & recovery ============

    /// Rotate a wallet's key shares on behalf of the caller
    pub async fn rotate_key_shares(&self, caller: &Caller, wallet_id: &str) -> Result<KeyMetadata> {
        let wallet = self.active_wallet(wallet_id).await?;
        self.authorize(caller, &wallet, PermissionKind::Rotate, AuditAction::KeyRotated)
            .await?;

        let result = self.rotation.rotate_key_shares(wallet_id).await;
        self.audit(AuditAction::KeyRotated, &caller.did, wallet_id, &result)
            .await;
        result
    }

    /// Transfer a wallet to `new_owner`.
    ///
    /// `proof` must satisfy [`IdentityVerifier::verify_did_ownership`] for the
    /// new owner. The key is regenerated so no share issued to the previous
    /// owner remains valid; the wallet reads `recovering` meanwhile and goes
    /// back to `active` whatever the outcome.
    #[instrument(skip(self, caller, proof))]
    pub async fn recover_wallet(
        &self,
        caller: &Caller,
        wallet_id: &str,
        new_owner: &str,
        proof: &[u8],
    ) -> Result<Wallet> {
        if new_owner.trim().is_empty() {
            return Err(Error::InvalidRequest("new owner is empty".into()));
        }
        let wallet = self.active_wallet(wallet_id).await?;
        self.authorize(caller, &wallet, PermissionKind::Recover, AuditAction::WalletRecovered)
            .await?;

        let result = self.recover_inner(&wallet.address, new_owner, proof).await;
        self.audit(AuditAction::WalletRecovered, &caller.did, wallet_id, &result)
            .await;
        result
    }

    async fn recover_inner(&self, wallet_id: &str, new_owner: &str, proof: &[u8]) -> Result<Wallet> {
        self.identity
            .verify_did_ownership(new_owner, proof)
            .await?;
        let lease = self.sessions.reserve_wallet(wallet_id)?;
        let mut wallet = self.active_wallet(wallet_id).await?;

        wallet.status = WalletStatus::Recovering;
        wallet.updated_at = Utc::now();
        self.store.put_wallet(&wallet).await?;

        if let Err(e) = self.rotation.rotate_under_lease(&lease).await {
            wallet.status = WalletStatus::Active;
            wallet.updated_at = Utc::now();
            self.store.put_wallet(&wallet).await?;
            return Err(e);
        }

        let revoked = self.revoke_all_grants(wallet_id).await?;

        // Rotation refreshed the key fields of the stored record
        let mut recovered = self.get_wallet(&wallet.address).await?;
        let previous = std::mem::replace(&mut recovered.owner, new_owner.to_string());
        recovered.status = WalletStatus::Active;
        recovered.updated_at = Utc::now();
        self.store.put_wallet(&recovered).await?;

        info!(
            wallet_id = %recovered.address,
            previous_owner = %previous,
            new_owner,
            key_version = recovered.key_version,
            revoked_grants = revoked,
            "Wallet recovered"
        );
        Ok(recovered)
    }

    /// Grants issued by the previous owner do not survive a transfer
    async fn revoke_all_grants(&self, wallet_id: &str) -> Result<usize> {
        let now = Utc::now();
        let mut revoked = 0;
        for mut permission in self.store.list_permissions(wallet_id).await? {
            if permission.revoked {
                continue;
            }
            permission.revoked = true;
            permission.revoked_at = Some(now);
            self.store.put_permission(&permission).await?;
            self.identity
                .log_audit_event(
                    AuditEvent::success(AuditAction::PermissionRevoked, "system", wallet_id)
                        .with_detail(format!("{} revoked on recovery", permission.grantee)),
                )
                .await;
            revoked += 1;
        }
        Ok(revoked)
    }

    // ============ Permissions ============

    /// Delegate access to a wallet. Only the owner may grant.
    pub async fn grant_permission(
        &self,
        caller: &Caller,
        request: GrantPermissionRequest,
    ) -> Result<Permission> {
        let permissions = parse_permissions(&request.permissions)?;
        if request.grantee.trim().is_empty() {
            return Err(Error::InvalidPermission("grantee is empty".into()));
        }
        let now = Utc::now();
        if request.expires_at.is_some_and(|at| at <= now) {
            return Err(Error::InvalidPermission("expiry is in the past".into()));
        }

        let wallet = self.get_wallet(&request.wallet_id).await?;
        if request.grantee == wallet.owner {
            return Err(Error::InvalidPermission("owner cannot be a grantee".into()));
        }
        self.authorize_owner(caller, &wallet, AuditAction::PermissionGranted)
            .await?;

        let permission = Permission {
            wallet_address: wallet.address.clone(),
            grantee: request.grantee.clone(),
            permissions,
            granted_at: now,
            expires_at: request.expires_at,
            revoked: false,
            revoked_at: None,
        };
        let result = self.store.put_permission(&permission).await.map(|_| permission);
        self.audit(AuditAction::PermissionGranted, &caller.did, &wallet.address, &result)
            .await;
        result
    }

    /// Revoke a grantee's access. Revoking twice keeps the first timestamp.
    pub async fn revoke_permission(
        &self,
        caller: &Caller,
        wallet_id: &str,
        grantee: &str,
    ) -> Result<Permission> {
        let wallet = self.get_wallet(wallet_id).await?;
        self.authorize_owner(caller, &wallet, AuditAction::PermissionRevoked)
            .await?;

        let result = async {
            let mut permission = self
                .store
                .get_permission(wallet_id, grantee)
                .await?
                .ok_or_else(|| Error::NotFound(format!("permission for {} on {}", grantee, wallet_id)))?;
            if !permission.revoked {
                permission.revoked = true;
                permission.revoked_at = Some(Utc::now());
                self.store.put_permission(&permission).await?;
            }
            Ok(permission)
        }
        .await;
        self.audit(AuditAction::PermissionRevoked, &caller.did, wallet_id, &result)
            .await;
        result
    }

    // ============ Queries ============

    pub async fn get_wallet(&self, wallet_id: &str) -> Result<Wallet> {
        self.store
            .get_wallet(wallet_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("wallet {}", wallet_id)))
    }

    pub async fn get_key_metadata(&self, wallet_id: &str) -> Result<KeyMetadata> {
        self.metadata(wallet_id).await
    }

    /// Encode a signature in the wire format of `chain_id`
    pub fn encode_signature(&self, chain_id: &str, signature: Option<&SignatureResult>) -> Result<Vec<u8>> {
        self.adapter.encode(chain_id, signature)
    }

    // ============ Helpers ============

    async fn metadata(&self, wallet_id: &str) -> Result<KeyMetadata> {
        self.store
            .get_metadata(wallet_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("key metadata for {}", wallet_id)))
    }

    async fn active_wallet(&self, wallet_id: &str) -> Result<Wallet> {
        if wallet_id.trim().is_empty() {
            return Err(Error::InvalidRequest("wallet id is empty".into()));
        }
        let wallet = self.get_wallet(wallet_id).await?;
        if wallet.status != WalletStatus::Active {
            return Err(Error::InvalidRequest(format!(
                "wallet {} is {:?}",
                wallet_id, wallet.status
            )));
        }
        Ok(wallet)
    }

    /// Token and rate-limit checks; failures are audited
    async fn authenticate(&self, caller: &Caller, wallet_id: &str, action: AuditAction) -> Result<()> {
        let checked: Result<()> = async {
            self.identity
                .verify_auth_token(&caller.did, &caller.auth_token)
                .await?;
            self.identity.check_rate_limit(&caller.did, action).await
        }
        .await;
        self.audit_denial(caller, wallet_id, action, checked).await
    }

    /// Owner, or a grantee holding a live permission of `kind`
    async fn authorize(
        &self,
        caller: &Caller,
        wallet: &Wallet,
        kind: PermissionKind,
        action: AuditAction,
    ) -> Result<()> {
        self.authenticate(caller, &wallet.address, action).await?;
        if caller.did == wallet.owner {
            return Ok(());
        }
        let checked = match self.store.get_permission(&wallet.address, &caller.did).await {
            Ok(Some(permission)) => permission.authorize(kind, Utc::now()),
            Ok(None) => Err(Error::Unauthorized(format!(
                "{} has no access to {}",
                caller.did, wallet.address
            ))),
            Err(e) => Err(e),
        };
        self.audit_denial(caller, &wallet.address, action, checked).await
    }

    async fn authorize_owner(&self, caller: &Caller, wallet: &Wallet, action: AuditAction) -> Result<()> {
        self.authenticate(caller, &wallet.address, action).await?;
        let checked = if caller.did == wallet.owner {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "only the owner may manage permissions on {}",
                wallet.address
            )))
        };
        self.audit_denial(caller, &wallet.address, action, checked).await
    }

    async fn audit_denial(
        &self,
        caller: &Caller,
        wallet_id: &str,
        action: AuditAction,
        checked: Result<()>,
    ) -> Result<()> {
        if let Err(e) = &checked {
            warn!(did = %caller.did, wallet_id, %action, error = %e, "Request denied");
            self.identity
                .log_audit_event(AuditEvent::failure(action, &caller.did, wallet_id, e))
                .await;
        }
        checked
    }

    async fn audit<T>(&self, action: AuditAction, actor: &str, wallet_id: &str, result: &Result<T>) {
        let event = match result {
            Ok(_) => AuditEvent::success(action, actor, wallet_id),
            Err(e) => AuditEvent::failure(action, actor, wallet_id, e),
        };
        self.identity.log_audit_event(event).await;
    }
}

/// Parse a non-empty, duplicate-free permission set
fn parse_permissions(names: &[String]) -> Result<Vec<PermissionKind>> {
    if names.is_empty() {
        return Err(Error::InvalidPermission("permission set is empty".into()));
    }
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| {
            let kind: PermissionKind = name.trim().parse()?;
            if !seen.insert(kind) {
                return Err(Error::InvalidPermission(format!("duplicate permission '{}'", name)));
            }
            Ok(kind)
        })
        .collect()
}
