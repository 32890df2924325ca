//! Key share rotation
//!
//! Rotation regenerates a wallet's share set with a fresh DKG and replaces the
//! stored set stage-then-swap: the new set is encrypted and staged under the
//! next version, the version pointer is committed, and only then is the old
//! set removed. Until the commit succeeds the old shares stay readable.

use crate::session::{SessionManager, WalletLease};
use crate::storage::{KeyShare, ShareCipher, ShareStore};
use crate::types::KeyMetadata;
use crate::{Error, Result, SecurityLevel, WalletId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// Whether a wallet's shares are due for rotation at `now`.
///
/// The age is measured from the last rotation, or from creation if the key
/// was never rotated. A key exactly one interval old is due.
pub fn should_rotate(metadata: &KeyMetadata, now: DateTime<Utc>) -> bool {
    match metadata.security_level.rotation_interval() {
        Some(interval) => now - metadata.rotation_anchor() >= interval,
        None => false,
    }
}

/// A freshly generated, encrypted share set
#[derive(Debug)]
pub(crate) struct ProvisionedKey {
    pub public_key: Vec<u8>,
    pub shares: Vec<KeyShare>,
}

/// Generates, stores and rotates wallet share sets
pub struct RotationManager {
    sessions: Arc<SessionManager>,
    store: Arc<dyn ShareStore>,
    cipher: ShareCipher,
}

impl RotationManager {
    pub fn new(sessions: Arc<SessionManager>, store: Arc<dyn ShareStore>, cipher: ShareCipher) -> Self {
        Self {
            sessions,
            store,
            cipher,
        }
    }

    /// Run keygen for the leased wallet and encrypt every party's share
    /// under `version`. Nothing is persisted.
    pub(crate) async fn provision(
        &self,
        lease: &WalletLease,
        chain_id: &str,
        security_level: SecurityLevel,
        version: u64,
    ) -> Result<ProvisionedKey> {
        let wallet_id = lease.wallet_id();
        let deadline = Instant::now() + self.sessions.config().session_timeout();

        let session_id = self.sessions.start_keygen(lease, chain_id, security_level)?;
        let session = self.sessions.await_session(&session_id, deadline).await?;
        let public_key = session
            .public_key()
            .ok_or_else(|| Error::Internal(format!("keygen session {} has no public key", session_id)))?
            .to_vec();
        let shares = self.sessions.take_keygen_output(&session_id, deadline).await?;

        if shares.len() != security_level.parties() {
            return Err(Error::ThresholdNotMet {
                required: security_level.parties(),
                actual: shares.len(),
            });
        }
        if shares.iter().any(|s| s.public_key != public_key) {
            return Err(Error::VerificationFailed(
                "share does not match the session's joint public key".into(),
            ));
        }

        let mut encrypted = Vec::with_capacity(shares.len());
        for share in &shares {
            let bytes = Zeroizing::new(share.to_bytes()?);
            let blob = self.cipher.encrypt_share(wallet_id, &bytes, version).await?;
            encrypted.push(KeyShare {
                wallet_id: wallet_id.to_string(),
                party_id: share.party_id,
                share_index: share.share_index,
                encrypted: blob,
            });
        }

        Ok(ProvisionedKey {
            public_key,
            shares: encrypted,
        })
    }

    /// Stage a provisioned set and commit `metadata` as its version pointer.
    /// A failed commit discards the staged set.
    pub(crate) async fn persist(&self, key: ProvisionedKey, metadata: &KeyMetadata) -> Result<()> {
        let wallet_id = metadata.wallet_id.as_str();
        let version = metadata.key_version;

        let stored = async {
            self.store.stage_shares(wallet_id, version, key.shares).await?;
            self.store.commit_shares(metadata).await
        }
        .await;

        if let Err(e) = stored {
            if let Err(discard) = self.store.discard_staged(wallet_id, version).await {
                warn!(wallet_id, version, error = %discard, "Failed to discard staged shares");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Rotate a wallet's shares.
    ///
    /// Fails with `NotFound` if the wallet has no key metadata and with
    /// `SessionInProgress` if another session holds the wallet.
    pub async fn rotate_key_shares(&self, wallet_id: &str) -> Result<KeyMetadata> {
        if self.store.get_metadata(wallet_id).await?.is_none() {
            return Err(Error::NotFound(format!("key metadata for {}", wallet_id)));
        }
        let lease = self.sessions.reserve_wallet(wallet_id)?;
        self.rotate_under_lease(&lease).await
    }

    /// Rotate the shares of an already leased wallet
    #[instrument(skip(self, lease), fields(wallet_id = lease.wallet_id()))]
    pub async fn rotate_under_lease(&self, lease: &WalletLease) -> Result<KeyMetadata> {
        let wallet_id = lease.wallet_id();
        let current = self
            .store
            .get_metadata(wallet_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("key metadata for {}", wallet_id)))?;
        current.security_level.ensure_specified()?;

        let version = current.key_version + 1;
        let key = self
            .provision(lease, &current.chain_id, current.security_level, version)
            .await?;
        let public_key = key.public_key.clone();

        let now = Utc::now();
        let next = KeyMetadata {
            key_version: version,
            last_rotated: Some(now),
            ..current.clone()
        };
        self.persist(key, &next).await?;

        if let Some(mut wallet) = self.store.get_wallet(wallet_id).await? {
            wallet.public_key = hex::encode(&public_key);
            wallet.key_version = version;
            wallet.updated_at = now;
            self.store.put_wallet(&wallet).await?;
        }

        info!(
            wallet_id,
            from_version = current.key_version,
            to_version = version,
            "Key shares rotated"
        );
        Ok(next)
    }

    /// Wallets whose shares are due for rotation at `now`
    pub async fn due_wallets(&self, now: DateTime<Utc>) -> Result<Vec<WalletId>> {
        Ok(self
            .store
            .list_metadata()
            .await?
            .into_iter()
            .filter(|m| should_rotate(m, now))
            .map(|m| m.wallet_id)
            .collect())
    }

    /// Rotate every due wallet once. Returns the number rotated.
    pub async fn rotate_due(&self, now: DateTime<Utc>, shutdown: &CancellationToken) -> Result<usize> {
        let mut rotated = 0;
        for wallet_id in self.due_wallets(now).await? {
            if shutdown.is_cancelled() {
                break;
            }
            match self.rotate_key_shares(&wallet_id).await {
                Ok(_) => rotated += 1,
                Err(Error::SessionInProgress(_)) => {
                    debug!(wallet_id = %wallet_id, "Wallet busy, rotation deferred");
                }
                Err(e) => warn!(wallet_id = %wallet_id, error = %e, "Scheduled rotation failed"),
            }
        }
        Ok(rotated)
    }

    /// Check for due wallets periodically until `shutdown` fires
    pub fn spawn_scheduler(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(manager.sessions.config().rotation_check_interval());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match manager.rotate_due(Utc::now(), &shutdown).await {
                            Ok(0) => {}
                            Ok(rotated) => info!(rotated, "Scheduled rotation pass finished"),
                            Err(e) => warn!(error = %e, "Scheduled rotation pass failed"),
                        }
                    }
                }
            }
            debug!("Rotation scheduler stopped");
        })
    }
}
