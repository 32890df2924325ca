//! Versioned persistence of wallets, key metadata, permissions and encrypted
//! share sets

use super::{EncryptedShare, KvStore};
use crate::types::{KeyMetadata, PartyId, Permission, Wallet, WalletId};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};

/// One party's encrypted share, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    pub wallet_id: WalletId,
    pub party_id: PartyId,
    pub share_index: u64,
    pub encrypted: EncryptedShare,
}

impl KeyShare {
    pub fn version(&self) -> u64 {
        self.encrypted.version
    }
}

/// Storage for everything the service persists.
///
/// Share sets are written in two steps: [`ShareStore::stage_shares`] writes a
/// complete set under a new version, [`ShareStore::commit_shares`] moves the
/// version pointer (the key metadata) onto it and drops every other version.
/// Until commit, readers keep seeing the previous set.
#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn put_wallet(&self, wallet: &Wallet) -> Result<()>;

    async fn get_wallet(&self, address: &str) -> Result<Option<Wallet>>;

    async fn put_metadata(&self, metadata: &KeyMetadata) -> Result<()>;

    async fn get_metadata(&self, wallet_id: &str) -> Result<Option<KeyMetadata>>;

    /// Metadata of every wallet
    async fn list_metadata(&self) -> Result<Vec<KeyMetadata>>;

    /// Write a complete share set under `version` without making it current
    async fn stage_shares(&self, wallet_id: &str, version: u64, shares: Vec<KeyShare>)
    -> Result<()>;

    /// Make the staged set for `metadata.key_version` current and remove
    /// every other version
    async fn commit_shares(&self, metadata: &KeyMetadata) -> Result<()>;

    /// Remove a staged set that will never be committed
    async fn discard_staged(&self, wallet_id: &str, version: u64) -> Result<()>;

    /// Shares of the current version, ordered by party id
    async fn load_shares(&self, wallet_id: &str) -> Result<Vec<KeyShare>>;

    async fn put_permission(&self, permission: &Permission) -> Result<()>;

    async fn get_permission(&self, wallet_id: &str, grantee: &str) -> Result<Option<Permission>>;

    /// Every permission ever granted on a wallet, revoked ones included
    async fn list_permissions(&self, wallet_id: &str) -> Result<Vec<Permission>>;
}

/// Escape one key segment so it never contains the `/` separator.
///
/// Without this, `share/a/` would also prefix the shares of wallet `a/x`.
fn segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

fn wallet_key(address: &str) -> String {
    format!("wallet/{}", segment(address))
}

fn metadata_key(wallet_id: &str) -> String {
    format!("meta/{}", segment(wallet_id))
}

fn shares_prefix(wallet_id: &str) -> String {
    format!("share/{}/", segment(wallet_id))
}

fn version_prefix(wallet_id: &str, version: u64) -> String {
    format!("{}{:020}/", shares_prefix(wallet_id), version)
}

fn share_key(wallet_id: &str, version: u64, party_id: PartyId) -> String {
    format!("{}{:04}", version_prefix(wallet_id, version), party_id)
}

fn permissions_prefix(wallet_id: &str) -> String {
    format!("perm/{}/", segment(wallet_id))
}

fn permission_key(wallet_id: &str, grantee: &str) -> String {
    format!("{}{}", permissions_prefix(wallet_id), segment(grantee))
}

/// Per-wallet lock that drops its map entry once nobody else holds it
struct WalletGuard<'a, G> {
    locks: &'a DashMap<WalletId, Arc<RwLock<()>>>,
    wallet_id: String,
    guard: Option<G>,
}

impl<G> Drop for WalletGuard<'_, G> {
    fn drop(&mut self) {
        // Release the guard's handle before counting
        self.guard.take();
        self.locks
            .remove_if(&self.wallet_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// [`ShareStore`] over any [`KvStore`]
pub struct KvShareStore {
    kv: Arc<dyn KvStore>,
    locks: DashMap<WalletId, Arc<RwLock<()>>>,
}

impl KvShareStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, wallet_id: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(wallet_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    async fn write_lock(&self, wallet_id: &str) -> WalletGuard<'_, OwnedRwLockWriteGuard<()>> {
        let guard = self.lock_for(wallet_id).write_owned().await;
        WalletGuard {
            locks: &self.locks,
            wallet_id: wallet_id.to_string(),
            guard: Some(guard),
        }
    }

    async fn read_lock(&self, wallet_id: &str) -> WalletGuard<'_, OwnedRwLockReadGuard<()>> {
        let guard = self.lock_for(wallet_id).read_owned().await;
        WalletGuard {
            locks: &self.locks,
            wallet_id: wallet_id.to_string(),
            guard: Some(guard),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Storage(format!("corrupt record {}: {}", key, e))),
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.kv.set(key, serde_json::to_vec(value)?).await
    }

    async fn scan_shares(&self, prefix: &str) -> Result<Vec<KeyShare>> {
        self.kv
            .scan_prefix(prefix)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Storage(format!("corrupt share {}: {}", key, e)))
            })
            .collect()
    }

    async fn current_version(&self, wallet_id: &str) -> Result<Option<u64>> {
        Ok(self
            .read_json::<KeyMetadata>(&metadata_key(wallet_id))
            .await?
            .map(|m| m.key_version))
    }
}

impl std::fmt::Debug for KvShareStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvShareStore")
            .field("locked_wallets", &self.locks.len())
            .finish()
    }
}

#[async_trait]
impl ShareStore for KvShareStore {
    async fn put_wallet(&self, wallet: &Wallet) -> Result<()> {
        self.write_json(&wallet_key(&wallet.address), wallet).await
    }

    async fn get_wallet(&self, address: &str) -> Result<Option<Wallet>> {
        self.read_json(&wallet_key(address)).await
    }

    async fn put_metadata(&self, metadata: &KeyMetadata) -> Result<()> {
        let _guard = self.write_lock(&metadata.wallet_id).await;
        if let Some(current) = self.current_version(&metadata.wallet_id).await? {
            if current != metadata.key_version {
                return Err(Error::Storage(format!(
                    "metadata for {} is at version {}, refusing to write version {} outside a commit",
                    metadata.wallet_id, current, metadata.key_version
                )));
            }
        }
        self.write_json(&metadata_key(&metadata.wallet_id), metadata)
            .await
    }

    async fn get_metadata(&self, wallet_id: &str) -> Result<Option<KeyMetadata>> {
        self.read_json(&metadata_key(wallet_id)).await
    }

    async fn list_metadata(&self) -> Result<Vec<KeyMetadata>> {
        self.kv
            .scan_prefix("meta/")
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Storage(format!("corrupt record {}: {}", key, e)))
            })
            .collect()
    }

    async fn stage_shares(
        &self,
        wallet_id: &str,
        version: u64,
        shares: Vec<KeyShare>,
    ) -> Result<()> {
        if shares.is_empty() {
            return Err(Error::InvalidRequest("empty share set".into()));
        }
        for share in &shares {
            if share.wallet_id != wallet_id || share.version() != version {
                return Err(Error::InvalidRequest(format!(
                    "share for party {} does not belong to {} v{}",
                    share.party_id, wallet_id, version
                )));
            }
        }

        let _guard = self.write_lock(wallet_id).await;

        if let Some(current) = self.current_version(wallet_id).await? {
            if version <= current {
                return Err(Error::Storage(format!(
                    "staged version {} for {} does not exceed current {}",
                    version, wallet_id, current
                )));
            }
        }

        for share in &shares {
            self.write_json(&share_key(wallet_id, version, share.party_id), share)
                .await?;
        }
        debug!(wallet_id, version, count = shares.len(), "Staged share set");
        Ok(())
    }

    async fn commit_shares(&self, metadata: &KeyMetadata) -> Result<()> {
        let wallet_id = metadata.wallet_id.as_str();
        let version = metadata.key_version;
        let _guard = self.write_lock(wallet_id).await;

        if let Some(current) = self.current_version(wallet_id).await? {
            if version <= current {
                return Err(Error::Storage(format!(
                    "commit of version {} for {} does not exceed current {}",
                    version, wallet_id, current
                )));
            }
        }
        let staged = self.scan_shares(&version_prefix(wallet_id, version)).await?;
        if staged.is_empty() {
            return Err(Error::NotFound(format!(
                "no staged shares for {} v{}",
                wallet_id, version
            )));
        }

        self.write_json(&metadata_key(wallet_id), metadata).await?;

        let keep = version_prefix(wallet_id, version);
        for (key, _) in self.kv.scan_prefix(&shares_prefix(wallet_id)).await? {
            if !key.starts_with(&keep) {
                self.kv.delete(&key).await?;
            }
        }

        info!(wallet_id, version, shares = staged.len(), "Committed share set");
        Ok(())
    }

    async fn discard_staged(&self, wallet_id: &str, version: u64) -> Result<()> {
        let _guard = self.write_lock(wallet_id).await;

        if self.current_version(wallet_id).await? == Some(version) {
            return Err(Error::Storage(format!(
                "version {} of {} is committed",
                version, wallet_id
            )));
        }
        for (key, _) in self
            .kv
            .scan_prefix(&version_prefix(wallet_id, version))
            .await?
        {
            self.kv.delete(&key).await?;
        }
        debug!(wallet_id, version, "Discarded staged share set");
        Ok(())
    }

    async fn load_shares(&self, wallet_id: &str) -> Result<Vec<KeyShare>> {
        let _guard = self.read_lock(wallet_id).await;

        let version = self
            .current_version(wallet_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("key metadata for {}", wallet_id)))?;
        let shares = self.scan_shares(&version_prefix(wallet_id, version)).await?;
        if shares.is_empty() {
            return Err(Error::NotFound(format!(
                "shares for {} v{}",
                wallet_id, version
            )));
        }
        Ok(shares)
    }

    async fn put_permission(&self, permission: &Permission) -> Result<()> {
        self.write_json(
            &permission_key(&permission.wallet_address, &permission.grantee),
            permission,
        )
        .await
    }

    async fn get_permission(&self, wallet_id: &str, grantee: &str) -> Result<Option<Permission>> {
        self.read_json(&permission_key(wallet_id, grantee)).await
    }

    async fn list_permissions(&self, wallet_id: &str) -> Result<Vec<Permission>> {
        self.kv
            .scan_prefix(&permissions_prefix(wallet_id))
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Storage(format!("corrupt record {}: {}", key, e)))
            })
            .collect()
    }
}
