//! AES-256-GCM share encryption
//!
//! Blobs are `nonce (12 bytes) || ciphertext || tag`. Keys come from a
//! [`KeyManager`] and are referenced by id, so a blob can be decrypted as long
//! as the key it names still exists.

use crate::{Error, Result};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use zeroize::Zeroizing;

/// AES-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// 256-bit symmetric key
pub type EncryptionKey = Zeroizing<[u8; 32]>;

/// Generate a random 256-bit key
pub fn generate_encryption_key() -> EncryptionKey {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(key.as_mut());
    key
}

/// Key-management boundary
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Current key for a wallet, generated on first use
    async fn wallet_key(&self, wallet_id: &str) -> Result<(String, EncryptionKey)>;

    /// Look up a key by id; `KeyNotFound` if unknown
    async fn key(&self, key_id: &str) -> Result<EncryptionKey>;
}

/// In-memory [`KeyManager`]
#[derive(Default)]
pub struct MemoryKeyManager {
    keys: DashMap<String, EncryptionKey>,
    wallet_keys: DashMap<String, String>,
}

impl MemoryKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a key; blobs encrypted under it become undecryptable
    pub fn destroy_key(&self, key_id: &str) -> bool {
        self.wallet_keys.retain(|_, id| id != key_id);
        self.keys.remove(key_id).is_some()
    }
}

impl std::fmt::Debug for MemoryKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyManager")
            .field("keys", &self.keys.len())
            .finish()
    }
}

#[async_trait]
impl KeyManager for MemoryKeyManager {
    async fn wallet_key(&self, wallet_id: &str) -> Result<(String, EncryptionKey)> {
        let key_id = self
            .wallet_keys
            .entry(wallet_id.to_string())
            .or_insert_with(|| {
                let key_id = format!("key-{}", uuid::Uuid::new_v4());
                self.keys.insert(key_id.clone(), generate_encryption_key());
                debug!(wallet_id, key_id = %key_id, "Generated wallet encryption key");
                key_id
            })
            .clone();
        let key = self.key(&key_id).await?;
        Ok((key_id, key))
    }

    async fn key(&self, key_id: &str) -> Result<EncryptionKey> {
        self.keys
            .get(key_id)
            .map(|k| k.value().clone())
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }
}

/// An encrypted share blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedShare {
    /// nonce || ciphertext || tag
    pub ciphertext: Vec<u8>,
    /// Id of the key the blob was encrypted under
    pub key_id: String,
    /// Key version of the share set this blob belongs to
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Encrypts and decrypts share blobs with keys from a [`KeyManager`]
#[derive(Clone)]
pub struct ShareCipher {
    keys: Arc<dyn KeyManager>,
}

impl ShareCipher {
    pub fn new(keys: Arc<dyn KeyManager>) -> Self {
        Self { keys }
    }

    /// Encrypt share bytes under the wallet's key
    pub async fn encrypt_share(
        &self,
        wallet_id: &str,
        share_bytes: &[u8],
        version: u64,
    ) -> Result<EncryptedShare> {
        let (key_id, key) = self.keys.wallet_key(wallet_id).await?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, share_bytes)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut ciphertext = Vec::with_capacity(NONCE_SIZE + sealed.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&sealed);

        Ok(EncryptedShare {
            ciphertext,
            key_id,
            version,
            created_at: Utc::now(),
        })
    }

    /// Decrypt a blob produced by [`ShareCipher::encrypt_share`]
    pub async fn decrypt_share(&self, blob: &[u8], key_id: &str) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.keys.key(key_id).await?;
        if blob.len() < NONCE_SIZE {
            error!(key_id, len = blob.len(), "Share blob shorter than nonce");
            return Err(Error::DecryptionFailed(format!(
                "blob of {} bytes is shorter than the nonce",
                blob.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| Error::DecryptionFailed(e.to_string()))?;
        let (nonce, sealed) = blob.split_at(NONCE_SIZE);

        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map(Zeroizing::new)
            .map_err(|_| {
                error!(key_id, "Share authentication failed");
                Error::DecryptionFailed("authentication tag mismatch".into())
            })
    }
}
