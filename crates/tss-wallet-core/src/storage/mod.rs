//! Encrypted share storage
//!
//! Shares only ever reach the [`KvStore`] as AES-256-GCM blobs produced by a
//! [`ShareCipher`]. Share sets are versioned per wallet and replaced
//! stage-then-swap, so a failed rotation never touches the current set.

mod encryption;
mod kv;
mod share_store;

pub use encryption::{
    EncryptedShare, EncryptionKey, KeyManager, MemoryKeyManager, NONCE_SIZE, ShareCipher,
    generate_encryption_key,
};
pub use kv::{KvStore, MemoryKvStore};
pub use share_store::{KeyShare, KvShareStore, ShareStore};
