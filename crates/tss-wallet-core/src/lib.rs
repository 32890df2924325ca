//! # TSS Wallet Core
//!
//! Custodial threshold-signature wallet engine. A wallet's private key only
//! ever exists as shares held by separate parties; signatures are produced
//! jointly without reconstructing it.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Distributed key generation**: t-of-n Feldman VSS over secp256k1 with
//!   Paillier pre-parameters ([`keygen`])
//! - **Threshold ECDSA**: GG18-style signing among a quorum, self-verified
//!   against the joint key ([`sign`])
//! - **Session management**: per-wallet exclusivity, party tasks, deadlines,
//!   cancellation and sweeping ([`session`])
//! - **Encrypted share storage**: AES-256-GCM blobs over a narrow key-value
//!   contract, versioned stage-then-swap ([`storage`])
//! - **Key rotation**: security-level driven schedule ([`rotation`])
//! - **Signature formats**: Ethereum, Cosmos and Bitcoin DER encodings chosen
//!   through a static network registry ([`format`], [`network`])
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tss_wallet_core::identity::{Caller, MemoryIdentityVerifier};
//! use tss_wallet_core::service::{GenerateKeySharesRequest, SigningRequest, TssWalletService};
//! use tss_wallet_core::storage::{MemoryKeyManager, MemoryKvStore};
//! use tss_wallet_core::{SecurityLevel, TssConfig, sha256_digest};
//!
//! let service = TssWalletService::new(
//!     TssConfig::default(),
//!     Arc::new(MemoryKvStore::new()),
//!     Arc::new(MemoryKeyManager::new()),
//!     identity,
//! )?;
//!
//! let generated = service
//!     .generate_key_shares(&caller, GenerateKeySharesRequest {
//!         wallet_address: "w1".into(),
//!         chain_id: "chain-1".into(),
//!         security_level: SecurityLevel::Standard,
//!     })
//!     .await?;
//!
//! let signed = service
//!     .initiate_signing(&caller, SigningRequest {
//!         wallet_id: "w1".into(),
//!         message_hash: sha256_digest(b"hello"),
//!     })
//!     .await?;
//! ```
//!
//! ## Security Model
//!
//! - Shares are zeroized on drop and never logged
//! - Shares are only persisted encrypted, under a per-wallet key
//! - At most one keygen, signing or rotation session runs per wallet
//! - Every signature is verified against the joint key before it is returned

pub mod config;
pub mod error;
pub mod format;
pub mod identity;
pub mod keygen;
pub mod mpc;
pub mod network;
pub mod paillier;
pub mod rotation;
pub mod service;
pub mod session;
pub mod sign;
pub mod storage;
pub mod types;

pub use config::TssConfig;
pub use error::{Error, ErrorCategory, Result};
pub use format::SignatureFormatAdapter;
pub use identity::{AuditAction, AuditEvent, Caller, IdentityVerifier};
pub use network::{NetworkInfo, NetworkRegistry};
pub use rotation::{RotationManager, should_rotate};
pub use service::TssWalletService;
pub use session::{SessionManager, SessionState};
pub use types::{
    KeyMetadata, PartyContribution, PartyId, Permission, PermissionKind, SecurityLevel,
    SessionId, ShareData, SignatureResult, Wallet, WalletId, WalletStatus, sha256_digest,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
