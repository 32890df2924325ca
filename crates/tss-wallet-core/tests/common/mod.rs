//! Shared fixtures

#![allow(dead_code)]

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey, signature::hazmat::PrehashVerifier};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tss_wallet_core::{
    Caller, ShareData, SignatureResult, TssConfig, TssWalletService,
    identity::MemoryIdentityVerifier,
    keygen::{KeygenConfig, run_dkg},
    mpc::{ChannelNetwork, Relay},
    network::NetworkRegistry,
    paillier::{MIN_MODULUS_BITS, PaillierSecretKey},
    session::MemorySessionStore,
    sign::run_dsg,
    storage::{KvShareStore, MemoryKeyManager, MemoryKvStore},
};

pub const OWNER: &str = "did:example:owner";
pub const OWNER_TOKEN: &str = "owner-token";
pub const OWNER_PROOF: &[u8] = b"owner-proof";

pub const HEIR: &str = "did:example:heir";
pub const HEIR_TOKEN: &str = "heir-token";
pub const HEIR_PROOF: &[u8] = b"heir-proof";

pub const DELEGATE: &str = "did:example:delegate";
pub const DELEGATE_TOKEN: &str = "delegate-token";

/// Small Paillier moduli keep the tests fast
pub fn test_config() -> TssConfig {
    TssConfig::default().with_paillier_bits(MIN_MODULUS_BITS)
}

pub fn owner() -> Caller {
    Caller::new(OWNER, OWNER_TOKEN)
}

pub fn heir() -> Caller {
    Caller::new(HEIR, HEIR_TOKEN)
}

pub fn delegate() -> Caller {
    Caller::new(DELEGATE, DELEGATE_TOKEN)
}

pub struct TestService {
    pub service: TssWalletService,
    pub kv: Arc<MemoryKvStore>,
    pub shares: Arc<KvShareStore>,
    pub keys: Arc<MemoryKeyManager>,
    pub identity: Arc<MemoryIdentityVerifier>,
}

/// Surface the crate's logs with `RUST_LOG=tss_wallet_core=debug`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Service over in-memory collaborators with three registered identities
pub fn test_service() -> TestService {
    init_tracing();
    let kv = Arc::new(MemoryKvStore::new());
    let shares = Arc::new(KvShareStore::new(kv.clone()));
    let keys = Arc::new(MemoryKeyManager::new());
    let identity = Arc::new(MemoryIdentityVerifier::new());
    identity.register(OWNER, OWNER_TOKEN, OWNER_PROOF);
    identity.register(HEIR, HEIR_TOKEN, HEIR_PROOF);
    identity.register(DELEGATE, DELEGATE_TOKEN, b"delegate-proof");

    let service = TssWalletService::from_parts(
        test_config(),
        NetworkRegistry::default(),
        Arc::new(MemorySessionStore::new()),
        shares.clone(),
        keys.clone(),
        identity.clone(),
    )
    .unwrap();

    TestService {
        service,
        kv,
        shares,
        keys,
        identity,
    }
}

pub fn preparams() -> PaillierSecretKey {
    PaillierSecretKey::generate(MIN_MODULUS_BITS, &AtomicBool::new(false)).unwrap()
}

/// Run a full DKG among `n` parties directly over a channel network
pub async fn run_keygen(n: usize, threshold: usize) -> Vec<ShareData> {
    let net = ChannelNetwork::new(
        format!("keygen-{}", uuid::Uuid::new_v4()),
        (0..n).collect(),
        Instant::now() + Duration::from_secs(120),
    );
    let cancel = net.cancellation().clone();

    let handles: Vec<_> = net
        .endpoints()
        .into_iter()
        .map(|relay| {
            let config = KeygenConfig::new(threshold, "chain-1").with_preparams(preparams());
            let cancel = cancel.clone();
            tokio::spawn(async move { run_dkg(&config, &relay, &cancel).await })
        })
        .collect();

    let mut shares = Vec::new();
    for handle in handles {
        shares.push(handle.await.unwrap().unwrap().share);
    }
    shares
}

/// Run signing among the parties in `quorum`
pub async fn run_signing(
    shares: &[ShareData],
    quorum: &[usize],
    message_hash: [u8; 32],
) -> Vec<tss_wallet_core::Result<SignatureResult>> {
    let net = ChannelNetwork::new(
        format!("sign-{}", uuid::Uuid::new_v4()),
        quorum.to_vec(),
        Instant::now() + Duration::from_secs(60),
    )
    .with_cancellation(CancellationToken::new());

    let handles: Vec<_> = net
        .endpoints()
        .into_iter()
        .map(|relay| {
            let share = shares[relay.party_id()].clone();
            tokio::spawn(async move { run_dsg(&share, &message_hash, &relay).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

pub fn to_k256(sig: &SignatureResult) -> Signature {
    let mut rs = [0u8; 64];
    rs[32 - sig.r().len()..32].copy_from_slice(sig.r());
    rs[64 - sig.s().len()..].copy_from_slice(sig.s());
    Signature::from_slice(&rs).unwrap()
}

/// Verify against a SEC1 public key
pub fn verify(public_key: &[u8], message_hash: &[u8; 32], sig: &SignatureResult) -> bool {
    let key = VerifyingKey::from_sec1_bytes(public_key).unwrap();
    key.verify_prehash(message_hash, &to_k256(sig)).is_ok()
}

/// Recover the signer's key from the recovery byte
pub fn recover(message_hash: &[u8; 32], sig: &SignatureResult) -> VerifyingKey {
    let v = sig.v().expect("recovery byte");
    let recovery_id = RecoveryId::from_byte(v).unwrap();
    VerifyingKey::recover_from_prehash(message_hash, &to_k256(sig), recovery_id).unwrap()
}
