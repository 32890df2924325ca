//! Unit tests for share encryption and versioned storage

use chrono::Utc;
use std::sync::Arc;
use tss_wallet_core::{
    Error, KeyMetadata, Permission, PermissionKind, SecurityLevel,
    storage::{
        KeyShare, KvShareStore, KvStore, MemoryKeyManager, MemoryKvStore, NONCE_SIZE, ShareCipher,
        ShareStore,
    },
};

fn cipher() -> (ShareCipher, Arc<MemoryKeyManager>) {
    let keys = Arc::new(MemoryKeyManager::new());
    (ShareCipher::new(keys.clone()), keys)
}

// ============================================================================
// Encryption
// ============================================================================

#[tokio::test]
async fn test_encrypt_decrypt_empty_small_and_large() {
    let (cipher, _) = cipher();
    let large: Vec<u8> = (0..(1 << 20) + 3).map(|i| (i % 251) as u8).collect();

    for payload in [vec![], b"a share".to_vec(), large] {
        let blob = cipher.encrypt_share("w1", &payload, 1).await.unwrap();
        assert_eq!(blob.version, 1);
        assert!(blob.ciphertext.len() > NONCE_SIZE);
        let plain = cipher
            .decrypt_share(&blob.ciphertext, &blob.key_id)
            .await
            .unwrap();
        assert_eq!(&plain[..], &payload[..]);
    }
}

#[tokio::test]
async fn test_ciphertext_hides_plaintext() {
    let (cipher, _) = cipher();
    let payload = b"secret share bytes secret share bytes".to_vec();
    let blob = cipher.encrypt_share("w1", &payload, 1).await.unwrap();
    assert!(
        !blob
            .ciphertext
            .windows(payload.len())
            .any(|w| w == payload.as_slice())
    );

    // Same plaintext, fresh nonce
    let again = cipher.encrypt_share("w1", &payload, 1).await.unwrap();
    assert_ne!(blob.ciphertext, again.ciphertext);
}

#[tokio::test]
async fn test_wrong_key_id() {
    let (cipher, _) = cipher();
    let blob = cipher.encrypt_share("w1", b"share", 1).await.unwrap();

    let unknown = cipher.decrypt_share(&blob.ciphertext, "key-unknown").await;
    assert!(matches!(unknown, Err(Error::KeyNotFound(_))));

    let other = cipher.encrypt_share("w2", b"x", 1).await.unwrap();
    let wrong = cipher.decrypt_share(&blob.ciphertext, &other.key_id).await;
    let err = wrong.unwrap_err();
    assert!(matches!(err, Error::DecryptionFailed(_)));
    assert!(err.is_audit_alert());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_truncated_ciphertext() {
    let (cipher, _) = cipher();
    let blob = cipher.encrypt_share("w1", b"share", 1).await.unwrap();
    for len in [0, NONCE_SIZE - 1, NONCE_SIZE, NONCE_SIZE + 3] {
        let result = cipher
            .decrypt_share(&blob.ciphertext[..len], &blob.key_id)
            .await;
        assert!(matches!(result, Err(Error::DecryptionFailed(_))), "len {}", len);
    }
}

// ============================================================================
// Share store
// ============================================================================

async fn share_set(cipher: &ShareCipher, wallet_id: &str, version: u64, n: usize) -> Vec<KeyShare> {
    let mut shares = Vec::new();
    for party_id in 0..n {
        shares.push(KeyShare {
            wallet_id: wallet_id.into(),
            party_id,
            share_index: party_id as u64 + 1,
            encrypted: cipher
                .encrypt_share(wallet_id, format!("share-{}-{}", version, party_id).as_bytes(), version)
                .await
                .unwrap(),
        });
    }
    shares
}

#[tokio::test]
async fn test_rotation_swap_removes_previous_version() {
    let (cipher, _) = cipher();
    let kv = Arc::new(MemoryKvStore::new());
    let store = KvShareStore::new(kv.clone());

    let mut meta = KeyMetadata::new("w1", "chain-1", SecurityLevel::High);
    store
        .stage_shares("w1", 1, share_set(&cipher, "w1", 1, 3).await)
        .await
        .unwrap();
    store.commit_shares(&meta).await.unwrap();

    meta.key_version = 2;
    meta.last_rotated = Some(Utc::now());
    store
        .stage_shares("w1", 2, share_set(&cipher, "w1", 2, 3).await)
        .await
        .unwrap();
    store.commit_shares(&meta).await.unwrap();

    let shares = store.load_shares("w1").await.unwrap();
    assert_eq!(shares.len(), 3);
    for share in &shares {
        let plain = cipher
            .decrypt_share(&share.encrypted.ciphertext, &share.encrypted.key_id)
            .await
            .unwrap();
        assert_eq!(&plain[..], format!("share-2-{}", share.party_id).as_bytes());
    }
    assert_eq!(kv.scan_prefix("share/w1/").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_wallets_are_isolated() {
    let (cipher, _) = cipher();
    let store = KvShareStore::new(Arc::new(MemoryKvStore::new()));

    for wallet in ["w1", "w10"] {
        store
            .stage_shares(wallet, 1, share_set(&cipher, wallet, 1, 2).await)
            .await
            .unwrap();
        store
            .commit_shares(&KeyMetadata::new(wallet, "chain-1", SecurityLevel::Standard))
            .await
            .unwrap();
    }

    // "w1/" must not match "w10/"
    assert!(store.load_shares("w1").await.unwrap().iter().all(|s| s.wallet_id == "w1"));
    assert_eq!(store.list_metadata().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_nested_wallet_ids_keep_their_shares() {
    let (cipher, _) = cipher();
    let store = KvShareStore::new(Arc::new(MemoryKvStore::new()));

    // "a/x" first, then "a" is created and rotated
    for wallet in ["a/x", "a"] {
        store
            .stage_shares(wallet, 1, share_set(&cipher, wallet, 1, 2).await)
            .await
            .unwrap();
        store
            .commit_shares(&KeyMetadata::new(wallet, "chain-1", SecurityLevel::Standard))
            .await
            .unwrap();
    }
    let mut meta = KeyMetadata::new("a", "chain-1", SecurityLevel::Standard);
    meta.key_version = 2;
    store
        .stage_shares("a", 2, share_set(&cipher, "a", 2, 2).await)
        .await
        .unwrap();
    store.commit_shares(&meta).await.unwrap();

    let nested = store.load_shares("a/x").await.unwrap();
    assert_eq!(nested.len(), 2);
    assert!(nested.iter().all(|s| s.wallet_id == "a/x" && s.version() == 1));
    assert!(store.load_shares("a").await.unwrap().iter().all(|s| s.wallet_id == "a"));
}

#[tokio::test]
async fn test_permissions_listed_per_wallet() {
    let store = KvShareStore::new(Arc::new(MemoryKvStore::new()));
    let grant = |wallet: &str, grantee: &str| Permission {
        wallet_address: wallet.into(),
        grantee: grantee.into(),
        permissions: vec![PermissionKind::Sign],
        granted_at: Utc::now(),
        expires_at: None,
        revoked: false,
        revoked_at: None,
    };
    for (wallet, grantee) in [("a", "did:example:bob"), ("a", "did:example:carol"), ("a/x", "did:example:dave")] {
        store.put_permission(&grant(wallet, grantee)).await.unwrap();
    }

    let mut listed: Vec<_> = store
        .list_permissions("a")
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.grantee)
        .collect();
    listed.sort();
    assert_eq!(listed, vec!["did:example:bob", "did:example:carol"]);
    assert_eq!(store.list_permissions("a/x").await.unwrap().len(), 1);
    assert!(store.list_permissions("b").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_readers_see_whole_sets() {
    let (cipher, _) = cipher();
    let store = Arc::new(KvShareStore::new(Arc::new(MemoryKvStore::new())));
    let mut meta = KeyMetadata::new("w1", "chain-1", SecurityLevel::High);
    store
        .stage_shares("w1", 1, share_set(&cipher, "w1", 1, 3).await)
        .await
        .unwrap();
    store.commit_shares(&meta).await.unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..20 {
                    let shares = store.load_shares("w1").await.unwrap();
                    assert_eq!(shares.len(), 3);
                    let version = shares[0].version();
                    assert!(shares.iter().all(|s| s.version() == version));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    for version in 2..=5 {
        meta.key_version = version;
        store
            .stage_shares("w1", version, share_set(&cipher, "w1", version, 3).await)
            .await
            .unwrap();
        store.commit_shares(&meta).await.unwrap();
    }

    for reader in readers {
        reader.await.unwrap();
    }
    assert!(store.load_shares("w1").await.unwrap().iter().all(|s| s.version() == 5));
}
