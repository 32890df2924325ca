//! Wallet lifecycle through the service: create, sign, rotate, delegate, recover

use crate::common::{DELEGATE, HEIR, HEIR_PROOF, delegate, heir, owner, test_service, verify};
use chrono::Utc;
use tss_wallet_core::{
    AuditAction, Error, SecurityLevel, WalletStatus, sha256_digest,
    service::{GenerateKeySharesRequest, GrantPermissionRequest, SigningRequest},
    storage::ShareStore,
};

fn generate(wallet: &str, chain: &str, level: SecurityLevel) -> GenerateKeySharesRequest {
    GenerateKeySharesRequest {
        wallet_address: wallet.into(),
        chain_id: chain.into(),
        security_level: level,
    }
}

#[tokio::test]
async fn test_generate_sign_rotate() {
    let t = test_service();
    let service = &t.service;

    let created = service
        .generate_key_shares(&owner(), generate("w1", "chain-1", SecurityLevel::Standard))
        .await
        .unwrap();
    assert_eq!(created.metadata.key_version, 1);
    assert_eq!(created.public_key.len(), 33);

    let wallet = service.get_wallet("w1").await.unwrap();
    assert_eq!(wallet.status, WalletStatus::Active);
    assert_eq!(wallet.public_key, hex::encode(&created.public_key));

    let digest = sha256_digest(b"hello");
    let signed = service
        .initiate_signing(&owner(), SigningRequest {
            wallet_id: "w1".into(),
            message_hash: digest,
        })
        .await
        .unwrap();
    assert!(verify(&created.public_key, &digest, &signed.signature));
    assert_eq!(signed.metadata.usage_count, 1);
    assert_eq!(signed.signature.raw().len(), 64);

    let before = Utc::now();
    let rotated = service.rotate_key_shares(&owner(), "w1").await.unwrap();
    assert_eq!(rotated.key_version, 2);
    assert!(rotated.last_rotated.unwrap() >= before);
    assert_eq!(rotated.usage_count, 1);

    // The rotated key signs and replaces the old one
    let wallet = service.get_wallet("w1").await.unwrap();
    assert_eq!(wallet.key_version, 2);
    let new_key = hex::decode(&wallet.public_key).unwrap();
    assert_ne!(new_key, created.public_key);

    let signed = service
        .initiate_signing(&owner(), SigningRequest {
            wallet_id: "w1".into(),
            message_hash: digest,
        })
        .await
        .unwrap();
    assert!(verify(&new_key, &digest, &signed.signature));
    assert!(!verify(&created.public_key, &digest, &signed.signature));

    let actions: Vec<_> = t.identity.events().into_iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![
        AuditAction::KeyGenerated,
        AuditAction::SignatureRequested,
        AuditAction::KeyRotated,
        AuditAction::SignatureRequested,
    ]);
}

#[tokio::test]
async fn test_busy_wallet_is_rejected() {
    let t = test_service();
    t.service
        .generate_key_shares(&owner(), generate("w1", "chain-1", SecurityLevel::Standard))
        .await
        .unwrap();

    let lease = t.service.sessions().reserve_wallet("w1").unwrap();
    let signing = t
        .service
        .initiate_signing(&owner(), SigningRequest {
            wallet_id: "w1".into(),
            message_hash: [7u8; 32],
        })
        .await;
    assert!(matches!(signing, Err(Error::SessionInProgress(_))));
    assert!(matches!(
        t.service.rotate_key_shares(&owner(), "w1").await,
        Err(Error::SessionInProgress(_))
    ));
    drop(lease);

    // Failed attempts left the wallet untouched
    let metadata = t.service.get_key_metadata("w1").await.unwrap();
    assert_eq!(metadata.key_version, 1);
    assert_eq!(metadata.usage_count, 0);
    let failures: Vec<_> = t.identity.events().into_iter().filter(|e| !e.success).collect();
    assert_eq!(failures.len(), 2);
    assert!(
        failures
            .iter()
            .all(|e| e.detail.as_deref().is_some_and(|d| d.contains("in progress")))
    );
}

#[tokio::test]
async fn test_duplicate_wallet_rejected() {
    let t = test_service();
    t.service
        .generate_key_shares(&owner(), generate("w1", "chain-1", SecurityLevel::Standard))
        .await
        .unwrap();
    let again = t
        .service
        .generate_key_shares(&owner(), generate("w1", "chain-1", SecurityLevel::High))
        .await;
    assert!(matches!(again, Err(Error::InvalidRequest(_))));
    assert_eq!(
        t.service.get_key_metadata("w1").await.unwrap().security_level,
        SecurityLevel::Standard
    );
}

#[tokio::test]
async fn test_delegated_signing_and_recovery() {
    let t = test_service();
    let service = &t.service;
    let created = service
        .generate_key_shares(&owner(), generate("w1", "chain-1", SecurityLevel::High))
        .await
        .unwrap();

    let request = SigningRequest {
        wallet_id: "w1".into(),
        message_hash: [9u8; 32],
    };
    assert!(matches!(
        service.initiate_signing(&heir(), request.clone()).await,
        Err(Error::Unauthorized(_))
    ));

    service
        .grant_permission(&owner(), GrantPermissionRequest {
            wallet_id: "w1".into(),
            grantee: HEIR.into(),
            permissions: vec!["sign".into(), "recover".into()],
            expires_at: None,
        })
        .await
        .unwrap();
    let signed = service.initiate_signing(&heir(), request).await.unwrap();
    assert!(verify(&created.public_key, &[9u8; 32], &signed.signature));

    // Rotation was not granted
    assert!(service.rotate_key_shares(&heir(), "w1").await.is_err());

    let recovered = service
        .recover_wallet(&heir(), "w1", HEIR, HEIR_PROOF)
        .await
        .unwrap();
    assert_eq!(recovered.owner, HEIR);
    assert_eq!(recovered.status, WalletStatus::Active);
    assert_eq!(recovered.key_version, 2);
    assert_eq!(t.shares.load_shares("w1").await.unwrap().len(), 3);
    assert!(t.shares.load_shares("w1").await.unwrap().iter().all(|s| s.version() == 2));
}

#[tokio::test]
async fn test_recovery_with_bad_proof_keeps_wallet() {
    let t = test_service();
    t.service
        .generate_key_shares(&owner(), generate("w1", "chain-1", SecurityLevel::Standard))
        .await
        .unwrap();

    let result = t
        .service
        .recover_wallet(&owner(), "w1", HEIR, b"forged")
        .await;
    assert!(result.is_err());

    let wallet = t.service.get_wallet("w1").await.unwrap();
    assert_eq!(wallet.owner, crate::common::OWNER);
    assert_eq!(wallet.status, WalletStatus::Active);
    assert_eq!(wallet.key_version, 1);
}

#[tokio::test]
async fn test_recovery_revokes_previous_grants() {
    let t = test_service();
    let service = &t.service;
    service
        .generate_key_shares(&owner(), generate("w1", "chain-1", SecurityLevel::Standard))
        .await
        .unwrap();
    service
        .grant_permission(&owner(), GrantPermissionRequest {
            wallet_id: "w1".into(),
            grantee: DELEGATE.into(),
            permissions: vec!["sign".into()],
            expires_at: None,
        })
        .await
        .unwrap();
    let request = SigningRequest {
        wallet_id: "w1".into(),
        message_hash: [3u8; 32],
    };
    service.initiate_signing(&delegate(), request.clone()).await.unwrap();

    service
        .recover_wallet(&owner(), "w1", HEIR, HEIR_PROOF)
        .await
        .unwrap();

    assert!(matches!(
        service.initiate_signing(&delegate(), request.clone()).await,
        Err(Error::PermissionRevoked { .. })
    ));
    let grant = t.shares.get_permission("w1", DELEGATE).await.unwrap().unwrap();
    assert!(grant.revoked);
    assert!(grant.revoked_at.is_some());
    service.initiate_signing(&heir(), request).await.unwrap();

    let revocations: Vec<_> = t
        .identity
        .events()
        .into_iter()
        .filter(|e| e.action == AuditAction::PermissionRevoked)
        .collect();
    assert_eq!(revocations.len(), 1);
    assert_eq!(revocations[0].actor, "system");
    assert!(revocations[0].success);
}

#[tokio::test]
async fn test_failed_recovery_keeps_grants() {
    let t = test_service();
    t.service
        .generate_key_shares(&owner(), generate("w1", "chain-1", SecurityLevel::Standard))
        .await
        .unwrap();
    t.service
        .grant_permission(&owner(), GrantPermissionRequest {
            wallet_id: "w1".into(),
            grantee: DELEGATE.into(),
            permissions: vec!["sign".into()],
            expires_at: None,
        })
        .await
        .unwrap();

    assert!(t.service.recover_wallet(&owner(), "w1", HEIR, b"forged").await.is_err());
    let grant = t.shares.get_permission("w1", DELEGATE).await.unwrap().unwrap();
    assert!(!grant.revoked);
}

#[tokio::test]
async fn test_wallet_ids_sharing_a_prefix() {
    let t = test_service();
    let nested = t
        .service
        .generate_key_shares(&owner(), generate("a/x", "chain-1", SecurityLevel::Standard))
        .await
        .unwrap();
    t.service
        .generate_key_shares(&owner(), generate("a", "chain-1", SecurityLevel::Standard))
        .await
        .unwrap();
    t.service.rotate_key_shares(&owner(), "a").await.unwrap();

    let digest = sha256_digest(b"nested");
    let signed = t
        .service
        .initiate_signing(&owner(), SigningRequest {
            wallet_id: "a/x".into(),
            message_hash: digest,
        })
        .await
        .unwrap();
    assert!(verify(&nested.public_key, &digest, &signed.signature));
    assert_eq!(t.service.get_key_metadata("a/x").await.unwrap().key_version, 1);
    assert_eq!(t.service.get_key_metadata("a").await.unwrap().key_version, 2);
}

#[tokio::test]
async fn test_control_characters_rejected() {
    let t = test_service();
    let result = t
        .service
        .generate_key_shares(&owner(), generate("w\n1", "chain-1", SecurityLevel::Standard))
        .await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}
