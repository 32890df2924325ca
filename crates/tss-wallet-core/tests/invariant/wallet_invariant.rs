//! Properties that must hold for every wallet and session

use crate::common::{owner, run_keygen, test_config, test_service};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tss_wallet_core::{
    Error, SecurityLevel, SessionManager, SessionState,
    network::NetworkRegistry,
    service::{GenerateKeySharesRequest, SigningRequest},
    session::MemorySessionStore,
    storage::ShareStore,
};

fn request(wallet: &str, level: SecurityLevel) -> GenerateKeySharesRequest {
    GenerateKeySharesRequest {
        wallet_address: wallet.into(),
        chain_id: "chain-1".into(),
        security_level: level,
    }
}

/// A wallet stores exactly one share per party, all of the current version
#[tokio::test]
async fn invariant_share_count_matches_parties() {
    let t = test_service();
    for (wallet, level) in [("w-std", SecurityLevel::Standard), ("w-high", SecurityLevel::High)] {
        t.service
            .generate_key_shares(&owner(), request(wallet, level))
            .await
            .unwrap();

        let shares = t.shares.load_shares(wallet).await.unwrap();
        assert_eq!(shares.len(), level.parties(), "{}", level);

        let mut parties: Vec<_> = shares.iter().map(|s| s.party_id).collect();
        parties.dedup();
        assert_eq!(parties.len(), level.parties());
        assert!(shares.iter().all(|s| s.version() == 1 && s.wallet_id == wallet));
    }
}

/// Each rotation moves the key version forward by exactly one
#[tokio::test]
async fn invariant_key_version_strictly_increases() {
    let t = test_service();
    t.service
        .generate_key_shares(&owner(), request("w1", SecurityLevel::Standard))
        .await
        .unwrap();

    let mut last = t.service.get_key_metadata("w1").await.unwrap();
    for _ in 0..3 {
        let next = t.service.rotate_key_shares(&owner(), "w1").await.unwrap();
        assert_eq!(next.key_version, last.key_version + 1);
        assert!(next.last_rotated >= last.last_rotated);
        assert_eq!(next.created_at, last.created_at);

        let stored = t.shares.load_shares("w1").await.unwrap();
        assert!(stored.iter().all(|s| s.version() == next.key_version));
        last = next;
    }

    // Going backwards is refused
    let mut stale = last.clone();
    stale.key_version -= 1;
    assert!(t.shares.put_metadata(&stale).await.is_err());
}

/// Completed and failed sessions never change state again
#[tokio::test]
async fn invariant_terminal_sessions_are_final() {
    let manager = Arc::new(SessionManager::new(
        Arc::new(MemorySessionStore::new()),
        NetworkRegistry::default(),
        test_config(),
    ));
    let deadline = || Instant::now() + Duration::from_secs(60);

    let shares = run_keygen(2, 2).await;
    let completed = manager
        .create_signing_session([5u8; 32], "w1", shares.clone())
        .unwrap();
    manager.await_session(&completed, deadline()).await.unwrap();

    let failed = manager
        .create_signing_session([6u8; 32], "w2", shares)
        .unwrap();
    manager.cancel_session(&failed).unwrap();
    let _ = manager.await_session(&failed, deadline()).await;

    for (id, state) in [(completed, SessionState::Completed), (failed, SessionState::Failed)] {
        assert!(matches!(
            manager.cancel_session(&id),
            Err(Error::InvalidSessionState { .. })
        ));
        // Late workers finishing do not revive the session
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.get_session(&id).unwrap().state, state);
    }
}

/// At most one session owns a wallet at any time
#[tokio::test]
async fn invariant_wallet_exclusivity() {
    let t = test_service();
    t.service
        .generate_key_shares(&owner(), request("w1", SecurityLevel::Standard))
        .await
        .unwrap();

    let caller = owner();
    let sign = |byte: u8| {
        t.service.initiate_signing(&caller, SigningRequest {
            wallet_id: "w1".into(),
            message_hash: [byte; 32],
        })
    };
    let (r1, r2, s1, s2) = tokio::join!(
        t.service.rotate_key_shares(&caller, "w1"),
        t.service.rotate_key_shares(&caller, "w1"),
        sign(1),
        sign(2),
    );
    let results = [
        r1.map(|m| m.key_version),
        r2.map(|m| m.key_version),
        s1.map(|r| r.metadata.key_version),
        s2.map(|r| r.metadata.key_version),
    ];

    assert!(results.iter().any(|r| r.is_ok()));
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::SessionInProgress(_)))
    );

    let rotations = t.service.get_key_metadata("w1").await.unwrap().key_version - 1;
    let rotated = results[..2].iter().filter(|r| r.is_ok()).count() as u64;
    assert_eq!(rotations, rotated);
    assert!(!t.service.sessions().is_wallet_active("w1"));
}
