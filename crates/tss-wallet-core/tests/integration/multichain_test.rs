//! Signing for different chains through one service

use crate::common::{owner, recover, test_service, verify};
use k256::ecdsa::{Signature, VerifyingKey};
use tss_wallet_core::{
    Error, SecurityLevel,
    format::parse_bitcoin,
    network::MessageHash,
    service::GenerateKeySharesRequest,
};

async fn create(t: &crate::common::TestService, wallet: &str, chain: &str) -> Vec<u8> {
    t.service
        .generate_key_shares(&owner(), GenerateKeySharesRequest {
            wallet_address: wallet.into(),
            chain_id: chain.into(),
            security_level: SecurityLevel::Standard,
        })
        .await
        .unwrap()
        .public_key
}

#[tokio::test]
async fn test_ethereum_wallet() {
    let t = test_service();
    let public_key = create(&t, "0xabc", "eip155:1").await;

    let message = b"transfer 1 eth";
    let signed = t
        .service
        .sign_message(&owner(), "0xabc", message)
        .await
        .unwrap();
    let digest = MessageHash::Keccak256.digest(message);

    let wire = signed.signature.raw();
    assert_eq!(wire.len(), 65);
    assert!(matches!(wire[64], 27 | 28));
    assert!(verify(&public_key, &digest, &signed.signature));
    assert_eq!(
        recover(&digest, &signed.signature),
        VerifyingKey::from_sec1_bytes(&public_key).unwrap()
    );
}

#[tokio::test]
async fn test_bitcoin_wallet() {
    let t = test_service();
    let public_key = create(&t, "bc1q", "bitcoin-mainnet").await;

    let message = b"spend output 0";
    let signed = t.service.sign_message(&owner(), "bc1q", message).await.unwrap();
    let digest = MessageHash::DoubleSha256.digest(message);

    let (parsed, sighash) = parse_bitcoin(signed.signature.raw()).unwrap();
    assert_eq!(sighash, Some(0x01));
    assert!(verify(&public_key, &digest, &parsed));

    let wire = signed.signature.raw();
    assert!(Signature::from_der(&wire[..wire.len() - 1]).is_ok());
}

#[tokio::test]
async fn test_cosmos_wallet() {
    let t = test_service();
    let public_key = create(&t, "cosmos1xyz", "cosmoshub-4").await;

    let message = b"delegate";
    let signed = t
        .service
        .sign_message(&owner(), "cosmos1xyz", message)
        .await
        .unwrap();
    assert_eq!(signed.signature.raw().len(), 64);
    assert!(verify(
        &public_key,
        &MessageHash::Sha256.digest(message),
        &signed.signature
    ));

    let encoded = t
        .service
        .encode_signature("eip155:1", Some(&signed.signature))
        .unwrap();
    assert_eq!(encoded.len(), 65);
    assert_eq!(&encoded[..64], signed.signature.raw());
}

#[tokio::test]
async fn test_unsupported_chains() {
    let t = test_service();
    let request = |chain: &str| GenerateKeySharesRequest {
        wallet_address: "w1".into(),
        chain_id: chain.into(),
        security_level: SecurityLevel::Standard,
    };

    assert!(matches!(
        t.service.generate_key_shares(&owner(), request("dogecoin")).await,
        Err(Error::UnsupportedNetwork(_))
    ));
    assert!(matches!(
        t.service
            .generate_key_shares(&owner(), request("solana-mainnet"))
            .await,
        Err(Error::UnsupportedCurve(_))
    ));
    assert!(t.service.get_wallet("w1").await.is_err());
    assert!(t.identity.events().is_empty());
}

#[tokio::test]
async fn test_wallets_on_different_chains_sign_independently() {
    let t = test_service();
    let eth = create(&t, "0xabc", "eip155:137").await;
    let atom = create(&t, "osmo1xyz", "osmosis-1").await;
    assert_ne!(eth, atom);

    let (owner_a, owner_b) = (owner(), owner());
    let (a, b) = tokio::join!(
        t.service.sign_message(&owner_a, "0xabc", b"one"),
        t.service.sign_message(&owner_b, "osmo1xyz", b"two"),
    );
    assert!(verify(&eth, &MessageHash::Keccak256.digest(b"one"), &a.unwrap().signature));
    assert!(verify(&atom, &MessageHash::Sha256.digest(b"two"), &b.unwrap().signature));
}
