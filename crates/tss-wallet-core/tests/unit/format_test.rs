//! Unit tests for chain signature encodings

use crate::common::{recover, run_keygen, run_signing, to_k256};
use k256::ecdsa::{Signature, VerifyingKey, signature::hazmat::PrehashVerifier};
use tss_wallet_core::{
    Error, SignatureFormatAdapter, SignatureResult,
    format::{
        DEFAULT_V, format_cosmos, format_der, format_ethereum, parse_bitcoin, parse_der,
        parse_ethereum,
    },
    network::{MessageHash, NetworkRegistry},
};

fn adapter() -> SignatureFormatAdapter {
    SignatureFormatAdapter::new(NetworkRegistry::default())
}

#[test]
fn test_der_pads_high_bit_components() {
    let mut r = [0x11u8; 32];
    r[0] = 0x80;
    let s = [0x22u8; 32];
    let der = format_der(&SignatureResult::new(r.to_vec(), s.to_vec(), None)).unwrap();

    assert_eq!(der[0], 0x30);
    assert_eq!(der[2..5], [0x02, 33, 0x00]);
    assert_eq!(der[3 + 34..3 + 36], [0x02, 32]);
    assert_eq!(der.len(), 2 + 35 + 34);
    assert_eq!(der[1] as usize, der.len() - 2);

    let parsed = parse_der(&der).unwrap();
    assert_eq!(parsed.r(), &r);
    assert_eq!(parsed.s(), &s);
}

#[test]
fn test_ethereum_default_v() {
    let sig = SignatureResult::new(vec![1; 32], vec![2; 32], None);
    assert_eq!(format_ethereum(&sig).unwrap()[64], DEFAULT_V);

    let sig = SignatureResult::new(vec![1; 32], vec![2; 32], Some(1));
    assert_eq!(format_ethereum(&sig).unwrap()[64], 28);
}

#[test]
fn test_ethereum_v_is_normalised() {
    let with_v = |v| SignatureResult::new(vec![1; 32], vec![2; 32], Some(v));

    // Wire-form V values come back as 27/28 and parse to the same recovery id
    for (v, wire) in [(0, 27), (1, 28), (27, 27), (28, 28), (37, 27), (38, 28)] {
        let encoded = format_ethereum(&with_v(v)).unwrap();
        assert_eq!(encoded[64], wire, "v {}", v);
        let parsed = parse_ethereum(&encoded).unwrap();
        assert_eq!(format_ethereum(&parsed).unwrap(), encoded);
    }

    for v in [2, 26, 29, 34] {
        assert!(matches!(
            format_ethereum(&with_v(v)),
            Err(Error::MalformedSignature(_))
        ));
    }
}

#[test]
fn test_cosmos_is_r_then_s() {
    let sig = SignatureResult::new(vec![0xaa; 32], vec![0xbb; 32], Some(0));
    let out = format_cosmos(&sig).unwrap();
    assert_eq!(out.len(), 64);
    assert!(out[..32].iter().all(|b| *b == 0xaa));
    assert!(out[32..].iter().all(|b| *b == 0xbb));
}

#[test]
fn test_parse_length_errors() {
    let adapter = adapter();
    assert!(matches!(
        adapter.decode("eip155:1", &[0u8; 64]),
        Err(Error::InvalidLength {
            expected: 65,
            actual: 64
        })
    ));
    assert!(matches!(
        adapter.decode("cosmoshub-4", &[0u8; 65]),
        Err(Error::InvalidLength {
            expected: 64,
            actual: 65
        })
    ));
    assert!(adapter.decode("bitcoin-mainnet", &[0x30]).is_err());
}

#[test]
fn test_nil_signature_and_unknown_chain() {
    let adapter = adapter();
    assert!(matches!(
        adapter.encode("eip155:1", None),
        Err(Error::NilSignature)
    ));
    let sig = SignatureResult::new(vec![1; 32], vec![2; 32], None);
    assert!(matches!(
        adapter.encode("dogecoin", Some(&sig)),
        Err(Error::UnsupportedNetwork(_))
    ));
}

#[test]
fn test_bitcoin_appends_sighash_all() {
    let sig = SignatureResult::new(vec![1; 32], vec![2; 32], None);
    let wire = adapter().encode("bitcoin-mainnet", Some(&sig)).unwrap();
    assert_eq!(wire.last(), Some(&0x01));

    let (parsed, sighash) = parse_bitcoin(&wire).unwrap();
    assert_eq!(sighash, Some(0x01));
    assert_eq!(parsed.r(), sig.r());
    assert_eq!(wire[..wire.len() - 1], format_der(&sig).unwrap()[..]);
}

#[tokio::test]
async fn test_threshold_signature_in_every_encoding() {
    let shares = run_keygen(2, 2).await;
    let key = VerifyingKey::from_sec1_bytes(&shares[0].public_key).unwrap();
    let adapter = adapter();

    for (chain, hash) in [
        ("eip155:1", MessageHash::Keccak256),
        ("cosmoshub-4", MessageHash::Sha256),
        ("bitcoin-mainnet", MessageHash::DoubleSha256),
    ] {
        let digest = hash.digest(b"transfer 1 unit");
        let sig = run_signing(&shares, &[0, 1], digest)
            .await
            .remove(0)
            .unwrap();
        let wire = adapter.encode(chain, Some(&sig)).unwrap();

        let decoded = adapter.decode(chain, &wire).unwrap();
        assert!(key.verify_prehash(&digest, &to_k256(&decoded)).is_ok(), "{}", chain);

        match chain {
            "eip155:1" => {
                assert_eq!(wire.len(), 65);
                assert!(matches!(wire[64], 27 | 28));
                assert_eq!(recover(&digest, &decoded), key);
            }
            "cosmoshub-4" => assert_eq!(wire.len(), 64),
            _ => {
                // Accepted by an independent DER parser
                let der = Signature::from_der(&wire[..wire.len() - 1]).unwrap();
                assert!(key.verify_prehash(&digest, &der).is_ok());
            }
        }
    }
}
