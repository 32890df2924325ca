//! Property tests for signature encodings

use proptest::prelude::*;
use tss_wallet_core::{
    SignatureResult,
    format::{
        format_cosmos, format_der, format_ethereum, parse_bitcoin, parse_cosmos, parse_der,
        parse_ethereum,
    },
};

/// A non-zero 256-bit component
fn component() -> impl Strategy<Value = [u8; 32]> {
    any::<[u8; 32]>().prop_filter("non-zero", |b| b.iter().any(|x| *x != 0))
}

proptest! {
    #[test]
    fn fixed_width_encodings_preserve_components(
        r in component(),
        s in component(),
        rid in 0u8..2,
    ) {
        let sig = SignatureResult::new(r.to_vec(), s.to_vec(), Some(rid));

        let eth = format_ethereum(&sig).unwrap();
        let parsed = parse_ethereum(&eth).unwrap();
        prop_assert_eq!(parsed.r(), &r[..]);
        prop_assert_eq!(parsed.s(), &s[..]);
        prop_assert_eq!(parsed.v(), Some(rid));

        let cosmos = format_cosmos(&sig).unwrap();
        prop_assert_eq!(&cosmos[..], &eth[..64]);
        let parsed_cosmos = parse_cosmos(&cosmos).unwrap();
        prop_assert_eq!(parsed_cosmos.r(), &r[..]);
    }

    #[test]
    fn parsed_ethereum_signatures_reformat(r in component(), s in component(), v in any::<u8>()) {
        let mut wire = [0u8; 65];
        wire[..32].copy_from_slice(&r);
        wire[32..64].copy_from_slice(&s);
        wire[64] = v;

        if let Ok(parsed) = parse_ethereum(&wire) {
            let again = format_ethereum(&parsed).unwrap();
            prop_assert_eq!(&again[..64], &wire[..64]);
            prop_assert_eq!(again[64], 27 + parsed.v().unwrap());
            prop_assert_eq!(parse_ethereum(&again).unwrap(), parsed);
        }
    }

    #[test]
    fn der_is_strict_and_minimal(r in component(), s in component()) {
        let sig = SignatureResult::new(r.to_vec(), s.to_vec(), None);
        let der = format_der(&sig).unwrap();

        prop_assert!(der.len() <= 72);
        prop_assert_eq!(der[1] as usize, der.len() - 2);
        let parsed = parse_der(&der).unwrap();
        prop_assert_eq!(parsed.r(), &r[..]);
        prop_assert_eq!(parsed.s(), &s[..]);

        // Any trailing byte is read as a sighash, two are rejected
        let mut with_sighash = der.clone();
        with_sighash.push(0x81);
        prop_assert_eq!(parse_bitcoin(&with_sighash).unwrap().1, Some(0x81));
        with_sighash.push(0x00);
        prop_assert!(parse_der(&with_sighash).is_err());
        prop_assert!(parse_bitcoin(&with_sighash).is_err());
    }

    #[test]
    fn short_components_are_left_padded(r in 1u64..=u64::MAX, s in 1u64..=u64::MAX) {
        let sig = SignatureResult::new(
            r.to_be_bytes().to_vec(),
            s.to_be_bytes().to_vec(),
            None,
        );
        let cosmos = format_cosmos(&sig).unwrap();
        prop_assert!(cosmos[..24].iter().all(|b| *b == 0));
        prop_assert_eq!(&cosmos[24..32], &r.to_be_bytes()[..]);
        prop_assert_eq!(&cosmos[56..], &s.to_be_bytes()[..]);
    }

    #[test]
    fn parsers_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..96)) {
        let _ = parse_ethereum(&bytes);
        let _ = parse_cosmos(&bytes);
        let _ = parse_der(&bytes);
        let _ = parse_bitcoin(&bytes);
    }

    #[test]
    fn der_like_inputs_never_panic(
        body in proptest::collection::vec(any::<u8>(), 0..80),
        len in any::<u8>(),
    ) {
        let mut bytes = vec![0x30, len];
        bytes.extend(body);
        if let Ok(sig) = parse_der(&bytes) {
            // Whatever parses re-encodes to the same bytes
            prop_assert_eq!(format_der(&sig).unwrap(), bytes);
        }
    }
}
