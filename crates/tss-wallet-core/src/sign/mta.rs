//! Multiplicative-to-additive share conversion over Paillier (`libpaillier`)
//!
//! Alice holds `a` and publishes Enc_A(a). Bob holds `b`, picks a mask β' and
//! returns Enc_A(a * b + β'). Alice decrypts α = a * b + β' (mod q) and Bob
//! keeps β = -β' (mod q), so α + β = a * b.
//!
//! The mask is drawn below 2^576; with a, b < 2^256 the plaintext never wraps
//! a modulus of at least 1024 bits.

use crate::paillier::{Ciphertext, MIN_MODULUS_BITS, PaillierPublicKey, PaillierSecretKey};
use crate::{Error, Result};
use k256::{
    Scalar,
    elliptic_curve::{bigint::U256, ops::Reduce},
};
use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use std::sync::OnceLock;

const MASK_BITS: u64 = 576;

/// secp256k1 group order
fn curve_order() -> &'static BigUint {
    static ORDER: OnceLock<BigUint> = OnceLock::new();
    ORDER.get_or_init(|| {
        BigUint::from_bytes_be(&[
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0xFE, 0xBA, 0xAE, 0xDC, 0xE6, 0xAF, 0x48, 0xA0, 0x3B, 0xBF, 0xD2, 0x5E, 0x8C,
            0xD0, 0x36, 0x41, 0x41,
        ])
    })
}

pub(crate) fn scalar_to_biguint(scalar: &Scalar) -> BigUint {
    BigUint::from_bytes_be(&scalar.to_bytes())
}

pub(crate) fn biguint_to_scalar(value: &BigUint) -> Scalar {
    let reduced = value % curve_order();
    let bytes = reduced.to_bytes_be();
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    <Scalar as Reduce<U256>>::reduce_bytes(&padded.into())
}

/// Alice's first message: Enc(a) under her own key
pub fn encrypt_secret(key: &PaillierSecretKey, a: &Scalar) -> Result<Ciphertext> {
    key.public_key().encrypt(&scalar_to_biguint(a))
}

/// Bob's response to Enc_A(a): returns the ciphertext for Alice and Bob's share β
pub fn respond(
    alice_key: &PaillierPublicKey,
    encrypted_a: &Ciphertext,
    b: &Scalar,
) -> Result<(Ciphertext, Scalar)> {
    if alice_key.bits() < MIN_MODULUS_BITS {
        return Err(Error::VerificationFailed(
            "peer Paillier modulus too small for MtA".into(),
        ));
    }
    alice_key.validate_ciphertext(encrypted_a)?;

    let mask = OsRng.gen_biguint(MASK_BITS);
    let product = alice_key.mul(encrypted_a, &scalar_to_biguint(b))?;
    let response = alice_key.add(&product, &alice_key.encrypt(&mask)?)?;

    let beta = -biguint_to_scalar(&mask);
    Ok((response, beta))
}

/// Alice's share α from Bob's response
pub fn finish(key: &PaillierSecretKey, response: &Ciphertext) -> Result<Scalar> {
    let plaintext = key
        .decrypt(response)
        .map_err(|_| Error::VerificationFailed("MtA response is not a valid ciphertext".into()))?;
    Ok(biguint_to_scalar(&plaintext))
}
