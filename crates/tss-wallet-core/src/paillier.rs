//! Paillier keys for the signing engine
//!
//! Thin wrapper over [`libpaillier`]: the MtA code works on `num-bigint`
//! values and serde-friendly ciphertexts, while the cryptosystem itself lives
//! in the library. Key pairs are the "pre-parameters" each party produces
//! before the interactive DKG rounds; finding the primes is by far the most
//! expensive step of the whole protocol, so [`PaillierSecretKey::generate`]
//! accepts an abort flag checked between prime draws.

use crate::{Error, Result};
use libpaillier::{DecryptionKey, EncryptionKey, unknown_order::BigNumber};
use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Smallest modulus accepted from a peer.
///
/// MtA masks products of two scalars (< 2^512) with 576-bit randomness, so
/// the plaintext space must be comfortably above 2^577.
pub const MIN_MODULUS_BITS: u64 = 1024;

fn to_bignum(value: &BigUint) -> BigNumber {
    BigNumber::from_slice(&value.to_bytes_be())
}

fn from_bignum(value: &BigNumber) -> BigUint {
    BigUint::from_bytes_be(&value.to_bytes())
}

/// Paillier public key with generator g = n + 1
#[derive(Clone)]
pub struct PaillierPublicKey {
    inner: EncryptionKey,
    n: BigUint,
}

/// Paillier key pair
#[derive(Clone)]
pub struct PaillierSecretKey {
    inner: DecryptionKey,
    public: PaillierPublicKey,
    p: BigUint,
    q: BigUint,
}

/// A Paillier ciphertext (element of Z*_{n^2})
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext(pub BigUint);

impl PaillierPublicKey {
    /// Rebuild a key from its modulus
    pub fn from_modulus(n: &BigUint) -> Result<Self> {
        let inner = EncryptionKey::from_bytes(&n.to_bytes_be())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self {
            inner,
            n: n.clone(),
        })
    }

    fn from_library(inner: EncryptionKey) -> Self {
        let n = from_bignum(inner.n());
        Self { inner, n }
    }

    /// The modulus n
    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    /// n^2
    pub fn modulus_squared(&self) -> BigUint {
        from_bignum(self.inner.nn())
    }

    /// Bit length of n
    pub fn bits(&self) -> u64 {
        self.n.bits()
    }

    /// Reject keys that are too small or trivially malformed
    pub fn validate(&self) -> Result<()> {
        if self.n.bits() < MIN_MODULUS_BITS {
            return Err(Error::VerificationFailed(format!(
                "Paillier modulus too small: {} bits",
                self.n.bits()
            )));
        }
        if self.n.is_even() {
            return Err(Error::VerificationFailed("Paillier modulus is even".into()));
        }
        Ok(())
    }

    /// Encrypt `m` (taken mod n) with fresh randomness
    pub fn encrypt(&self, m: &BigUint) -> Result<Ciphertext> {
        let m = m % &self.n;
        let (c, _nonce) = self
            .inner
            .encrypt(&m.to_bytes_be(), None)
            .ok_or_else(|| Error::Crypto("Paillier plaintext out of range".into()))?;
        Ok(Ciphertext(from_bignum(&c)))
    }

    /// Homomorphic addition: Enc(a) ⊕ Enc(b) = Enc(a + b)
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        self.inner
            .add(&to_bignum(&a.0), &to_bignum(&b.0))
            .map(|c| Ciphertext(from_bignum(&c)))
            .ok_or_else(|| Error::VerificationFailed("Paillier addition out of range".into()))
    }

    /// Homomorphic scalar multiplication: Enc(a) ⊗ k = Enc(a * k)
    pub fn mul(&self, c: &Ciphertext, k: &BigUint) -> Result<Ciphertext> {
        self.inner
            .mul(&to_bignum(&c.0), &to_bignum(k))
            .map(|c| Ciphertext(from_bignum(&c)))
            .ok_or_else(|| Error::VerificationFailed("Paillier multiplication out of range".into()))
    }

    /// Check a ciphertext received from a peer lies in Z*_{n^2}
    pub fn validate_ciphertext(&self, c: &Ciphertext) -> Result<()> {
        if c.0.is_zero() || c.0 >= self.modulus_squared() {
            return Err(Error::VerificationFailed(
                "Paillier ciphertext out of range".into(),
            ));
        }
        if !c.0.gcd(&self.n).is_one() {
            return Err(Error::VerificationFailed(
                "Paillier ciphertext not invertible".into(),
            ));
        }
        Ok(())
    }
}

impl PartialEq for PaillierPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.n == other.n
    }
}

impl Eq for PaillierPublicKey {}

impl fmt::Debug for PaillierPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaillierPublicKey")
            .field("bits", &self.n.bits())
            .finish()
    }
}

impl Serialize for PaillierPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.n.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PaillierPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let n = BigUint::deserialize(deserializer)?;
        Self::from_modulus(&n).map_err(de::Error::custom)
    }
}

impl PaillierSecretKey {
    /// Generate a key pair whose modulus has exactly `bits` bits
    pub fn generate(bits: u64, abort: &AtomicBool) -> Result<Self> {
        if bits < MIN_MODULUS_BITS || bits % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "Paillier modulus must be an even number of bits >= {}, got {}",
                MIN_MODULUS_BITS, bits
            )));
        }
        let half = (bits / 2) as usize;

        loop {
            if abort.load(Ordering::Relaxed) {
                return Err(Error::Cancelled("prime generation aborted".into()));
            }
            let p = from_bignum(&BigNumber::prime(half));
            if abort.load(Ordering::Relaxed) {
                return Err(Error::Cancelled("prime generation aborted".into()));
            }
            let q = from_bignum(&BigNumber::prime(half));
            if p == q || (&p * &q).bits() != bits {
                continue;
            }
            return Self::from_primes(&p, &q);
        }
    }

    /// Build a key pair from two distinct primes
    pub fn from_primes(p: &BigUint, q: &BigUint) -> Result<Self> {
        if p == q {
            return Err(Error::Crypto("Paillier primes must differ".into()));
        }
        let inner = DecryptionKey::with_primes_unchecked(&to_bignum(p), &to_bignum(q))
            .ok_or_else(|| Error::Crypto("invalid Paillier primes".into()))?;
        let public = PaillierPublicKey::from_library(EncryptionKey::from(&inner));

        Ok(Self {
            inner,
            public,
            p: p.clone(),
            q: q.clone(),
        })
    }

    pub fn public_key(&self) -> &PaillierPublicKey {
        &self.public
    }

    /// Decrypt to a value in [0, n)
    pub fn decrypt(&self, c: &Ciphertext) -> Result<BigUint> {
        self.public.validate_ciphertext(c)?;
        let plaintext = self
            .inner
            .decrypt(&to_bignum(&c.0))
            .ok_or_else(|| Error::Crypto("Paillier decryption failed".into()))?;
        Ok(BigUint::from_bytes_be(&plaintext))
    }
}

impl fmt::Debug for PaillierSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaillierSecretKey")
            .field("public", &self.public)
            .field("primes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct SecretKeyRepr {
    p: BigUint,
    q: BigUint,
}

impl Serialize for PaillierSecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        SecretKeyRepr {
            p: self.p.clone(),
            q: self.q.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PaillierSecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = SecretKeyRepr::deserialize(deserializer)?;
        Self::from_primes(&repr.p, &repr.q).map_err(de::Error::custom)
    }
}
