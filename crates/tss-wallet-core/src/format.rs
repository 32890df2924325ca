//! Signature format adapter
//!
//! Converts algebraic `(R, S[, V])` signatures into chain wire formats and
//! back:
//!
//! | Encoding   | Layout                                   | Length   |
//! |------------|------------------------------------------|----------|
//! | Ethereum   | `R (32) ‖ S (32) ‖ V (1)`                | 65       |
//! | Cosmos     | `R (32) ‖ S (32)`                        | 64       |
//! | DER        | `SEQUENCE { INTEGER R, INTEGER S }`      | 8..=72   |
//!
//! Bitcoin signatures are DER followed by an optional sighash byte.
//! [`SignatureFormatAdapter`] picks the encoding for a chain through the
//! [`NetworkRegistry`].

use crate::network::{NetworkRegistry, SignatureEncoding};
use crate::types::left_pad_32;
use crate::{Error, Result, SignatureResult};
use tracing::debug;

/// V byte used when a signature carries no recovery id
pub const DEFAULT_V: u8 = 27;

const DER_SEQUENCE: u8 = 0x30;
const DER_INTEGER: u8 = 0x02;

/// Strip leading zeros and check the value fits in 256 bits
fn component<'a>(bytes: &'a [u8], name: &str) -> Result<&'a [u8]> {
    if bytes.is_empty() {
        return Err(Error::NilSignature);
    }
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let trimmed = &bytes[first..];
    if trimmed.len() > 32 {
        return Err(Error::MalformedSignature(format!(
            "{} exceeds 256 bits",
            name
        )));
    }
    Ok(trimmed)
}

fn fixed_rs(sig: &SignatureResult) -> Result<([u8; 32], [u8; 32])> {
    let r = component(sig.r(), "R")?;
    let s = component(sig.s(), "S")?;
    Ok((left_pad_32(r), left_pad_32(s)))
}

/// Map an Ethereum V byte to a recovery id
fn recovery_id_from_v(v: u8) -> Result<u8> {
    match v {
        0 | 1 => Ok(v),
        27 | 28 => Ok(v - 27),
        // EIP-155: v = rid + 35 + 2 * chain_id
        v if v >= 35 => Ok((v - 35) % 2),
        other => Err(Error::MalformedSignature(format!(
            "invalid V byte {}",
            other
        ))),
    }
}

/// `R ‖ S ‖ V`, V = 27 + recovery id (27 if unset).
///
/// A V already in wire form (27/28 or EIP-155) is folded back to 27/28.
pub fn format_ethereum(sig: &SignatureResult) -> Result<[u8; 65]> {
    let (r, s) = fixed_rs(sig)?;
    let v = match sig.v() {
        None => DEFAULT_V,
        Some(v) => DEFAULT_V + recovery_id_from_v(v)?,
    };

    let mut out = [0u8; 65];
    out[..32].copy_from_slice(&r);
    out[32..64].copy_from_slice(&s);
    out[64] = v;
    Ok(out)
}

/// `R ‖ S`
pub fn format_cosmos(sig: &SignatureResult) -> Result<[u8; 64]> {
    let (r, s) = fixed_rs(sig)?;
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&r);
    out[32..].copy_from_slice(&s);
    Ok(out)
}

fn der_integer(value: &[u8], name: &str) -> Result<Vec<u8>> {
    let trimmed = component(value, name)?;
    if trimmed.is_empty() {
        return Err(Error::MalformedSignature(format!("{} is not positive", name)));
    }
    let pad = trimmed[0] & 0x80 != 0;
    let len = trimmed.len() + usize::from(pad);

    let mut out = Vec::with_capacity(len + 2);
    out.push(DER_INTEGER);
    out.push(len as u8);
    if pad {
        out.push(0x00);
    }
    out.extend_from_slice(trimmed);
    Ok(out)
}

/// Strict ASN.1 DER `SEQUENCE { INTEGER R, INTEGER S }`
pub fn format_der(sig: &SignatureResult) -> Result<Vec<u8>> {
    let r = der_integer(sig.r(), "R")?;
    let s = der_integer(sig.s(), "S")?;

    let mut out = Vec::with_capacity(2 + r.len() + s.len());
    out.push(DER_SEQUENCE);
    out.push((r.len() + s.len()) as u8);
    out.extend_from_slice(&r);
    out.extend_from_slice(&s);
    Ok(out)
}

/// Inverse of [`format_ethereum`]; the returned V is the recovery id
pub fn parse_ethereum(bytes: &[u8]) -> Result<SignatureResult> {
    if bytes.len() != 65 {
        return Err(Error::InvalidLength {
            expected: 65,
            actual: bytes.len(),
        });
    }
    let v = recovery_id_from_v(bytes[64])?;
    Ok(SignatureResult::new(
        bytes[..32].to_vec(),
        bytes[32..64].to_vec(),
        Some(v),
    )
    .with_wire_bytes(bytes.to_vec()))
}

/// Inverse of [`format_cosmos`]
pub fn parse_cosmos(bytes: &[u8]) -> Result<SignatureResult> {
    if bytes.len() != 64 {
        return Err(Error::InvalidLength {
            expected: 64,
            actual: bytes.len(),
        });
    }
    Ok(
        SignatureResult::new(bytes[..32].to_vec(), bytes[32..].to_vec(), None)
            .with_wire_bytes(bytes.to_vec()),
    )
}

/// Read one DER INTEGER at `pos`, returning its 32-byte value and the next offset
fn read_der_integer(bytes: &[u8], pos: usize, name: &str) -> Result<([u8; 32], usize)> {
    let malformed = |msg: &str| Error::MalformedSignature(format!("{}: {}", name, msg));

    if bytes.get(pos) != Some(&DER_INTEGER) {
        return Err(malformed("expected INTEGER tag"));
    }
    let len = *bytes.get(pos + 1).ok_or_else(|| malformed("missing length"))? as usize;
    if len == 0 {
        return Err(malformed("empty integer"));
    }
    if len > 33 {
        return Err(malformed("integer longer than 33 bytes"));
    }
    let start = pos + 2;
    let value = bytes
        .get(start..start + len)
        .ok_or_else(|| malformed("truncated integer"))?;

    if value[0] & 0x80 != 0 {
        return Err(malformed("negative integer"));
    }
    if len > 1 && value[0] == 0x00 && value[1] & 0x80 == 0 {
        return Err(malformed("non-minimal integer encoding"));
    }

    let magnitude = component(value, name).map_err(|_| malformed("exceeds 256 bits"))?;
    if magnitude.is_empty() {
        return Err(malformed("integer is zero"));
    }
    Ok((left_pad_32(magnitude), start + len))
}

/// Parse a strict DER signature with no trailing bytes
pub fn parse_der(bytes: &[u8]) -> Result<SignatureResult> {
    if bytes.len() < 8 {
        return Err(Error::MalformedSignature(format!(
            "DER signature too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0] != DER_SEQUENCE {
        return Err(Error::MalformedSignature("expected SEQUENCE tag".into()));
    }
    let seq_len = bytes[1] as usize;
    if seq_len & 0x80 != 0 {
        return Err(Error::MalformedSignature(
            "long-form length not allowed".into(),
        ));
    }
    if seq_len + 2 != bytes.len() {
        return Err(Error::InvalidLength {
            expected: seq_len + 2,
            actual: bytes.len(),
        });
    }

    let (r, next) = read_der_integer(bytes, 2, "R")?;
    let (s, end) = read_der_integer(bytes, next, "S")?;
    if end != bytes.len() {
        return Err(Error::MalformedSignature(
            "trailing bytes inside SEQUENCE".into(),
        ));
    }

    Ok(SignatureResult::new(r.to_vec(), s.to_vec(), None).with_wire_bytes(bytes.to_vec()))
}

/// Parse a Bitcoin signature: DER plus an optional trailing sighash byte.
///
/// Returns the signature and the sighash byte, if present.
pub fn parse_bitcoin(bytes: &[u8]) -> Result<(SignatureResult, Option<u8>)> {
    if bytes.len() < 2 {
        return Err(Error::MalformedSignature(format!(
            "DER signature too short: {} bytes",
            bytes.len()
        )));
    }
    let der_len = bytes[1] as usize + 2;
    match bytes.len() {
        n if n == der_len => Ok((parse_der(bytes)?, None)),
        n if n == der_len + 1 => {
            let sig = parse_der(&bytes[..der_len])?;
            Ok((sig.with_wire_bytes(bytes.to_vec()), Some(bytes[der_len])))
        }
        n => Err(Error::InvalidLength {
            expected: der_len + 1,
            actual: n,
        }),
    }
}

/// Chooses a wire encoding per chain and applies it
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureFormatAdapter {
    registry: NetworkRegistry,
}

impl SignatureFormatAdapter {
    pub fn new(registry: NetworkRegistry) -> Self {
        Self { registry }
    }

    /// Encode a signature for `chain_id`
    pub fn encode(&self, chain_id: &str, sig: Option<&SignatureResult>) -> Result<Vec<u8>> {
        let network = self.registry.get(chain_id)?;
        let sig = sig.ok_or(Error::NilSignature)?;

        debug!(chain_id, encoding = ?network.signing.encoding, "Encoding signature");

        match network.signing.encoding {
            SignatureEncoding::Ethereum => Ok(format_ethereum(sig)?.to_vec()),
            SignatureEncoding::Cosmos => Ok(format_cosmos(sig)?.to_vec()),
            SignatureEncoding::BitcoinDer => {
                let mut der = format_der(sig)?;
                if let Some(sighash) = network.signing.sighash {
                    der.push(sighash);
                }
                Ok(der)
            }
        }
    }

    /// Attach the chain encoding to a signature's wire bytes
    pub fn apply(&self, chain_id: &str, sig: SignatureResult) -> Result<SignatureResult> {
        let wire = self.encode(chain_id, Some(&sig))?;
        Ok(sig.with_wire_bytes(wire))
    }

    /// Decode wire bytes produced for `chain_id`
    pub fn decode(&self, chain_id: &str, bytes: &[u8]) -> Result<SignatureResult> {
        match self.registry.encoding_for(chain_id)? {
            SignatureEncoding::Ethereum => parse_ethereum(bytes),
            SignatureEncoding::Cosmos => parse_cosmos(bytes),
            SignatureEncoding::BitcoinDer => parse_bitcoin(bytes).map(|(sig, _)| sig),
        }
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }
}
