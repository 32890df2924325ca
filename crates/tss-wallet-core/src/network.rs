//! Network registry
//!
//! Static catalog mapping chain ids to the curve, signing algorithm, address
//! parameters and signature encoding a wallet on that chain uses. All entries
//! are `&'static` data; the registry itself only holds a slice reference and
//! is `Copy`.

use crate::{Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};

/// Elliptic curve backing a chain's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    Secp256k1,
    Ed25519,
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Curve::Secp256k1 => write!(f, "secp256k1"),
            Curve::Ed25519 => write!(f, "ed25519"),
        }
    }
}

/// Signature scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningAlgorithm {
    Ecdsa,
    Eddsa,
}

/// Wire encoding for signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureEncoding {
    /// R || S || V, 65 bytes
    Ethereum,
    /// R || S, 64 bytes
    Cosmos,
    /// ASN.1 DER with an optional trailing sighash byte
    BitcoinDer,
}

/// Digest applied to messages before signing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageHash {
    Sha256,
    Keccak256,
    DoubleSha256,
}

impl MessageHash {
    /// Digest `message` the way the chain expects before signing
    pub fn digest(&self, message: &[u8]) -> [u8; 32] {
        match self {
            MessageHash::Sha256 => Sha256::digest(message).into(),
            MessageHash::DoubleSha256 => Sha256::digest(Sha256::digest(message)).into(),
            MessageHash::Keccak256 => {
                let mut hasher = Keccak::v256();
                let mut output = [0u8; 32];
                hasher.update(message);
                hasher.finalize(&mut output);
                output
            }
        }
    }
}

/// Per-chain signing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SigningConfig {
    pub encoding: SignatureEncoding,
    pub hash: MessageHash,
    /// Sighash byte appended to DER signatures, if any
    pub sighash: Option<u8>,
}

/// Reference data describing one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub chain_id: &'static str,
    pub name: &'static str,
    pub curve: Curve,
    pub algorithm: SigningAlgorithm,
    /// Bech32 HRP or textual address prefix
    pub address_prefix: &'static str,
    /// SLIP-44 coin type
    pub coin_type: u32,
    pub signing: SigningConfig,
}

impl NetworkInfo {
    /// Whether the threshold engines can produce keys for this chain
    pub fn ensure_threshold_ecdsa(&self) -> Result<()> {
        if self.curve != Curve::Secp256k1 || self.algorithm != SigningAlgorithm::Ecdsa {
            return Err(Error::UnsupportedCurve(format!(
                "{} uses {} / {:?}",
                self.chain_id, self.curve, self.algorithm
            )));
        }
        Ok(())
    }
}

const COSMOS_SIGNING: SigningConfig = SigningConfig {
    encoding: SignatureEncoding::Cosmos,
    hash: MessageHash::Sha256,
    sighash: None,
};

const EVM_SIGNING: SigningConfig = SigningConfig {
    encoding: SignatureEncoding::Ethereum,
    hash: MessageHash::Keccak256,
    sighash: None,
};

const BITCOIN_SIGNING: SigningConfig = SigningConfig {
    encoding: SignatureEncoding::BitcoinDer,
    hash: MessageHash::DoubleSha256,
    // SIGHASH_ALL
    sighash: Some(0x01),
};

/// Built-in network catalog
pub static DEFAULT_NETWORKS: &[NetworkInfo] = &[
    NetworkInfo {
        chain_id: "chain-1",
        name: "Host Ledger Devnet",
        curve: Curve::Secp256k1,
        algorithm: SigningAlgorithm::Ecdsa,
        address_prefix: "tss",
        coin_type: 118,
        signing: COSMOS_SIGNING,
    },
    NetworkInfo {
        chain_id: "cosmoshub-4",
        name: "Cosmos Hub",
        curve: Curve::Secp256k1,
        algorithm: SigningAlgorithm::Ecdsa,
        address_prefix: "cosmos",
        coin_type: 118,
        signing: COSMOS_SIGNING,
    },
    NetworkInfo {
        chain_id: "osmosis-1",
        name: "Osmosis",
        curve: Curve::Secp256k1,
        algorithm: SigningAlgorithm::Ecdsa,
        address_prefix: "osmo",
        coin_type: 118,
        signing: COSMOS_SIGNING,
    },
    NetworkInfo {
        chain_id: "eip155:1",
        name: "Ethereum Mainnet",
        curve: Curve::Secp256k1,
        algorithm: SigningAlgorithm::Ecdsa,
        address_prefix: "0x",
        coin_type: 60,
        signing: EVM_SIGNING,
    },
    NetworkInfo {
        chain_id: "eip155:11155111",
        name: "Ethereum Sepolia",
        curve: Curve::Secp256k1,
        algorithm: SigningAlgorithm::Ecdsa,
        address_prefix: "0x",
        coin_type: 60,
        signing: EVM_SIGNING,
    },
    NetworkInfo {
        chain_id: "eip155:137",
        name: "Polygon",
        curve: Curve::Secp256k1,
        algorithm: SigningAlgorithm::Ecdsa,
        address_prefix: "0x",
        coin_type: 60,
        signing: EVM_SIGNING,
    },
    NetworkInfo {
        chain_id: "bitcoin-mainnet",
        name: "Bitcoin",
        curve: Curve::Secp256k1,
        algorithm: SigningAlgorithm::Ecdsa,
        address_prefix: "bc",
        coin_type: 0,
        signing: BITCOIN_SIGNING,
    },
    NetworkInfo {
        chain_id: "bitcoin-testnet",
        name: "Bitcoin Testnet",
        curve: Curve::Secp256k1,
        algorithm: SigningAlgorithm::Ecdsa,
        address_prefix: "tb",
        coin_type: 1,
        signing: BITCOIN_SIGNING,
    },
    NetworkInfo {
        chain_id: "solana-mainnet",
        name: "Solana",
        curve: Curve::Ed25519,
        algorithm: SigningAlgorithm::Eddsa,
        address_prefix: "",
        coin_type: 501,
        signing: SigningConfig {
            encoding: SignatureEncoding::Cosmos,
            hash: MessageHash::Sha256,
            sighash: None,
        },
    },
];

/// Lookup table over a static network catalog
#[derive(Debug, Clone, Copy)]
pub struct NetworkRegistry {
    networks: &'static [NetworkInfo],
}

impl NetworkRegistry {
    /// Registry over a custom catalog
    pub const fn new(networks: &'static [NetworkInfo]) -> Self {
        Self { networks }
    }

    /// Find a network by chain id
    pub fn get(&self, chain_id: &str) -> Result<&'static NetworkInfo> {
        self.networks
            .iter()
            .find(|n| n.chain_id == chain_id)
            .ok_or_else(|| Error::UnsupportedNetwork(chain_id.to_string()))
    }

    /// Signature encoding used by a chain
    pub fn encoding_for(&self, chain_id: &str) -> Result<SignatureEncoding> {
        Ok(self.get(chain_id)?.signing.encoding)
    }

    pub fn contains(&self, chain_id: &str) -> bool {
        self.networks.iter().any(|n| n.chain_id == chain_id)
    }

    /// All networks in the catalog
    pub fn networks(&self) -> &'static [NetworkInfo] {
        self.networks
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_NETWORKS)
    }
}
