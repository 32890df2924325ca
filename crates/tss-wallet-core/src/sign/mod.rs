//! Distributed Signature Generation (DSG)
//!
//! GG18-style threshold ECDSA. Any quorum of at least `threshold` parties can
//! sign a 32-byte message hash:
//!
//! - each signer weights its share with the Lagrange coefficient of the quorum
//! - nonce and key products are converted to additive shares with Paillier MtA
//! - the nonce point is only revealed after every Γ_i has been committed
//!
//! The private key and the nonce are never assembled in one place. A signature
//! is returned only after it verifies against the joint public key.

mod dsg;
mod messages;
pub mod mta;

pub use dsg::run_dsg;
pub use messages::{
    DsgPartialMessage, DsgRound1Message, DsgRound2Message, DsgRound3Message, DsgRound4Message,
};
