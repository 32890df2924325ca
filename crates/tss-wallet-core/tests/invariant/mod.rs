//! Invariant tests module
//!
//! Properties that must hold across operations, checked through the public
//! API.

pub mod wallet_invariant;
