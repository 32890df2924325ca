//! Integration tests module
//!
//! End-to-end flows through the wallet service.

pub mod full_flow_test;
pub mod multichain_test;
