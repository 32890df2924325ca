//! Unit tests module
//!
//! This module contains unit tests for individual components:
//! - MPC core (DKG, signing)
//! - Share storage
//! - Session management
//! - Signature formats

pub mod format_test;
pub mod storage_test;
