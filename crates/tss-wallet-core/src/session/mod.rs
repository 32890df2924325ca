//! Keygen and signing session management
//!
//! A session moves `pending -> active -> {completed, failed}` and never leaves
//! a terminal state. At most one session is live per wallet at any time;
//! sessions for different wallets share nothing but the store.

mod manager;
mod state;
mod store;

pub use manager::{SessionManager, WalletLease};
pub use state::{Session, SessionArtifact, SessionKind, SessionState};
pub use store::{MemorySessionStore, SessionStore};
