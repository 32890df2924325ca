//! MPC coordination utilities
//!
//! The [`Relay`] trait abstracts message passing between the parties of one
//! protocol session. Each party holds its own relay endpoint; the engines in
//! [`crate::keygen`] and [`crate::sign`] only ever talk to that endpoint.
//!
//! Routing rules every implementation must honour:
//! - a party never receives its own messages (self-loop guard)
//! - a direct message reaches only its addressee
//! - a broadcast reaches every *other* party
//! - messages from one sender to one receiver arrive in send order
//! - every wait is bounded by the session deadline and aborts on cancellation

use crate::{PartyId, Result, SessionId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub use async_trait::async_trait;

pub mod channel;

pub use channel::{ChannelNetwork, ChannelRelay};

/// A routed protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: SessionId,
    pub from: PartyId,
    /// `None` for broadcasts
    pub to: Option<PartyId>,
    pub round: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

/// Message relay trait for MPC communication
///
/// One value of this trait is one party's view of a session's network.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Session this endpoint belongs to
    fn session_id(&self) -> &SessionId;

    /// The party owning this endpoint
    fn party_id(&self) -> PartyId;

    /// Every participant of the session, including this party
    fn parties(&self) -> &[PartyId];

    /// Broadcast a message to every other party
    async fn broadcast<T: Serialize + Send + Sync>(&self, round: u32, message: &T) -> Result<()>;

    /// Send a direct message to one party
    async fn send_direct<T: Serialize + Send + Sync>(
        &self,
        round: u32,
        to: PartyId,
        message: &T,
    ) -> Result<()>;

    /// Collect one broadcast from every other party for `round`.
    ///
    /// Results are ordered by sender id.
    async fn collect_broadcasts<T: DeserializeOwned + Send>(
        &self,
        round: u32,
    ) -> Result<Vec<(PartyId, T)>>;

    /// Collect one direct message from every other party for `round`.
    ///
    /// Results are ordered by sender id.
    async fn collect_direct<T: DeserializeOwned + Send>(
        &self,
        round: u32,
    ) -> Result<Vec<(PartyId, T)>>;

    /// Other participants, in id order
    fn peers(&self) -> Vec<PartyId> {
        let me = self.party_id();
        self.parties().iter().copied().filter(|p| *p != me).collect()
    }
}
