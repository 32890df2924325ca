//! Channel-backed relay for in-process protocol sessions
//!
//! [`ChannelNetwork::endpoints`] wires one bounded `mpsc` inbox per party and
//! hands each party a [`ChannelRelay`] holding senders to every peer. Messages
//! that arrive before the local party asks for them (a fast peer already in
//! the next round) are parked and replayed on the matching collect call.

use super::{Envelope, Relay, async_trait};
use crate::{Error, PartyId, Result, SessionId};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Default per-party inbox capacity
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Builder for the endpoints of one session
#[derive(Debug, Clone)]
pub struct ChannelNetwork {
    session_id: SessionId,
    parties: Vec<PartyId>,
    capacity: usize,
    deadline: Instant,
    round_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ChannelNetwork {
    /// Network for `parties`, every wait bounded by `deadline`
    pub fn new(session_id: impl Into<SessionId>, parties: Vec<PartyId>, deadline: Instant) -> Self {
        Self {
            session_id: session_id.into(),
            parties,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            deadline,
            round_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the inbox capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Bound each collect call additionally by `timeout`
    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = Some(timeout);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Create one endpoint per party, in `parties` order
    pub fn endpoints(&self) -> Vec<ChannelRelay> {
        let mut senders = HashMap::with_capacity(self.parties.len());
        let mut receivers = Vec::with_capacity(self.parties.len());
        for party in &self.parties {
            let (tx, rx) = mpsc::channel(self.capacity);
            senders.insert(*party, tx);
            receivers.push((*party, rx));
        }

        receivers
            .into_iter()
            .map(|(party, rx)| {
                let peers = senders
                    .iter()
                    .filter(|(id, _)| **id != party)
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect();
                ChannelRelay {
                    session_id: self.session_id.clone(),
                    party_id: party,
                    parties: self.parties.clone(),
                    peers,
                    inbox: Mutex::new(Inbox {
                        rx,
                        parked: VecDeque::new(),
                    }),
                    deadline: self.deadline,
                    round_timeout: self.round_timeout,
                    cancel: self.cancel.clone(),
                }
            })
            .collect()
    }
}

struct Inbox {
    rx: mpsc::Receiver<Envelope>,
    parked: VecDeque<Envelope>,
}

/// One party's endpoint of a [`ChannelNetwork`]
pub struct ChannelRelay {
    session_id: SessionId,
    party_id: PartyId,
    parties: Vec<PartyId>,
    peers: HashMap<PartyId, mpsc::Sender<Envelope>>,
    inbox: Mutex<Inbox>,
    deadline: Instant,
    round_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChannelRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRelay")
            .field("session_id", &self.session_id)
            .field("party_id", &self.party_id)
            .field("parties", &self.parties)
            .finish()
    }
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn deserialize<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    serde_json::from_slice(&envelope.payload).map_err(|e| {
        Error::Protocol(format!(
            "malformed round {} message from party {}: {}",
            envelope.round, envelope.from, e
        ))
    })
}

impl ChannelRelay {
    fn wait_deadline(&self) -> Instant {
        match self.round_timeout {
            Some(timeout) => self.deadline.min(Instant::now() + timeout),
            None => self.deadline,
        }
    }

    async fn deliver(&self, to: PartyId, envelope: Envelope) -> Result<()> {
        if to == self.party_id {
            return Err(Error::Protocol(format!(
                "party {} attempted to send to itself",
                self.party_id
            )));
        }
        let tx = self.peers.get(&to).ok_or_else(|| {
            Error::Protocol(format!("party {} is not part of the session", to))
        })?;

        let deadline = self.wait_deadline();
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(Error::Cancelled(format!("session {}", self.session_id)))
            }
            sent = tokio::time::timeout_at(deadline, tx.send(envelope)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::Protocol(format!("party {} has left the session", to))),
                Err(_) => Err(Error::Timeout(format!("delivery to party {}", to))),
            },
        }
    }

    async fn collect<T: DeserializeOwned + Send>(
        &self,
        round: u32,
        broadcast: bool,
    ) -> Result<Vec<(PartyId, T)>> {
        let expected = self.peers();
        let mut collected: BTreeMap<PartyId, Envelope> = BTreeMap::new();
        let matches = |env: &Envelope| env.round == round && env.is_broadcast() == broadcast;

        let mut inbox = self.inbox.lock().await;

        let mut still_parked = VecDeque::with_capacity(inbox.parked.len());
        while let Some(env) = inbox.parked.pop_front() {
            if matches(&env) && !collected.contains_key(&env.from) {
                collected.insert(env.from, env);
            } else {
                still_parked.push_back(env);
            }
        }
        inbox.parked = still_parked;

        let deadline = self.wait_deadline();
        while collected.len() < expected.len() {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("session {}", self.session_id)));
                }
                received = tokio::time::timeout_at(deadline, inbox.rx.recv()) => received,
            };

            let env = match received {
                Ok(Some(env)) => env,
                Ok(None) => {
                    return Err(Error::Protocol("all peers disconnected".into()));
                }
                Err(_) => {
                    let missing: Vec<_> = expected
                        .iter()
                        .filter(|p| !collected.contains_key(p))
                        .collect();
                    warn!(
                        session_id = %self.session_id,
                        party_id = self.party_id,
                        round,
                        ?missing,
                        "Round timed out"
                    );
                    return Err(Error::Timeout(format!(
                        "round {} messages from parties {:?}",
                        round, missing
                    )));
                }
            };

            self.check_envelope(&env)?;
            trace!(
                party_id = self.party_id,
                from = env.from,
                round = env.round,
                "Received message"
            );

            if matches(&env) {
                if collected.contains_key(&env.from) {
                    return Err(Error::Protocol(format!(
                        "duplicate round {} message from party {}",
                        round, env.from
                    )));
                }
                collected.insert(env.from, env);
            } else if env.round < round {
                return Err(Error::Protocol(format!(
                    "out-of-order message from party {}: round {} while in round {}",
                    env.from, env.round, round
                )));
            } else {
                inbox.parked.push_back(env);
            }
        }

        collected
            .into_iter()
            .map(|(from, env)| Ok((from, deserialize(&env)?)))
            .collect()
    }

    fn check_envelope(&self, env: &Envelope) -> Result<()> {
        if env.session_id != self.session_id {
            return Err(Error::Protocol(format!(
                "message for session {} delivered to session {}",
                env.session_id, self.session_id
            )));
        }
        if env.from == self.party_id {
            return Err(Error::Protocol("received own message".into()));
        }
        if !self.peers.contains_key(&env.from) {
            return Err(Error::Protocol(format!(
                "message from unknown party {}",
                env.from
            )));
        }
        if let Some(to) = env.to {
            if to != self.party_id {
                return Err(Error::Protocol(format!(
                    "misrouted message for party {}",
                    to
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for ChannelRelay {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn party_id(&self) -> PartyId {
        self.party_id
    }

    fn parties(&self) -> &[PartyId] {
        &self.parties
    }

    async fn broadcast<T: Serialize + Send + Sync>(&self, round: u32, message: &T) -> Result<()> {
        let payload = serialize(message)?;
        for to in self.peers() {
            let envelope = Envelope {
                session_id: self.session_id.clone(),
                from: self.party_id,
                to: None,
                round,
                payload: payload.clone(),
            };
            self.deliver(to, envelope).await?;
        }
        Ok(())
    }

    async fn send_direct<T: Serialize + Send + Sync>(
        &self,
        round: u32,
        to: PartyId,
        message: &T,
    ) -> Result<()> {
        let envelope = Envelope {
            session_id: self.session_id.clone(),
            from: self.party_id,
            to: Some(to),
            round,
            payload: serialize(message)?,
        };
        self.deliver(to, envelope).await
    }

    async fn collect_broadcasts<T: DeserializeOwned + Send>(
        &self,
        round: u32,
    ) -> Result<Vec<(PartyId, T)>> {
        self.collect(round, true).await
    }

    async fn collect_direct<T: DeserializeOwned + Send>(
        &self,
        round: u32,
    ) -> Result<Vec<(PartyId, T)>> {
        self.collect(round, false).await
    }
}
