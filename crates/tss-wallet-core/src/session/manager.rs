//! Session manager
//!
//! Owns the lifecycle of keygen and signing sessions: wallet exclusivity,
//! spawning one task per protocol party, collecting results, deadlines,
//! cancellation and the periodic sweep.

use super::{Session, SessionArtifact, SessionKind, SessionState, SessionStore};
use crate::config::TssConfig;
use crate::keygen::{KeygenConfig, run_dkg};
use crate::mpc::{ChannelNetwork, ChannelRelay, Relay};
use crate::network::NetworkRegistry;
use crate::sign::run_dsg;
use crate::types::decode_point;
use crate::{
    Error, PartyContribution, Result, SecurityLevel, SessionId, ShareData, SignatureResult,
    WalletId,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Exclusive claim on a wallet.
///
/// While any clone is alive no other session can start for the wallet. The
/// marker is cleared when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct WalletLease {
    inner: Arc<LeaseInner>,
}

#[derive(Debug)]
struct LeaseInner {
    wallet_id: WalletId,
    token: Uuid,
    markers: Arc<DashMap<WalletId, Uuid>>,
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.markers
            .remove_if(&self.wallet_id, |_, token| *token == self.token);
    }
}

impl WalletLease {
    pub fn wallet_id(&self) -> &str {
        &self.inner.wallet_id
    }
}

type KeygenOutput = Result<Vec<ShareData>>;

/// Per-session runtime handles
struct SessionRuntime {
    cancel: CancellationToken,
    updates: watch::Sender<Session>,
    failure: Mutex<Option<Error>>,
    lease: Mutex<Option<WalletLease>>,
    keygen_output: Mutex<Option<oneshot::Receiver<KeygenOutput>>>,
}

impl SessionRuntime {
    fn publish(&self, session: &Session) {
        // A completed keygen keeps the wallet until its shares are taken
        let holds_output =
            session.kind == SessionKind::Keygen && session.state == SessionState::Completed;
        if session.state.is_terminal() && !holds_output {
            self.release();
        }
        self.updates.send_replace(session.clone());
    }

    fn release(&self) {
        self.lease.lock().take();
    }
}

/// Coordinates keygen and signing sessions
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    markers: Arc<DashMap<WalletId, Uuid>>,
    runtimes: DashMap<SessionId, Arc<SessionRuntime>>,
    registry: NetworkRegistry,
    config: TssConfig,
}

impl SessionManager {
    /// Create a manager over an injected session store
    pub fn new(store: Arc<dyn SessionStore>, registry: NetworkRegistry, config: TssConfig) -> Self {
        Self {
            store,
            markers: Arc::new(DashMap::new()),
            runtimes: DashMap::new(),
            registry,
            config,
        }
    }

    pub fn config(&self) -> &TssConfig {
        &self.config
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    /// Claim a wallet; fails with `SessionInProgress` if already claimed
    pub fn reserve_wallet(&self, wallet_id: &str) -> Result<WalletLease> {
        if wallet_id.trim().is_empty() {
            return Err(Error::InvalidRequest("wallet id is empty".into()));
        }
        let token = Uuid::new_v4();
        match self.markers.entry(wallet_id.to_string()) {
            Entry::Occupied(_) => Err(Error::SessionInProgress(wallet_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(WalletLease {
                    inner: Arc::new(LeaseInner {
                        wallet_id: wallet_id.to_string(),
                        token,
                        markers: Arc::clone(&self.markers),
                    }),
                })
            }
        }
    }

    /// Whether a session (or a lease holder) currently owns the wallet
    pub fn is_wallet_active(&self, wallet_id: &str) -> bool {
        self.markers.contains_key(wallet_id)
    }

    /// Snapshot of a session
    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        self.store
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    // ============ Keygen ============

    /// Start a keygen session for a wallet
    pub fn create_keygen_session(
        self: &Arc<Self>,
        wallet_id: &str,
        chain_id: &str,
        security_level: SecurityLevel,
    ) -> Result<SessionId> {
        validate_keygen_request(&self.registry, chain_id, security_level)?;
        let lease = self.reserve_wallet(wallet_id)?;
        self.start_keygen(&lease, chain_id, security_level)
    }

    /// Start a keygen session under an existing lease
    #[instrument(skip(self, lease), fields(wallet_id = lease.wallet_id()))]
    pub fn start_keygen(
        self: &Arc<Self>,
        lease: &WalletLease,
        chain_id: &str,
        security_level: SecurityLevel,
    ) -> Result<SessionId> {
        validate_keygen_request(&self.registry, chain_id, security_level)?;

        let session = Session::new(
            SessionKind::Keygen,
            lease.wallet_id(),
            chain_id,
            security_level,
        );
        let session_id = session.id.clone();
        let parties: Vec<usize> = (0..security_level.parties()).collect();
        let (relays, runtime) = self.register(session, lease, parties)?;

        let keygen_config = KeygenConfig::new(security_level.threshold(), chain_id)
            .with_paillier_bits(self.config.paillier_bits)
            .with_preparams_timeout(self.config.preparams_timeout());

        let mut tasks = JoinSet::new();
        for relay in relays {
            let manager = Arc::clone(self);
            let config = keygen_config.clone();
            let cancel = runtime.cancel.clone();
            let sid = session_id.clone();
            tasks.spawn(async move {
                let result = run_dkg(&config, &relay, &cancel).await?;
                manager.submit_party_round(&sid, PartyContribution {
                    party_id: format!("party-{}", relay.party_id()),
                    public_key: result.public_key.clone(),
                    chain_id: config.chain_id.clone(),
                })?;
                Ok::<ShareData, Error>(result.share)
            });
        }

        let (tx, rx) = oneshot::channel();
        *runtime.keygen_output.lock() = Some(rx);

        let manager = Arc::clone(self);
        let sid = session_id.clone();
        tokio::spawn(async move {
            let output = manager.collect_keygen(&sid, tasks).await;
            let _ = tx.send(output);
        });

        info!(
            session_id = %session_id,
            chain_id,
            %security_level,
            "Keygen session started"
        );
        Ok(session_id)
    }

    /// Record a party's keygen contribution.
    ///
    /// The session completes once `threshold` distinct parties agree on the
    /// joint public key. Later contributions are checked against that key.
    /// Invalid or disagreeing contributions fail the whole session.
    pub fn submit_party_round(&self, session_id: &str, contribution: PartyContribution) -> Result<()> {
        let runtime = self.runtime(session_id)?;

        if let Err(e) = contribution.validate() {
            self.fail_session(session_id, e.clone());
            return Err(e);
        }

        let current = self.get_session(session_id)?;
        if current.kind != SessionKind::Keygen {
            return Err(Error::InvalidSessionState {
                expected: SessionKind::Keygen.to_string(),
                actual: current.kind.to_string(),
            });
        }
        if current.state == SessionState::Completed {
            return match current.public_key() {
                Some(pk) if pk == contribution.public_key.as_slice() => Ok(()),
                _ => Err(Error::VerificationFailed(format!(
                    "late contribution from {} disagrees on the joint public key",
                    contribution.party_id
                ))),
            };
        }

        let updated = self.store.update(session_id, &mut |session| {
            if contribution.chain_id != session.chain_id {
                return Err(Error::InvalidPartyData(format!(
                    "{} contributed for chain {}, session is for {}",
                    contribution.party_id, contribution.chain_id, session.chain_id
                )));
            }
            let count = session.add_contribution(contribution.clone())?;
            debug!(session_id = %session.id, party = %contribution.party_id, count, "Contribution recorded");
            if count >= session.security_level.threshold() {
                let public_key = combine_public_keys(&session.contributions)?;
                session.complete(SessionArtifact::PublicKey(public_key))?;
            }
            Ok(())
        });

        match updated {
            Ok(session) => {
                if session.state == SessionState::Completed {
                    info!(session_id, wallet_id = %session.wallet_id, "Keygen session completed");
                }
                runtime.publish(&session);
                Ok(())
            }
            Err(e) => {
                self.fail_session(session_id, e.clone());
                Err(e)
            }
        }
    }

    async fn collect_keygen(
        &self,
        session_id: &str,
        mut tasks: JoinSet<Result<ShareData>>,
    ) -> KeygenOutput {
        let mut shares = Vec::new();
        let mut failure = None;

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(Error::from).and_then(|r| r) {
                Ok(share) => shares.push(share),
                Err(e) => {
                    if failure.is_none() {
                        self.fail_session(session_id, e.clone());
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            // Drop every share produced so far
            drop(shares);
            return Err(e);
        }

        shares.sort_by_key(|s| s.party_id);
        let agreed = shares.windows(2).all(|w| w[0].public_key == w[1].public_key);
        if !agreed {
            let e = Error::VerificationFailed("parties disagree on the joint public key".into());
            self.fail_session(session_id, e.clone());
            return Err(e);
        }
        Ok(shares)
    }

    /// Take the per-party shares of a keygen session.
    ///
    /// Waits for every party task, not just the quorum. The wallet stays
    /// claimed until this returns, whatever the outcome.
    pub async fn take_keygen_output(&self, session_id: &str, deadline: Instant) -> Result<Vec<ShareData>> {
        let runtime = self.runtime(session_id)?;
        let taken = runtime.keygen_output.lock().take();
        let Some(rx) = taken else {
            runtime.release();
            return Err(Error::InvalidRequest(format!("no keygen output for {}", session_id)));
        };

        let output = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(output)) => output,
            Ok(Err(_)) => Err(Error::Internal("keygen supervisor dropped".into())),
            Err(_) => {
                self.fail_session(session_id, Error::Timeout(format!("keygen output for {}", session_id)));
                Err(Error::Timeout(format!("keygen output for {}", session_id)))
            }
        };
        runtime.release();
        output
    }

    // ============ Signing ============

    /// Start a signing session for a wallet
    pub fn create_signing_session(
        self: &Arc<Self>,
        message_hash: [u8; 32],
        wallet_id: &str,
        shares: Vec<ShareData>,
    ) -> Result<SessionId> {
        let lease = self.reserve_wallet(wallet_id)?;
        self.start_signing(&lease, message_hash, shares)
    }

    /// Start a signing session under an existing lease.
    ///
    /// `shares` are the quorum's decrypted shares, one per signer.
    #[instrument(skip(self, lease, message_hash, shares), fields(wallet_id = lease.wallet_id()))]
    pub fn start_signing(
        self: &Arc<Self>,
        lease: &WalletLease,
        message_hash: [u8; 32],
        shares: Vec<ShareData>,
    ) -> Result<SessionId> {
        let signers = validate_signing_shares(&shares)?;
        let first = &shares[0];
        let chain_id = first.chain_id.clone();
        let level = match (first.n_parties, first.threshold) {
            (2, 2) => SecurityLevel::Standard,
            (3, 2) => SecurityLevel::High,
            (3, 3) => SecurityLevel::Enterprise,
            _ => SecurityLevel::Unspecified,
        };

        let session = Session::new(SessionKind::Signing, lease.wallet_id(), chain_id, level);
        let session_id = session.id.clone();
        let (relays, runtime) = self.register(session, lease, signers.clone())?;

        let mut by_party: BTreeMap<usize, ShareData> =
            shares.into_iter().map(|s| (s.party_id, s)).collect();

        let mut tasks = JoinSet::new();
        for relay in relays {
            let share = by_party
                .remove(&relay.party_id())
                .ok_or(Error::InvalidPartyId(relay.party_id()))?;
            tasks.spawn(async move { run_dsg(&share, &message_hash, &relay).await });
        }

        let manager = Arc::clone(self);
        let sid = session_id.clone();
        let cancel = runtime.cancel.clone();
        tokio::spawn(async move {
            manager.collect_signatures(&sid, tasks, cancel).await;
        });

        info!(session_id = %session_id, signers = ?signers, "Signing session started");
        Ok(session_id)
    }

    async fn collect_signatures(
        &self,
        session_id: &str,
        mut tasks: JoinSet<Result<SignatureResult>>,
        cancel: CancellationToken,
    ) {
        let mut signatures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(Error::from).and_then(|r| r) {
                Ok(sig) => signatures.push(sig),
                Err(e) => {
                    self.fail_session(session_id, e);
                    cancel.cancel();
                    tasks.shutdown().await;
                    return;
                }
            }
        }

        let Some(signature) = signatures.first().cloned() else {
            self.fail_session(session_id, Error::Internal("no signer produced output".into()));
            return;
        };
        if signatures
            .iter()
            .any(|s| s.r() != signature.r() || s.s() != signature.s())
        {
            self.fail_session(
                session_id,
                Error::SelfCheckFailed("signers produced different signatures".into()),
            );
            return;
        }

        let Ok(runtime) = self.runtime(session_id) else {
            return;
        };
        match self.store.update(session_id, &mut |s| {
            s.complete(SessionArtifact::Signature(signature.clone()))
        }) {
            Ok(session) => {
                info!(session_id, wallet_id = %session.wallet_id, "Signing session completed");
                runtime.publish(&session);
            }
            Err(e) => debug!(session_id, error = %e, "Signing result arrived after session ended"),
        }
    }

    // ============ Lifecycle ============

    fn register(
        &self,
        session: Session,
        lease: &WalletLease,
        parties: Vec<usize>,
    ) -> Result<(Vec<ChannelRelay>, Arc<SessionRuntime>)> {
        let session_id = session.id.clone();
        let deadline = Instant::now() + self.config.session_timeout();
        let cancel = CancellationToken::new();
        let network = ChannelNetwork::new(session_id.clone(), parties, deadline)
            .with_capacity(self.config.channel_capacity)
            .with_round_timeout(self.config.round_timeout())
            .with_cancellation(cancel.clone());

        self.store.insert(session.clone())?;
        let (updates, _) = watch::channel(session);
        let runtime = Arc::new(SessionRuntime {
            cancel,
            updates,
            failure: Mutex::new(None),
            lease: Mutex::new(Some(lease.clone())),
            keygen_output: Mutex::new(None),
        });
        self.runtimes.insert(session_id.clone(), Arc::clone(&runtime));

        let active = self.store.update(&session_id, &mut |s| s.activate())?;
        runtime.publish(&active);

        Ok((network.endpoints(), runtime))
    }

    fn runtime(&self, session_id: &str) -> Result<Arc<SessionRuntime>> {
        self.runtimes
            .get(session_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Fail a live session and cancel its party tasks.
    ///
    /// Returns false if the session was already terminal or unknown.
    fn fail_session(&self, session_id: &str, error: Error) -> bool {
        let Ok(runtime) = self.runtime(session_id) else {
            return false;
        };
        let reason = error.to_string();
        match self.store.update(session_id, &mut |s| s.fail(reason.clone())) {
            Ok(session) => {
                warn!(
                    session_id,
                    wallet_id = %session.wallet_id,
                    kind = %session.kind,
                    error = %error,
                    "Session failed"
                );
                *runtime.failure.lock() = Some(error);
                runtime.cancel.cancel();
                runtime.publish(&session);
                true
            }
            Err(_) => false,
        }
    }

    /// Cancel a live session; its party tasks stop and the session fails
    pub fn cancel_session(&self, session_id: &str) -> Result<()> {
        let session = self.get_session(session_id)?;
        if session.state.is_terminal() {
            return Err(Error::InvalidSessionState {
                expected: "pending or active".into(),
                actual: session.state.to_string(),
            });
        }
        self.fail_session(session_id, Error::Cancelled(session_id.to_string()));
        Ok(())
    }

    /// Wait until a session is terminal or `deadline` passes.
    ///
    /// Completed sessions are returned; failed sessions surface their error.
    /// On deadline the session is failed, its tasks cancelled and `Timeout`
    /// returned.
    pub async fn await_session(&self, session_id: &str, deadline: Instant) -> Result<Session> {
        let runtime = match self.runtime(session_id) {
            Ok(runtime) => runtime,
            Err(e) => {
                return match self.store.get(session_id) {
                    Some(session) if session.state == SessionState::Completed => Ok(session),
                    Some(session) if session.state == SessionState::Failed => Err(Error::Internal(
                        session.error.unwrap_or_else(|| "session failed".into()),
                    )),
                    _ => Err(e),
                };
            }
        };

        let mut rx = runtime.updates.subscribe();
        let waited = tokio::time::timeout_at(deadline, async {
            rx.wait_for(|s| s.state.is_terminal())
                .await
                .map(|s| s.clone())
        })
        .await;

        let session = match waited {
            Ok(Ok(session)) => session,
            Ok(Err(_)) => return Err(Error::Internal("session updates closed".into())),
            Err(_) => {
                let timeout = Error::Timeout(format!("session {}", session_id));
                if self.fail_session(session_id, timeout.clone()) {
                    return Err(timeout);
                }
                runtime.updates.borrow().clone()
            }
        };

        match session.state {
            SessionState::Completed => Ok(session),
            _ => Err(runtime.failure.lock().clone().unwrap_or_else(|| {
                Error::Internal(session.error.clone().unwrap_or_default())
            })),
        }
    }

    /// Remove terminal sessions and sessions older than the age bound.
    ///
    /// Live sessions past the bound are failed first. Terminal sessions of a
    /// wallet that is still leased are kept until the lease ends.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(self.config.session_max_age())
            .unwrap_or(chrono::Duration::MAX);
        let mut removed = 0;

        for session in self.store.list() {
            let expired = session.age(now) >= max_age;
            if !expired && !(session.state.is_terminal() && !self.is_wallet_active(&session.wallet_id)) {
                continue;
            }
            if !session.state.is_terminal() {
                self.fail_session(
                    &session.id,
                    Error::Timeout(format!("session {} exceeded its maximum age", session.id)),
                );
            }
            self.store.remove(&session.id);
            self.runtimes.remove(&session.id);
            removed += 1;
        }

        if removed > 0 {
            debug!(removed, "Swept sessions");
        }
        removed
    }

    /// Run [`SessionManager::sweep`] periodically until `shutdown` fires
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.sweep(Utc::now());
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }
}

fn validate_keygen_request(
    registry: &NetworkRegistry,
    chain_id: &str,
    security_level: SecurityLevel,
) -> Result<()> {
    security_level.ensure_specified()?;
    if chain_id.trim().is_empty() {
        return Err(Error::InvalidRequest("chain id is empty".into()));
    }
    registry.get(chain_id)?.ensure_threshold_ecdsa()
}

fn validate_signing_shares(shares: &[ShareData]) -> Result<Vec<usize>> {
    let first = shares
        .first()
        .ok_or(Error::ThresholdNotMet { required: 1, actual: 0 })?;
    if shares.len() < first.threshold {
        return Err(Error::ThresholdNotMet {
            required: first.threshold,
            actual: shares.len(),
        });
    }
    let mut signers: Vec<usize> = shares.iter().map(|s| s.party_id).collect();
    signers.sort_unstable();
    signers.dedup();
    if signers.len() != shares.len() {
        return Err(Error::InvalidRequest("duplicate share in signing quorum".into()));
    }
    if shares
        .iter()
        .any(|s| s.public_key != first.public_key || s.chain_id != first.chain_id)
    {
        return Err(Error::InvalidRequest("shares belong to different keys".into()));
    }
    Ok(signers)
}

/// All contributions must carry the same valid joint key
fn combine_public_keys(contributions: &BTreeMap<String, PartyContribution>) -> Result<Vec<u8>> {
    let mut keys = contributions.values().map(|c| &c.public_key);
    let first = keys
        .next()
        .ok_or_else(|| Error::InvalidPartyData("no contributions".into()))?;
    if keys.any(|k| k != first) {
        return Err(Error::VerificationFailed(
            "contributions disagree on the joint public key".into(),
        ));
    }
    decode_point(first)
        .map_err(|_| Error::InvalidPartyData("joint public key is not a curve point".into()))?;
    Ok(first.clone())
}
