//! Session records and their state machine

use crate::{
    Error, PartyContribution, Result, SecurityLevel, SessionId, SignatureResult, WalletId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What a session produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Keygen,
    Signing,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Keygen => write!(f, "keygen"),
            SessionKind::Signing => write!(f, "signing"),
        }
    }
}

/// Lifecycle state: pending -> active -> {completed, failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl SessionState {
    /// Completed and failed sessions never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Pending => write!(f, "pending"),
            SessionState::Active => write!(f, "active"),
            SessionState::Completed => write!(f, "completed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Output of a completed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionArtifact {
    /// Joint public key (compressed SEC1)
    PublicKey(Vec<u8>),
    Signature(SignatureResult),
}

/// A keygen or signing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub kind: SessionKind,
    pub state: SessionState,
    pub wallet_id: WalletId,
    pub chain_id: String,
    pub security_level: SecurityLevel,
    /// Contributions keyed by party id
    pub contributions: BTreeMap<String, PartyContribution>,
    pub artifact: Option<SessionArtifact>,
    /// Failure reason
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a pending session
    pub fn new(
        kind: SessionKind,
        wallet_id: impl Into<WalletId>,
        chain_id: impl Into<String>,
        security_level: SecurityLevel,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            state: SessionState::Pending,
            wallet_id: wallet_id.into(),
            chain_id: chain_id.into(),
            security_level,
            contributions: BTreeMap::new(),
            artifact: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn transition_error(&self, expected: SessionState) -> Error {
        Error::InvalidSessionState {
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }

    /// pending -> active
    pub fn activate(&mut self) -> Result<()> {
        if self.state != SessionState::Pending {
            return Err(self.transition_error(SessionState::Pending));
        }
        self.state = SessionState::Active;
        Ok(())
    }

    /// Record a contribution; returns the number of distinct contributors
    pub fn add_contribution(&mut self, contribution: PartyContribution) -> Result<usize> {
        if self.state != SessionState::Active {
            return Err(self.transition_error(SessionState::Active));
        }
        if self.contributions.contains_key(&contribution.party_id) {
            return Err(Error::InvalidPartyData(format!(
                "party {} already contributed",
                contribution.party_id
            )));
        }
        self.contributions
            .insert(contribution.party_id.clone(), contribution);
        Ok(self.contributions.len())
    }

    /// active -> completed
    pub fn complete(&mut self, artifact: SessionArtifact) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(self.transition_error(SessionState::Active));
        }
        self.artifact = Some(artifact);
        self.state = SessionState::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// pending | active -> failed
    ///
    /// Contributions are dropped together with any partial key material.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::InvalidSessionState {
                expected: "pending or active".into(),
                actual: self.state.to_string(),
            });
        }
        self.state = SessionState::Failed;
        self.error = Some(reason.into());
        self.contributions.clear();
        self.artifact = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Age of the session at `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// Joint public key, once a keygen session completed
    pub fn public_key(&self) -> Option<&[u8]> {
        match &self.artifact {
            Some(SessionArtifact::PublicKey(pk)) => Some(pk),
            _ => None,
        }
    }

    /// Signature, once a signing session completed
    pub fn signature(&self) -> Option<&SignatureResult> {
        match &self.artifact {
            Some(SessionArtifact::Signature(sig)) => Some(sig),
            _ => None,
        }
    }
}
