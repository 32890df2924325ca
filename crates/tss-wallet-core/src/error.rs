//! Error types for threshold wallet operations

use thiserror::Error;

/// Result type alias for threshold wallet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`], used for retry and audit decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input, returned synchronously and never retried
    Validation,
    /// Session bookkeeping (exclusivity, unknown sessions)
    Session,
    /// Malformed peer messages or failed protocol checks
    Protocol,
    /// Round, pre-parameter or session deadline exceeded
    Timeout,
    /// Missing records or undecryptable blobs
    Storage,
    /// Identity, rate limit or permission failures
    Authorization,
    /// Signature wire-format problems
    Format,
    /// Everything else
    Internal,
}

/// Errors that can occur during threshold wallet operations
#[derive(Debug, Clone, Error)]
pub enum Error {
    // ============ Validation Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Security level must be specified for key material
    #[error("Security level is unspecified")]
    UnspecifiedSecurityLevel,

    /// Party contribution failed validation
    #[error("Invalid party data: {0}")]
    InvalidPartyData(String),

    /// Invalid party ID
    #[error("Invalid party ID: {0}")]
    InvalidPartyId(usize),

    /// Threshold requirements not met
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Malformed permission set
    #[error("Invalid permission: {0}")]
    InvalidPermission(String),

    // ============ Session Errors ============
    /// Another session is already active for the wallet
    #[error("Session already in progress for wallet {0}")]
    SessionInProgress(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Illegal state transition
    #[error("Invalid session state: expected {expected}, got {actual}")]
    InvalidSessionState { expected: String, actual: String },

    // ============ Protocol Errors ============
    /// Peer sent something that does not fit the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Commitment, proof or share verification failed
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// The combined signature did not verify against the joint key
    #[error("Signature self-check failed: {0}")]
    SelfCheckFailed(String),

    /// Session was cancelled before it finished
    #[error("Session cancelled: {0}")]
    Cancelled(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    // ============ Timeout Errors ============
    /// Deadline exceeded
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    // ============ Storage Errors ============
    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Encryption key id unknown to the key manager
    #[error("Encryption key not found: {0}")]
    KeyNotFound(String),

    /// Ciphertext too short or authentication tag mismatch
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Encryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    // ============ Authorization Errors ============
    /// Identity verification failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Rate limit exceeded
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Permission expired
    #[error("Permission expired for {grantee} on {wallet}")]
    PermissionExpired { wallet: String, grantee: String },

    /// Permission revoked
    #[error("Permission revoked for {grantee} on {wallet}")]
    PermissionRevoked { wallet: String, grantee: String },

    // ============ Format Errors ============
    /// Signature missing
    #[error("Signature is nil")]
    NilSignature,

    /// Encoded signature has the wrong length
    #[error("Invalid signature length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Encoded signature is structurally invalid
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// Chain id not present in the network registry
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// Curve not supported by the signing engines
    #[error("Unsupported curve: {0}")]
    UnsupportedCurve(String),

    // ============ Serialization Errors ============
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidConfig(_)
            | Error::InvalidRequest(_)
            | Error::UnspecifiedSecurityLevel
            | Error::InvalidPartyData(_)
            | Error::InvalidPartyId(_)
            | Error::ThresholdNotMet { .. }
            | Error::InvalidPermission(_) => ErrorCategory::Validation,
            Error::SessionInProgress(_)
            | Error::SessionNotFound(_)
            | Error::InvalidSessionState { .. } => ErrorCategory::Session,
            Error::Protocol(_)
            | Error::VerificationFailed(_)
            | Error::SelfCheckFailed(_)
            | Error::Cancelled(_)
            | Error::Crypto(_)
            | Error::Deserialization(_) => ErrorCategory::Protocol,
            Error::Timeout(_) => ErrorCategory::Timeout,
            Error::NotFound(_)
            | Error::KeyNotFound(_)
            | Error::DecryptionFailed(_)
            | Error::Encryption(_)
            | Error::Storage(_) => ErrorCategory::Storage,
            Error::Unauthorized(_)
            | Error::RateLimited(_)
            | Error::PermissionExpired { .. }
            | Error::PermissionRevoked { .. } => ErrorCategory::Authorization,
            Error::NilSignature
            | Error::InvalidLength { .. }
            | Error::MalformedSignature(_)
            | Error::UnsupportedNetwork(_)
            | Error::UnsupportedCurve(_) => ErrorCategory::Format,
            Error::Serialization(_) | Error::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether a caller may retry the same operation with a fresh session.
    ///
    /// Only timeouts qualify; protocol failures need a new session too but
    /// usually point at a misbehaving party, and authorization failures must
    /// never be retried silently.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    /// Whether this error should raise an audit alert
    pub fn is_audit_alert(&self) -> bool {
        matches!(
            self,
            Error::DecryptionFailed(_) | Error::SelfCheckFailed(_)
        ) || self.category() == ErrorCategory::Authorization
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Deserialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("party task failed: {}", e))
    }
}
