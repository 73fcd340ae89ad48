//! Flat error taxonomy shared by every kernel component (spec §7).

use std::collections::HashMap;
use thiserror::Error;

/// Identity / replay-protection failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unknown principal: {0}")]
    UnknownPrincipal(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("request timestamp drifted too far from now")]
    StaleTimestamp,
    #[error("nonce already seen within its TTL")]
    ReplayedNonce,
    #[error("identity suspended: {0}")]
    IdentitySuspended(String),
    #[error("identity revoked: {0}")]
    IdentityRevoked(String),
}

/// Capability lifecycle / quota failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),
    #[error("capability expired: {0}")]
    CapabilityExpired(String),
    #[error("invalid capability signature")]
    InvalidCapabilitySignature,
    #[error("broken delegation chain at link {index}")]
    BrokenDelegationChain { index: usize },
    #[error("quota exceeded: {kind}")]
    QuotaExceeded {
        kind: String,
        ctx: HashMap<String, String>,
    },
}

/// Constraint evaluator failures.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("constraint violated: {kind}")]
pub struct ConstraintError {
    pub kind: ConstraintKind,
    pub ctx: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    TimeWindow,
    AllowedPaths,
    RateLimit,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintKind::TimeWindow => write!(f, "time_window"),
            ConstraintKind::AllowedPaths => write!(f, "allowed_paths"),
            ConstraintKind::RateLimit => write!(f, "rate_limit"),
        }
    }
}

/// Policy / approval / escalation failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("policy denied the request")]
    PolicyDenied,
    #[error("escalation is disabled")]
    EscalationDisabled,
    #[error("no consensus module configured")]
    NoConsensusModule,
    #[error("consensus module unavailable")]
    ConsensusUnavailable,
    #[error("consensus submission failed: {0}")]
    ConsensusSubmissionFailed(String),
}

/// Filesystem-guard failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FileGuardError {
    #[error("path escapes its capability root")]
    PathTraversal,
    #[error("basename does not match any allowed pattern")]
    PatternMismatch,
    #[error("basename matches an excluded pattern")]
    ExcludedPattern,
    #[error("path exceeds max_depth relative to root")]
    MaxDepthExceeded,
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Crypto / serialization failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CryptoError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid encryption key")]
    InvalidEncryptionKey,
    #[error("invalid payload")]
    InvalidPayload,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
}

/// Double Ratchet failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RatchetError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("max skipped-message-key count exceeded")]
    MaxSkipExceeded,
}

/// Top-level error returned by `authorize` and friends.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum KernelError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    FileGuard(#[from] FileGuardError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    #[error("operation timed out")]
    Timeout,
}

pub type KernelResult<T> = Result<T, KernelError>;
