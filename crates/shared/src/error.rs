//! The closed error-kind set shared by every evolution-core subsystem.
//!
//! Each variant carries a human-readable message; `kind()` returns the
//! machine-readable token that metrics and peers key on. No other error
//! type crosses a public API boundary.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum SwarmError {
    #[error("Invalid antibody spec: {0}")]
    InvalidSpec(String),
    #[error("Unsupported detector variant: {0}")]
    UnsupportedVariant(String),
    #[error("Numerically degenerate value: {0}")]
    NumericalDegenerate(String),
    #[error("Feature namespace exhausted: {0}")]
    FeatureNamespaceExhausted(String),
    #[error("Insufficient samples: requested {requested}, minimum {minimum}")]
    InsufficientSamples { requested: usize, minimum: usize },
    #[error("Excessive samples: requested {requested}, maximum {maximum}")]
    ExcessiveSamples { requested: usize, maximum: usize },
    #[error("Trial timed out: {0}")]
    TrialTimeout(String),
    #[error("Red attack launch failed: {0}")]
    ExternalAttackFailed(String),
    #[error("Blue detection monitor failed: {0}")]
    ExternalDetectionFailed(String),
    #[error("Worker channel closed prematurely: {0}")]
    WorkerChannelClosed(String),
    #[error("WAL write failed: {0}")]
    WalWriteFailed(String),
    #[error("Event dropped, queue full (capacity {0})")]
    QueueFullDropped(usize),
    #[error("Incompatible sketch: {0}")]
    IncompatibleSketch(String),
    #[error("Corrupt sketch: {0}")]
    CorruptSketch(String),
    #[error("Incompatible diversity signature versions: {ours} vs {theirs}")]
    IncompatibleSignature { ours: u8, theirs: u8 },
    #[error("Replay detected: {0}")]
    Replay(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
    #[error("Resource budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwarmError {
    /// Machine-readable error kind, stable across releases. Used as the
    /// `reason`/`outcome` label on counters and in federation responses.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSpec(_) => "invalid_spec",
            Self::UnsupportedVariant(_) => "unsupported_variant",
            Self::NumericalDegenerate(_) => "numerical_degenerate",
            Self::FeatureNamespaceExhausted(_) => "feature_namespace_exhausted",
            Self::InsufficientSamples { .. } => "insufficient_samples",
            Self::ExcessiveSamples { .. } => "excessive_samples",
            Self::TrialTimeout(_) => "trial_timeout",
            Self::ExternalAttackFailed(_) => "external_attack_failed",
            Self::ExternalDetectionFailed(_) => "external_detection_failed",
            Self::WorkerChannelClosed(_) => "worker_channel_closed_prematurely",
            Self::WalWriteFailed(_) => "wal_write_failed",
            Self::QueueFullDropped(_) => "queue_full_dropped",
            Self::IncompatibleSketch(_) => "incompatible_sketch",
            Self::CorruptSketch(_) => "corrupt_sketch",
            Self::IncompatibleSignature { .. } => "incompatible_signature",
            Self::Replay(_) => "replay",
            Self::RateLimited(_) => "rate_limited",
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::PeerUnreachable(_) => "peer_unreachable",
            Self::Cancelled(_) => "cancelled",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::Internal(_) => "internal",
        }
    }
}

pub type SwarmResult<T> = std::result::Result<T, SwarmError>;
