//! Execution layer error types.
//!
//! The exchange taxonomy is the contract of §adapter boundary: transient
//! failures retry, rejections don't, and `Unknown` (submit-then-timeout)
//! is resolved ONLY via `lookup_order`, never by resubmitting.

use marlim_domain::IntentId;
use thiserror::Error;

/// Failure taxonomy the engine reasons about.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Transient network/exchange failure; safe to retry with backoff
    #[error("Transient exchange error: {0}")]
    Transient(String),

    /// Exchange rate limit hit; retry after backing off with jitter
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Permanent rejection; retrying the same request cannot succeed
    #[error("Order rejected: {0}")]
    Rejected(String),

    /// Ambiguous: the request may have been accepted. The caller must
    /// resolve via `lookup_order` with the same client_order_id.
    #[error("Unknown outcome: {0}")]
    Unknown(String),
}

impl ExchangeError {
    /// True when the same request may be retried (with the same
    /// client_order_id; retries never mint a new id).
    pub fn is_retriable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::RateLimited(_))
    }

    /// True when only a lookup can tell what happened.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ExchangeError::Unknown(_))
    }
}

/// Errors from the execution layer.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Exchange error passthrough
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// Intent already completed (idempotent short-circuit)
    #[error("Intent already processed: {0}")]
    AlreadyProcessed(IntentId),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] marlim_store::StoreError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] marlim_domain::DomainError),

    /// Engine error
    #[error("Engine error: {0}")]
    Engine(#[from] marlim_engine::EngineError),

    /// Invalid state for the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
