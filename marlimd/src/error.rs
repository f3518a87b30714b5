//! Daemon error types.

use marlim_domain::DomainError;
use marlim_engine::EngineError;
use marlim_exec::ExecError;
use marlim_lease::LeaseError;
use marlim_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Execution error
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Lease error
    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    /// Position not found
    #[error("Position not found: {0}")]
    PositionNotFound(Uuid),

    /// Invalid position state for the operation
    #[error("Invalid position state: expected {expected}, got {actual}")]
    InvalidPositionState { expected: String, actual: String },

    /// Operation requires a confirmation flag
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// Degraded mode forbids the operation
    #[error("Degraded mode: {0}")]
    Degraded(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl DaemonError {
    /// Stable error discriminator for the operator surface.
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonError::Domain(_) => "domain",
            DaemonError::Engine(_) => "engine",
            DaemonError::Exec(_) => "exec",
            DaemonError::Store(_) => "store",
            DaemonError::Lease(_) => "lease",
            DaemonError::PositionNotFound(_) => "not_found",
            DaemonError::InvalidPositionState { .. } => "invalid_state",
            DaemonError::ConfirmationRequired(_) => "confirmation_required",
            DaemonError::Degraded(_) => "degraded",
            DaemonError::Config(_) => "config",
            DaemonError::Shutdown => "shutdown",
        }
    }

    /// Whether retrying the same request can succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DaemonError::Exec(ExecError::Exchange(e)) if e.is_retriable()
        ) || matches!(self, DaemonError::Lease(LeaseError::Conflict(_)))
            || matches!(self, DaemonError::Degraded(_))
    }
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
