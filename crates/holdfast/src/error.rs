//! Structured error kinds for stage-boundary failures.
//!
//! Leaf helpers still return `anyhow::Result` with `.context()` chains for
//! ergonomics; `HoldfastError` exists so the Pipeline and CLI can match on
//! *why* a stage failed (to pick an exit code, to decide whether a retry
//! makes sense) without string-matching an anyhow chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HoldfastError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock busy: {0}")]
    LockBusy(String),

    #[error("command failed: {0}")]
    ExecFailure(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("secret error: {0}")]
    Secret(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("manifest resolution error: {0}")]
    Resolve(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl HoldfastError {
    /// Exit code per the CLI contract: 0 success (not applicable here), 1
    /// user-visible failure, 2 configuration error.
    pub fn exit_code(&self) -> i32 {
        match self {
            HoldfastError::Config(_) | HoldfastError::Validation(_) => 2,
            _ => 1,
        }
    }
}
