//! Error type for the simulation harness.

use hydrotwin_core::KernelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// Kernel wiring error raised during a scenario
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// A scenario invariant did not hold
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns `SimError::Assertion(msg)` unless `condition` holds.
pub(crate) fn ensure(condition: bool, msg: impl FnOnce() -> String) -> Result<(), SimError> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Assertion(msg()))
    }
}
