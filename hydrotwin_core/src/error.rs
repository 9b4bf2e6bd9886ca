//! Error types for the HydroTwin agent kernel.
//!
//! Two families:
//! - [`AgentError`]: something went wrong *inside* an agent hook at runtime.
//!   The kernel contains it: the agent goes to FAULT and the loop continues.
//! - [`KernelError`]: a structural/wiring mistake (duplicate id, unknown
//!   state, unknown agent). These are returned to the caller immediately.

use crate::agent::AgentStatus;
use hydrotwin_env::AgentId;
use thiserror::Error;

/// Structural errors surfaced synchronously to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    /// `add_agent` called twice with the same id
    #[error("Agent id already registered: {0}")]
    DuplicateAgent(AgentId),

    /// Operation addressed an id the registry does not know
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// `transition_to` named a state the machine does not contain
    #[error("Unknown state: {0}")]
    UnknownState(String),

    /// Message topics and subscriptions must be non-empty
    #[error("Topic must not be empty")]
    EmptyTopic,

    /// Restart requested for an agent that is not in FAULT
    #[error("Agent {id} is {status}, restart requires FAULT")]
    NotFaulted { id: AgentId, status: AgentStatus },

    /// Re-construction or setup of a faulted agent failed
    #[error("Restart of {id} failed: {reason}")]
    RestartFailed { id: AgentId, reason: String },

    /// The factory refused to build the agent at registration
    #[error("Construction of {id} failed: {reason}")]
    Construction { id: AgentId, reason: String },

    /// `tick()` called before `start()`
    #[error("Kernel has not been started")]
    NotStarted,

    /// Time step must be finite and positive
    #[error("Invalid time step: {0}")]
    InvalidTimeStep(f64),

    /// A status change outside the lifecycle table
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
}

/// Runtime failure raised by an agent hook.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Generic failure with a human-readable cause
    #[error("{0}")]
    Failed(String),

    /// Payload or parameter did not have the expected shape
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The hook panicked; the panic message is preserved
    #[error("Agent panicked: {0}")]
    Panicked(String),

    /// A wiring error raised from inside a hook. Never absorbed as FAULT.
    #[error(transparent)]
    Wiring(#[from] KernelError),
}

impl AgentError {
    /// Creates a generic failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Returns the wiring error if this failure must propagate to the caller.
    pub fn as_wiring(&self) -> Option<&KernelError> {
        match self {
            Self::Wiring(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wiring_errors_are_distinguished() {
        let err: AgentError = KernelError::UnknownState("priming".to_string()).into();
        assert_eq!(
            err.as_wiring(),
            Some(&KernelError::UnknownState("priming".to_string()))
        );

        let runtime = AgentError::failed("sensor offline");
        assert!(runtime.as_wiring().is_none());
        assert_eq!(runtime.to_string(), "sensor offline");
    }

    #[test]
    fn test_not_faulted_message() {
        let err = KernelError::NotFaulted {
            id: AgentId::from("gate-2"),
            status: AgentStatus::Running,
        };
        assert_eq!(err.to_string(), "Agent gate-2 is RUNNING, restart requires FAULT");
    }
}
