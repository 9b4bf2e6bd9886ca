//! Built-in agents.
//!
//! - [`LifecycleManager`]: turns `cmd.lifecycle.restart` messages into
//!   `restart_agent` calls.
//! - [`Monitoring`]: periodically publishes the performance snapshot on
//!   `system.performance`.
//! - [`PumpAgent`]: a state-machine driven pump model, the template for
//!   physical asset agents.
//!
//! Every built-in exposes `create(id, parameters)` with the factory
//! signature accepted by `AgentKernel::add_agent`.

mod lifecycle;
mod monitoring;
mod pump;

pub use lifecycle::LifecycleManager;
pub use monitoring::Monitoring;
pub use pump::{PumpAgent, PumpData};

use crate::error::AgentError;
use crate::message::Payload;

/// Reads an optional numeric parameter.
pub(crate) fn f64_param(params: &Payload, key: &str, default: f64) -> Result<f64, AgentError> {
    match params.get(key) {
        None | Some(Payload::Null) => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| {
            AgentError::failed(format!("parameter '{}' must be a number, got {}", key, value))
        }),
    }
}

/// Reads an optional string parameter.
pub(crate) fn str_param(params: &Payload, key: &str, default: &str) -> Result<String, AgentError> {
    match params.get(key) {
        None | Some(Payload::Null) => Ok(default.to_string()),
        Some(value) => value.as_str().map(str::to_string).ok_or_else(|| {
            AgentError::failed(format!("parameter '{}' must be a string, got {}", key, value))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_f64_param() {
        let params = json!({"interval": 3.0, "label": "x"});

        assert_eq!(f64_param(&params, "interval", 5.0).unwrap(), 3.0);
        assert_eq!(f64_param(&params, "missing", 5.0).unwrap(), 5.0);
        assert!(f64_param(&params, "label", 5.0).is_err());
        assert_eq!(f64_param(&json!(null), "interval", 5.0).unwrap(), 5.0);
    }

    #[test]
    fn test_str_param() {
        let params = json!({"topic": "ops.restart", "interval": 2});

        assert_eq!(str_param(&params, "topic", "x").unwrap(), "ops.restart");
        assert_eq!(str_param(&params, "other", "x").unwrap(), "x");
        assert!(str_param(&params, "interval", "x").is_err());
    }
}
