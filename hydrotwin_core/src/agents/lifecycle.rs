//! Restart-on-request supervision agent.

use crate::agent::{Agent, AgentContext};
use crate::agents::str_param;
use crate::error::AgentError;
use crate::message::{topics, Message, Payload};
use hydrotwin_env::AgentId;
use tracing::{error, info, warn};

/// Listens for restart requests and forwards them to the kernel.
///
/// Request payload: `{"agent_id": "<id>"}`. Requests without a string
/// `agent_id` are logged and ignored. Restart outcomes (including refusals)
/// are logged; none of them fault the manager.
///
/// Parameters: `topic` (default `cmd.lifecycle.restart`).
pub struct LifecycleManager {
    topic: String,
}

impl LifecycleManager {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    /// Factory for `AgentKernel::add_agent`.
    pub fn create(_id: &AgentId, params: &Payload) -> Result<Box<dyn Agent>, AgentError> {
        let topic = str_param(params, "topic", topics::LIFECYCLE_RESTART)?;
        Ok(Box::new(Self::new(topic)))
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(topics::LIFECYCLE_RESTART)
    }
}

impl Agent for LifecycleManager {
    fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        ctx.subscribe(&self.topic)?;
        Ok(())
    }

    fn execute(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        _current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    fn on_message(
        &mut self,
        ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<(), AgentError> {
        let Some(target) = message.str_field("agent_id") else {
            warn!(
                "Ignoring restart request from {} without agent_id: {}",
                message.sender(),
                message.payload()
            );
            return Ok(());
        };

        let target = AgentId::from(target);
        match ctx.restart_agent(&target) {
            Ok(()) => info!("Restarted {} (requested by {})", target, message.sender()),
            Err(err) => error!(
                "Restart of {} requested by {} failed: {}",
                target,
                message.sender(),
                err
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::config::KernelConfig;
    use crate::kernel::AgentKernel;
    use serde_json::json;

    /// Fails every execution once simulated time reaches `fail_at`.
    struct Flaky {
        fail_at: f64,
    }

    impl Agent for Flaky {
        fn execute(
            &mut self,
            _ctx: &mut AgentContext<'_>,
            current_time: f64,
            _time_step: f64,
        ) -> Result<(), AgentError> {
            if current_time >= self.fail_at {
                return Err(AgentError::failed("overflow sensor tripped"));
            }
            Ok(())
        }
    }

    fn flaky(_id: &AgentId, params: &Payload) -> Result<Box<dyn Agent>, AgentError> {
        let fail_at = crate::agents::f64_param(params, "fail_at", f64::INFINITY)?;
        Ok(Box::new(Flaky { fail_at }))
    }

    fn restart_request(target: &str, time: f64) -> Message {
        Message::new(
            topics::LIFECYCLE_RESTART,
            "operator",
            json!({ "agent_id": target }),
            time,
        )
        .unwrap()
    }

    fn kernel() -> AgentKernel {
        let mut kernel = AgentKernel::new(KernelConfig::default());
        kernel
            .add_agent(LifecycleManager::create, "lifecycle", json!({}))
            .unwrap();
        kernel
            .add_agent(flaky, "overflow", json!({"fail_at": 4.0}))
            .unwrap();
        kernel.start(1.0).unwrap();
        kernel
    }

    #[test]
    fn test_fault_then_restart_on_request() {
        let mut kernel = kernel();
        let overflow = AgentId::from("overflow");

        for _ in 0..4 {
            kernel.tick().unwrap();
        }
        assert_eq!(kernel.agent_status(&overflow), Some(AgentStatus::Running));

        // Fifth tick runs at t=4
        kernel.tick().unwrap();
        assert_eq!(kernel.agent_status(&overflow), Some(AgentStatus::Fault));

        kernel.publish(restart_request("overflow", 5.0));
        kernel.tick().unwrap();

        assert_eq!(kernel.agent_status(&overflow), Some(AgentStatus::Running));
        assert_eq!(kernel.restart_count(&overflow), Some(1));
    }

    #[test]
    fn test_malformed_request_is_ignored() {
        let mut kernel = kernel();

        kernel.publish(
            Message::new(topics::LIFECYCLE_RESTART, "operator", json!({"id": 7}), 0.0).unwrap(),
        );
        kernel.publish(
            Message::new(topics::LIFECYCLE_RESTART, "operator", json!("overflow"), 0.0).unwrap(),
        );
        let report = kernel.tick().unwrap();

        assert_eq!(report.dispatch.delivered, 2);
        assert!(report.faulted.is_empty());
        assert_eq!(
            kernel.agent_status(&AgentId::from("lifecycle")),
            Some(AgentStatus::Running)
        );
    }

    #[test]
    fn test_refused_restart_does_not_fault_manager() {
        let mut kernel = kernel();

        kernel.publish(restart_request("overflow", 0.0));
        kernel.publish(restart_request("ghost", 0.0));
        kernel.tick().unwrap();

        assert_eq!(
            kernel.agent_status(&AgentId::from("lifecycle")),
            Some(AgentStatus::Running)
        );
        assert_eq!(
            kernel.agent_status(&AgentId::from("overflow")),
            Some(AgentStatus::Running)
        );
        assert_eq!(kernel.restart_count(&AgentId::from("overflow")), Some(0));
    }

    #[test]
    fn test_custom_topic() {
        let mut kernel = AgentKernel::new(KernelConfig::default());
        kernel
            .add_agent(
                LifecycleManager::create,
                "lifecycle",
                json!({"topic": "ops.restart"}),
            )
            .unwrap();
        kernel
            .add_agent(flaky, "overflow", json!({"fail_at": 0.0}))
            .unwrap();
        kernel.start(1.0).unwrap();
        kernel.tick().unwrap();

        kernel.publish(
            Message::new("ops.restart", "operator", json!({"agent_id": "overflow"}), 1.0)
                .unwrap(),
        );
        kernel.tick().unwrap();

        assert_eq!(kernel.restart_count(&AgentId::from("overflow")), Some(1));
    }
}
