//! The Agent contract and the context handed to every agent hook.
//!
//! # Lifecycle
//!
//! ```text
//!                 setup ok            execute/on_message fails
//!  INITIALIZING ───────────► RUNNING ─────────────────────────► FAULT
//!       │                      │  ▲                               │
//!       │ setup fails          │  └───────── restart ok ──────────┘
//!       └──────────► FAULT     │
//!                              │ stop
//!                              ▼
//!                        SHUTTING_DOWN ──► STOPPED
//! ```
//!
//! `stop()` shuts down every agent regardless of status. Nothing leaves
//! SHUTTING_DOWN except STOPPED, and nothing leaves STOPPED.

use crate::bus::Outbox;
use crate::error::{AgentError, KernelError};
use crate::message::{Message, Payload};
use crate::registry::AgentRegistry;
use hydrotwin_env::{AgentId, TwinContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Initializing,
    Running,
    Stopped,
    Fault,
    ShuttingDown,
}

impl AgentStatus {
    /// Returns true if `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Initializing, Running | Fault | ShuttingDown)
                | (Running, Fault | ShuttingDown)
                | (Fault, Running | ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Initializing => "INITIALIZING",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Stopped => "STOPPED",
            AgentStatus::Fault => "FAULT",
            AgentStatus::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of computation scheduled by the kernel.
///
/// Physical models, sensors, actuators and controllers all implement this
/// trait. Any `Err` (or panic) from a hook moves the agent to FAULT; the rest
/// of the simulation is unaffected. `AgentError::Wiring` is the exception and
/// is returned to whoever drives the kernel.
pub trait Agent: Send {
    /// Called exactly once before the agent is eligible to run.
    ///
    /// Subscriptions are usually made here.
    fn setup(&mut self, _ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        Ok(())
    }

    /// Called once per tick while the agent is RUNNING.
    fn execute(
        &mut self,
        ctx: &mut AgentContext<'_>,
        current_time: f64,
        time_step: f64,
    ) -> Result<(), AgentError>;

    /// Called for every delivered message on a subscribed topic.
    fn on_message(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        _message: &Message,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    /// Best-effort cleanup, called once when the kernel stops.
    fn shutdown(&mut self, _ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Builds an agent from its id and construction parameters.
///
/// Stored for the lifetime of the registration so a faulted agent can be
/// rebuilt from exactly the same inputs.
pub type AgentFactory =
    Arc<dyn Fn(&AgentId, &Payload) -> Result<Box<dyn Agent>, AgentError> + Send + Sync>;

/// Everything an agent may touch while one of its hooks runs.
///
/// Publications and subscriptions are buffered and reach the bus as soon as
/// the hook returns. Supervision calls (`restart_agent`, status and
/// performance queries) go straight to the registry; the calling agent's own
/// instance is out of the registry for the duration of the call.
pub struct AgentContext<'a> {
    id: &'a AgentId,
    current_time: f64,
    time_step: f64,
    outbox: &'a mut Outbox,
    registry: &'a mut AgentRegistry,
    env: &'a dyn TwinContext,
}

impl<'a> AgentContext<'a> {
    pub(crate) fn new(
        id: &'a AgentId,
        current_time: f64,
        time_step: f64,
        outbox: &'a mut Outbox,
        registry: &'a mut AgentRegistry,
        env: &'a dyn TwinContext,
    ) -> Self {
        Self {
            id,
            current_time,
            time_step,
            outbox,
            registry,
            env,
        }
    }

    /// Id of the agent this context belongs to.
    pub fn id(&self) -> &AgentId {
        self.id
    }

    /// Simulated time of the tick in progress.
    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    /// Publishes `payload` on `topic`, stamped with this agent's id and the
    /// current simulated time.
    pub fn publish(&mut self, topic: &str, payload: Payload) -> Result<(), KernelError> {
        let message = Message::new(topic, self.id.clone(), payload, self.current_time)?;
        self.outbox.publish(message);
        Ok(())
    }

    /// Subscribes this agent to `topic` (idempotent).
    pub fn subscribe(&mut self, topic: &str) -> Result<(), KernelError> {
        self.outbox.subscribe(self.id, topic)
    }

    pub fn unsubscribe(&mut self, topic: &str) {
        self.outbox.unsubscribe(self.id, topic);
    }

    /// Pending message counts per topic, as of the start of this hook.
    pub fn topic_queue_lengths(&self) -> &BTreeMap<String, usize> {
        self.outbox.queue_lengths()
    }

    /// Duration of each agent's most recent `execute` call.
    pub fn agent_performance(&self) -> BTreeMap<AgentId, Duration> {
        self.registry.performance()
    }

    pub fn agent_status(&self, id: &AgentId) -> Option<AgentStatus> {
        self.registry.status(id)
    }

    /// Ids of all registered agents, in registration order.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.registry.ids()
    }

    /// Rebuilds a faulted agent from its stored factory and parameters.
    ///
    /// Same contract as `AgentKernel::restart_agent`.
    pub fn restart_agent(&mut self, id: &AgentId) -> Result<(), KernelError> {
        self.registry.restart(
            id,
            &mut *self.outbox,
            self.env,
            self.current_time,
            self.time_step,
        )
    }

    /// The environment the kernel runs in.
    pub fn env(&self) -> &dyn TwinContext {
        self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentStatus::*;

    #[test]
    fn test_status_transition_table() {
        assert!(Initializing.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Fault));
        assert!(Running.can_transition_to(Fault));
        assert!(Running.can_transition_to(ShuttingDown));
        assert!(Fault.can_transition_to(Running));
        assert!(ShuttingDown.can_transition_to(Stopped));
    }

    #[test]
    fn test_no_path_back_from_shutdown() {
        for next in [Initializing, Running, Fault, ShuttingDown] {
            assert!(!Stopped.can_transition_to(next));
        }
        assert!(!ShuttingDown.can_transition_to(Running));
        assert!(!ShuttingDown.can_transition_to(Fault));
    }

    #[test]
    fn test_status_serializes_screaming() {
        let json = serde_json::to_string(&ShuttingDown).unwrap();
        assert_eq!(json, "\"SHUTTING_DOWN\"");
        assert_eq!(Fault.to_string(), "FAULT");
    }
}
