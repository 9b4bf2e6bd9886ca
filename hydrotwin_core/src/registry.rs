//! Agent registry: live instances, stored construction inputs, status.
//!
//! Every hook call goes through [`AgentRegistry::invoke`], which moves the
//! instance out of its slot, runs the hook inside `catch_unwind`, and puts
//! the instance back. While a hook runs, the registry itself is handed to
//! the agent (through `AgentContext`) so supervision calls such as
//! `restart_agent` can reach every *other* agent.

use crate::agent::{Agent, AgentContext, AgentFactory, AgentStatus};
use crate::bus::{Delivery, DeliverySink, Outbox};
use crate::error::{AgentError, KernelError};
use crate::message::{Message, Payload};
use hydrotwin_env::{AgentId, TwinContext};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// One registered agent.
struct AgentEntry {
    id: AgentId,

    /// Constructor captured at registration (never replaced)
    factory: AgentFactory,

    /// Construction parameters captured at registration (never mutated)
    parameters: Payload,

    /// Live instance; `None` only while one of its hooks is running
    instance: Option<Box<dyn Agent>>,

    status: AgentStatus,

    /// Restart attempts so far
    restarts: u32,

    /// Cause of the most recent fault
    last_fault: Option<String>,

    /// Guards against an agent restarting itself from its own setup
    restarting: bool,
}

/// Kernel-owned table of agents in registration order.
pub struct AgentRegistry {
    entries: Vec<AgentEntry>,
    index: HashMap<AgentId, usize>,

    /// Last `execute` duration per agent (overwritten, never accumulated)
    performance: BTreeMap<AgentId, Duration>,

    /// Restart budget per agent (`None` = unlimited)
    max_restarts: Option<u32>,
}

impl AgentRegistry {
    pub fn new(max_restarts: Option<u32>) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            performance: BTreeMap::new(),
            max_restarts,
        }
    }

    /// Constructs the agent and stores it with its factory and parameters.
    pub fn register(
        &mut self,
        id: AgentId,
        factory: AgentFactory,
        parameters: Payload,
    ) -> Result<(), KernelError> {
        if self.index.contains_key(&id) {
            return Err(KernelError::DuplicateAgent(id));
        }

        let instance = guard(|| factory(&id, &parameters)).map_err(|err| {
            KernelError::Construction {
                id: id.clone(),
                reason: err.to_string(),
            }
        })?;

        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(AgentEntry {
            id,
            factory,
            parameters,
            instance: Some(instance),
            status: AgentStatus::Initializing,
            restarts: 0,
            last_fault: None,
            restarting: false,
        });

        Ok(())
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in registration order.
    pub fn ids(&self) -> Vec<AgentId> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn status(&self, id: &AgentId) -> Option<AgentStatus> {
        self.entry(id).map(|e| e.status)
    }

    /// Statuses of all agents, keyed by id.
    pub fn statuses(&self) -> BTreeMap<AgentId, AgentStatus> {
        self.entries
            .iter()
            .map(|e| (e.id.clone(), e.status))
            .collect()
    }

    pub fn fault_reason(&self, id: &AgentId) -> Option<&str> {
        self.entry(id).and_then(|e| e.last_fault.as_deref())
    }

    pub fn restart_count(&self, id: &AgentId) -> Option<u32> {
        self.entry(id).map(|e| e.restarts)
    }

    /// Moves an agent to `next`, enforcing the lifecycle table.
    ///
    /// Setting the current status again is a no-op.
    pub fn set_status(&mut self, id: &AgentId, next: AgentStatus) -> Result<(), KernelError> {
        let entry = self
            .entry_mut(id)
            .ok_or_else(|| KernelError::UnknownAgent(id.clone()))?;

        if entry.status == next {
            return Ok(());
        }
        if !entry.status.can_transition_to(next) {
            return Err(KernelError::InvalidTransition {
                id: id.clone(),
                from: entry.status,
                to: next,
            });
        }

        entry.status = next;
        Ok(())
    }

    /// Records a runtime failure: the agent moves to FAULT.
    pub fn fault(&mut self, id: &AgentId, phase: &str, cause: &AgentError) {
        error!("Agent {} faulted during {}: {}", id, phase, cause);

        if let Some(entry) = self.entry_mut(id) {
            entry.last_fault = Some(format!("{}: {}", phase, cause));
        }
        if let Err(err) = self.set_status(id, AgentStatus::Fault) {
            error!("Could not mark {} as FAULT: {}", id, err);
        }
    }

    pub fn record_execution(&mut self, id: &AgentId, elapsed: Duration) {
        self.performance.insert(id.clone(), elapsed);
    }

    /// Snapshot of the performance probe table.
    pub fn performance(&self) -> BTreeMap<AgentId, Duration> {
        self.performance.clone()
    }

    /// Runs one hook of agent `id` with fault containment.
    ///
    /// Returns `None` if the id is unknown or its instance is already in use
    /// (a hook re-entering itself).
    pub fn invoke<F>(
        &mut self,
        id: &AgentId,
        outbox: &mut Outbox,
        env: &dyn TwinContext,
        current_time: f64,
        time_step: f64,
        hook: F,
    ) -> Option<Result<(), AgentError>>
    where
        F: FnOnce(&mut dyn Agent, &mut AgentContext<'_>) -> Result<(), AgentError>,
    {
        let slot = *self.index.get(id)?;
        let mut instance = self.entries[slot].instance.take()?;
        let agent_id = self.entries[slot].id.clone();

        let result = {
            let mut ctx = AgentContext::new(&agent_id, current_time, time_step, outbox, self, env);
            guard(|| hook(instance.as_mut(), &mut ctx))
        };

        self.entries[slot].instance = Some(instance);
        Some(result)
    }

    /// Replaces a faulted agent with a fresh instance built from its stored
    /// factory and parameters, then runs its setup.
    ///
    /// All state of the previous instance is discarded.
    pub fn restart(
        &mut self,
        id: &AgentId,
        outbox: &mut Outbox,
        env: &dyn TwinContext,
        current_time: f64,
        time_step: f64,
    ) -> Result<(), KernelError> {
        let slot = *self
            .index
            .get(id)
            .ok_or_else(|| KernelError::UnknownAgent(id.clone()))?;

        let entry = &mut self.entries[slot];
        if entry.status != AgentStatus::Fault {
            return Err(KernelError::NotFaulted {
                id: id.clone(),
                status: entry.status,
            });
        }
        if entry.restarting {
            return Err(KernelError::RestartFailed {
                id: id.clone(),
                reason: "restart already in progress".to_string(),
            });
        }
        if let Some(max) = self.max_restarts {
            if entry.restarts >= max {
                error!("Restart of {} refused: budget of {} exhausted", id, max);
                return Err(KernelError::RestartFailed {
                    id: id.clone(),
                    reason: format!("restart budget of {} exhausted", max),
                });
            }
        }

        entry.restarts += 1;
        entry.restarting = true;
        let factory = Arc::clone(&entry.factory);
        let parameters = entry.parameters.clone();
        let agent_id = entry.id.clone();

        let mut instance = match guard(|| factory(&agent_id, &parameters)) {
            Ok(instance) => instance,
            Err(err) => return Err(self.restart_failed(slot, "construction", err)),
        };

        // The old instance is dropped here
        self.entries[slot].instance = None;

        let setup = {
            let mut ctx = AgentContext::new(&agent_id, current_time, time_step, outbox, self, env);
            guard(|| instance.setup(&mut ctx))
        };

        let entry = &mut self.entries[slot];
        entry.instance = Some(instance);

        match setup {
            Ok(()) => {
                entry.restarting = false;
                entry.last_fault = None;
                entry.status = AgentStatus::Running;
                info!("Agent {} restarted (attempt {})", agent_id, entry.restarts);
                Ok(())
            }
            Err(AgentError::Wiring(err)) => {
                entry.restarting = false;
                Err(err)
            }
            Err(err) => Err(self.restart_failed(slot, "setup", err)),
        }
    }

    fn restart_failed(&mut self, slot: usize, phase: &str, cause: AgentError) -> KernelError {
        let entry = &mut self.entries[slot];
        entry.restarting = false;
        entry.last_fault = Some(format!("restart {}: {}", phase, cause));

        error!("Restart of {} failed during {}: {}", entry.id, phase, cause);
        KernelError::RestartFailed {
            id: entry.id.clone(),
            reason: cause.to_string(),
        }
    }

    fn entry(&self, id: &AgentId) -> Option<&AgentEntry> {
        self.index.get(id).map(|&slot| &self.entries[slot])
    }

    fn entry_mut(&mut self, id: &AgentId) -> Option<&mut AgentEntry> {
        let slot = *self.index.get(id)?;
        self.entries.get_mut(slot)
    }
}

/// Delivers bus messages to registered agents.
pub(crate) struct RegistrySink<'a> {
    registry: &'a mut AgentRegistry,
    env: &'a dyn TwinContext,
    current_time: f64,
    time_step: f64,
}

impl<'a> RegistrySink<'a> {
    pub(crate) fn new(
        registry: &'a mut AgentRegistry,
        env: &'a dyn TwinContext,
        current_time: f64,
        time_step: f64,
    ) -> Self {
        Self {
            registry,
            env,
            current_time,
            time_step,
        }
    }
}

impl DeliverySink for RegistrySink<'_> {
    fn deliver(
        &mut self,
        subscriber: &AgentId,
        message: &Message,
        outbox: &mut Outbox,
    ) -> Result<Delivery, KernelError> {
        if self.registry.status(subscriber) != Some(AgentStatus::Running) {
            return Ok(Delivery::Skipped);
        }

        let result = self.registry.invoke(
            subscriber,
            outbox,
            self.env,
            self.current_time,
            self.time_step,
            |agent, ctx| agent.on_message(ctx, message),
        );

        match result {
            None => Ok(Delivery::Skipped),
            Some(Ok(())) => Ok(Delivery::Delivered),
            Some(Err(AgentError::Wiring(err))) => Err(err),
            Some(Err(err)) => {
                self.registry.fault(subscriber, "message handling", &err);
                Ok(Delivery::Failed(err.to_string()))
            }
        }
    }
}

/// Runs an agent hook, converting a panic into `AgentError::Panicked`.
pub(crate) fn guard<T>(hook: impl FnOnce() -> Result<T, AgentError>) -> Result<T, AgentError> {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => result,
        Err(payload) => Err(AgentError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotwin_env::TokioContext;
    use serde_json::json;

    struct Idle;

    impl Agent for Idle {
        fn execute(
            &mut self,
            _ctx: &mut AgentContext<'_>,
            _current_time: f64,
            _time_step: f64,
        ) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn idle_factory() -> AgentFactory {
        Arc::new(|_id: &AgentId, _params: &Payload| Ok(Box::new(Idle) as Box<dyn Agent>))
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = AgentRegistry::new(None);
        registry
            .register(AgentId::from("tank"), idle_factory(), json!({}))
            .unwrap();

        let err = registry
            .register(AgentId::from("tank"), idle_factory(), json!({}))
            .unwrap_err();
        assert_eq!(err, KernelError::DuplicateAgent(AgentId::from("tank")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_construction_failure() {
        let mut registry = AgentRegistry::new(None);
        let factory: AgentFactory =
            Arc::new(|_id: &AgentId, _params: &Payload| Err(AgentError::failed("bad geometry")));

        let err = registry
            .register(AgentId::from("channel"), factory, json!({}))
            .unwrap_err();
        assert!(matches!(err, KernelError::Construction { .. }));
        assert!(!registry.contains(&AgentId::from("channel")));
    }

    #[test]
    fn test_set_status_enforces_table() {
        let mut registry = AgentRegistry::new(None);
        let id = AgentId::from("gate");
        registry.register(id.clone(), idle_factory(), json!({})).unwrap();

        registry.set_status(&id, AgentStatus::ShuttingDown).unwrap();
        registry.set_status(&id, AgentStatus::Stopped).unwrap();

        let err = registry.set_status(&id, AgentStatus::Running).unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));
    }

    #[test]
    fn test_invoke_contains_panics() {
        let mut registry = AgentRegistry::new(None);
        let id = AgentId::from("pump");
        registry.register(id.clone(), idle_factory(), json!({})).unwrap();

        let env = TokioContext::new();
        let mut outbox = Outbox::new();
        let result = registry.invoke(&id, &mut outbox, &env, 0.0, 1.0, |_agent, _ctx| {
            panic!("impeller jammed")
        });

        match result {
            Some(Err(AgentError::Panicked(msg))) => assert_eq!(msg, "impeller jammed"),
            other => panic!("unexpected result: {:?}", other.map(|r| r.is_ok())),
        }

        // The instance is back in its slot after the panic
        let again = registry.invoke(&id, &mut outbox, &env, 0.0, 1.0, |_agent, _ctx| Ok(()));
        assert!(matches!(again, Some(Ok(()))));
    }

    #[test]
    fn test_fault_records_reason() {
        let mut registry = AgentRegistry::new(None);
        let id = AgentId::from("sensor");
        registry.register(id.clone(), idle_factory(), json!({})).unwrap();
        registry.set_status(&id, AgentStatus::Running).unwrap();

        registry.fault(&id, "execute", &AgentError::failed("reading out of range"));

        assert_eq!(registry.status(&id), Some(AgentStatus::Fault));
        assert_eq!(
            registry.fault_reason(&id),
            Some("execute: reading out of range")
        );
    }
}
