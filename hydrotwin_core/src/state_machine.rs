//! Finite state machine for agent behavior.
//!
//! States are trait objects registered under a name. Each hook returns a
//! [`Transition`] as data; the machine applies it, calling `on_exit` on the
//! old state and `on_enter` on the new one.
//!
//! ```text
//!   execute / on_message
//!          │
//!          ▼
//!   ┌─────────────┐  Transition::To("b")  ┌─────────────┐
//!   │  state "a"  │ ────────────────────► │  state "b"  │
//!   └─────────────┘  a.on_exit, b.on_enter└─────────────┘
//! ```
//!
//! Transitions can be time-driven (returned from `execute`) or
//! message-driven (returned from `on_message`); the kernel is not involved
//! in either. Naming an unknown state is a wiring error
//! (`KernelError::UnknownState`) and is never absorbed as an agent fault.

use crate::agent::AgentContext;
use crate::error::{AgentError, KernelError};
use crate::message::Message;
use std::collections::HashMap;
use tracing::debug;

/// What a state asks the machine to do after a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Stay,
    To(String),
}

impl Transition {
    pub fn to(name: impl Into<String>) -> Self {
        Transition::To(name.into())
    }
}

/// One named state of a [`StateMachine`] over agent-owned data `C`.
pub trait State<C>: Send {
    fn on_enter(&mut self, _data: &mut C, _now: f64) {}

    fn on_exit(&mut self, _data: &mut C, _now: f64) {}

    /// Called once per agent tick while this state is current.
    fn execute(
        &mut self,
        data: &mut C,
        ctx: &mut AgentContext<'_>,
    ) -> Result<Transition, AgentError>;

    /// Called for every message the owning agent receives.
    fn on_message(
        &mut self,
        _data: &mut C,
        _ctx: &mut AgentContext<'_>,
        _message: &Message,
    ) -> Result<Transition, AgentError> {
        Ok(Transition::Stay)
    }
}

/// Collects named states before the machine is entered.
pub struct StateMachineBuilder<C> {
    states: HashMap<String, Box<dyn State<C>>>,
}

impl<C> StateMachineBuilder<C> {
    /// Registers a state. A later state with the same name replaces the
    /// earlier one.
    pub fn state(mut self, name: impl Into<String>, state: impl State<C> + 'static) -> Self {
        self.states.insert(name.into(), Box::new(state));
        self
    }

    /// Enters `initial` and returns the running machine.
    pub fn build(
        self,
        initial: &str,
        data: &mut C,
        now: f64,
    ) -> Result<StateMachine<C>, KernelError> {
        let mut states = self.states;
        let state = states
            .get_mut(initial)
            .ok_or_else(|| KernelError::UnknownState(initial.to_string()))?;
        state.on_enter(data, now);

        Ok(StateMachine {
            states,
            current: initial.to_string(),
        })
    }
}

/// A set of named states with exactly one current state.
pub struct StateMachine<C> {
    states: HashMap<String, Box<dyn State<C>>>,
    current: String,
}

impl<C> StateMachine<C> {
    pub fn builder() -> StateMachineBuilder<C> {
        StateMachineBuilder {
            states: HashMap::new(),
        }
    }

    pub fn current_state(&self) -> &str {
        &self.current
    }

    /// Names of all registered states, sorted.
    pub fn state_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.states.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Switches to `name`.
    ///
    /// Returns false (and calls no hooks) if `name` is already current.
    pub fn transition_to(
        &mut self,
        name: &str,
        data: &mut C,
        now: f64,
    ) -> Result<bool, KernelError> {
        if !self.states.contains_key(name) {
            return Err(KernelError::UnknownState(name.to_string()));
        }
        if self.current == name {
            return Ok(false);
        }

        if let Some(old) = self.states.get_mut(&self.current) {
            old.on_exit(data, now);
        }

        debug!("State transition {} -> {}", self.current, name);
        self.current = name.to_string();

        if let Some(new) = self.states.get_mut(name) {
            new.on_enter(data, now);
        }

        Ok(true)
    }

    /// Runs the current state's `execute` and applies its transition.
    pub fn execute(&mut self, data: &mut C, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        let transition = self.current_mut()?.execute(data, ctx)?;
        self.apply(transition, data, ctx.current_time())
    }

    /// Forwards a message to the current state and applies its transition.
    pub fn handle_message(
        &mut self,
        data: &mut C,
        ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<(), AgentError> {
        let transition = self.current_mut()?.on_message(data, ctx, message)?;
        self.apply(transition, data, ctx.current_time())
    }

    fn apply(&mut self, transition: Transition, data: &mut C, now: f64) -> Result<(), AgentError> {
        if let Transition::To(name) = transition {
            self.transition_to(&name, data, now)?;
        }
        Ok(())
    }

    fn current_mut(&mut self) -> Result<&mut Box<dyn State<C>>, KernelError> {
        self.states
            .get_mut(&self.current)
            .ok_or_else(|| KernelError::UnknownState(self.current.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Outbox;
    use crate::registry::AgentRegistry;
    use hydrotwin_env::{AgentId, TokioContext};
    use serde_json::json;

    /// Hook trace shared by all states of a test machine.
    #[derive(Default)]
    struct Trace {
        events: Vec<String>,
        ticks: u32,
    }

    struct Named {
        name: &'static str,
        next: Option<&'static str>,
    }

    impl State<Trace> for Named {
        fn on_enter(&mut self, data: &mut Trace, now: f64) {
            data.events.push(format!("enter {} @{}", self.name, now));
        }

        fn on_exit(&mut self, data: &mut Trace, now: f64) {
            data.events.push(format!("exit {} @{}", self.name, now));
        }

        fn execute(
            &mut self,
            data: &mut Trace,
            _ctx: &mut AgentContext<'_>,
        ) -> Result<Transition, AgentError> {
            data.ticks += 1;
            Ok(self.next.map_or(Transition::Stay, Transition::to))
        }

        fn on_message(
            &mut self,
            _data: &mut Trace,
            _ctx: &mut AgentContext<'_>,
            message: &Message,
        ) -> Result<Transition, AgentError> {
            Ok(match message.str_field("goto") {
                Some(target) => Transition::to(target),
                None => Transition::Stay,
            })
        }
    }

    fn machine(trace: &mut Trace) -> StateMachine<Trace> {
        StateMachine::builder()
            .state("closed", Named { name: "closed", next: None })
            .state("opening", Named { name: "opening", next: Some("open") })
            .state("open", Named { name: "open", next: None })
            .build("closed", trace, 0.0)
            .unwrap()
    }

    #[test]
    fn test_build_enters_initial_state() {
        let mut trace = Trace::default();
        let sm = machine(&mut trace);

        assert_eq!(sm.current_state(), "closed");
        assert_eq!(trace.events, vec!["enter closed @0"]);
        assert_eq!(sm.state_names(), vec!["closed", "open", "opening"]);
    }

    #[test]
    fn test_build_rejects_unknown_initial() {
        let mut trace = Trace::default();
        let result = StateMachine::builder()
            .state("closed", Named { name: "closed", next: None })
            .build("ajar", &mut trace, 0.0);

        assert_eq!(
            result.err(),
            Some(KernelError::UnknownState("ajar".to_string()))
        );
        assert!(trace.events.is_empty());
    }

    #[test]
    fn test_transition_calls_exit_then_enter() {
        let mut trace = Trace::default();
        let mut sm = machine(&mut trace);

        assert!(sm.transition_to("opening", &mut trace, 2.5).unwrap());
        assert_eq!(sm.current_state(), "opening");
        assert_eq!(
            trace.events,
            vec!["enter closed @0", "exit closed @2.5", "enter opening @2.5"]
        );
    }

    #[test]
    fn test_transition_to_current_is_noop() {
        let mut trace = Trace::default();
        let mut sm = machine(&mut trace);

        assert!(!sm.transition_to("closed", &mut trace, 1.0).unwrap());
        assert_eq!(trace.events.len(), 1);
    }

    #[test]
    fn test_transition_to_unknown_state() {
        let mut trace = Trace::default();
        let mut sm = machine(&mut trace);

        let err = sm.transition_to("jammed", &mut trace, 1.0).unwrap_err();
        assert_eq!(err, KernelError::UnknownState("jammed".to_string()));
        assert_eq!(sm.current_state(), "closed");
    }

    #[test]
    fn test_execute_and_message_driven_transitions() {
        let mut trace = Trace::default();
        let mut sm = machine(&mut trace);

        let env = TokioContext::new();
        let mut registry = AgentRegistry::new(None);
        let mut outbox = Outbox::new();
        let id = AgentId::from("gate-1");
        let mut ctx = AgentContext::new(&id, 3.0, 1.0, &mut outbox, &mut registry, &env);

        // Message-driven
        let msg = Message::new("cmd.gate-1", "ops", json!({"goto": "opening"}), 3.0).unwrap();
        sm.handle_message(&mut trace, &mut ctx, &msg).unwrap();
        assert_eq!(sm.current_state(), "opening");

        // Time-driven
        sm.execute(&mut trace, &mut ctx).unwrap();
        assert_eq!(sm.current_state(), "open");
        assert_eq!(trace.ticks, 1);

        // Unknown target surfaces as a wiring error
        let bad = Message::new("cmd.gate-1", "ops", json!({"goto": "ajar"}), 3.0).unwrap();
        let err = sm.handle_message(&mut trace, &mut ctx, &bad).unwrap_err();
        assert_eq!(
            err.as_wiring(),
            Some(&KernelError::UnknownState("ajar".to_string()))
        );
    }
}
