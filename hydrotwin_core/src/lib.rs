//! HydroTwin Core - Agent Orchestration Kernel for Water-Infrastructure Digital Twins
//!
//! A digital twin is a set of agents (physical models, sensors, actuators,
//! controllers) advanced in lockstep by a discrete-time kernel and
//! communicating only through a topic-based message bus.
//!
//! ```text
//!   ┌──────────────────────── AgentKernel ────────────────────────┐
//!   │                                                             │
//!   │  AgentRegistry                         MessageBus           │
//!   │  ┌───────────────────────┐   publish   ┌─────────────────┐  │
//!   │  │ id → instance, status │ ──────────► │ topic → queue   │  │
//!   │  │      factory, params  │ ◄────────── │ topic → subs    │  │
//!   │  └───────────────────────┘   deliver   └─────────────────┘  │
//!   │                                                             │
//!   │  tick: execute all RUNNING agents → dispatch once → t += dt │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! 1. **Fault containment**: an agent that fails (or panics) goes to FAULT;
//!    the simulation keeps running.
//! 2. **Supervised restart**: a faulted agent can be rebuilt from the
//!    factory and parameters it was registered with.
//! 3. **Determinism**: single-threaded ticks, registration-order execution,
//!    publish-order delivery, clock supplied by [`TwinContext`].

pub mod agent;
pub mod agents;
pub mod bus;
pub mod config;
pub mod error;
pub mod kernel;
pub mod message;
pub mod registry;
pub mod state_machine;

// Re-export key types for convenience
pub use agent::{Agent, AgentContext, AgentFactory, AgentStatus};
pub use agents::{LifecycleManager, Monitoring, PumpAgent};
pub use bus::{BusStats, DispatchReport, MessageBus};
pub use config::KernelConfig;
pub use error::{AgentError, KernelError};
pub use kernel::{AgentKernel, RunReport, TickReport, TIME_EPSILON};
pub use message::{topics, Message, Payload};
pub use state_machine::{State, StateMachine, Transition};

pub use hydrotwin_env::{AgentId, TokioContext, TwinContext};
