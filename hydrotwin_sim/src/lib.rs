//! HydroTwin Deterministic Simulation Harness
//!
//! Runs the agent kernel against a seeded [`SimContext`] so every scenario
//! is reproducible from one 64-bit seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: the virtual clock moves only when an agent consumes time
//! - **Randomness**: every agent stream is derived from the master seed
//! - **Scheduling**: the kernel is single-threaded and ticked explicitly
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                       │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ SimContext (virtual clock + ChaCha8 seed streams)  │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌───────────────────────▼────────────────────────────┐  │
//! │  │ AgentKernel                                        │  │
//! │  │   Lifecycle · Monitoring · Pump                    │  │
//! │  │   Faulty · Chaos · Workload · Watchdog · Recorder  │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │                 assertions + SimExport                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hydrotwin_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::FaultRecovery);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod exporter;
mod runner;
pub mod agents;
pub mod scenarios;

pub use context::SimContext;
pub use error::SimError;
pub use exporter::{AgentFrame, SimEvent, SimExport, SimFrame};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
