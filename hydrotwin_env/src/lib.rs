//! HydroTwin Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the agent kernel
//! to run in both **Production** (wall clock) and **Simulation** (virtual
//! clock) environments.
//!
//! # Core Concept
//!
//! The kernel never reads the system clock directly. Everything that would
//! make a run non-reproducible goes through [`TwinContext`]:
//! - Time (`now()` for execution probes, `sleep()` for paced runs)
//! - Randomness (`derive_seed()` for agent-local generators)
//!
//! By deriving all entropy from a single 64-bit seed, any simulation run
//! becomes reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use hydrotwin_env::{TwinContext, TokioContext};
//!
//! let ctx = TokioContext::shared();
//! let started = ctx.now();
//! // ... run an agent hook ...
//! let elapsed = ctx.now() - started;
//! ```

mod context;
mod types;
mod tokio_impl;

pub use context::TwinContext;
pub use types::AgentId;
pub use tokio_impl::TokioContext;
