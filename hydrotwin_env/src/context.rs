//! Core environment context trait for HydroTwin kernels.

use async_trait::async_trait;
use std::time::Duration;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the agent kernel can run
/// against wall-clock time in production and against a virtual clock in
/// deterministic simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `std::time::Instant`, `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` (in `hydrotwin_sim`) - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// The kernel measures agent execution time with `now()`. In simulation the
/// clock only moves when the harness (or a workload agent) advances it, so
/// performance probes are reproducible from the seed alone.
#[async_trait]
pub trait TwinContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for per-agent execution probes. In simulation, this is the
    /// virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Derives a seed for an agent-local random generator.
    ///
    /// Simulation combines the master seed with `seed_extension` so the same
    /// agent always draws the same sequence; production returns fresh entropy.
    ///
    /// # Arguments
    /// * `seed_extension` - A value to combine with the global seed
    fn derive_seed(&self, seed_extension: u64) -> u64;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
