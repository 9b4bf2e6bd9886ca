//! Kernel configuration.

/// Configuration for an [`AgentKernel`](crate::AgentKernel).
#[derive(Debug, Clone, PartialEq)]
pub struct KernelConfig {
    /// Kernel's logical name (for logging)
    pub name: String,

    /// Wall-clock seconds slept per simulated second in paced runs
    /// (default: 1.0, i.e. real time)
    pub realtime_factor: f64,

    /// Restart attempts allowed per agent (default: unlimited)
    pub max_restarts: Option<u32>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "hydrotwin-kernel".to_string(),
            realtime_factor: 1.0,
            max_restarts: None,
        }
    }
}

impl KernelConfig {
    /// Sets the logical name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the pacing factor for `run_paced`.
    pub fn with_realtime_factor(mut self, factor: f64) -> Self {
        self.realtime_factor = factor;
        self
    }

    /// Caps restart attempts per agent.
    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = Some(max);
        self
    }
}
