//! The agent kernel: owns the registry, the bus and the simulation clock.
//!
//! # Tick
//!
//! ```text
//!  tick() ──► for agent in registration order (RUNNING only):
//!               t0 = env.now()
//!               agent.execute(ctx, current_time, time_step)   ◄─ guarded
//!               performance[agent] = env.now() - t0
//!           ──► bus.dispatch()                                 (exactly once)
//!           ──► current_time += time_step
//! ```
//!
//! A failing (or panicking) agent is moved to FAULT and the tick carries on.
//! Only wiring errors (`KernelError`) come back out of `tick`/`run`.

use crate::agent::{Agent, AgentContext, AgentFactory, AgentStatus};
use crate::bus::{DispatchReport, MessageBus, Outbox};
use crate::config::KernelConfig;
use crate::error::{AgentError, KernelError};
use crate::message::{Message, Payload};
use crate::registry::{AgentRegistry, RegistrySink};
use hydrotwin_env::{AgentId, TokioContext, TwinContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Tolerance for comparing accumulated simulated time (float drift from
/// repeated `+= time_step`).
pub const TIME_EPSILON: f64 = 1e-9;

/// Summary of one `tick()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    /// Index of this tick (0-based)
    pub tick: u64,

    /// Simulated time at which the tick ran
    pub time: f64,

    /// `execute` calls made
    pub executed: usize,

    /// Agents that faulted during this tick (execution or delivery)
    pub faulted: Vec<AgentId>,

    pub dispatch: DispatchReport,
}

/// Summary of a `run()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub ticks: u64,
    pub final_time: f64,
    pub faults: usize,
    pub delivered: usize,
    pub discarded: usize,
}

impl RunReport {
    fn record(&mut self, tick: &TickReport) {
        self.ticks += 1;
        self.faults += tick.faulted.len();
        self.delivered += tick.dispatch.delivered;
        self.discarded += tick.dispatch.discarded;
    }
}

/// Central orchestrator of a digital twin.
///
/// The kernel is an explicit object; create as many as needed. All agent
/// code runs on the caller's thread, one hook at a time.
pub struct AgentKernel {
    config: KernelConfig,

    /// Clock and entropy source
    env: Arc<dyn TwinContext>,

    registry: AgentRegistry,
    bus: MessageBus,

    /// Simulated time in seconds
    current_time: f64,

    /// Simulated seconds per tick (set by `start`)
    time_step: f64,

    tick_count: u64,
    running: bool,
}

impl AgentKernel {
    /// Creates a kernel running against the wall clock.
    pub fn new(config: KernelConfig) -> Self {
        Self::with_context(config, TokioContext::shared())
    }

    /// Creates a kernel with an explicit environment (e.g. a simulated one).
    pub fn with_context(config: KernelConfig, env: Arc<dyn TwinContext>) -> Self {
        let registry = AgentRegistry::new(config.max_restarts);
        Self {
            config,
            env,
            registry,
            bus: MessageBus::new(),
            current_time: 0.0,
            time_step: 0.0,
            tick_count: 0,
            running: false,
        }
    }

    /// Registers an agent built by `factory` under `id`.
    ///
    /// The factory and parameters are kept for restarts. `setup` is not
    /// called until `start`.
    pub fn add_agent<F>(
        &mut self,
        factory: F,
        id: impl Into<AgentId>,
        parameters: Payload,
    ) -> Result<(), KernelError>
    where
        F: Fn(&AgentId, &Payload) -> Result<Box<dyn Agent>, AgentError> + Send + Sync + 'static,
    {
        self.add_agent_factory(Arc::new(factory), id, parameters)
    }

    /// Registers an agent from an already shared factory.
    pub fn add_agent_factory(
        &mut self,
        factory: AgentFactory,
        id: impl Into<AgentId>,
        parameters: Payload,
    ) -> Result<(), KernelError> {
        let id = id.into();
        self.registry.register(id.clone(), factory, parameters)?;
        info!("[{}] Registered agent {}", self.config.name, id);
        Ok(())
    }

    /// Subscribes a registered agent to `topic` from outside the agent.
    pub fn subscribe(&mut self, id: &AgentId, topic: &str) -> Result<bool, KernelError> {
        if !self.registry.contains(id) {
            return Err(KernelError::UnknownAgent(id.clone()));
        }
        self.bus.subscribe(id, topic)
    }

    /// Injects a message from outside any agent.
    pub fn publish(&mut self, message: Message) {
        self.bus.publish(message);
    }

    /// Marks the kernel running and sets up every INITIALIZING agent.
    ///
    /// May be called again to set up agents registered since.
    pub fn start(&mut self, time_step: f64) -> Result<(), KernelError> {
        if !time_step.is_finite() || time_step <= 0.0 {
            return Err(KernelError::InvalidTimeStep(time_step));
        }

        self.time_step = time_step;
        self.running = true;
        info!(
            "[{}] Starting {} agent(s), time step {}s",
            self.config.name,
            self.registry.len(),
            time_step
        );

        for id in self.registry.ids() {
            if self.registry.status(&id) != Some(AgentStatus::Initializing) {
                continue;
            }

            match self.invoke(&id, |agent, ctx| agent.setup(ctx)) {
                Some(Ok(())) => self.registry.set_status(&id, AgentStatus::Running)?,
                Some(Err(AgentError::Wiring(err))) => return Err(err),
                Some(Err(err)) => self.registry.fault(&id, "setup", &err),
                None => {}
            }
        }

        Ok(())
    }

    /// Advances the simulation by one time step.
    pub fn tick(&mut self) -> Result<TickReport, KernelError> {
        if !self.running {
            return Err(KernelError::NotStarted);
        }

        let time = self.current_time;
        let time_step = self.time_step;
        let mut executed = 0;
        let mut faulted = Vec::new();

        for id in self.registry.ids() {
            if self.registry.status(&id) != Some(AgentStatus::Running) {
                continue;
            }

            let started = self.env.now();
            let result = self.invoke(&id, |agent, ctx| agent.execute(ctx, time, time_step));
            let elapsed = self.env.now().saturating_sub(started);
            self.registry.record_execution(&id, elapsed);

            match result {
                Some(Ok(())) => executed += 1,
                Some(Err(AgentError::Wiring(err))) => return Err(err),
                Some(Err(err)) => {
                    executed += 1;
                    self.registry.fault(&id, "execution", &err);
                    faulted.push(id);
                }
                None => {}
            }
        }

        let dispatch = {
            let mut sink =
                RegistrySink::new(&mut self.registry, self.env.as_ref(), time, time_step);
            self.bus.dispatch(&mut sink)?
        };
        faulted.extend(dispatch.failures.iter().map(|f| f.subscriber.clone()));

        let report = TickReport {
            tick: self.tick_count,
            time,
            executed,
            faulted,
            dispatch,
        };

        self.current_time += time_step;
        self.tick_count += 1;

        debug!(
            "[{}] tick {} t={:.3}: {} executed, {} delivered, {} fault(s)",
            self.config.name,
            report.tick,
            report.time,
            report.executed,
            report.dispatch.delivered,
            report.faulted.len()
        );

        Ok(report)
    }

    /// Starts, ticks until `duration` simulated seconds have elapsed, stops.
    ///
    /// On a wiring error the kernel is stopped before the error is returned.
    pub fn run(&mut self, duration: f64, time_step: f64) -> Result<RunReport, KernelError> {
        self.start(time_step)?;
        let mut report = RunReport::default();

        while self.running && self.current_time + TIME_EPSILON < duration {
            match self.tick() {
                Ok(tick) => report.record(&tick),
                Err(err) => {
                    self.stop();
                    return Err(err);
                }
            }
        }

        self.stop();
        report.final_time = self.current_time;
        Ok(report)
    }

    /// Like `run`, but sleeps `time_step * realtime_factor` seconds of
    /// context time after each tick.
    pub async fn run_paced(
        &mut self,
        duration: f64,
        time_step: f64,
    ) -> Result<RunReport, KernelError> {
        self.start(time_step)?;
        let pause = Duration::try_from_secs_f64(time_step * self.config.realtime_factor)
            .unwrap_or(Duration::ZERO);
        let env = Arc::clone(&self.env);
        let mut report = RunReport::default();

        while self.running && self.current_time + TIME_EPSILON < duration {
            match self.tick() {
                Ok(tick) => report.record(&tick),
                Err(err) => {
                    self.stop();
                    return Err(err);
                }
            }
            env.sleep(pause).await;
        }

        self.stop();
        report.final_time = self.current_time;
        Ok(report)
    }

    /// Stops the kernel and shuts down every agent not already STOPPED.
    ///
    /// Shutdown failures are logged and never propagated. Messages
    /// published during shutdown stay queued.
    pub fn stop(&mut self) {
        if self.running {
            info!("[{}] Stopping at t={:.3}", self.config.name, self.current_time);
        }
        self.running = false;

        for id in self.registry.ids() {
            match self.registry.status(&id) {
                None | Some(AgentStatus::Stopped) => continue,
                Some(_) => {}
            }

            if let Err(err) = self.registry.set_status(&id, AgentStatus::ShuttingDown) {
                error!("Could not shut down {}: {}", id, err);
                continue;
            }

            if let Some(Err(err)) = self.invoke(&id, |agent, ctx| agent.shutdown(ctx)) {
                error!("Agent {} failed during shutdown: {}", id, err);
            }

            if let Err(err) = self.registry.set_status(&id, AgentStatus::Stopped) {
                error!("Could not stop {}: {}", id, err);
            }
        }
    }

    /// Replaces a faulted agent with a fresh instance and sets it up.
    ///
    /// # Errors
    /// `UnknownAgent`, `NotFaulted` (state unchanged), or `RestartFailed`
    /// (agent stays FAULT).
    pub fn restart_agent(&mut self, id: &AgentId) -> Result<(), KernelError> {
        let mut outbox = self.bus.outbox();
        let result = self.registry.restart(
            id,
            &mut outbox,
            self.env.as_ref(),
            self.current_time,
            self.time_step,
        );
        self.bus.absorb(outbox);
        result
    }

    /// Duration of each agent's most recent `execute` call.
    pub fn agent_performance(&self) -> BTreeMap<AgentId, Duration> {
        self.registry.performance()
    }

    /// Pending message counts per topic.
    pub fn topic_queue_lengths(&self) -> BTreeMap<String, usize> {
        self.bus.topic_queue_lengths()
    }

    pub fn agent_status(&self, id: &AgentId) -> Option<AgentStatus> {
        self.registry.status(id)
    }

    pub fn agent_statuses(&self) -> BTreeMap<AgentId, AgentStatus> {
        self.registry.statuses()
    }

    /// Ids in registration order.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.registry.ids()
    }

    pub fn fault_reason(&self, id: &AgentId) -> Option<&str> {
        self.registry.fault_reason(id)
    }

    pub fn restart_count(&self, id: &AgentId) -> Option<u32> {
        self.registry.restart_count(id)
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn env(&self) -> &Arc<dyn TwinContext> {
        &self.env
    }

    /// Runs one hook with a fresh outbox, then hands the outbox to the bus.
    fn invoke<F>(&mut self, id: &AgentId, hook: F) -> Option<Result<(), AgentError>>
    where
        F: FnOnce(&mut dyn Agent, &mut AgentContext<'_>) -> Result<(), AgentError>,
    {
        let mut outbox: Outbox = self.bus.outbox();
        let result = self.registry.invoke(
            id,
            &mut outbox,
            self.env.as_ref(),
            self.current_time,
            self.time_step,
            hook,
        );
        self.bus.absorb(outbox);
        result
    }
}
