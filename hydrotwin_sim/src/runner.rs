//! Scenario runner - drives a kernel tick by tick against a seeded
//! simulation context and checks its guarantees.

use crate::agents::{ChaosAgent, FaultyAgent, MessageLog, Recorder, Relay, Watchdog, WorkloadAgent};
use crate::context::SimContext;
use crate::error::{ensure, SimError};
use crate::exporter::{SimEvent, SimExport, SimFrame};
use crate::scenarios::ScenarioId;

use hydrotwin_core::{
    topics, Agent, AgentError, AgentId, AgentKernel, AgentStatus, KernelConfig, LifecycleManager,
    Message, Monitoring, Payload, PumpAgent, RunReport, TickReport, TIME_EPSILON,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Successful deliveries
    pub messages_delivered: u64,

    /// Messages dropped for lack of subscribers
    pub messages_discarded: u64,

    /// Subscriber handlers that failed
    pub delivery_failures: u64,

    /// Agents moved to FAULT (execution and delivery)
    pub faults: u64,

    /// Restart attempts across all agents
    pub restarts: u64,

    /// Longest single `execute` probe (ms of context time)
    pub max_execution_ms: f64,
}

// ============================================================================
// HARNESS
// ============================================================================

/// One kernel under test plus the bookkeeping around it.
struct Harness {
    kernel: AgentKernel,
    clock: Arc<SimContext>,
    time_step: f64,
    ticks: u64,
    metrics: ScenarioMetrics,
    export: Option<SimExport>,
}

impl Harness {
    fn new(scenario: ScenarioId, seed: u64, time_step: f64, export: bool) -> Self {
        let clock = SimContext::shared(seed);
        let config = KernelConfig::default().with_name(format!("sim-{}", scenario.name()));
        let kernel = AgentKernel::with_context(config, clock.clone());

        Self {
            kernel,
            clock,
            time_step,
            ticks: 0,
            metrics: ScenarioMetrics::default(),
            export: export.then(|| SimExport::new(scenario.name(), seed)),
        }
    }

    fn add<F>(&mut self, factory: F, id: &str, params: Payload) -> Result<(), SimError>
    where
        F: Fn(&AgentId, &Payload) -> Result<Box<dyn Agent>, AgentError> + Send + Sync + 'static,
    {
        self.kernel.add_agent(factory, id, params)?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), SimError> {
        self.kernel.start(self.time_step)?;
        Ok(())
    }

    /// Publishes from outside any agent, stamped with the current time.
    fn inject(&mut self, topic: &str, payload: Payload) -> Result<(), SimError> {
        let message = Message::new(topic, "operator", payload, self.kernel.current_time())?;
        self.kernel.publish(message);
        Ok(())
    }

    fn tick(&mut self) -> Result<TickReport, SimError> {
        let report = self.kernel.tick()?;
        self.ticks += 1;

        self.metrics.messages_delivered += report.dispatch.delivered as u64;
        self.metrics.messages_discarded += report.dispatch.discarded as u64;
        self.metrics.delivery_failures += report.dispatch.failures.len() as u64;
        self.metrics.faults += report.faulted.len() as u64;
        for elapsed in self.kernel.agent_performance().values() {
            let ms = elapsed.as_secs_f64() * 1000.0;
            if ms > self.metrics.max_execution_ms {
                self.metrics.max_execution_ms = ms;
            }
        }

        for id in &report.faulted {
            debug!(
                "t={:.3} {} faulted: {}",
                report.time,
                id,
                self.kernel.fault_reason(id).unwrap_or("unknown")
            );
        }

        if let Some(export) = self.export.as_mut() {
            let mut events: Vec<SimEvent> = report
                .faulted
                .iter()
                .map(|id| {
                    SimEvent::warn(format!(
                        "{} faulted: {}",
                        id,
                        self.kernel.fault_reason(id).unwrap_or("unknown")
                    ))
                })
                .collect();
            if report.dispatch.discarded > 0 {
                events.push(SimEvent::info(format!(
                    "{} message(s) discarded",
                    report.dispatch.discarded
                )));
            }
            export.add_frame(SimFrame::capture(&self.kernel, &report, events));
        }

        Ok(report)
    }

    fn run_ticks(&mut self, ticks: u64) -> Result<(), SimError> {
        for _ in 0..ticks {
            self.tick()?;
        }
        Ok(())
    }

    fn status(&self, id: &str) -> Option<AgentStatus> {
        self.kernel.agent_status(&AgentId::from(id))
    }

    /// Stops the kernel and returns (ticks, final time, metrics, export).
    fn finish(mut self) -> (u64, f64, ScenarioMetrics, Option<SimExport>) {
        let final_time = self.kernel.current_time();
        self.metrics.restarts = self
            .kernel
            .agent_ids()
            .iter()
            .filter_map(|id| self.kernel.restart_count(id))
            .map(u64::from)
            .sum();
        self.kernel.stop();
        (self.ticks, final_time, self.metrics, self.export)
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs kernel scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Simulated duration in seconds
    duration_secs: f64,

    /// Simulated seconds per tick
    time_step: f64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            duration_secs: 20.0,
            time_step: 1.0,
        }
    }

    /// Sets the simulated duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Sets the time step.
    pub fn with_time_step(mut self, secs: f64) -> Self {
        self.time_step = secs;
        self
    }

    /// Ticks a scenario will run: the configured duration, but never fewer
    /// than the scenario needs.
    pub fn ticks_for(&self, scenario: ScenarioId) -> u64 {
        let planned = if self.time_step > 0.0 && self.duration_secs > 0.0 {
            (self.duration_secs / self.time_step - TIME_EPSILON).ceil() as u64
        } else {
            0
        };
        planned.max(scenario.min_ticks())
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, false).0
    }

    /// Runs a scenario and also records one frame per tick.
    pub fn run_exported(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let (result, export) = self.execute(scenario, true);
        let mut export = export.unwrap_or_else(|| SimExport::new(scenario.name(), self.seed));
        export.finalize(result.passed, result.failure_reason.clone());
        (result, export)
    }

    fn execute(&self, scenario: ScenarioId, export: bool) -> (ScenarioResult, Option<SimExport>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let ticks = self.ticks_for(scenario);
        let mut harness = Harness::new(scenario, self.seed, self.time_step, export);

        let outcome = match scenario {
            ScenarioId::FaultRecovery => fault_recovery(&mut harness, ticks),
            ScenarioId::MonitoringCadence => monitoring_cadence(&mut harness, ticks),
            ScenarioId::DeferredDelivery => deferred_delivery(&mut harness, ticks),
            ScenarioId::SubscriberIsolation => subscriber_isolation(&mut harness, ticks),
            ScenarioId::ChaosRestart => chaos_restart(&mut harness, ticks),
            ScenarioId::PumpCycle => pump_cycle(&mut harness, ticks),
        };

        let (total_ticks, final_time_secs, metrics, export) = harness.finish();
        let failure_reason = outcome.err().map(|e| e.to_string());
        if let Some(reason) = &failure_reason {
            warn!("{} (seed={}) failed: {}", scenario.name(), self.seed, reason);
        }

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            total_ticks,
            final_time_secs,
            failure_reason,
            metrics,
        };
        (result, export)
    }

    /// Runs a small plant against the wall clock, pausing
    /// `time_step * factor` seconds after each tick.
    pub async fn run_realtime(&self, factor: f64) -> Result<RunReport, SimError> {
        let config = KernelConfig::default()
            .with_name("hydrotwin-live")
            .with_realtime_factor(factor);
        let mut kernel = AgentKernel::new(config);

        kernel.add_agent(LifecycleManager::create, "lifecycle", json!({}))?;
        kernel.add_agent(PumpAgent::create, "p1", json!({ "startup_duration": 3.0 * self.time_step }))?;
        kernel.add_agent(ChaosAgent::create, "telemetry", json!({ "failure_rate": 0.05 }))?;
        kernel.add_agent(Watchdog::create, "watchdog", json!({ "watch": ["p1", "telemetry"] }))?;
        kernel.add_agent(Monitoring::create, "monitor", json!({ "interval": 5.0 * self.time_step }))?;
        kernel.publish(Message::new("cmd.p1", "operator", json!({ "command": "start" }), 0.0)?);

        info!(
            "Live run: {}s simulated at {}x wall-clock pacing",
            self.duration_secs, factor
        );
        Ok(kernel.run_paced(self.duration_secs, self.time_step).await?)
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// KRN-001: a sensor faults inside `[0.3T, 0.5T)`; a watchdog requests a
/// restart each time and the lifecycle manager performs it.
fn fault_recovery(h: &mut Harness, ticks: u64) -> Result<(), SimError> {
    let horizon = ticks as f64 * h.time_step;
    let log = MessageLog::new();

    h.add(LifecycleManager::create, "lifecycle", json!({}))?;
    h.add(
        FaultyAgent::create,
        "overflow_sensor",
        json!({ "fail_at": 0.3 * horizon, "recover_at": 0.5 * horizon }),
    )?;
    h.add(Watchdog::create, "watchdog", json!({ "watch": ["overflow_sensor"] }))?;
    h.add(
        Recorder::factory(log.clone()),
        "recorder",
        json!({ "topics": [topics::LIFECYCLE_RESTART] }),
    )?;
    h.start()?;
    h.run_ticks(ticks)?;

    let sensor = AgentId::from("overflow_sensor");
    let restarts = h.kernel.restart_count(&sensor).unwrap_or(0);
    let requests = log.on_topic(topics::LIFECYCLE_RESTART);

    ensure(h.metrics.faults >= 1, || "sensor never faulted".to_string())?;
    ensure(restarts >= 1, || "sensor was never restarted".to_string())?;
    ensure(requests.len() == restarts as usize, || {
        format!("{} restart request(s) but {} restart(s)", requests.len(), restarts)
    })?;
    ensure(h.status("overflow_sensor") == Some(AgentStatus::Running), || {
        format!("sensor ended {:?}", h.status("overflow_sensor"))
    })?;
    ensure(
        requests.iter().all(|r| r.payload == json!({ "agent_id": "overflow_sensor" })),
        || "restart request for the wrong agent".to_string(),
    )?;

    info!("  {} fault(s), {} restart(s)", h.metrics.faults, restarts);
    Ok(())
}

/// KRN-002: monitoring every three steps of simulated time, with non-zero
/// execution probes for agents that consume time.
fn monitoring_cadence(h: &mut Harness, ticks: u64) -> Result<(), SimError> {
    let interval = 3.0 * h.time_step;
    let log = MessageLog::new();
    let workers = ["solver_a", "solver_b"];

    for id in workers {
        h.add(
            WorkloadAgent::factory(h.clock.clone()),
            id,
            json!({ "mean_ms": 2.0, "std_ms": 0.25 }),
        )?;
    }
    h.add(Monitoring::create, "monitor", json!({ "interval": interval }))?;
    h.add(
        Recorder::factory(log.clone()),
        "recorder",
        json!({ "topics": [topics::PERFORMANCE] }),
    )?;
    h.start()?;
    h.run_ticks(ticks)?;

    let reports = log.on_topic(topics::PERFORMANCE);
    let expected = ((ticks - 1) / 3) as usize;
    ensure(reports.len() == expected, || {
        format!("{} performance report(s) over {} ticks, expected {}", reports.len(), ticks, expected)
    })?;

    for (n, report) in reports.iter().enumerate() {
        let due = (n + 1) as f64 * interval;
        ensure((report.timestamp - due).abs() < TIME_EPSILON, || {
            format!("report {} stamped t={:.6}, expected t={:.6}", n, report.timestamp, due)
        })?;

        for id in workers {
            let execution_ms = report.payload["agent_execution_times"][id].as_f64().unwrap_or(0.0);
            ensure(execution_ms > 0.0, || {
                format!("report {} has no execution time for {}", n, id)
            })?;
        }
        ensure(report.payload["topic_queue_lengths"].is_object(), || {
            format!("report {} has no queue lengths", n)
        })?;
    }

    info!("  {} report(s), max execution {:.3} ms", reports.len(), h.metrics.max_execution_ms);
    Ok(())
}

/// KRN-003: within one dispatch, only topics pending at its start are
/// processed. A relayed message lands in this dispatch only when its topic
/// has not been taken yet.
fn deferred_delivery(h: &mut Harness, ticks: u64) -> Result<(), SimError> {
    let dt = h.time_step;
    let log = MessageLog::new();

    h.add(Relay::create, "relay", json!({ "listen": "a", "forward": ["a", "b", "c"] }))?;
    h.add(Recorder::factory(log.clone()), "recorder", json!({}))?;
    h.start()?;

    h.inject("a", json!({ "hops": 0 }))?;
    h.inject("b", json!({ "hops": 0 }))?;
    h.run_ticks(ticks)?;

    let arrival = |topic: &str, hops: u64| -> Vec<f64> {
        log.on_topic(topic)
            .into_iter()
            .filter(|m| m.payload["hops"].as_u64() == Some(hops))
            .map(|m| m.received_at)
            .collect()
    };
    let at = |times: &[f64], t: f64| times.len() == 1 && (times[0] - t).abs() < TIME_EPSILON;

    ensure(at(&arrival("a", 0), 0.0), || "external 'a' not delivered at t=0".to_string())?;
    ensure(at(&arrival("b", 0), 0.0), || "external 'b' not delivered at t=0".to_string())?;

    // 'b' was still queued when the relay published: same dispatch
    let relayed_b = arrival("b", 1);
    ensure(at(&relayed_b, 0.0), || format!("relayed 'b' arrived at {:?}, expected [0]", relayed_b))?;

    // 'a' was already taken and 'c' was not pending: next tick
    let relayed_a = arrival("a", 1);
    ensure(at(&relayed_a, dt), || format!("relayed 'a' arrived at {:?}, expected [{}]", relayed_a, dt))?;
    let relayed_c = arrival("c", 1);
    ensure(at(&relayed_c, dt), || format!("relayed 'c' arrived at {:?}, expected [{}]", relayed_c, dt))?;

    ensure(log.len() == 5, || format!("{} deliveries, expected 5", log.len()))?;
    Ok(())
}

/// KRN-004: one subscriber fails on its first message; the subscribers on
/// either side of it still receive every message in order.
fn subscriber_isolation(h: &mut Harness, ticks: u64) -> Result<(), SimError> {
    let log = MessageLog::new();

    h.add(
        WorkloadAgent::factory(h.clock.clone()),
        "level_sensor",
        json!({ "mean_ms": 1.0, "std_ms": 0.1, "topic": "level" }),
    )?;
    h.add(Recorder::factory(log.clone()), "hmi", json!({ "topics": ["level"] }))?;
    h.add(
        FaultyAgent::create,
        "historian",
        json!({ "phase": "message", "topic": "level" }),
    )?;
    h.add(Recorder::factory(log.clone()), "alarm", json!({ "topics": ["level"] }))?;
    h.start()?;
    h.run_ticks(ticks)?;

    ensure(h.status("historian") == Some(AgentStatus::Fault), || {
        format!("historian ended {:?}", h.status("historian"))
    })?;
    ensure(h.metrics.delivery_failures == 1, || {
        format!("{} delivery failure(s), expected 1", h.metrics.delivery_failures)
    })?;

    for recipient in ["hmi", "alarm"] {
        let sequence: Vec<u64> = log
            .entries()
            .into_iter()
            .filter(|m| m.recipient == recipient)
            .filter_map(|m| m.payload["sequence"].as_u64())
            .collect();
        let expected: Vec<u64> = (1..=ticks).collect();
        ensure(sequence == expected, || {
            format!("{} saw {} of {} message(s) or out of order", recipient, sequence.len(), ticks)
        })?;
    }
    Ok(())
}

/// KRN-005: chaos agents fault at random; each fault is restarted in the
/// same tick, so no chaos agent is FAULT between ticks.
fn chaos_restart(h: &mut Harness, ticks: u64) -> Result<(), SimError> {
    let chaos: Vec<String> = (0..4).map(|i| format!("chaos_{}", i)).collect();

    h.add(LifecycleManager::create, "lifecycle", json!({}))?;
    for id in &chaos {
        h.add(ChaosAgent::create, id, json!({ "failure_rate": 0.25 }))?;
    }
    h.add(Watchdog::create, "watchdog", json!({ "watch": chaos }))?;
    h.start()?;

    for tick in 0..ticks {
        h.tick()?;
        for id in &chaos {
            ensure(h.status(id) == Some(AgentStatus::Running), || {
                format!("{} left {:?} after tick {}", id, h.status(id), tick)
            })?;
        }
    }

    let restarts: u64 = chaos
        .iter()
        .filter_map(|id| h.kernel.restart_count(&AgentId::from(id.as_str())))
        .map(u64::from)
        .sum();

    ensure(h.metrics.faults > 0, || "no chaos fault injected".to_string())?;
    ensure(h.metrics.faults == restarts, || {
        format!("{} fault(s) but {} restart(s)", h.metrics.faults, restarts)
    })?;

    info!("  {} chaos fault(s), all restarted", restarts);
    Ok(())
}

/// KRN-006: scripted operator commands drive the pump through its whole
/// state machine.
fn pump_cycle(h: &mut Harness, ticks: u64) -> Result<(), SimError> {
    let rated_flow = 2.0;
    let log = MessageLog::new();
    let script: BTreeMap<u64, &str> =
        BTreeMap::from([(1, "start"), (6, "trip"), (8, "reset"), (9, "start")]);

    h.add(
        PumpAgent::create,
        "p1",
        json!({ "rated_flow": rated_flow, "startup_duration": 2.0 * h.time_step }),
    )?;
    h.add(Recorder::factory(log.clone()), "scada", json!({ "topics": ["state.p1"] }))?;
    h.start()?;

    for tick in 0..ticks {
        if let Some(command) = script.get(&tick) {
            h.inject("cmd.p1", json!({ "command": command }))?;
        }
        h.tick()?;
    }

    let readings = log.on_topic("state.p1");
    let mut states: Vec<String> = readings
        .iter()
        .filter_map(|m| m.payload["state"].as_str().map(str::to_string))
        .collect();
    states.dedup();

    let expected = ["stopped", "starting", "running", "fault", "stopped", "starting", "running"];
    ensure(states == expected, || format!("pump went through {:?}", states))?;

    let final_flow = readings
        .last()
        .and_then(|m| m.payload["flow"].as_f64())
        .unwrap_or(0.0);
    ensure((final_flow - rated_flow).abs() < f64::EPSILON, || {
        format!("final flow {} != rated {}", final_flow, rated_flow)
    })?;
    ensure(h.status("p1") == Some(AgentStatus::Running), || {
        "pump agent itself faulted".to_string()
    })?;
    Ok(())
}
