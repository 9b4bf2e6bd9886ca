//! Agents used by the simulation scenarios.
//!
//! These are ordinary `hydrotwin_core` agents whose behavior is driven by
//! their parameters and by seeds derived from the simulation context:
//!
//! | Agent           | Role                                                   |
//! |-----------------|--------------------------------------------------------|
//! | `FaultyAgent`   | fails in one hook inside a simulated-time window       |
//! | `ChaosAgent`    | fails each tick with a seeded probability              |
//! | `WorkloadAgent` | burns virtual CPU time and publishes telemetry         |
//! | `Recorder`      | captures every delivery into a shared `MessageLog`     |
//! | `Watchdog`      | requests restarts for watched agents that are FAULT    |
//! | `Relay`         | re-publishes what it hears once (delivery-order probe) |

use crate::context::SimContext;
use hydrotwin_core::{
    topics, Agent, AgentContext, AgentError, AgentId, AgentStatus, Message, Payload, TwinContext,
    TIME_EPSILON,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Stable per-id stream number (FNV-1a).
fn stream_of(id: &AgentId) -> u64 {
    id.as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        })
}

fn parse<T: serde::de::DeserializeOwned>(params: &Payload) -> Result<T, AgentError> {
    if params.is_null() {
        return Ok(serde_json::from_value(json!({}))?);
    }
    Ok(serde_json::from_value(params.clone())?)
}

// ============================================================================
// FAULTY AGENT
// ============================================================================

/// Hook in which a [`FaultyAgent`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPhase {
    Setup,
    Execute,
    Message,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FaultyParams {
    fail_at: f64,
    recover_at: Option<f64>,
    phase: FailPhase,
    topic: Option<String>,
}

impl Default for FaultyParams {
    fn default() -> Self {
        Self {
            fail_at: 0.0,
            recover_at: None,
            phase: FailPhase::Execute,
            topic: None,
        }
    }
}

/// Fails in one hook while `fail_at <= t < recover_at`.
///
/// Parameters: `fail_at` (default 0.0), `recover_at` (default never),
/// `phase` (`setup` | `execute` | `message`, default `execute`), `topic`
/// (subscribed in setup).
pub struct FaultyAgent {
    params: FaultyParams,
}

impl FaultyAgent {
    pub fn create(_id: &AgentId, params: &Payload) -> Result<Box<dyn Agent>, AgentError> {
        Ok(Box::new(Self {
            params: parse(params)?,
        }))
    }

    fn failing_at(&self, phase: FailPhase, time: f64) -> bool {
        let recover_at = self.params.recover_at.unwrap_or(f64::INFINITY);
        self.params.phase == phase
            && time + TIME_EPSILON >= self.params.fail_at
            && time + TIME_EPSILON < recover_at
    }

    fn injected(phase: FailPhase, time: f64) -> AgentError {
        AgentError::failed(format!("injected {:?} failure at t={:.3}", phase, time))
    }
}

impl Agent for FaultyAgent {
    fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        if let Some(topic) = &self.params.topic {
            ctx.subscribe(topic)?;
        }
        if self.failing_at(FailPhase::Setup, ctx.current_time()) {
            return Err(Self::injected(FailPhase::Setup, ctx.current_time()));
        }
        Ok(())
    }

    fn execute(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        if self.failing_at(FailPhase::Execute, current_time) {
            return Err(Self::injected(FailPhase::Execute, current_time));
        }
        Ok(())
    }

    fn on_message(
        &mut self,
        ctx: &mut AgentContext<'_>,
        _message: &Message,
    ) -> Result<(), AgentError> {
        if self.failing_at(FailPhase::Message, ctx.current_time()) {
            return Err(Self::injected(FailPhase::Message, ctx.current_time()));
        }
        Ok(())
    }
}

// ============================================================================
// CHAOS AGENT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ChaosParams {
    failure_rate: f64,
    stream: Option<u64>,
}

impl Default for ChaosParams {
    fn default() -> Self {
        Self {
            failure_rate: 0.1,
            stream: None,
        }
    }
}

/// Fails each execution with probability `failure_rate`.
///
/// The generator is seeded in `setup` from the context seed, the agent's
/// stream and the setup time, so a restarted instance draws a new but
/// reproducible sequence.
pub struct ChaosAgent {
    failure_rate: f64,
    stream: u64,
    rng: Option<ChaCha8Rng>,
    executions: u64,
}

impl ChaosAgent {
    pub fn create(id: &AgentId, params: &Payload) -> Result<Box<dyn Agent>, AgentError> {
        let params: ChaosParams = parse(params)?;
        if !(0.0..=1.0).contains(&params.failure_rate) {
            return Err(AgentError::failed(format!(
                "failure_rate must be within [0, 1], got {}",
                params.failure_rate
            )));
        }

        Ok(Box::new(Self {
            failure_rate: params.failure_rate,
            stream: params.stream.unwrap_or_else(|| stream_of(id)),
            rng: None,
            executions: 0,
        }))
    }
}

impl Agent for ChaosAgent {
    fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        let seed = ctx
            .env()
            .derive_seed(self.stream ^ ctx.current_time().to_bits());
        self.rng = Some(ChaCha8Rng::seed_from_u64(seed));
        Ok(())
    }

    fn execute(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        let rng = self
            .rng
            .as_mut()
            .ok_or_else(|| AgentError::failed("executed before setup"))?;

        self.executions += 1;
        if rng.gen_bool(self.failure_rate) {
            return Err(AgentError::failed(format!(
                "chaos strike on execution {} at t={:.3}",
                self.executions, current_time
            )));
        }
        Ok(())
    }
}

// ============================================================================
// WORKLOAD AGENT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct WorkloadParams {
    mean_ms: f64,
    std_ms: f64,
    topic: Option<String>,
}

impl Default for WorkloadParams {
    fn default() -> Self {
        Self {
            mean_ms: 2.0,
            std_ms: 0.5,
            topic: None,
        }
    }
}

/// Consumes virtual CPU time on every execution and publishes telemetry.
///
/// Each `execute` advances the simulation clock by a cost drawn from
/// `Normal(mean_ms, std_ms)`, so the kernel's execution probe for this
/// agent is non-zero and reproducible from the seed.
///
/// Parameters: `mean_ms` (default 2.0), `std_ms` (default 0.5), `topic`
/// (default `telemetry.<id>`).
pub struct WorkloadAgent {
    clock: Arc<SimContext>,
    cost: Normal<f64>,
    topic: String,
    stream: u64,
    rng: Option<ChaCha8Rng>,
    sequence: u64,
}

impl WorkloadAgent {
    /// Builds a factory bound to the simulation clock.
    pub fn factory(
        clock: Arc<SimContext>,
    ) -> impl Fn(&AgentId, &Payload) -> Result<Box<dyn Agent>, AgentError> + Send + Sync + 'static
    {
        move |id: &AgentId, params: &Payload| {
            let params: WorkloadParams = parse(params)?;
            let cost = Normal::new(params.mean_ms, params.std_ms)
                .map_err(|e| AgentError::failed(format!("invalid workload cost: {}", e)))?;

            Ok(Box::new(WorkloadAgent {
                clock: Arc::clone(&clock),
                cost,
                topic: params.topic.unwrap_or_else(|| format!("telemetry.{}", id)),
                stream: stream_of(id),
                rng: None,
                sequence: 0,
            }) as Box<dyn Agent>)
        }
    }
}

impl Agent for WorkloadAgent {
    fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        let seed = ctx.env().derive_seed(self.stream);
        self.rng = Some(ChaCha8Rng::seed_from_u64(seed));
        Ok(())
    }

    fn execute(
        &mut self,
        ctx: &mut AgentContext<'_>,
        _current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        let rng = self
            .rng
            .as_mut()
            .ok_or_else(|| AgentError::failed("executed before setup"))?;

        let cost_ms = self.cost.sample(rng).max(0.0);
        self.clock.advance_time(Duration::from_secs_f64(cost_ms / 1000.0));
        self.sequence += 1;

        ctx.publish(
            &self.topic,
            json!({ "sequence": self.sequence, "cost_ms": cost_ms }),
        )?;
        Ok(())
    }
}

// ============================================================================
// RECORDER
// ============================================================================

/// One delivery observed by a [`Recorder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedMessage {
    pub recipient: AgentId,

    /// Simulated time of the tick that delivered the message
    pub received_at: f64,

    pub topic: String,
    pub sender: AgentId,
    pub timestamp: f64,
    pub payload: Payload,
}

/// Delivery log shared between recorders and the scenario that owns them.
///
/// Lives outside the agent so it survives restarts.
#[derive(Debug, Clone, Default)]
pub struct MessageLog(Arc<Mutex<Vec<RecordedMessage>>>);

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: RecordedMessage) -> Result<(), AgentError> {
        self.0
            .lock()
            .map_err(|_| AgentError::failed("message log poisoned"))?
            .push(entry);
        Ok(())
    }

    /// Snapshot of all recorded deliveries.
    pub fn entries(&self) -> Vec<RecordedMessage> {
        match self.0.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Recorded deliveries on `topic`.
    pub fn on_topic(&self, topic: &str) -> Vec<RecordedMessage> {
        self.entries()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RecorderParams {
    topics: Vec<String>,
}

impl Default for RecorderParams {
    fn default() -> Self {
        Self {
            topics: vec![topics::WILDCARD.to_string()],
        }
    }
}

/// Subscribes to `topics` (default: everything) and logs each delivery.
pub struct Recorder {
    log: MessageLog,
    topics: Vec<String>,
}

impl Recorder {
    /// Builds a factory writing into `log`.
    pub fn factory(
        log: MessageLog,
    ) -> impl Fn(&AgentId, &Payload) -> Result<Box<dyn Agent>, AgentError> + Send + Sync + 'static
    {
        move |_id: &AgentId, params: &Payload| {
            let params: RecorderParams = parse(params)?;
            Ok(Box::new(Recorder {
                log: log.clone(),
                topics: params.topics,
            }) as Box<dyn Agent>)
        }
    }
}

impl Agent for Recorder {
    fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        for topic in &self.topics {
            ctx.subscribe(topic)?;
        }
        Ok(())
    }

    fn execute(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        _current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    fn on_message(
        &mut self,
        ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<(), AgentError> {
        self.log.push(RecordedMessage {
            recipient: ctx.id().clone(),
            received_at: ctx.current_time(),
            topic: message.topic().to_string(),
            sender: message.sender().clone(),
            timestamp: message.timestamp(),
            payload: message.payload().clone(),
        })
    }
}

// ============================================================================
// WATCHDOG
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct WatchdogParams {
    watch: Vec<AgentId>,

    #[serde(default = "default_restart_topic")]
    topic: String,
}

fn default_restart_topic() -> String {
    topics::LIFECYCLE_RESTART.to_string()
}

/// Publishes a restart request for every watched agent found in FAULT.
///
/// Parameters: `watch` (list of ids, required), `topic` (default
/// `cmd.lifecycle.restart`).
pub struct Watchdog {
    watch: Vec<AgentId>,
    topic: String,
}

impl Watchdog {
    pub fn create(_id: &AgentId, params: &Payload) -> Result<Box<dyn Agent>, AgentError> {
        let params: WatchdogParams = parse(params)?;
        Ok(Box::new(Self {
            watch: params.watch,
            topic: params.topic,
        }))
    }
}

impl Agent for Watchdog {
    fn execute(
        &mut self,
        ctx: &mut AgentContext<'_>,
        current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        for id in &self.watch {
            match ctx.agent_status(id) {
                Some(AgentStatus::Fault) => {
                    debug!("Watchdog requesting restart of {} at t={:.3}", id, current_time);
                    ctx.publish(&self.topic, json!({ "agent_id": id }))?;
                }
                None => warn!("Watchdog watching unknown agent {}", id),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// RELAY
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct RelayParams {
    listen: String,
    forward: Vec<String>,
}

/// Re-publishes each first-hand message on every `forward` topic.
///
/// Forwarded copies carry `"hops": 1` and are not forwarded again.
pub struct Relay {
    listen: String,
    forward: Vec<String>,
}

impl Relay {
    pub fn create(_id: &AgentId, params: &Payload) -> Result<Box<dyn Agent>, AgentError> {
        let params: RelayParams = parse(params)?;
        Ok(Box::new(Self {
            listen: params.listen,
            forward: params.forward,
        }))
    }
}

impl Agent for Relay {
    fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        ctx.subscribe(&self.listen)?;
        Ok(())
    }

    fn execute(
        &mut self,
        _ctx: &mut AgentContext<'_>,
        _current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    fn on_message(
        &mut self,
        ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<(), AgentError> {
        let hops = message.field("hops").and_then(Payload::as_u64).unwrap_or(0);
        if hops > 0 {
            return Ok(());
        }

        for topic in &self.forward {
            ctx.publish(topic, json!({ "hops": hops + 1, "origin": message.topic() }))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrotwin_core::{AgentKernel, KernelConfig};

    fn sim_kernel(seed: u64) -> (AgentKernel, Arc<SimContext>) {
        let clock = SimContext::shared(seed);
        let kernel = AgentKernel::with_context(KernelConfig::default(), clock.clone());
        (kernel, clock)
    }

    #[test]
    fn test_faulty_agent_window() {
        let (mut kernel, _clock) = sim_kernel(1);
        kernel
            .add_agent(
                FaultyAgent::create,
                "sensor",
                json!({"fail_at": 2.0, "recover_at": 3.0}),
            )
            .unwrap();
        kernel.start(1.0).unwrap();

        kernel.tick().unwrap();
        kernel.tick().unwrap();
        assert_eq!(kernel.agent_status(&"sensor".into()), Some(AgentStatus::Running));

        kernel.tick().unwrap();
        assert_eq!(kernel.agent_status(&"sensor".into()), Some(AgentStatus::Fault));

        // Past the window a restarted instance runs cleanly
        kernel.restart_agent(&"sensor".into()).unwrap();
        kernel.tick().unwrap();
        assert_eq!(kernel.agent_status(&"sensor".into()), Some(AgentStatus::Running));
    }

    #[test]
    fn test_faulty_agent_bad_phase() {
        let (mut kernel, _clock) = sim_kernel(1);
        let result = kernel.add_agent(FaultyAgent::create, "sensor", json!({"phase": "teardown"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_chaos_agent_is_deterministic() {
        let faults = |seed: u64| {
            let (mut kernel, _clock) = sim_kernel(seed);
            kernel
                .add_agent(ChaosAgent::create, "chaos", json!({"failure_rate": 0.3}))
                .unwrap();
            kernel.start(1.0).unwrap();

            let mut fault_ticks = Vec::new();
            for tick in 0..50 {
                if !kernel.tick().unwrap().faulted.is_empty() {
                    fault_ticks.push(tick);
                    kernel.restart_agent(&"chaos".into()).unwrap();
                }
            }
            fault_ticks
        };

        let first = faults(42);
        assert!(!first.is_empty());
        assert_eq!(first, faults(42));
    }

    #[test]
    fn test_chaos_agent_rejects_bad_rate() {
        let (mut kernel, _clock) = sim_kernel(1);
        let result = kernel.add_agent(ChaosAgent::create, "chaos", json!({"failure_rate": 1.5}));
        assert!(result.is_err());
    }

    #[test]
    fn test_workload_advances_virtual_clock() {
        let (mut kernel, clock) = sim_kernel(9);
        kernel
            .add_agent(
                WorkloadAgent::factory(clock.clone()),
                "solver",
                json!({"mean_ms": 5.0, "std_ms": 0.0}),
            )
            .unwrap();
        kernel.start(1.0).unwrap();
        let report = kernel.tick().unwrap();

        assert_eq!(clock.now(), Duration::from_millis(5));
        assert_eq!(
            kernel.agent_performance()[&AgentId::from("solver")],
            Duration::from_millis(5)
        );
        // Unsubscribed telemetry is discarded and the topic forgotten
        assert_eq!(report.dispatch.discarded, 1);
        assert_eq!(kernel.topic_queue_lengths().get("telemetry.solver"), None);
    }

    #[test]
    fn test_recorder_and_watchdog() {
        let (mut kernel, _clock) = sim_kernel(3);
        let log = MessageLog::new();

        kernel
            .add_agent(FaultyAgent::create, "gate", json!({"fail_at": 1.0}))
            .unwrap();
        kernel
            .add_agent(Watchdog::create, "watchdog", json!({"watch": ["gate"]}))
            .unwrap();
        kernel
            .add_agent(Recorder::factory(log.clone()), "recorder", json!(null))
            .unwrap();
        kernel.start(1.0).unwrap();

        kernel.tick().unwrap();
        assert!(log.is_empty());

        kernel.tick().unwrap();
        let requests = log.on_topic(topics::LIFECYCLE_RESTART);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].sender, "watchdog");
        assert_eq!(requests[0].payload, json!({"agent_id": "gate"}));
        assert_eq!(requests[0].received_at, 1.0);
    }

    #[test]
    fn test_relay_forwards_once() {
        let (mut kernel, _clock) = sim_kernel(3);
        let log = MessageLog::new();

        kernel
            .add_agent(Relay::create, "relay", json!({"listen": "a", "forward": ["a", "b"]}))
            .unwrap();
        kernel
            .add_agent(Recorder::factory(log.clone()), "recorder", json!({}))
            .unwrap();
        kernel.start(1.0).unwrap();

        kernel.publish(Message::new("a", "ops", json!({}), 0.0).unwrap());
        for _ in 0..3 {
            kernel.tick().unwrap();
        }

        assert_eq!(log.on_topic("a").len(), 2);
        assert_eq!(log.on_topic("b").len(), 1);
    }
}
