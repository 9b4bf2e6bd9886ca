//! Pump model driven by a [`StateMachine`].
//!
//! ```text
//!            start              startup elapsed
//!  stopped ─────────► starting ─────────────────► running
//!     ▲                  │                           │
//!     │      stop        │          stop             │
//!     ├──────────────────┴───────────────────────────┘
//!     │ stop / reset
//!   fault ◄──── trip (from any state)
//! ```
//!
//! Commands arrive on `cmd.<id>` as `{"command": "<name>"}` or as a bare
//! string payload. After every tick the pump publishes
//! `{"state", "flow"}` on `state.<id>`.

use crate::agent::{Agent, AgentContext};
use crate::agents::{f64_param, str_param};
use crate::error::AgentError;
use crate::kernel::TIME_EPSILON;
use crate::message::{Message, Payload};
use crate::state_machine::{State, StateMachine, Transition};
use hydrotwin_env::AgentId;
use serde_json::json;
use tracing::{info, warn};

pub const STOPPED: &str = "stopped";
pub const STARTING: &str = "starting";
pub const RUNNING: &str = "running";
pub const FAULT: &str = "fault";

/// Physical state of the pump, shared by all of its states.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpData {
    /// Flow at full speed (m³/s)
    pub rated_flow: f64,

    /// Seconds from `start` to full speed
    pub startup_duration: f64,

    /// Current flow (m³/s)
    pub flow: f64,

    /// Simulated time the current startup began
    pub started_at: f64,
}

fn command(message: &Message) -> Option<&str> {
    message
        .str_field("command")
        .or_else(|| message.payload().as_str())
}

/// Commands every state honors. `None` means the state decides.
fn common_command(cmd: &str) -> Option<Transition> {
    match cmd {
        "trip" => Some(Transition::to(FAULT)),
        "stop" => Some(Transition::to(STOPPED)),
        _ => None,
    }
}

struct Stopped;

impl State<PumpData> for Stopped {
    fn on_enter(&mut self, data: &mut PumpData, _now: f64) {
        data.flow = 0.0;
    }

    fn execute(
        &mut self,
        _data: &mut PumpData,
        _ctx: &mut AgentContext<'_>,
    ) -> Result<Transition, AgentError> {
        Ok(Transition::Stay)
    }

    fn on_message(
        &mut self,
        _data: &mut PumpData,
        _ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<Transition, AgentError> {
        Ok(match command(message) {
            Some("start") => Transition::to(STARTING),
            Some(cmd) => common_command(cmd).unwrap_or(Transition::Stay),
            None => Transition::Stay,
        })
    }
}

struct Starting;

impl State<PumpData> for Starting {
    fn on_enter(&mut self, data: &mut PumpData, now: f64) {
        data.started_at = now;
    }

    fn execute(
        &mut self,
        data: &mut PumpData,
        ctx: &mut AgentContext<'_>,
    ) -> Result<Transition, AgentError> {
        let elapsed = ctx.current_time() - data.started_at;
        if data.startup_duration <= 0.0 || elapsed + TIME_EPSILON >= data.startup_duration {
            return Ok(Transition::to(RUNNING));
        }

        data.flow = data.rated_flow * (elapsed / data.startup_duration);
        Ok(Transition::Stay)
    }

    fn on_message(
        &mut self,
        _data: &mut PumpData,
        _ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<Transition, AgentError> {
        Ok(command(message)
            .and_then(common_command)
            .unwrap_or(Transition::Stay))
    }
}

struct Running;

impl State<PumpData> for Running {
    fn on_enter(&mut self, data: &mut PumpData, _now: f64) {
        data.flow = data.rated_flow;
    }

    fn execute(
        &mut self,
        _data: &mut PumpData,
        _ctx: &mut AgentContext<'_>,
    ) -> Result<Transition, AgentError> {
        Ok(Transition::Stay)
    }

    fn on_message(
        &mut self,
        _data: &mut PumpData,
        _ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<Transition, AgentError> {
        Ok(command(message)
            .and_then(common_command)
            .unwrap_or(Transition::Stay))
    }
}

struct Fault;

impl State<PumpData> for Fault {
    fn on_enter(&mut self, data: &mut PumpData, now: f64) {
        data.flow = 0.0;
        warn!("Pump tripped at t={:.3}", now);
    }

    fn execute(
        &mut self,
        _data: &mut PumpData,
        _ctx: &mut AgentContext<'_>,
    ) -> Result<Transition, AgentError> {
        Ok(Transition::Stay)
    }

    fn on_message(
        &mut self,
        _data: &mut PumpData,
        _ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<Transition, AgentError> {
        // A trip is cleared only by stop or reset, never by start
        Ok(match command(message) {
            Some("stop") | Some("reset") => Transition::to(STOPPED),
            _ => Transition::Stay,
        })
    }
}

/// Pump asset agent.
///
/// Parameters: `rated_flow` (default 1.0), `startup_duration` (default
/// 3.0), `command_topic` (default `cmd.<id>`), `state_topic` (default
/// `state.<id>`).
pub struct PumpAgent {
    machine: StateMachine<PumpData>,
    data: PumpData,
    command_topic: String,
    state_topic: String,
}

impl PumpAgent {
    /// Factory for `AgentKernel::add_agent`.
    pub fn create(id: &AgentId, params: &Payload) -> Result<Box<dyn Agent>, AgentError> {
        let rated_flow = f64_param(params, "rated_flow", 1.0)?;
        let startup_duration = f64_param(params, "startup_duration", 3.0)?;
        if rated_flow < 0.0 || startup_duration < 0.0 {
            return Err(AgentError::failed(
                "rated_flow and startup_duration must not be negative",
            ));
        }

        let mut data = PumpData {
            rated_flow,
            startup_duration,
            flow: 0.0,
            started_at: 0.0,
        };
        let machine = StateMachine::builder()
            .state(STOPPED, Stopped)
            .state(STARTING, Starting)
            .state(RUNNING, Running)
            .state(FAULT, Fault)
            .build(STOPPED, &mut data, 0.0)?;

        Ok(Box::new(Self {
            machine,
            data,
            command_topic: str_param(params, "command_topic", &format!("cmd.{}", id))?,
            state_topic: str_param(params, "state_topic", &format!("state.{}", id))?,
        }))
    }
}

impl Agent for PumpAgent {
    fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
        ctx.subscribe(&self.command_topic)?;
        info!("Pump {} listening on '{}'", ctx.id(), self.command_topic);
        Ok(())
    }

    fn execute(
        &mut self,
        ctx: &mut AgentContext<'_>,
        _current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        self.machine.execute(&mut self.data, ctx)?;

        let state = json!({
            "state": self.machine.current_state(),
            "flow": self.data.flow,
        });
        ctx.publish(&self.state_topic, state)?;
        Ok(())
    }

    fn on_message(
        &mut self,
        ctx: &mut AgentContext<'_>,
        message: &Message,
    ) -> Result<(), AgentError> {
        if command(message).is_none() {
            warn!("Pump {} ignoring message without command: {}", ctx.id(), message);
            return Ok(());
        }
        self.machine.handle_message(&mut self.data, ctx, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::AgentKernel;
    use approx::assert_relative_eq;
    use std::sync::{Arc, Mutex};

    /// Records `(state, flow)` from the pump's state topic.
    struct Gauge {
        readings: Arc<Mutex<Vec<(String, f64)>>>,
    }

    impl Agent for Gauge {
        fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
            ctx.subscribe("state.p1")?;
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
            _ctx: &mut AgentContext<'_>,
            message: &Message,
        ) -> Result<(), AgentError> {
            let state = message.str_field("state").unwrap_or_default().to_string();
            let flow = message.field("flow").and_then(Payload::as_f64).unwrap_or(-1.0);
            self.readings.lock().unwrap().push((state, flow));
            Ok(())
        }
    }

    fn pump_kernel() -> (AgentKernel, Arc<Mutex<Vec<(String, f64)>>>) {
        let readings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&readings);

        let mut kernel = AgentKernel::new(KernelConfig::default());
        kernel
            .add_agent(
                PumpAgent::create,
                "p1",
                json!({"rated_flow": 2.0, "startup_duration": 2.0}),
            )
            .unwrap();
        kernel
            .add_agent(
                move |_id: &AgentId, _params: &Payload| {
                    Ok(Box::new(Gauge {
                        readings: Arc::clone(&sink),
                    }) as Box<dyn Agent>)
                },
                "gauge",
                json!({}),
            )
            .unwrap();
        kernel.start(1.0).unwrap();
        (kernel, readings)
    }

    fn send(kernel: &mut AgentKernel, command: &str) {
        let time = kernel.current_time();
        kernel.publish(Message::new("cmd.p1", "ops", json!({"command": command}), time).unwrap());
    }

    fn last(readings: &Arc<Mutex<Vec<(String, f64)>>>) -> (String, f64) {
        readings.lock().unwrap().last().cloned().unwrap()
    }

    #[test]
    fn test_start_ramps_then_runs() {
        let (mut kernel, readings) = pump_kernel();

        kernel.tick().unwrap();
        assert_eq!(last(&readings).0, STOPPED);

        send(&mut kernel, "start");
        kernel.tick().unwrap();

        kernel.tick().unwrap();
        let (state, flow) = last(&readings);
        assert_eq!(state, STARTING);
        assert_relative_eq!(flow, 1.0);

        kernel.tick().unwrap();
        let (state, flow) = last(&readings);
        assert_eq!(state, RUNNING);
        assert_relative_eq!(flow, 2.0);
    }

    #[test]
    fn test_trip_and_reset() {
        let (mut kernel, readings) = pump_kernel();

        send(&mut kernel, "start");
        kernel.tick().unwrap();
        send(&mut kernel, "trip");
        kernel.tick().unwrap();
        kernel.tick().unwrap();
        assert_eq!(last(&readings), (FAULT.to_string(), 0.0));

        // A trip is not cleared by start
        send(&mut kernel, "start");
        kernel.tick().unwrap();
        kernel.tick().unwrap();
        assert_eq!(last(&readings).0, FAULT);

        send(&mut kernel, "reset");
        kernel.tick().unwrap();
        kernel.tick().unwrap();
        assert_eq!(last(&readings).0, STOPPED);
    }

    #[test]
    fn test_stop_clears_trip() {
        let (mut kernel, readings) = pump_kernel();

        send(&mut kernel, "trip");
        kernel.tick().unwrap();
        kernel.tick().unwrap();
        assert_eq!(last(&readings), (FAULT.to_string(), 0.0));

        send(&mut kernel, "stop");
        kernel.tick().unwrap();
        kernel.tick().unwrap();
        assert_eq!(last(&readings), (STOPPED.to_string(), 0.0));

        // A stopped pump starts again normally
        send(&mut kernel, "start");
        kernel.tick().unwrap();
        kernel.tick().unwrap();
        assert_eq!(last(&readings).0, STARTING);
    }

    #[test]
    fn test_bare_string_command() {
        let (mut kernel, readings) = pump_kernel();

        kernel.publish(Message::new("cmd.p1", "ops", json!("start"), 0.0).unwrap());
        kernel.tick().unwrap();
        kernel.tick().unwrap();

        assert_eq!(last(&readings).0, STARTING);
    }

    #[test]
    fn test_invalid_parameters() {
        let mut kernel = AgentKernel::new(KernelConfig::default());
        let result = kernel.add_agent(PumpAgent::create, "p1", json!({"rated_flow": -1.0}));
        assert!(result.is_err());

        let result = kernel.add_agent(PumpAgent::create, "p2", json!({"rated_flow": "high"}));
        assert!(result.is_err());
    }
}
