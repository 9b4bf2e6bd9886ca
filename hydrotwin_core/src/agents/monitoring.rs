//! Periodic performance telemetry.

use crate::agent::{Agent, AgentContext};
use crate::agents::{f64_param, str_param};
use crate::error::AgentError;
use crate::kernel::TIME_EPSILON;
use crate::message::{topics, Payload};
use hydrotwin_env::AgentId;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Default publish interval in simulated seconds.
pub const DEFAULT_INTERVAL: f64 = 5.0;

/// Publishes a performance snapshot every `interval` simulated seconds.
///
/// Payload:
///
/// ```text
/// {
///   "timestamp": <simulated seconds>,
///   "agent_execution_times": { "<id>": <seconds of last execute>, ... },
///   "topic_queue_lengths": { "<topic>": <pending>, ... }
/// }
/// ```
///
/// The interval is measured in simulated time, not ticks: with
/// `interval = 3.0` and a 1 s step it publishes on every third tick.
///
/// Parameters: `interval` (default 5.0), `topic` (default
/// `system.performance`).
pub struct Monitoring {
    interval: f64,
    topic: String,

    /// Simulated time of the last publication
    last_publish: f64,
}

impl Monitoring {
    pub fn new(interval: f64, topic: impl Into<String>) -> Result<Self, AgentError> {
        if !interval.is_finite() || interval <= 0.0 {
            return Err(AgentError::failed(format!(
                "monitoring interval must be positive, got {}",
                interval
            )));
        }

        Ok(Self {
            interval,
            topic: topic.into(),
            last_publish: 0.0,
        })
    }

    /// Factory for `AgentKernel::add_agent`.
    pub fn create(_id: &AgentId, params: &Payload) -> Result<Box<dyn Agent>, AgentError> {
        let interval = f64_param(params, "interval", DEFAULT_INTERVAL)?;
        let topic = str_param(params, "topic", topics::PERFORMANCE)?;
        Ok(Box::new(Self::new(interval, topic)?))
    }
}

impl Agent for Monitoring {
    fn execute(
        &mut self,
        ctx: &mut AgentContext<'_>,
        current_time: f64,
        _time_step: f64,
    ) -> Result<(), AgentError> {
        if current_time - self.last_publish + TIME_EPSILON < self.interval {
            return Ok(());
        }
        self.last_publish = current_time;

        let execution_times: BTreeMap<String, f64> = ctx
            .agent_performance()
            .into_iter()
            .map(|(id, elapsed)| (id.to_string(), elapsed.as_secs_f64()))
            .collect();

        let payload = json!({
            "timestamp": current_time,
            "agent_execution_times": execution_times,
            "topic_queue_lengths": ctx.topic_queue_lengths(),
        });

        debug!("Publishing performance snapshot at t={:.3}", current_time);
        ctx.publish(&self.topic, payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::config::KernelConfig;
    use crate::kernel::AgentKernel;
    use crate::message::Message;
    use std::sync::{Arc, Mutex};

    /// Stores every performance payload it receives.
    struct Capture {
        seen: Arc<Mutex<Vec<Payload>>>,
    }

    impl Agent for Capture {
        fn setup(&mut self, ctx: &mut AgentContext<'_>) -> Result<(), AgentError> {
            ctx.subscribe(topics::PERFORMANCE)?;
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
            self.seen.lock().unwrap().push(message.payload().clone());
            Ok(())
        }
    }

    fn kernel_with_capture(params: Payload) -> (AgentKernel, Arc<Mutex<Vec<Payload>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut kernel = AgentKernel::new(KernelConfig::default());
        kernel.add_agent(Monitoring::create, "monitor", params).unwrap();
        kernel
            .add_agent(
                move |_id: &AgentId, _params: &Payload| {
                    Ok(Box::new(Capture {
                        seen: Arc::clone(&sink),
                    }) as Box<dyn Agent>)
                },
                "capture",
                json!({}),
            )
            .unwrap();
        kernel.start(1.0).unwrap();
        (kernel, seen)
    }

    #[test]
    fn test_publishes_every_interval_not_every_tick() {
        let (mut kernel, seen) = kernel_with_capture(json!({"interval": 3.0}));

        for _ in 0..10 {
            kernel.tick().unwrap();
        }

        let timestamps: Vec<f64> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p["timestamp"].as_f64())
            .collect();
        assert_eq!(timestamps, vec![3.0, 6.0, 9.0]);
    }

    #[test]
    fn test_payload_shape() {
        let (mut kernel, seen) = kernel_with_capture(json!({"interval": 3.0}));

        for _ in 0..7 {
            kernel.tick().unwrap();
        }

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();

        let times = last["agent_execution_times"].as_object().unwrap();
        assert!(times.contains_key("monitor"));
        assert!(times.contains_key("capture"));
        assert!(times.values().all(|v| v.as_f64().is_some_and(|s| s >= 0.0)));

        // The topic was known by the second publication, with nothing pending
        assert_eq!(last["topic_queue_lengths"][topics::PERFORMANCE], json!(0));
    }

    #[test]
    fn test_default_interval() {
        let (mut kernel, seen) = kernel_with_capture(json!({}));

        for _ in 0..5 {
            kernel.tick().unwrap();
        }
        assert!(seen.lock().unwrap().is_empty());

        kernel.tick().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        let mut kernel = AgentKernel::new(KernelConfig::default());
        let err = kernel
            .add_agent(Monitoring::create, "monitor", json!({"interval": 0.0}))
            .unwrap_err();

        assert!(err.to_string().contains("interval"));
        assert_eq!(kernel.agent_status(&AgentId::from("monitor")), None::<AgentStatus>);
    }
}
