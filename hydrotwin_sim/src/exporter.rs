//! JSON exporter for offline inspection of a scenario run.
//!
//! One [`SimFrame`] per tick: agent statuses, execution probes, queue
//! depths and notable events.

use crate::error::SimError;
use hydrotwin_core::{AgentKernel, AgentStatus, TickReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds (start of the tick)
    pub time_sec: f64,

    /// Per-agent state after the tick
    pub agents: Vec<AgentFrame>,

    /// Pending messages per topic after the tick
    pub queue_lengths: BTreeMap<String, usize>,

    /// Successful deliveries during the tick
    pub delivered: usize,

    /// Events (faults, restarts, discarded messages)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SimEvent>,
}

impl SimFrame {
    /// Captures the kernel state right after `report`'s tick.
    pub fn capture(kernel: &AgentKernel, report: &TickReport, events: Vec<SimEvent>) -> Self {
        let performance = kernel.agent_performance();
        let statuses = kernel.agent_statuses();
        let agents = kernel
            .agent_ids()
            .into_iter()
            .map(|id| AgentFrame {
                status: statuses.get(&id).copied().unwrap_or(AgentStatus::Stopped),
                execution_ms: performance.get(&id).map(|d| d.as_secs_f64() * 1000.0),
                restarts: kernel.restart_count(&id).unwrap_or(0),
                agent_id: id.to_string(),
            })
            .collect();

        Self {
            time_sec: report.time,
            agents,
            queue_lengths: kernel.topic_queue_lengths(),
            delivered: report.dispatch.delivered,
            events,
        }
    }
}

/// Agent frame data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFrame {
    pub agent_id: String,
    pub status: AgentStatus,

    /// Duration of the last `execute` call
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub execution_ms: Option<f64>,

    pub restarts: u32,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("warn".to_string()),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_round_trip_through_file() {
        let mut export = SimExport::new("pump_cycle", 42);
        export.add_frame(SimFrame {
            time_sec: 2.0,
            agents: vec![AgentFrame {
                agent_id: "p1".to_string(),
                status: AgentStatus::Running,
                execution_ms: Some(0.5),
                restarts: 0,
            }],
            queue_lengths: BTreeMap::from([("state.p1".to_string(), 0)]),
            delivered: 1,
            events: vec![SimEvent::warn("p1 faulted")],
        });
        export.finalize(true, None);

        let path = std::env::temp_dir().join("hydrotwin_export_test.json");
        let path = path.to_string_lossy().to_string();
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back: SimExport = serde_json::from_str(&text).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(back.duration_sec, 2.0);
        assert_eq!(back.frames[0].agents[0].status, AgentStatus::Running);
        assert_eq!(back.frames[0].events[0].level.as_deref(), Some("warn"));
        assert!(text.contains("\"RUNNING\""));
    }
}
