//! Kernel guarantee scenarios.

use crate::error::SimError;
use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// KRN-001: fault inside a time window, watchdog + lifecycle restart
    FaultRecovery,

    /// KRN-002: performance snapshots on a simulated-time interval
    MonitoringCadence,

    /// KRN-003: messages published mid-dispatch wait for the next tick
    DeferredDelivery,

    /// KRN-004: one failing subscriber does not affect the others
    SubscriberIsolation,

    /// KRN-005: random faults, every one of them restarted
    ChaosRestart,

    /// KRN-006: state-machine pump through start, trip, reset
    PumpCycle,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::FaultRecovery,
            ScenarioId::MonitoringCadence,
            ScenarioId::DeferredDelivery,
            ScenarioId::SubscriberIsolation,
            ScenarioId::ChaosRestart,
            ScenarioId::PumpCycle,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::FaultRecovery => "fault_recovery",
            ScenarioId::MonitoringCadence => "monitoring_cadence",
            ScenarioId::DeferredDelivery => "deferred_delivery",
            ScenarioId::SubscriberIsolation => "subscriber_isolation",
            ScenarioId::ChaosRestart => "chaos_restart",
            ScenarioId::PumpCycle => "pump_cycle",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::FaultRecovery => {
                "Sensor faults mid-run, watchdog requests restart, sensor returns to RUNNING"
            }
            ScenarioId::MonitoringCadence => {
                "Monitoring publishes every 3 steps of simulated time with non-zero execution times"
            }
            ScenarioId::DeferredDelivery => {
                "Re-published and late-topic messages are delivered on the following tick"
            }
            ScenarioId::SubscriberIsolation => {
                "A faulting subscriber is isolated; other subscribers see every message"
            }
            ScenarioId::ChaosRestart => "Seeded random faults, each restarted within its tick",
            ScenarioId::PumpCycle => "Pump state machine: stopped, starting, running, fault, reset",
        }
    }

    /// Fewest ticks the scenario needs to exercise its assertions.
    pub fn min_ticks(&self) -> u64 {
        match self {
            ScenarioId::FaultRecovery => 10,
            ScenarioId::MonitoringCadence => 7,
            ScenarioId::DeferredDelivery => 3,
            ScenarioId::SubscriberIsolation => 3,
            ScenarioId::ChaosRestart => 20,
            ScenarioId::PumpCycle => 16,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fault_recovery" | "faultrecovery" | "krn-001" => Ok(ScenarioId::FaultRecovery),
            "monitoring_cadence" | "monitoringcadence" | "krn-002" => {
                Ok(ScenarioId::MonitoringCadence)
            }
            "deferred_delivery" | "deferreddelivery" | "krn-003" => {
                Ok(ScenarioId::DeferredDelivery)
            }
            "subscriber_isolation" | "subscriberisolation" | "krn-004" => {
                Ok(ScenarioId::SubscriberIsolation)
            }
            "chaos_restart" | "chaosrestart" | "krn-005" => Ok(ScenarioId::ChaosRestart),
            "pump_cycle" | "pumpcycle" | "krn-006" => Ok(ScenarioId::PumpCycle),
            _ => Err(SimError::UnknownScenario(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for id in ScenarioId::all() {
            assert_eq!(id.name().parse::<ScenarioId>().unwrap(), id);
            assert_eq!(id.to_string(), id.name());
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("KRN-003".parse::<ScenarioId>().unwrap(), ScenarioId::DeferredDelivery);
        assert!(matches!(
            "split_brain".parse::<ScenarioId>(),
            Err(SimError::UnknownScenario(_))
        ));
    }
}
