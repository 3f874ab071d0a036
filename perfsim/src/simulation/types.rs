//! Simulation records and their typed parameters.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SimulatorConfig;
use crate::error::{PerfSimError, PerfSimResult};
use crate::time::add_duration;

/// Kind of synthetic workload a simulation declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationType {
    /// Sustained CPU burn.
    CpuStress,
    /// Retained memory allocation.
    MemoryPressure,
    /// Global blocking window honored by concurrent requests.
    RequestBlocking,
    /// Requests that are slow on their own.
    SlowRequest,
    /// Session lock held to serialize requests.
    SessionLock,
}

impl SimulationType {
    /// Every kind, in display order.
    pub const ALL: [SimulationType; 5] = [
        SimulationType::CpuStress,
        SimulationType::MemoryPressure,
        SimulationType::RequestBlocking,
        SimulationType::SlowRequest,
        SimulationType::SessionLock,
    ];

    /// Wire name, e.g. `CPU_STRESS`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationType::CpuStress => "CPU_STRESS",
            SimulationType::MemoryPressure => "MEMORY_PRESSURE",
            SimulationType::RequestBlocking => "REQUEST_BLOCKING",
            SimulationType::SlowRequest => "SLOW_REQUEST",
            SimulationType::SessionLock => "SESSION_LOCK",
        }
    }
}

impl fmt::Display for SimulationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status. Only `Active` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    /// Running until its scheduled end.
    Active,
    /// Ran to (or past) its scheduled end.
    Completed,
    /// Cancelled before its scheduled end.
    Stopped,
}

impl SimulationStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SimulationStatus::Active)
    }
}

/// Parameters of a CPU stress simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStressParams {
    /// Declared load, 1..=100 percent.
    pub target_load_percent: u8,
}

/// Parameters of a memory pressure simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPressureParams {
    /// Amount of memory held, in megabytes.
    pub size_mb: u32,
}

/// Parameters of a request blocking window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBlockingParams {
    /// Length of the window.
    pub duration_seconds: u64,
    /// Number of out-of-band workers spawned alongside the window.
    pub concurrent_workers: u32,
}

/// Parameters of a slow request simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowRequestParams {
    /// Delay each slow request incurs.
    pub delay_seconds: u64,
}

/// Parameters of a session lock hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLockParams {
    /// Session whose lock is held.
    pub session_id: String,
    /// How long the holder keeps the lock.
    pub hold_seconds: u64,
}

/// Typed parameters, one variant per [`SimulationType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationParams {
    /// CPU stress parameters.
    CpuStress(CpuStressParams),
    /// Memory pressure parameters.
    MemoryPressure(MemoryPressureParams),
    /// Request blocking parameters.
    RequestBlocking(RequestBlockingParams),
    /// Slow request parameters.
    SlowRequest(SlowRequestParams),
    /// Session lock parameters.
    SessionLock(SessionLockParams),
}

impl SimulationParams {
    /// CPU stress at `target_load_percent`.
    pub fn cpu_stress(target_load_percent: u8) -> Self {
        SimulationParams::CpuStress(CpuStressParams {
            target_load_percent,
        })
    }

    /// Memory pressure of `size_mb`.
    pub fn memory_pressure(size_mb: u32) -> Self {
        SimulationParams::MemoryPressure(MemoryPressureParams { size_mb })
    }

    /// Slow requests delayed by `delay_seconds`.
    pub fn slow_request(delay_seconds: u64) -> Self {
        SimulationParams::SlowRequest(SlowRequestParams { delay_seconds })
    }

    /// The kind these parameters belong to.
    pub fn simulation_type(&self) -> SimulationType {
        match self {
            SimulationParams::CpuStress(_) => SimulationType::CpuStress,
            SimulationParams::MemoryPressure(_) => SimulationType::MemoryPressure,
            SimulationParams::RequestBlocking(_) => SimulationType::RequestBlocking,
            SimulationParams::SlowRequest(_) => SimulationType::SlowRequest,
            SimulationParams::SessionLock(_) => SimulationType::SessionLock,
        }
    }

    /// Check magnitudes against the configured bounds.
    pub fn validate(&self, config: &SimulatorConfig) -> PerfSimResult<()> {
        match self {
            SimulationParams::CpuStress(p) => {
                if !(1..=100).contains(&p.target_load_percent) {
                    return Err(PerfSimError::invalid(
                        "targetLoadPercent",
                        format!("must be between 1 and 100, got {}", p.target_load_percent),
                    ));
                }
            }
            SimulationParams::MemoryPressure(p) => {
                if p.size_mb == 0 || p.size_mb > config.max_memory_mb {
                    return Err(PerfSimError::invalid(
                        "sizeMb",
                        format!(
                            "must be between 1 and {}, got {}",
                            config.max_memory_mb, p.size_mb
                        ),
                    ));
                }
            }
            SimulationParams::RequestBlocking(p) => {
                config.check_duration("durationSeconds", p.duration_seconds)?;
                if p.concurrent_workers == 0 || p.concurrent_workers > config.max_concurrent_workers
                {
                    return Err(PerfSimError::invalid(
                        "concurrentWorkers",
                        format!(
                            "must be between 1 and {}, got {}",
                            config.max_concurrent_workers, p.concurrent_workers
                        ),
                    ));
                }
            }
            SimulationParams::SlowRequest(p) => {
                config.check_duration("delaySeconds", p.delay_seconds)?;
            }
            SimulationParams::SessionLock(p) => {
                config.check_session_id(&p.session_id)?;
                config.check_duration("holdSeconds", p.hold_seconds)?;
                if p.hold_seconds > config.max_lock_hold_secs {
                    return Err(PerfSimError::invalid(
                        "holdSeconds",
                        format!(
                            "must be at most {}, got {}",
                            config.max_lock_hold_secs, p.hold_seconds
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn to_value(&self) -> Value {
        let encoded = match self {
            SimulationParams::CpuStress(p) => serde_json::to_value(p),
            SimulationParams::MemoryPressure(p) => serde_json::to_value(p),
            SimulationParams::RequestBlocking(p) => serde_json::to_value(p),
            SimulationParams::SlowRequest(p) => serde_json::to_value(p),
            SimulationParams::SessionLock(p) => serde_json::to_value(p),
        };
        // Structs of scalars and strings always encode.
        encoded.unwrap_or(Value::Null)
    }

    fn from_value(kind: SimulationType, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            SimulationType::CpuStress => {
                SimulationParams::CpuStress(serde_json::from_value(value)?)
            }
            SimulationType::MemoryPressure => {
                SimulationParams::MemoryPressure(serde_json::from_value(value)?)
            }
            SimulationType::RequestBlocking => {
                SimulationParams::RequestBlocking(serde_json::from_value(value)?)
            }
            SimulationType::SlowRequest => {
                SimulationParams::SlowRequest(serde_json::from_value(value)?)
            }
            SimulationType::SessionLock => {
                SimulationParams::SessionLock(serde_json::from_value(value)?)
            }
        })
    }
}

/// A declared, time-bounded synthetic workload.
///
/// `scheduled_end_at` is fixed at creation. `status` only ever moves from
/// `Active` to one terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SimulationRecord", into = "SimulationRecord")]
pub struct Simulation {
    id: String,
    params: SimulationParams,
    status: SimulationStatus,
    started_at: DateTime<Utc>,
    scheduled_end_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl Simulation {
    pub(crate) fn start(params: SimulationParams, duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_id(now),
            params,
            status: SimulationStatus::Active,
            started_at: now,
            scheduled_end_at: add_duration(now, duration),
            completed_at: None,
        }
    }

    /// Unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kind, derived from the parameters.
    pub fn simulation_type(&self) -> SimulationType {
        self.params.simulation_type()
    }

    /// Typed parameters.
    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Current status.
    pub fn status(&self) -> SimulationStatus {
        self.status
    }

    /// Creation instant.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Declared end instant.
    pub fn scheduled_end_at(&self) -> DateTime<Utc> {
        self.scheduled_end_at
    }

    /// Instant of the terminal transition, if any.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Whether the status is `Active`.
    pub fn is_active(&self) -> bool {
        self.status == SimulationStatus::Active
    }

    /// Active although its scheduled end has passed.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.scheduled_end_at < now
    }

    /// Active and not yet past its scheduled end.
    pub fn is_running_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.scheduled_end_at > now
    }

    /// Move to a terminal status. Returns false, changing nothing, when the
    /// record is already terminal or `to` is `Active`.
    pub(crate) fn finish(&mut self, to: SimulationStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !to.is_terminal() {
            return false;
        }
        self.status = to;
        self.completed_at = Some(now);
        true
    }
}

fn generate_id(now: DateTime<Utc>) -> String {
    format!(
        "sim_{:x}_{:016x}",
        now.timestamp_millis().max(0),
        rand::random::<u64>()
    )
}

/// Wire form of a [`Simulation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulationRecord {
    id: String,
    #[serde(rename = "type")]
    kind: SimulationType,
    status: SimulationStatus,
    parameters: Value,
    started_at: DateTime<Utc>,
    scheduled_end_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SimulationRecord> for Simulation {
    type Error = serde_json::Error;

    fn try_from(record: SimulationRecord) -> Result<Self, Self::Error> {
        Ok(Simulation {
            id: record.id,
            params: SimulationParams::from_value(record.kind, record.parameters)?,
            status: record.status,
            started_at: record.started_at,
            scheduled_end_at: record.scheduled_end_at,
            completed_at: record.completed_at,
        })
    }
}

impl From<Simulation> for SimulationRecord {
    fn from(sim: Simulation) -> Self {
        SimulationRecord {
            kind: sim.params.simulation_type(),
            parameters: sim.params.to_value(),
            id: sim.id,
            status: sim.status,
            started_at: sim.started_at,
            scheduled_end_at: sim.scheduled_end_at,
            completed_at: sim.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape_is_camel_case_with_type_tag() {
        let now = Utc::now();
        let sim = Simulation::start(SimulationParams::cpu_stress(75), Duration::from_secs(5), now);
        let value = serde_json::to_value(&sim).unwrap();

        assert_eq!(value["type"], "CPU_STRESS");
        assert_eq!(value["status"], "ACTIVE");
        assert_eq!(value["parameters"], json!({"targetLoadPercent": 75}));
        assert!(value["startedAt"].is_string());
        assert!(value["scheduledEndAt"].is_string());
        assert!(value.get("completedAt").is_none());

        let back: Simulation = serde_json::from_value(value).unwrap();
        assert_eq!(back, sim);
    }

    #[test]
    fn test_parameters_must_match_type() {
        let value = json!({
            "id": "sim_1",
            "type": "MEMORY_PRESSURE",
            "status": "ACTIVE",
            "parameters": {"targetLoadPercent": 50},
            "startedAt": "2026-01-01T00:00:00Z",
            "scheduledEndAt": "2026-01-01T00:00:05Z"
        });
        assert!(serde_json::from_value::<Simulation>(value).is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let now = Utc::now();
        let mut sim =
            Simulation::start(SimulationParams::slow_request(2), Duration::from_secs(2), now);

        assert!(!sim.finish(SimulationStatus::Active, now));
        assert!(sim.finish(SimulationStatus::Stopped, now));
        assert!(!sim.finish(SimulationStatus::Completed, now));
        assert_eq!(sim.status(), SimulationStatus::Stopped);
    }

    #[test]
    fn test_stale_and_running_windows() {
        let now = Utc::now();
        let sim = Simulation::start(SimulationParams::cpu_stress(10), Duration::from_secs(5), now);

        assert!(sim.is_running_at(now));
        assert!(!sim.is_stale_at(now + chrono::Duration::seconds(5)));
        assert!(sim.is_stale_at(now + chrono::Duration::seconds(6)));
        assert!(!sim.is_running_at(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_ids_are_unique() {
        let now = Utc::now();
        let a = Simulation::start(SimulationParams::cpu_stress(10), Duration::from_secs(1), now);
        let b = Simulation::start(SimulationParams::cpu_stress(10), Duration::from_secs(1), now);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("sim_"));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = SimulatorConfig::default();
        assert!(SimulationParams::cpu_stress(0).validate(&config).is_err());
        assert!(SimulationParams::cpu_stress(101).validate(&config).is_err());
        assert!(SimulationParams::cpu_stress(100).validate(&config).is_ok());
        assert!(SimulationParams::memory_pressure(0).validate(&config).is_err());

        let blocking = SimulationParams::RequestBlocking(RequestBlockingParams {
            duration_seconds: 10,
            concurrent_workers: 0,
        });
        assert!(matches!(
            blocking.validate(&config),
            Err(PerfSimError::InvalidParameter { name: "concurrentWorkers", .. })
        ));
    }
}
