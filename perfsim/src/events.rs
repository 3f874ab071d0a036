//! Notification boundary for lifecycle events.
//!
//! Status transitions are reported to an external logging collaborator
//! through [`EventSink`]. Sinks return a `Result`, but the core never depends
//! on delivery: callers go through [`notify`], which discards failures after
//! logging them at debug level.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::simulation::{Simulation, SimulationStatus};
use crate::storage::{SharedStorage, StorageError, StorageExt};
use crate::time::Clock;

/// Storage key of the recent-events ring.
pub const EVENT_LOG_KEY: &str = "event_log";

/// Event codes emitted by the core.
pub mod codes {
    /// A simulation was created.
    pub const SIMULATION_STARTED: &str = "SIMULATION_STARTED";
    /// A simulation reached its end, explicitly or through reconciliation.
    pub const SIMULATION_COMPLETED: &str = "SIMULATION_COMPLETED";
    /// A simulation was cancelled.
    pub const SIMULATION_STOPPED: &str = "SIMULATION_STOPPED";
    /// A blocking window opened.
    pub const BLOCKING_WINDOW_STARTED: &str = "BLOCKING_WINDOW_STARTED";
    /// A blocking window closed.
    pub const BLOCKING_WINDOW_ENDED: &str = "BLOCKING_WINDOW_ENDED";
    /// A session lock hold ended.
    pub const SESSION_LOCK_RELEASED: &str = "SESSION_LOCK_RELEASED";
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Normal lifecycle progress.
    Info,
    /// Something degraded but handled.
    Warning,
    /// Something failed.
    Error,
}

/// Structured lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationEvent {
    /// Severity.
    pub level: EventLevel,
    /// Machine readable code, see [`codes`].
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Id of the record the event is about.
    pub subject_id: String,
    /// Kind of the record the event is about.
    pub subject_type: String,
}

impl SimulationEvent {
    /// Event describing a simulation's current status.
    pub fn for_simulation(sim: &Simulation) -> Self {
        let (code, verb) = match sim.status() {
            SimulationStatus::Active => (codes::SIMULATION_STARTED, "started"),
            SimulationStatus::Completed => (codes::SIMULATION_COMPLETED, "completed"),
            SimulationStatus::Stopped => (codes::SIMULATION_STOPPED, "stopped"),
        };
        Self {
            level: EventLevel::Info,
            code: code.to_string(),
            message: format!("{} simulation {} {}", sim.simulation_type(), sim.id(), verb),
            subject_id: sim.id().to_string(),
            subject_type: sim.simulation_type().as_str().to_string(),
        }
    }

    /// Event with an explicit code about a simulation.
    pub fn with_code(code: &str, message: impl Into<String>, sim: &Simulation) -> Self {
        Self {
            level: EventLevel::Info,
            code: code.to_string(),
            message: message.into(),
            subject_id: sim.id().to_string(),
            subject_type: sim.simulation_type().as_str().to_string(),
        }
    }
}

/// Errors a sink may report. The core logs and drops them.
#[derive(Debug, Error)]
pub enum EventError {
    /// Persisting the event failed.
    #[error("event storage failed: {0}")]
    Storage(#[from] StorageError),

    /// The collaborator refused the event.
    #[error("event rejected: {0}")]
    Rejected(String),
}

/// External logging collaborator.
#[async_trait]
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Deliver one event.
    async fn emit(&self, event: &SimulationEvent) -> Result<(), EventError>;
}

/// Deliver an event and deliberately ignore the outcome.
pub async fn notify(sink: &dyn EventSink, event: SimulationEvent) {
    if let Err(e) = sink.emit(&event).await {
        tracing::debug!(code = %event.code, error = %e, "event delivery failed");
    }
}

/// Sink that writes events to the `tracing` pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: &SimulationEvent) -> Result<(), EventError> {
        match event.level {
            EventLevel::Info => tracing::info!(
                code = %event.code,
                subject_id = %event.subject_id,
                subject_type = %event.subject_type,
                "{}",
                event.message
            ),
            EventLevel::Warning => tracing::warn!(
                code = %event.code,
                subject_id = %event.subject_id,
                subject_type = %event.subject_type,
                "{}",
                event.message
            ),
            EventLevel::Error => tracing::error!(
                code = %event.code,
                subject_id = %event.subject_id,
                subject_type = %event.subject_type,
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// Event as kept in the stored ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// The event itself.
    #[serde(flatten)]
    pub event: SimulationEvent,
}

/// Bounded ring of recent events kept in the shared store, so a polling
/// dashboard can show what happened in other processes.
///
/// Appends are read-modify-write without coordination; concurrent appends
/// may lose an event.
#[derive(Debug, Clone)]
pub struct StorageEventLog {
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    ttl: Duration,
}

impl StorageEventLog {
    /// Create a log keeping at most `capacity` events for `ttl`.
    pub fn new(
        storage: Arc<dyn SharedStorage>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Up to `limit` events, newest first.
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<LoggedEvent>, StorageError> {
        let events: Vec<LoggedEvent> = self
            .storage
            .get_json(EVENT_LOG_KEY)
            .await?
            .unwrap_or_default();
        Ok(events.into_iter().rev().take(limit).collect())
    }
}

#[async_trait]
impl EventSink for StorageEventLog {
    async fn emit(&self, event: &SimulationEvent) -> Result<(), EventError> {
        let mut events: Vec<LoggedEvent> = self
            .storage
            .get_json(EVENT_LOG_KEY)
            .await?
            .unwrap_or_default();
        events.push(LoggedEvent {
            timestamp: self.clock.now(),
            event: event.clone(),
        });
        if events.len() > self.capacity {
            let excess = events.len() - self.capacity;
            events.drain(..excess);
        }
        self.storage
            .set_json(EVENT_LOG_KEY, &events, Some(self.ttl))
            .await?;
        Ok(())
    }
}

/// Sink forwarding every event to several sinks.
#[derive(Debug, Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    /// Create a fanout over `sinks`.
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    /// Delivers to every sink and reports the first failure, if any.
    async fn emit(&self, event: &SimulationEvent) -> Result<(), EventError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulationParams;
    use crate::storage::InMemoryStorage;
    use crate::time::ManualClock;

    #[derive(Debug)]
    struct RejectingSink;

    #[async_trait]
    impl EventSink for RejectingSink {
        async fn emit(&self, _event: &SimulationEvent) -> Result<(), EventError> {
            Err(EventError::Rejected("collector offline".to_string()))
        }
    }

    fn sample_event(n: usize) -> SimulationEvent {
        SimulationEvent {
            level: EventLevel::Info,
            code: codes::SIMULATION_COMPLETED.to_string(),
            message: format!("event {}", n),
            subject_id: format!("sim_{}", n),
            subject_type: "CPU_STRESS".to_string(),
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let sim = Simulation::start(
            SimulationParams::cpu_stress(50),
            Duration::from_secs(1),
            Utc::now(),
        );
        let value = serde_json::to_value(SimulationEvent::for_simulation(&sim)).unwrap();

        assert_eq!(value["level"], "info");
        assert_eq!(value["code"], codes::SIMULATION_STARTED);
        assert_eq!(value["subjectId"], sim.id());
        assert_eq!(value["subjectType"], "CPU_STRESS");
    }

    #[tokio::test]
    async fn test_storage_event_log_keeps_newest_within_capacity() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let storage: Arc<dyn SharedStorage> = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        let log = StorageEventLog::new(storage, clock, 3, Duration::from_secs(60));

        for n in 0..5 {
            log.emit(&sample_event(n)).await.unwrap();
        }

        let recent = log.recent_events(10).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|e| e.event.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["sim_4", "sim_3", "sim_2"]);
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink_despite_failure() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let storage: Arc<dyn SharedStorage> = Arc::new(InMemoryStorage::with_clock(clock.clone()));
        let log = Arc::new(StorageEventLog::new(storage, clock, 10, Duration::from_secs(60)));
        let fanout = FanoutEventSink::new(vec![Arc::new(RejectingSink), log.clone()]);

        assert!(fanout.emit(&sample_event(1)).await.is_err());
        assert_eq!(log.recent_events(10).await.unwrap().len(), 1);

        // notify swallows the failure
        notify(&fanout, sample_event(2)).await;
        assert_eq!(log.recent_events(10).await.unwrap().len(), 2);
    }
}
