//! Global time-boxed blocking window.
//!
//! While a window is live, every request that calls
//! [`BlockingService::perform_blocking_if_active`] burns extra CPU, scaled by
//! how much of the window remains. The window is one stored entry under a
//! fixed key; starting a new window while one is live overwrites it and the
//! last writer wins.
//!
//! The stored window outlives its own end time by a slack period so that late
//! readers can observe it and complete the backing simulation. If the slack
//! also runs out before anyone reads it, the next read falls back to the
//! registry's stale reconciliation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SimulatorConfig;
use crate::error::PerfSimResult;
use crate::events::{codes, notify, EventLevel, EventSink, SimulationEvent};
use crate::simulation::{
    RequestBlockingParams, Simulation, SimulationParams, SimulationStatus, SimulationTracker,
    SimulationType,
};
use crate::storage::{SharedStorage, StorageExt};
use crate::time::{seconds_between, Clock};
use crate::work::burn_cpu;
use crate::workers::WorkerPool;

/// Storage key of the live window.
pub const BLOCKING_MODE_KEY: &str = "blocking_mode";

/// Lowest intensity applied while a window is live.
const MIN_INTENSITY: f64 = 0.5;

/// The stored blocking window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingWindow {
    /// Instant the window closes.
    pub end_time: DateTime<Utc>,
    /// Declared length.
    pub duration_seconds: u64,
    /// Instant the window opened.
    pub started_at: DateTime<Utc>,
    /// Backing REQUEST_BLOCKING simulation. A back-reference only: the window
    /// can vanish before the simulation is reconciled.
    pub simulation_id: String,
}

impl BlockingWindow {
    /// Whether the window's end time has been reached.
    pub fn is_over_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    /// Seconds left before the window closes, never negative.
    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(now, self.end_time).max(0.0)
    }

    /// Fraction of the window remaining, clamped to `[0.5, 1.0]`.
    pub fn intensity_at(&self, now: DateTime<Utc>) -> f64 {
        if self.duration_seconds == 0 {
            return 1.0;
        }
        let fraction = self.remaining_seconds_at(now) / self.duration_seconds as f64;
        fraction.clamp(MIN_INTENSITY, 1.0)
    }
}

/// Result of opening a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingStart {
    /// Backing simulation id.
    pub id: String,
    /// Always `REQUEST_BLOCKING`.
    #[serde(rename = "type")]
    pub kind: SimulationType,
    /// Human readable summary.
    pub message: String,
    /// Status of the backing simulation.
    pub status: SimulationStatus,
    /// Instant the window opened.
    pub started_at: DateTime<Utc>,
    /// Instant the window closes.
    pub scheduled_end_at: DateTime<Utc>,
    /// Declared length.
    pub duration_seconds: u64,
    /// Requested concurrent workers.
    pub concurrent_workers: u32,
    /// Workers actually admitted by the pool.
    pub spawned_workers: u32,
}

/// Work performed by one blocked request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingWork {
    /// Window the work was performed for.
    pub simulation_id: String,
    /// Applied intensity in `[0.5, 1.0]`.
    pub intensity: f64,
    /// CPU iterations performed.
    pub iterations: u64,
    /// Wall time spent working.
    pub elapsed_ms: u64,
    /// Seconds left in the window when the work started.
    pub remaining_seconds: f64,
}

/// Opens, observes and closes the blocking window.
#[derive(Debug, Clone)]
pub struct BlockingService {
    tracker: SimulationTracker,
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: Arc<SimulatorConfig>,
    pool: WorkerPool,
}

impl BlockingService {
    /// Create the service. `pool` receives the out-of-band workers.
    pub fn new(
        tracker: SimulationTracker,
        storage: Arc<dyn SharedStorage>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        config: Arc<SimulatorConfig>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            tracker,
            storage,
            clock,
            events,
            config,
            pool,
        }
    }

    /// Open a window for `duration_seconds`, replacing any live one.
    ///
    /// With `concurrent_workers > 1` that many background workers are also
    /// spawned; they keep performing blocking work until this window ends, is
    /// stopped or is superseded. Their failures are never reported here.
    pub async fn start_blocking_window(
        &self,
        duration_seconds: u64,
        concurrent_workers: u32,
    ) -> PerfSimResult<BlockingStart> {
        let params = SimulationParams::RequestBlocking(RequestBlockingParams {
            duration_seconds,
            concurrent_workers,
        });
        let sim = self
            .tracker
            .create_simulation(params, duration_seconds)
            .await?;

        let window = BlockingWindow {
            end_time: sim.scheduled_end_at(),
            duration_seconds,
            started_at: sim.started_at(),
            simulation_id: sim.id().to_string(),
        };
        let ttl = Duration::from_secs(duration_seconds + self.config.blocking_ttl_slack_secs);
        self.storage
            .set_json(BLOCKING_MODE_KEY, &window, Some(ttl))
            .await?;

        tracing::info!(
            simulation_id = %sim.id(),
            duration_secs = duration_seconds,
            concurrent_workers,
            "blocking window opened"
        );
        notify(
            self.events.as_ref(),
            SimulationEvent::with_code(
                codes::BLOCKING_WINDOW_STARTED,
                format!("Blocking window opened for {}s", duration_seconds),
                &sim,
            ),
        )
        .await;

        let spawned_workers = if concurrent_workers > 1 {
            self.spawn_workers(&window, concurrent_workers)
        } else {
            0
        };

        Ok(BlockingStart {
            id: sim.id().to_string(),
            kind: SimulationType::RequestBlocking,
            message: format!(
                "Blocking window active for {}s with {} concurrent worker(s)",
                duration_seconds, concurrent_workers
            ),
            status: sim.status(),
            started_at: sim.started_at(),
            scheduled_end_at: sim.scheduled_end_at(),
            duration_seconds,
            concurrent_workers,
            spawned_workers,
        })
    }

    /// The live window, or `None`.
    ///
    /// A window found past its end time is deleted and its simulation
    /// completed. A window whose simulation was already stopped or completed
    /// through the registry is deleted as well. When no window is stored at
    /// all, stale REQUEST_BLOCKING records are reconciled instead. No clean-up
    /// ever fails the call.
    pub async fn get_blocking_mode(&self) -> PerfSimResult<Option<BlockingWindow>> {
        let Some(window) = self
            .storage
            .get_json::<BlockingWindow>(BLOCKING_MODE_KEY)
            .await?
        else {
            if let Err(e) = self
                .tracker
                .get_active_simulations_by_type(SimulationType::RequestBlocking)
                .await
            {
                tracing::warn!(error = %e, "blocking reconciliation sweep failed");
            }
            return Ok(None);
        };

        if !window.is_over_at(self.clock.now()) {
            if !self.backing_simulation_ended(&window).await {
                return Ok(Some(window));
            }
            if let Err(e) = self.storage.delete(BLOCKING_MODE_KEY).await {
                tracing::warn!(error = %e, "could not delete orphaned blocking window");
            }
            tracing::info!(
                simulation_id = %window.simulation_id,
                "blocking window dropped, its simulation already ended"
            );
            return Ok(None);
        }

        if let Err(e) = self.storage.delete(BLOCKING_MODE_KEY).await {
            tracing::warn!(error = %e, "could not delete expired blocking window");
        }
        match self.tracker.complete_simulation(&window.simulation_id).await {
            Ok(true) => self.notify_ended(&window, "ended").await,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    simulation_id = %window.simulation_id,
                    error = %e,
                    "could not complete blocking simulation"
                );
            }
        }
        Ok(None)
    }

    /// Burn CPU proportional to the remaining fraction of the live window.
    ///
    /// Returns `None` without doing anything when no window is live. A stop
    /// issued while this runs does not interrupt it.
    pub async fn perform_blocking_if_active(&self) -> PerfSimResult<Option<BlockingWork>> {
        match self.get_blocking_mode().await? {
            Some(window) => Ok(Some(self.work_for(&window).await?)),
            None => Ok(None),
        }
    }

    /// Delete the window and stop its simulation, however much time is left.
    ///
    /// Returns the window that was live, if any. Idempotent.
    pub async fn stop_blocking_window(&self) -> PerfSimResult<Option<BlockingWindow>> {
        let window = self
            .storage
            .get_json::<BlockingWindow>(BLOCKING_MODE_KEY)
            .await?;
        self.storage.delete(BLOCKING_MODE_KEY).await?;

        if let Some(window) = &window {
            if self.tracker.stop_simulation(&window.simulation_id).await? {
                self.notify_ended(window, "stopped").await;
            }
            tracing::info!(simulation_id = %window.simulation_id, "blocking window stopped");
        }
        Ok(window)
    }

    async fn work_for(&self, window: &BlockingWindow) -> PerfSimResult<BlockingWork> {
        let now = self.clock.now();
        let intensity = window.intensity_at(now);
        let iterations = (self.config.blocking_base_iterations as f64 * intensity).round() as u64;

        let started = Instant::now();
        tokio::task::spawn_blocking(move || burn_cpu(iterations)).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::debug!(
            simulation_id = %window.simulation_id,
            intensity,
            iterations,
            elapsed_ms,
            "performed blocking work"
        );
        Ok(BlockingWork {
            simulation_id: window.simulation_id.clone(),
            intensity,
            iterations,
            elapsed_ms,
            remaining_seconds: window.remaining_seconds_at(now),
        })
    }

    fn spawn_workers(&self, window: &BlockingWindow, count: u32) -> u32 {
        let mut spawned = 0;
        for n in 0..count {
            let service = self.clone();
            let simulation_id = window.simulation_id.clone();
            let name = format!("blocking-worker-{}", n);
            if self
                .pool
                .spawn_detached(&name, async move { service.run_worker(simulation_id).await })
            {
                spawned += 1;
            }
        }
        tracing::debug!(requested = count, spawned, "blocking workers spawned");
        spawned
    }

    /// Keep working until the window this worker belongs to goes away.
    async fn run_worker(self, simulation_id: String) -> PerfSimResult<()> {
        let pause = Duration::from_millis(self.config.worker_pause_ms);
        loop {
            let Some(window) = self.get_blocking_mode().await? else {
                return Ok(());
            };
            if window.simulation_id != simulation_id {
                return Ok(());
            }
            self.work_for(&window).await?;
            tokio::time::sleep(pause).await;
        }
    }

    /// Whether the window's simulation was stopped or completed through the
    /// registry. A missing record or an unreadable registry keeps the window.
    async fn backing_simulation_ended(&self, window: &BlockingWindow) -> bool {
        match self.tracker.get_simulation(&window.simulation_id).await {
            Ok(Some(sim)) => sim.status().is_terminal(),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    simulation_id = %window.simulation_id,
                    error = %e,
                    "could not look up blocking simulation"
                );
                false
            }
        }
    }

    async fn notify_ended(&self, window: &BlockingWindow, how: &str) {
        // The record may already be gone from the registry; fall back to a
        // bare event keyed by the window's back-reference.
        let event = match self.tracker.get_simulation(&window.simulation_id).await {
            Ok(Some(sim)) => window_ended_event(&sim, how),
            _ => SimulationEvent {
                level: EventLevel::Info,
                code: codes::BLOCKING_WINDOW_ENDED.to_string(),
                message: format!("Blocking window {}", how),
                subject_id: window.simulation_id.clone(),
                subject_type: SimulationType::RequestBlocking.as_str().to_string(),
            },
        };
        notify(self.events.as_ref(), event).await;
    }
}

fn window_ended_event(sim: &Simulation, how: &str) -> SimulationEvent {
    SimulationEvent::with_code(
        codes::BLOCKING_WINDOW_ENDED,
        format!("Blocking window {} for simulation {}", how, sim.id()),
        sim,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PerfSimError;
    use crate::events::TracingEventSink;
    use crate::storage::InMemoryStorage;
    use crate::time::ManualClock;

    struct Fixture {
        service: BlockingService,
        tracker: SimulationTracker,
        storage: Arc<InMemoryStorage>,
        clock: ManualClock,
        pool: WorkerPool,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(
            SimulatorConfig::builder()
                .blocking_base_iterations(20_000)
                .worker_pause_ms(5)
                .build()
                .unwrap(),
        );
        let clock = ManualClock::starting_now();
        let storage = Arc::new(InMemoryStorage::with_clock(Arc::new(clock.clone())));
        let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        let tracker = SimulationTracker::new(
            storage.clone(),
            Arc::new(clock.clone()),
            events.clone(),
            config.clone(),
        );
        let pool = WorkerPool::new(4);
        let service = BlockingService::new(
            tracker.clone(),
            storage.clone(),
            Arc::new(clock.clone()),
            events,
            config,
            pool.clone(),
        );
        Fixture {
            service,
            tracker,
            storage,
            clock,
            pool,
        }
    }

    async fn status_of(tracker: &SimulationTracker, id: &str) -> SimulationStatus {
        tracker.get_simulation(id).await.unwrap().unwrap().status()
    }

    #[tokio::test]
    async fn test_window_is_live_then_completes_after_end() {
        let f = fixture();
        let opened_at = f.clock.now();
        let start = f.service.start_blocking_window(2, 1).await.unwrap();
        assert_eq!(start.kind, SimulationType::RequestBlocking);
        assert_eq!(start.spawned_workers, 0);

        let window = f.service.get_blocking_mode().await.unwrap().unwrap();
        assert_eq!(window.end_time, opened_at + chrono::Duration::seconds(2));
        assert_eq!(window.simulation_id, start.id);

        f.clock.advance(Duration::from_millis(2_100));
        assert!(f.service.get_blocking_mode().await.unwrap().is_none());
        assert_eq!(status_of(&f.tracker, &start.id).await, SimulationStatus::Completed);
        assert!(f.storage.get(BLOCKING_MODE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_then_get_returns_none() {
        let f = fixture();
        let start = f.service.start_blocking_window(30, 1).await.unwrap();

        let stopped = f.service.stop_blocking_window().await.unwrap();
        assert_eq!(stopped.map(|w| w.simulation_id), Some(start.id.clone()));
        assert!(f.service.get_blocking_mode().await.unwrap().is_none());
        assert_eq!(status_of(&f.tracker, &start.id).await, SimulationStatus::Stopped);

        // Idempotent.
        assert!(f.service.stop_blocking_window().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stopping_the_simulation_ends_its_window() {
        let f = fixture();
        let start = f.service.start_blocking_window(30, 1).await.unwrap();

        assert!(f.tracker.stop_simulation(&start.id).await.unwrap());
        assert!(f.service.get_blocking_mode().await.unwrap().is_none());
        assert!(f.service.perform_blocking_if_active().await.unwrap().is_none());
        assert!(f.storage.get(BLOCKING_MODE_KEY).await.unwrap().is_none());
        assert_eq!(status_of(&f.tracker, &start.id).await, SimulationStatus::Stopped);
    }

    #[tokio::test]
    async fn test_window_survives_missing_registry_record() {
        let f = fixture();
        let start = f.service.start_blocking_window(30, 1).await.unwrap();
        f.storage.delete(crate::simulation::REGISTRY_KEY).await.unwrap();

        let window = f.service.get_blocking_mode().await.unwrap().unwrap();
        assert_eq!(window.simulation_id, start.id);
    }

    #[tokio::test]
    async fn test_work_shrinks_towards_window_end() {
        let f = fixture();
        f.service.start_blocking_window(10, 1).await.unwrap();

        let early = f.service.perform_blocking_if_active().await.unwrap().unwrap();
        f.clock.advance(Duration::from_millis(9_900));
        let late = f.service.perform_blocking_if_active().await.unwrap().unwrap();

        assert_eq!(early.intensity, 1.0);
        assert_eq!(late.intensity, MIN_INTENSITY);
        assert!(late.iterations < early.iterations);
        assert_eq!(early.iterations, 20_000);
    }

    #[tokio::test]
    async fn test_no_window_means_no_work() {
        let f = fixture();
        assert!(f.service.perform_blocking_if_active().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_window_lost_to_ttl_is_reconciled_from_registry() {
        let f = fixture();
        let start = f.service.start_blocking_window(5, 1).await.unwrap();

        // Past the window's own TTL (duration + slack): the key is simply gone.
        f.clock.advance(Duration::from_secs(5 + 61));
        assert!(f.service.get_blocking_mode().await.unwrap().is_none());
        assert_eq!(status_of(&f.tracker, &start.id).await, SimulationStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_duration_mutates_nothing() {
        let f = fixture();
        let err = f.service.start_blocking_window(0, 1).await.unwrap_err();
        assert!(matches!(err, PerfSimError::InvalidParameter { .. }));

        let err = f.service.start_blocking_window(10, 999).await.unwrap_err();
        assert!(matches!(err, PerfSimError::InvalidParameter { name: "concurrentWorkers", .. }));

        assert!(f.service.get_blocking_mode().await.unwrap().is_none());
        assert!(f.tracker.get_all_simulations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_newer_window_supersedes_older() {
        let f = fixture();
        let first = f.service.start_blocking_window(30, 1).await.unwrap();
        let second = f.service.start_blocking_window(10, 1).await.unwrap();

        let window = f.service.get_blocking_mode().await.unwrap().unwrap();
        assert_eq!(window.simulation_id, second.id);
        // The superseded record stays active until its own end is noticed.
        assert_eq!(status_of(&f.tracker, &first.id).await, SimulationStatus::Active);
    }

    #[tokio::test]
    async fn test_concurrent_workers_run_until_stopped() {
        let f = fixture();
        let start = f.service.start_blocking_window(30, 3).await.unwrap();
        assert_eq!(start.spawned_workers, 3);
        assert_eq!(f.pool.in_flight(), 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        f.service.stop_blocking_window().await.unwrap();

        for _ in 0..200 {
            if f.pool.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.pool.in_flight(), 0);
    }

    #[test]
    fn test_intensity_clamps() {
        let now = Utc::now();
        let window = BlockingWindow {
            end_time: now + chrono::Duration::seconds(10),
            duration_seconds: 10,
            started_at: now,
            simulation_id: "sim_x".to_string(),
        };
        assert_eq!(window.intensity_at(now), 1.0);
        assert_eq!(window.intensity_at(now - chrono::Duration::seconds(5)), 1.0);
        assert_eq!(window.intensity_at(now + chrono::Duration::seconds(3)), 0.7);
        assert_eq!(window.intensity_at(now + chrono::Duration::seconds(30)), 0.5);
    }
}
