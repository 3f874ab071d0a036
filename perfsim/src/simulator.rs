//! Facade wiring every coordination component over one shared store.
//!
//! A controller layer builds one [`Simulator`] per process. Every process
//! pointed at the same store directory sees the same registry, blocking
//! window and load test gauge.

use std::sync::Arc;
use std::time::Duration;

use crate::blocking::{BlockingService, BlockingStart, BlockingWindow, BlockingWork};
use crate::config::SimulatorConfig;
use crate::error::PerfSimResult;
use crate::events::{EventSink, FanoutEventSink, LoggedEvent, StorageEventLog, TracingEventSink};
use crate::metrics::{LoadTestGauge, MetricsAggregator, MetricsSnapshot};
use crate::session_lock::{LockHoldResult, ProbeResult, SessionLockService};
use crate::simulation::{Simulation, SimulationParams, SimulationTracker, SimulationType};
use crate::storage::{FileStorage, SharedStorage};
use crate::time::{Clock, SystemClock};
use crate::workers::WorkerPool;

/// Entry point for a controller layer.
///
/// Cheap to clone; clones share the same store, clock and worker pool.
#[derive(Debug, Clone)]
pub struct Simulator {
    config: Arc<SimulatorConfig>,
    storage: Arc<dyn SharedStorage>,
    tracker: SimulationTracker,
    blocking: BlockingService,
    session_lock: SessionLockService,
    metrics: MetricsAggregator,
    load_test: LoadTestGauge,
    event_log: StorageEventLog,
}

impl Simulator {
    /// Start building a simulator.
    pub fn builder() -> SimulatorBuilder {
        SimulatorBuilder::new()
    }

    /// The configuration in use.
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// The shared store.
    pub fn storage(&self) -> &Arc<dyn SharedStorage> {
        &self.storage
    }

    /// The simulation registry.
    pub fn tracker(&self) -> &SimulationTracker {
        &self.tracker
    }

    /// The blocking window service.
    pub fn blocking(&self) -> &BlockingService {
        &self.blocking
    }

    /// The session lock service.
    pub fn session_lock(&self) -> &SessionLockService {
        &self.session_lock
    }

    /// The metrics aggregator.
    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// The load test gauge.
    pub fn load_test(&self) -> &LoadTestGauge {
        &self.load_test
    }

    /// See [`SimulationTracker::create_simulation`].
    pub async fn create_simulation(
        &self,
        params: SimulationParams,
        duration_secs: u64,
    ) -> PerfSimResult<Simulation> {
        self.tracker.create_simulation(params, duration_secs).await
    }

    /// See [`SimulationTracker::complete_simulation`].
    pub async fn complete_simulation(&self, id: &str) -> PerfSimResult<bool> {
        self.tracker.complete_simulation(id).await
    }

    /// See [`SimulationTracker::stop_simulation`].
    pub async fn stop_simulation(&self, id: &str) -> PerfSimResult<bool> {
        self.tracker.stop_simulation(id).await
    }

    /// See [`SimulationTracker::get_active_simulations_by_type`].
    pub async fn get_active_simulations_by_type(
        &self,
        kind: SimulationType,
    ) -> PerfSimResult<Vec<Simulation>> {
        self.tracker.get_active_simulations_by_type(kind).await
    }

    /// See [`SimulationTracker::get_simulations_in_time_window`].
    pub async fn get_simulations_in_time_window(
        &self,
        kind: SimulationType,
    ) -> PerfSimResult<Vec<Simulation>> {
        self.tracker.get_simulations_in_time_window(kind).await
    }

    /// See [`BlockingService::start_blocking_window`].
    pub async fn start_blocking_window(
        &self,
        duration_seconds: u64,
        concurrent_workers: u32,
    ) -> PerfSimResult<BlockingStart> {
        self.blocking
            .start_blocking_window(duration_seconds, concurrent_workers)
            .await
    }

    /// See [`BlockingService::get_blocking_mode`].
    pub async fn get_blocking_mode(&self) -> PerfSimResult<Option<BlockingWindow>> {
        self.blocking.get_blocking_mode().await
    }

    /// See [`BlockingService::stop_blocking_window`].
    pub async fn stop_blocking_window(&self) -> PerfSimResult<Option<BlockingWindow>> {
        self.blocking.stop_blocking_window().await
    }

    /// See [`BlockingService::perform_blocking_if_active`].
    pub async fn perform_blocking_if_active(&self) -> PerfSimResult<Option<BlockingWork>> {
        self.blocking.perform_blocking_if_active().await
    }

    /// See [`SessionLockService::acquire_and_hold`].
    pub async fn acquire_and_hold(
        &self,
        session_id: &str,
        hold_seconds: u64,
    ) -> PerfSimResult<LockHoldResult> {
        self.session_lock
            .acquire_and_hold(session_id, hold_seconds)
            .await
    }

    /// See [`SessionLockService::probe`].
    pub async fn probe(&self, session_id: &str) -> PerfSimResult<ProbeResult> {
        self.session_lock.probe(session_id).await
    }

    /// See [`MetricsAggregator::collect`].
    pub async fn collect_metrics(&self) -> PerfSimResult<MetricsSnapshot> {
        self.metrics.collect().await
    }

    /// Up to `limit` recent events from every process, newest first.
    pub async fn recent_events(&self, limit: usize) -> PerfSimResult<Vec<LoggedEvent>> {
        Ok(self.event_log.recent_events(limit).await?)
    }
}

/// Builder for [`Simulator`].
///
/// # Example
///
/// ```rust,ignore
/// let simulator = Simulator::builder()
///     .config(SimulatorConfig::builder().base_dir("/var/run/perfsim").build()?)
///     .build()
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct SimulatorBuilder {
    config: Option<SimulatorConfig>,
    storage: Option<Arc<dyn SharedStorage>>,
    clock: Option<Arc<dyn Clock>>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl SimulatorBuilder {
    /// Create a builder with every setting at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of [`SimulatorConfig::default`].
    pub fn config(mut self, config: SimulatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `storage` instead of a [`FileStorage`] at `config.storage_dir`.
    pub fn storage(mut self, storage: Arc<dyn SharedStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use `clock` instead of the system clock.
    ///
    /// Only applies to the default file store; a store passed to
    /// [`Self::storage`] keeps its own clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Deliver events to `sink` instead of the tracing pipeline. The stored
    /// event log always receives them as well.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Validate the configuration and wire the components.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for an inconsistent configuration and
    /// `Storage` when the default store directory cannot be created.
    pub async fn build(self) -> PerfSimResult<Simulator> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = Arc::new(config);

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let storage: Arc<dyn SharedStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(
                FileStorage::open_with_clock(config.storage_dir.clone(), clock.clone()).await?,
            ),
        };

        let event_log = StorageEventLog::new(
            storage.clone(),
            clock.clone(),
            config.event_log_capacity,
            Duration::from_secs(config.event_log_ttl_secs),
        );
        let downstream = self
            .event_sink
            .unwrap_or_else(|| Arc::new(TracingEventSink));
        let events: Arc<dyn EventSink> = Arc::new(FanoutEventSink::new(vec![
            Arc::new(event_log.clone()),
            downstream,
        ]));

        let pool = WorkerPool::new(config.max_concurrent_workers as usize);
        let tracker = SimulationTracker::new(
            storage.clone(),
            clock.clone(),
            events.clone(),
            config.clone(),
        );
        let blocking = BlockingService::new(
            tracker.clone(),
            storage.clone(),
            clock.clone(),
            events.clone(),
            config.clone(),
            pool,
        );
        let session_lock =
            SessionLockService::new(tracker.clone(), clock.clone(), events, config.clone());
        let load_test = LoadTestGauge::new(
            storage.clone(),
            clock.clone(),
            Duration::from_secs(config.load_test_ttl_secs),
        );
        let metrics =
            MetricsAggregator::new(tracker.clone(), load_test.clone(), clock, config.clone());

        tracing::info!(
            storage = ?storage,
            lock_dir = %config.lock_dir.display(),
            workers = config.max_concurrent_workers,
            "simulator ready"
        );

        Ok(Simulator {
            config,
            storage,
            tracker,
            blocking,
            session_lock,
            metrics,
            load_test,
            event_log,
        })
    }
}
