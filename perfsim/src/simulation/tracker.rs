//! Simulation registry built on the shared store.
//!
//! The whole registry is one stored entry: a map of id to [`Simulation`].
//! Records are never deleted by lifecycle operations, only transitioned.
//!
//! # Self-healing
//!
//! There is no sweeper. Every read that scans the registry completes records
//! that are still `Active` past their scheduled end, writes the healed map
//! back and emits a completion event. A record nobody reads again stays
//! `Active` in storage; [`SimulationTracker::reconcile_stale`] is the explicit
//! administrative sweep for deployments that care.
//!
//! # Bounded growth
//!
//! Writes enforce `max_registry_entries` by evicting the oldest terminal
//! records. Active records are never evicted, so the cap can be exceeded
//! while that many simulations are genuinely running.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::SimulatorConfig;
use crate::error::PerfSimResult;
use crate::events::{notify, EventSink, SimulationEvent};
use crate::simulation::types::{Simulation, SimulationParams, SimulationStatus, SimulationType};
use crate::storage::{SharedStorage, StorageExt};
use crate::time::Clock;

/// Storage key of the registry entry.
pub const REGISTRY_KEY: &str = "simulations";

type Registry = BTreeMap<String, Simulation>;

/// Catalog of active and finished simulations.
#[derive(Debug, Clone)]
pub struct SimulationTracker {
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: Arc<SimulatorConfig>,
}

impl SimulationTracker {
    /// Create a tracker over `storage`.
    pub fn new(
        storage: Arc<dyn SharedStorage>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        config: Arc<SimulatorConfig>,
    ) -> Self {
        Self {
            storage,
            clock,
            events,
            config,
        }
    }

    /// Register a new `Active` simulation ending `duration_secs` from now.
    ///
    /// Parameters and duration are validated before anything is written.
    /// Store failures propagate.
    pub async fn create_simulation(
        &self,
        params: SimulationParams,
        duration_secs: u64,
    ) -> PerfSimResult<Simulation> {
        params.validate(&self.config)?;
        let duration = self.config.check_duration("durationSeconds", duration_secs)?;

        let sim = Simulation::start(params, duration, self.clock.now());
        let mut registry = self.load().await?;
        registry.insert(sim.id().to_string(), sim.clone());
        self.save(registry).await?;

        tracing::info!(
            simulation_id = %sim.id(),
            kind = %sim.simulation_type(),
            duration_secs,
            "simulation created"
        );
        notify(self.events.as_ref(), SimulationEvent::for_simulation(&sim)).await;
        Ok(sim)
    }

    /// Mark a simulation `Completed`.
    ///
    /// Returns `Ok(false)` without error when the id is unknown or the record
    /// is already terminal.
    pub async fn complete_simulation(&self, id: &str) -> PerfSimResult<bool> {
        self.finish(id, SimulationStatus::Completed).await
    }

    /// Mark a simulation `Stopped`.
    ///
    /// Returns `Ok(false)` without error when the id is unknown or the record
    /// is already terminal.
    pub async fn stop_simulation(&self, id: &str) -> PerfSimResult<bool> {
        self.finish(id, SimulationStatus::Stopped).await
    }

    /// Look up one simulation, reconciling the registry on the way.
    pub async fn get_simulation(&self, id: &str) -> PerfSimResult<Option<Simulation>> {
        let mut registry = self.snapshot().await?;
        Ok(registry.remove(id))
    }

    /// Every retained simulation, oldest first.
    pub async fn get_all_simulations(&self) -> PerfSimResult<Vec<Simulation>> {
        let registry = self.snapshot().await?;
        Ok(ordered(registry, |_| true))
    }

    /// Every `Active` simulation of any kind, oldest first.
    pub async fn get_active_simulations(&self) -> PerfSimResult<Vec<Simulation>> {
        let registry = self.snapshot().await?;
        Ok(ordered(registry, Simulation::is_active))
    }

    /// `Active` simulations of `kind`, oldest first.
    ///
    /// The result is a point-in-time snapshot; transitions made by other
    /// processes afterwards show up on the next call.
    pub async fn get_active_simulations_by_type(
        &self,
        kind: SimulationType,
    ) -> PerfSimResult<Vec<Simulation>> {
        let registry = self.snapshot().await?;
        Ok(ordered(registry, |sim| {
            sim.is_active() && sim.simulation_type() == kind
        }))
    }

    /// `Active` simulations of `kind` whose scheduled end is still ahead.
    ///
    /// Prefer this over [`Self::get_active_simulations_by_type`] when the
    /// caller must not trust an `Active` flag alone.
    pub async fn get_simulations_in_time_window(
        &self,
        kind: SimulationType,
    ) -> PerfSimResult<Vec<Simulation>> {
        let registry = self.snapshot().await?;
        let now = self.clock.now();
        Ok(ordered(registry, |sim| {
            sim.simulation_type() == kind && sim.is_running_at(now)
        }))
    }

    /// Complete every stale record now, returning how many were healed.
    pub async fn reconcile_stale(&self) -> PerfSimResult<usize> {
        let mut registry = self.load().await?;
        Ok(self.reconcile(&mut registry).await)
    }

    async fn finish(&self, id: &str, status: SimulationStatus) -> PerfSimResult<bool> {
        let now = self.clock.now();
        let mut registry = self.load().await?;

        let Some(sim) = registry.get_mut(id) else {
            tracing::debug!(
                simulation_id = %id,
                ?status,
                "ignoring transition of unknown simulation"
            );
            return Ok(false);
        };
        if !sim.finish(status, now) {
            tracing::debug!(
                simulation_id = %id,
                current = ?sim.status(),
                "simulation already terminal"
            );
            return Ok(false);
        }
        let event = SimulationEvent::for_simulation(sim);

        self.save(registry).await?;
        tracing::info!(simulation_id = %id, ?status, "simulation finished");
        notify(self.events.as_ref(), event).await;
        Ok(true)
    }

    async fn snapshot(&self) -> PerfSimResult<Registry> {
        let mut registry = self.load().await?;
        self.reconcile(&mut registry).await;
        Ok(registry)
    }

    /// Heal stale records in `registry` and persist them. Never fails: a
    /// write error is logged and the healed snapshot is still returned.
    async fn reconcile(&self, registry: &mut Registry) -> usize {
        let now = self.clock.now();
        let mut healed = Vec::new();
        for sim in registry.values_mut() {
            if sim.is_stale_at(now) && sim.finish(SimulationStatus::Completed, now) {
                healed.push(SimulationEvent::for_simulation(sim));
            }
        }
        if healed.is_empty() {
            return 0;
        }

        if let Err(e) = self.save(registry.clone()).await {
            tracing::warn!(
                error = %e,
                healed = healed.len(),
                "could not persist reconciled simulations"
            );
        }
        for event in healed.iter() {
            tracing::info!(simulation_id = %event.subject_id, "reconciled stale simulation");
            notify(self.events.as_ref(), event.clone()).await;
        }
        healed.len()
    }

    async fn load(&self) -> PerfSimResult<Registry> {
        Ok(self
            .storage
            .get_json::<Registry>(REGISTRY_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, mut registry: Registry) -> PerfSimResult<()> {
        evict_terminal(&mut registry, self.config.max_registry_entries);
        self.storage
            .set_json(REGISTRY_KEY, &registry, Some(self.config.registry_ttl()))
            .await?;
        Ok(())
    }
}

fn ordered(registry: Registry, keep: impl Fn(&Simulation) -> bool) -> Vec<Simulation> {
    let mut sims: Vec<Simulation> = registry.into_values().filter(|sim| keep(sim)).collect();
    sims.sort_by(|a, b| {
        a.started_at()
            .cmp(&b.started_at())
            .then_with(|| a.id().cmp(b.id()))
    });
    sims
}

fn evict_terminal(registry: &mut Registry, cap: usize) {
    if registry.len() <= cap {
        return;
    }
    // Oldest completion first, then oldest start.
    let mut terminal: Vec<_> = registry
        .values()
        .filter(|sim| sim.status().is_terminal())
        .map(|sim| {
            (
                sim.completed_at().unwrap_or(sim.started_at()),
                sim.started_at(),
                sim.id().to_string(),
            )
        })
        .collect();
    terminal.sort();

    let excess = registry.len() - cap;
    for (_, _, id) in terminal.into_iter().take(excess) {
        registry.remove(&id);
    }
    tracing::debug!(remaining = registry.len(), cap, "evicted terminal simulations");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PerfSimError;
    use crate::events::{codes, EventError};
    use crate::storage::{InMemoryStorage, StorageError};
    use crate::time::ManualClock;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingSink {
        events: Mutex<Vec<SimulationEvent>>,
    }

    impl RecordingSink {
        fn codes(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.code.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, event: &SimulationEvent) -> Result<(), EventError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct UnavailableStorage;

    #[async_trait]
    impl SharedStorage for UnavailableStorage {
        async fn get(&self, _key: &str) -> Result<Option<Value>, StorageError> {
            Err(StorageError::Unavailable)
        }
        async fn set(&self, _: &str, _: Value, _: Option<Duration>) -> Result<(), StorageError> {
            Err(StorageError::Unavailable)
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable)
        }
        async fn purge_expired(&self) -> Result<usize, StorageError> {
            Err(StorageError::Unavailable)
        }
    }

    /// Reads always work; writes fail once `fail_writes` is set.
    #[derive(Debug)]
    struct ReadOnlyAfterSwitch {
        inner: InMemoryStorage,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl SharedStorage for ReadOnlyAfterSwitch {
        async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
            self.inner.get(key).await
        }
        async fn set(
            &self,
            key: &str,
            value: Value,
            ttl: Option<Duration>,
        ) -> Result<(), StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable);
            }
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable);
            }
            self.inner.delete(key).await
        }
        async fn purge_expired(&self) -> Result<usize, StorageError> {
            self.inner.purge_expired().await
        }
    }

    struct Fixture {
        tracker: SimulationTracker,
        clock: ManualClock,
        sink: Arc<RecordingSink>,
    }

    fn fixture_with(config: SimulatorConfig) -> Fixture {
        let clock = ManualClock::starting_now();
        let storage = Arc::new(InMemoryStorage::with_clock(Arc::new(clock.clone())));
        let sink = Arc::new(RecordingSink::default());
        let tracker = SimulationTracker::new(
            storage,
            Arc::new(clock.clone()),
            sink.clone(),
            Arc::new(config),
        );
        Fixture {
            tracker,
            clock,
            sink,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SimulatorConfig::default())
    }

    #[tokio::test]
    async fn test_cpu_stress_lifecycle_reconciles_after_end() {
        let f = fixture();
        let sim = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(100), 5)
            .await
            .unwrap();
        assert_eq!(sim.scheduled_end_at() - sim.started_at(), chrono::Duration::seconds(5));

        let active = f
            .tracker
            .get_active_simulations_by_type(SimulationType::CpuStress)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), sim.id());

        f.clock.advance(Duration::from_secs(6));
        let active = f
            .tracker
            .get_active_simulations_by_type(SimulationType::CpuStress)
            .await
            .unwrap();
        assert!(active.is_empty());

        let stored = f.tracker.get_simulation(sim.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), SimulationStatus::Completed);
        assert!(stored.completed_at().is_some());
        assert_eq!(
            f.sink.codes(),
            vec![codes::SIMULATION_STARTED, codes::SIMULATION_COMPLETED]
        );
    }

    #[tokio::test]
    async fn test_reconciliation_survives_failed_write_back() {
        let clock = ManualClock::starting_now();
        let storage = Arc::new(ReadOnlyAfterSwitch {
            inner: InMemoryStorage::with_clock(Arc::new(clock.clone())),
            fail_writes: AtomicBool::new(false),
        });
        let sink = Arc::new(RecordingSink::default());
        let tracker = SimulationTracker::new(
            storage.clone(),
            Arc::new(clock.clone()),
            sink.clone(),
            Arc::new(SimulatorConfig::default()),
        );
        let sim = tracker
            .create_simulation(SimulationParams::cpu_stress(100), 5)
            .await
            .unwrap();

        storage.fail_writes.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(6));

        let active = tracker
            .get_active_simulations_by_type(SimulationType::CpuStress)
            .await
            .unwrap();
        assert!(active.is_empty());
        assert_eq!(
            sink.codes(),
            vec![codes::SIMULATION_STARTED, codes::SIMULATION_COMPLETED]
        );

        // Nothing was written back, so the next reader heals it again.
        let seen = tracker.get_simulation(sim.id()).await.unwrap().unwrap();
        assert_eq!(seen.status(), SimulationStatus::Completed);
    }

    #[tokio::test]
    async fn test_reconciliation_is_persisted_once() {
        let f = fixture();
        f.tracker
            .create_simulation(SimulationParams::slow_request(2), 2)
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(3));

        assert_eq!(f.tracker.reconcile_stale().await.unwrap(), 1);
        assert_eq!(f.tracker.reconcile_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminal_states_never_return_to_active() {
        let f = fixture();
        let sim = f
            .tracker
            .create_simulation(SimulationParams::memory_pressure(64), 30)
            .await
            .unwrap();

        assert!(f.tracker.stop_simulation(sim.id()).await.unwrap());
        assert!(!f.tracker.complete_simulation(sim.id()).await.unwrap());
        assert!(!f.tracker.stop_simulation(sim.id()).await.unwrap());

        f.clock.advance(Duration::from_secs(60));
        let stored = f.tracker.get_simulation(sim.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), SimulationStatus::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_id_is_a_no_op() {
        let f = fixture();
        assert!(!f.tracker.complete_simulation("sim_missing").await.unwrap());
        assert!(!f.tracker.stop_simulation("sim_missing").await.unwrap());
        assert!(f.sink.codes().is_empty());
    }

    #[tokio::test]
    async fn test_time_window_excludes_expired_and_other_kinds() {
        let f = fixture();
        let short = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(20), 2)
            .await
            .unwrap();
        f.clock.advance(Duration::from_millis(10));
        let long = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(40), 20)
            .await
            .unwrap();
        f.tracker
            .create_simulation(SimulationParams::memory_pressure(8), 20)
            .await
            .unwrap();

        let running = f
            .tracker
            .get_simulations_in_time_window(SimulationType::CpuStress)
            .await
            .unwrap();
        let ids: Vec<_> = running.iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec![short.id().to_string(), long.id().to_string()]);

        f.clock.advance(Duration::from_secs(3));
        let running = f
            .tracker
            .get_simulations_in_time_window(SimulationType::CpuStress)
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id(), long.id());
    }

    #[tokio::test]
    async fn test_invalid_parameters_write_nothing() {
        let f = fixture();
        let err = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(150), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PerfSimError::InvalidParameter { name: "targetLoadPercent", .. }));

        let err = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(50), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, PerfSimError::InvalidParameter { name: "durationSeconds", .. }));

        assert!(f.tracker.get_all_simulations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_cap_evicts_oldest_terminal_only() {
        let config = SimulatorConfig::builder().max_registry_entries(3).build().unwrap();
        let f = fixture_with(config);

        let first = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(10), 60)
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(1));
        let second = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(10), 60)
            .await
            .unwrap();
        f.tracker.stop_simulation(second.id()).await.unwrap();
        f.clock.advance(Duration::from_secs(1));
        let third = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(10), 60)
            .await
            .unwrap();
        f.tracker.stop_simulation(third.id()).await.unwrap();
        f.clock.advance(Duration::from_secs(1));
        let fourth = f
            .tracker
            .create_simulation(SimulationParams::cpu_stress(10), 60)
            .await
            .unwrap();

        let ids: Vec<_> = f
            .tracker
            .get_all_simulations()
            .await
            .unwrap()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(
            ids,
            vec![
                first.id().to_string(),
                third.id().to_string(),
                fourth.id().to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let clock = Arc::new(ManualClock::starting_now());
        let tracker = SimulationTracker::new(
            Arc::new(UnavailableStorage),
            clock,
            Arc::new(RecordingSink::default()),
            Arc::new(SimulatorConfig::default()),
        );

        let err = tracker
            .create_simulation(SimulationParams::cpu_stress(50), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PerfSimError::Storage(StorageError::Unavailable)));
        assert!(tracker.get_all_simulations().await.is_err());
    }
}
