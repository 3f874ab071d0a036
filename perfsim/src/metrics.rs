//! Metrics probe for a polling dashboard.
//!
//! [`MetricsAggregator::collect`] reads the registry once and, for each kind
//! with active simulations, performs real work sized from their parameters.
//! The probe's own latency is then a direct view of how loaded the process
//! is. It creates no simulation state; the only writes it causes are the
//! registry's stale reconciliation and nothing else.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SimulatorConfig;
use crate::error::PerfSimResult;
use crate::simulation::{Simulation, SimulationParams, SimulationTracker, SimulationType};
use crate::storage::{SharedStorage, StorageExt};
use crate::time::Clock;
use crate::work::{burn_cpu, file_round_trip, touch_memory};

/// Storage key of the load test gauge.
pub const LOAD_TEST_KEY: &str = "load_test_state";

const BYTES_PER_MB: usize = 1024 * 1024;

/// Load test activity as reported to the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTestStatus {
    /// Whether any load test request is in flight.
    pub active: bool,
    /// Number of load test requests in flight.
    pub concurrent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadTestState {
    concurrent: u64,
    updated_at: DateTime<Utc>,
}

/// Counter of in-flight load test requests kept in the shared store.
///
/// The entry has a short TTL that every update refreshes, so a count left
/// behind by a crashed request decays to zero instead of sticking.
#[derive(Debug, Clone)]
pub struct LoadTestGauge {
    storage: Arc<dyn SharedStorage>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LoadTestGauge {
    /// Create a gauge whose entry lives `ttl` past its last update.
    pub fn new(storage: Arc<dyn SharedStorage>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            storage,
            clock,
            ttl,
        }
    }

    /// Record a load test request starting. Returns the new count.
    pub async fn enter(&self) -> PerfSimResult<u64> {
        let current = self.current().await?;
        self.store(current.saturating_add(1)).await
    }

    /// Record a load test request finishing. Returns the new count.
    pub async fn exit(&self) -> PerfSimResult<u64> {
        let current = self.current().await?;
        self.store(current.saturating_sub(1)).await
    }

    /// Current load test activity.
    pub async fn status(&self) -> PerfSimResult<LoadTestStatus> {
        let concurrent = self.current().await?;
        Ok(LoadTestStatus {
            active: concurrent > 0,
            concurrent,
        })
    }

    async fn current(&self) -> PerfSimResult<u64> {
        let state = self
            .storage
            .get_json::<LoadTestState>(LOAD_TEST_KEY)
            .await?;
        Ok(state.map_or(0, |s| s.concurrent))
    }

    async fn store(&self, concurrent: u64) -> PerfSimResult<u64> {
        let state = LoadTestState {
            concurrent,
            updated_at: self.clock.now(),
        };
        self.storage
            .set_json(LOAD_TEST_KEY, &state, Some(self.ttl))
            .await?;
        Ok(concurrent)
    }
}

/// One metrics probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// When the probe started, in Unix milliseconds.
    pub timestamp_ms: i64,
    /// Wall time the probe took.
    pub latency_ms: u64,
    /// Work performed per kind: CPU iterations, megabytes touched, bytes
    /// round-tripped, or held locks.
    pub work_done: BTreeMap<String, u64>,
    /// Active simulations per kind.
    pub active_simulations: BTreeMap<String, usize>,
    /// Load test activity.
    pub load_test: LoadTestStatus,
}

/// Aggregates registry state into proportional probe work.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    tracker: SimulationTracker,
    gauge: LoadTestGauge,
    clock: Arc<dyn Clock>,
    config: Arc<SimulatorConfig>,
}

impl MetricsAggregator {
    /// Create an aggregator.
    pub fn new(
        tracker: SimulationTracker,
        gauge: LoadTestGauge,
        clock: Arc<dyn Clock>,
        config: Arc<SimulatorConfig>,
    ) -> Self {
        Self {
            tracker,
            gauge,
            clock,
            config,
        }
    }

    /// Run one probe.
    ///
    /// Store failures propagate. A failing scratch file round trip is logged
    /// and reported as zero work.
    pub async fn collect(&self) -> PerfSimResult<MetricsSnapshot> {
        let timestamp_ms = self.clock.now().timestamp_millis();
        let started = Instant::now();

        let mut by_kind: BTreeMap<SimulationType, Vec<Simulation>> = BTreeMap::new();
        for sim in self.tracker.get_active_simulations().await? {
            by_kind.entry(sim.simulation_type()).or_default().push(sim);
        }

        let mut work_done = BTreeMap::new();
        let mut active_simulations = BTreeMap::new();
        for (kind, sims) in &by_kind {
            active_simulations.insert(kind.as_str().to_string(), sims.len());
            let magnitude = self.work_for(*kind, sims).await?;
            work_done.insert(kind.as_str().to_string(), magnitude);
        }

        let load_test = self.gauge.status().await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            latency_ms,
            active = by_kind.values().map(Vec::len).sum::<usize>(),
            load_test_concurrent = load_test.concurrent,
            "metrics collected"
        );

        Ok(MetricsSnapshot {
            timestamp_ms,
            latency_ms,
            work_done,
            active_simulations,
            load_test,
        })
    }

    async fn work_for(&self, kind: SimulationType, sims: &[Simulation]) -> PerfSimResult<u64> {
        let magnitude = match kind {
            SimulationType::CpuStress => {
                let load: u64 = sims
                    .iter()
                    .filter_map(|sim| match sim.params() {
                        SimulationParams::CpuStress(p) => Some(u64::from(p.target_load_percent)),
                        _ => None,
                    })
                    .sum();
                let iterations = self.config.cpu_probe_iterations.saturating_mul(load) / 100;
                tokio::task::spawn_blocking(move || burn_cpu(iterations)).await?;
                iterations
            }
            SimulationType::RequestBlocking => {
                let iterations = self
                    .config
                    .blocking_probe_iterations
                    .saturating_mul(sims.len() as u64);
                tokio::task::spawn_blocking(move || burn_cpu(iterations)).await?;
                iterations
            }
            SimulationType::MemoryPressure => {
                let declared: u64 = sims
                    .iter()
                    .filter_map(|sim| match sim.params() {
                        SimulationParams::MemoryPressure(p) => Some(u64::from(p.size_mb)),
                        _ => None,
                    })
                    .sum();
                let mb = declared.min(u64::from(self.config.memory_probe_cap_mb));
                let bytes = mb as usize * BYTES_PER_MB;
                tokio::task::spawn_blocking(move || touch_memory(bytes)).await?;
                mb
            }
            SimulationType::SlowRequest => {
                match file_round_trip(&self.config.scratch_dir, self.config.io_probe_bytes).await {
                    Ok(bytes) => bytes as u64,
                    Err(e) => {
                        tracing::warn!(
                            dir = %self.config.scratch_dir.display(),
                            error = %e,
                            "slow request probe failed"
                        );
                        0
                    }
                }
            }
            SimulationType::SessionLock => sims.len() as u64,
        };
        Ok(magnitude)
    }
}
