//! Simulator configuration.
//!
//! Holds filesystem roots, storage lifetimes, parameter bounds and work
//! sizing. Every field has a default so a partial JSON document is enough.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PerfSimError, PerfSimResult};

/// Upper bound for `max_session_id_len`. A hex-escaped id of this length
/// plus its `.lock` suffix still fits in a 255 byte file name.
pub const SESSION_ID_LEN_LIMIT: usize = 120;

/// Configuration shared by every coordination component.
///
/// # Example
///
/// ```rust,ignore
/// // Everything default, under the system temp directory
/// let config = SimulatorConfig::default();
///
/// // Overrides via builder
/// let config = SimulatorConfig::builder()
///     .base_dir("/var/run/perfsim")
///     .max_duration_secs(120)
///     .build()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Root directory of the file-backed shared store.
    pub storage_dir: PathBuf,
    /// Directory holding session lock files.
    pub lock_dir: PathBuf,
    /// Directory used by the I/O probe for scratch files.
    pub scratch_dir: PathBuf,

    /// TTL of the registry entry, refreshed on every registry write.
    pub registry_ttl_secs: u64,
    /// Extra lifetime given to a blocking window beyond its own duration.
    pub blocking_ttl_slack_secs: u64,
    /// Upper bound on retained simulation records.
    pub max_registry_entries: usize,

    /// Smallest accepted simulation duration.
    pub min_duration_secs: u64,
    /// Largest accepted simulation duration.
    pub max_duration_secs: u64,
    /// Largest accepted worker count for a blocking window, and pool size.
    pub max_concurrent_workers: u32,
    /// Largest accepted memory pressure allocation.
    pub max_memory_mb: u32,
    /// Largest accepted session lock hold. May not exceed `max_duration_secs`.
    pub max_lock_hold_secs: u64,
    /// Longest accepted session id, in bytes.
    pub max_session_id_len: usize,
    /// Default ceiling on session lock acquisition; `None` waits forever.
    pub lock_timeout_secs: Option<u64>,

    /// CPU iterations performed by a blocked request at full intensity.
    pub blocking_base_iterations: u64,
    /// CPU iterations per 100% of declared CPU load, per metrics probe.
    pub cpu_probe_iterations: u64,
    /// CPU iterations per active blocking simulation, per metrics probe.
    pub blocking_probe_iterations: u64,
    /// Cap on memory re-touched by a metrics probe.
    pub memory_probe_cap_mb: u32,
    /// Size of the file round trip performed for slow requests.
    pub io_probe_bytes: usize,
    /// Pause between passes of a spawned blocking worker.
    pub worker_pause_ms: u64,

    /// Number of recent events retained by the stored event log.
    pub event_log_capacity: usize,
    /// TTL of the stored event log.
    pub event_log_ttl_secs: u64,
    /// TTL of the load test gauge; stale counts decay after this.
    pub load_test_ttl_secs: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("perfsim");
        Self {
            storage_dir: base.join("store"),
            lock_dir: base.join("locks"),
            scratch_dir: base.join("scratch"),
            registry_ttl_secs: 3600,
            blocking_ttl_slack_secs: 60,
            max_registry_entries: 500,
            min_duration_secs: 1,
            max_duration_secs: 600,
            max_concurrent_workers: 16,
            max_memory_mb: 2048,
            max_lock_hold_secs: 120,
            max_session_id_len: 64,
            lock_timeout_secs: Some(180),
            blocking_base_iterations: 2_000_000,
            cpu_probe_iterations: 500_000,
            blocking_probe_iterations: 250_000,
            memory_probe_cap_mb: 64,
            io_probe_bytes: 4096,
            worker_pause_ms: 50,
            event_log_capacity: 100,
            event_log_ttl_secs: 3600,
            load_test_ttl_secs: 30,
        }
    }
}

impl SimulatorConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> SimulatorConfigBuilder {
        SimulatorConfigBuilder::default()
    }

    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json_str(json: &str) -> PerfSimResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PerfSimError::InvalidConfiguration(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject internally inconsistent settings.
    pub fn validate(&self) -> PerfSimResult<()> {
        if self.min_duration_secs == 0 {
            return Err(PerfSimError::InvalidConfiguration(
                "min_duration_secs must be at least 1".to_string(),
            ));
        }
        if self.min_duration_secs > self.max_duration_secs {
            return Err(PerfSimError::InvalidConfiguration(format!(
                "min_duration_secs ({}) exceeds max_duration_secs ({})",
                self.min_duration_secs, self.max_duration_secs
            )));
        }
        if self.max_registry_entries == 0 {
            return Err(PerfSimError::InvalidConfiguration(
                "max_registry_entries must be positive".to_string(),
            ));
        }
        if self.max_concurrent_workers == 0 {
            return Err(PerfSimError::InvalidConfiguration(
                "max_concurrent_workers must be positive".to_string(),
            ));
        }
        if self.event_log_capacity == 0 {
            return Err(PerfSimError::InvalidConfiguration(
                "event_log_capacity must be positive".to_string(),
            ));
        }
        if self.max_lock_hold_secs > self.max_duration_secs {
            return Err(PerfSimError::InvalidConfiguration(format!(
                "max_lock_hold_secs ({}) exceeds max_duration_secs ({})",
                self.max_lock_hold_secs, self.max_duration_secs
            )));
        }
        if self.max_session_id_len == 0 || self.max_session_id_len > SESSION_ID_LEN_LIMIT {
            return Err(PerfSimError::InvalidConfiguration(format!(
                "max_session_id_len must be between 1 and {}, got {}",
                SESSION_ID_LEN_LIMIT, self.max_session_id_len
            )));
        }
        if self.registry_ttl_secs < self.max_duration_secs {
            return Err(PerfSimError::InvalidConfiguration(format!(
                "registry_ttl_secs ({}) must outlive max_duration_secs ({})",
                self.registry_ttl_secs, self.max_duration_secs
            )));
        }
        Ok(())
    }

    /// Validate a declared simulation duration against the configured bounds.
    pub fn check_duration(&self, name: &'static str, secs: u64) -> PerfSimResult<Duration> {
        if secs < self.min_duration_secs || secs > self.max_duration_secs {
            return Err(PerfSimError::invalid(
                name,
                format!(
                    "must be between {} and {} seconds, got {}",
                    self.min_duration_secs, self.max_duration_secs, secs
                ),
            ));
        }
        Ok(Duration::from_secs(secs))
    }

    /// Validate a session id: non-blank and at most `max_session_id_len` bytes.
    pub fn check_session_id(&self, session_id: &str) -> PerfSimResult<()> {
        if session_id.trim().is_empty() {
            return Err(PerfSimError::invalid("sessionId", "must not be empty"));
        }
        if session_id.len() > self.max_session_id_len {
            return Err(PerfSimError::invalid(
                "sessionId",
                format!(
                    "must be at most {} bytes, got {}",
                    self.max_session_id_len,
                    session_id.len()
                ),
            ));
        }
        Ok(())
    }

    /// Registry TTL as a duration.
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_secs)
    }

    /// Default lock acquisition ceiling as a duration.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }
}

/// Builder for [`SimulatorConfig`].
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfigBuilder {
    config: SimulatorConfig,
}

impl SimulatorConfigBuilder {
    /// Put the store, lock and scratch directories under one base directory.
    pub fn base_dir(mut self, base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        self.config.storage_dir = base.join("store");
        self.config.lock_dir = base.join("locks");
        self.config.scratch_dir = base.join("scratch");
        self
    }

    /// Set the registry TTL.
    pub fn registry_ttl_secs(mut self, secs: u64) -> Self {
        self.config.registry_ttl_secs = secs;
        self
    }

    /// Set the registry cap.
    pub fn max_registry_entries(mut self, entries: usize) -> Self {
        self.config.max_registry_entries = entries;
        self
    }

    /// Set the accepted duration range.
    pub fn duration_bounds(mut self, min_secs: u64, max_secs: u64) -> Self {
        self.config.min_duration_secs = min_secs;
        self.config.max_duration_secs = max_secs;
        self
    }

    /// Set the largest accepted duration.
    pub fn max_duration_secs(mut self, secs: u64) -> Self {
        self.config.max_duration_secs = secs;
        self
    }

    /// Set the worker bound.
    pub fn max_concurrent_workers(mut self, workers: u32) -> Self {
        self.config.max_concurrent_workers = workers;
        self
    }

    /// Set the largest accepted session lock hold.
    pub fn max_lock_hold_secs(mut self, secs: u64) -> Self {
        self.config.max_lock_hold_secs = secs;
        self
    }

    /// Set the longest accepted session id.
    pub fn max_session_id_len(mut self, bytes: usize) -> Self {
        self.config.max_session_id_len = bytes;
        self
    }

    /// Set the default lock acquisition ceiling.
    pub fn lock_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.config.lock_timeout_secs = secs;
        self
    }

    /// Set the CPU iterations of one blocked request at full intensity.
    pub fn blocking_base_iterations(mut self, iterations: u64) -> Self {
        self.config.blocking_base_iterations = iterations;
        self
    }

    /// Set the probe work sizes.
    pub fn probe_work(mut self, cpu_iterations: u64, blocking_iterations: u64) -> Self {
        self.config.cpu_probe_iterations = cpu_iterations;
        self.config.blocking_probe_iterations = blocking_iterations;
        self
    }

    /// Set the pause between blocking worker passes.
    pub fn worker_pause_ms(mut self, ms: u64) -> Self {
        self.config.worker_pause_ms = ms;
        self
    }

    /// Set the stored event log capacity.
    pub fn event_log_capacity(mut self, capacity: usize) -> Self {
        self.config.event_log_capacity = capacity;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> PerfSimResult<SimulatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        SimulatorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_builder_base_dir() {
        let config = SimulatorConfig::builder()
            .base_dir("/tmp/perfsim-test")
            .build()
            .unwrap();
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/perfsim-test/store"));
        assert_eq!(config.lock_dir, PathBuf::from("/tmp/perfsim-test/locks"));
    }

    #[test]
    fn test_builder_rejects_inverted_bounds() {
        let err = SimulatorConfig::builder()
            .duration_bounds(30, 10)
            .build()
            .unwrap_err();
        assert!(matches!(err, PerfSimError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            SimulatorConfig::from_json_str(
                r#"{"max_duration_secs": 90, "max_lock_hold_secs": 60, "lock_timeout_secs": null}"#,
            )
            .unwrap();
        assert_eq!(config.max_duration_secs, 90);
        assert_eq!(config.max_lock_hold_secs, 60);
        assert_eq!(config.lock_timeout_secs, None);
        assert_eq!(config.blocking_ttl_slack_secs, 60);
    }

    #[test]
    fn test_lock_hold_may_not_outlive_duration_bound() {
        let err = SimulatorConfig::builder()
            .max_duration_secs(60)
            .build()
            .unwrap_err();
        assert!(matches!(err, PerfSimError::InvalidConfiguration(_)));

        let config = SimulatorConfig::builder()
            .max_duration_secs(60)
            .max_lock_hold_secs(60)
            .build()
            .unwrap();
        assert_eq!(config.max_lock_hold_secs, 60);
    }

    #[test]
    fn test_session_id_length_is_bounded() {
        let config = SimulatorConfig::default();
        config.check_session_id(&"a".repeat(64)).unwrap();
        assert!(matches!(
            config.check_session_id(&"a".repeat(65)),
            Err(PerfSimError::InvalidParameter { name: "sessionId", .. })
        ));
        assert!(matches!(
            config.check_session_id(" "),
            Err(PerfSimError::InvalidParameter { name: "sessionId", .. })
        ));

        let err = SimulatorConfig::builder()
            .max_session_id_len(SESSION_ID_LEN_LIMIT + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, PerfSimError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let err = SimulatorConfig::from_json_str("{max:").unwrap_err();
        assert!(matches!(err, PerfSimError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_check_duration_bounds() {
        let config = SimulatorConfig::default();
        assert_eq!(
            config.check_duration("durationSeconds", 5).unwrap(),
            Duration::from_secs(5)
        );
        assert!(matches!(
            config.check_duration("durationSeconds", 0),
            Err(PerfSimError::InvalidParameter { name: "durationSeconds", .. })
        ));
        assert!(config.check_duration("durationSeconds", 601).is_err());
    }
}
