//! # perfsim
//!
//! Coordination layer for a performance pathology simulator.
//!
//! Request handlers in a process-per-request server share no memory. This
//! crate lets them agree on which simulations are running, on a time-boxed
//! blocking window, and on per-session mutual exclusion, using nothing but a
//! TTL-aware store that every process can reach and OS file locks.
//!
//! ## Architecture
//!
//! ```text
//!   Simulator (controller facade)
//!     ├── BlockingService ──── WorkerPool
//!     ├── SessionLockService ─ OS file locks
//!     ├── MetricsAggregator ── LoadTestGauge
//!     └── SimulationTracker (registry, self-healing)
//!           └── SharedStorage: InMemoryStorage | FileStorage (lazy TTL)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use perfsim::{Simulator, SimulatorConfig, SimulationParams, SimulationType};
//!
//! let simulator = Simulator::builder()
//!     .config(SimulatorConfig::builder().base_dir("/var/run/perfsim").build()?)
//!     .build()
//!     .await?;
//!
//! simulator.create_simulation(SimulationParams::cpu_stress(80), 30).await?;
//! let active = simulator
//!     .get_active_simulations_by_type(SimulationType::CpuStress)
//!     .await?;
//! ```
//!
//! ## Consistency
//!
//! Shared state is best effort and eventually visible. Read-modify-write
//! cycles on the store are not atomic, concurrent writers race and the last
//! write wins. Stale records are healed by whichever reader notices them.

#![deny(missing_docs)]

pub mod blocking;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod session_lock;
pub mod simulation;
pub mod simulator;
pub mod storage;
pub mod time;
pub mod work;
pub mod workers;

pub use blocking::{BlockingService, BlockingStart, BlockingWindow, BlockingWork};
pub use config::{SimulatorConfig, SimulatorConfigBuilder};
pub use error::{PerfSimError, PerfSimResult};
pub use events::{
    EventError, EventLevel, EventSink, FanoutEventSink, LoggedEvent, SimulationEvent,
    StorageEventLog, TracingEventSink,
};
pub use metrics::{LoadTestGauge, LoadTestStatus, MetricsAggregator, MetricsSnapshot};
pub use session_lock::{HolderInfo, LockHoldResult, ProbeResult, SessionLockService};
pub use simulation::{
    CpuStressParams, MemoryPressureParams, RequestBlockingParams, SessionLockParams, Simulation,
    SimulationParams, SimulationStatus, SimulationTracker, SimulationType, SlowRequestParams,
};
pub use simulator::{Simulator, SimulatorBuilder};
pub use storage::{FileStorage, InMemoryStorage, SharedStorage, StorageError, StorageExt};
pub use time::{Clock, ManualClock, SystemClock};
pub use workers::WorkerPool;
