//! Simulation records and the registry that tracks them.

pub mod tracker;
pub mod types;

pub use tracker::{SimulationTracker, REGISTRY_KEY};
pub use types::{
    CpuStressParams, MemoryPressureParams, RequestBlockingParams, SessionLockParams, Simulation,
    SimulationParams, SimulationStatus, SimulationType, SlowRequestParams,
};
