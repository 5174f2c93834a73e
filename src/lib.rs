//! Concurrent destructive write/verify testing of many block devices at once.
//!
//! Every device gets its own worker thread that overwrites the whole device
//! with a reproducible pattern, flushes it, reads it back and compares. Faults
//! are collected centrally and progress can be polled while the run is live.

pub mod device;
pub mod error;
pub mod fault;
pub mod log;
pub mod orchestrator;
pub mod pattern;
pub mod progress;
pub mod units;
pub mod worker;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use device::{BlockTarget, FileDevice};
pub use error::{ConfigError, SetupError, SetupErrorKind};
pub use fault::{Fault, FaultKind, FaultTracker};
pub use log::RunLog;
pub use orchestrator::{
    start_run, Canceller, DeviceSpec, Orchestrator, RunConfig, RunHandle, RunResult, TargetSpec,
    DEFAULT_CHUNK_SIZE,
};
pub use pattern::{PatternGenerator, PatternKind, DEFAULT_SEED};
pub use progress::{DeviceState, DeviceStatus, ProgressSnapshot, RunSnapshot, RunStatus};
pub use units::{human_bytes, parse_size_with_suffix};
pub use worker::{inspect_region, DeviceReport, RegionDiff, RunEvent};
