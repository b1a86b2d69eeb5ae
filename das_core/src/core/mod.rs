//! # Engine Core
//!
//! The serialized worker and everything that runs on it.

/// Cloneable engine handle, lifecycle and registry callbacks.
pub mod engine;
/// Engine state, the task enum and snapshots.
pub mod state;
/// The per-device attachment session.
pub mod attach;
/// Idle device detection and unused driver cleanup.
pub mod idle;
/// Candidate scoring and selection.
pub mod matcher;
/// Per-driver bookkeeping.
pub mod driver_attributes;
/// The platform-started gate.
pub mod startup;
/// The single-worker task queue and delayed scheduler.
pub mod worker;

pub use attach::SessionOutcome;
pub use driver_attributes::{AttachOutcome, DriverAttributes};
pub use engine::Engine;
pub use matcher::{DriverMatcher, DriverSelector, Match};
pub use startup::{platform_status, PlatformStarter, PlatformStatus};
pub use state::{DeviceSummary, DriverSummary, EngineSnapshot, EngineState, Task};
pub use worker::{NamedTask, TaskQueue};
