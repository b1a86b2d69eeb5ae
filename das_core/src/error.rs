//! # Error Types
//!
//! One `thiserror` enum per layer. Driver and catalog failures are raised by
//! external collaborators; `EngineError` is what escapes a worker task and is
//! logged at the task-queue boundary.

use thiserror::Error;

use crate::capability::{DriverId, ServiceId};

/// A failure raised by a driver while scoring or attaching a device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("match failed: {0}")]
    Match(String),

    #[error("attach failed: {0}")]
    Attach(String),

    #[error("driver panicked: {0}")]
    Panicked(String),
}

/// A failure raised while discovering, loading or unloading drivers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("driver locator failed: {0}")]
    Locator(String),

    #[error("failed to install driver package at {location}: {reason}")]
    Install { location: String, reason: String },

    #[error("failed to unload driver {driver_id}: {reason}")]
    Unload { driver_id: DriverId, reason: String },
}

/// Errors that abort a single worker task.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("attachment session for device {device} exceeded {limit} attempts")]
    SessionBoundExceeded { device: ServiceId, limit: usize },

    #[error("engine has been shut down")]
    Shutdown,

    #[error("platform status channel closed before the platform started")]
    PlatformGone,

    #[error("engine worker dropped the reply")]
    WorkerGone,
}

/// Errors raised while loading or validating engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error occurred: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("invalid configuration value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
