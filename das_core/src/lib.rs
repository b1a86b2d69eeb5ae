//! # das_core
//!
//! A device access engine: keeps track of registered devices, drivers and
//! driver locators, attaches the best matching driver to every device,
//! follows driver referrals and unloads drivers nobody uses any more.

/// Typed properties, capability handles and the registry facade.
pub mod capability;
/// Driver discovery, loading and unloading.
pub mod catalog;
/// Engine configuration.
pub mod configs;
/// The engine itself.
pub mod core;
/// Error types for every layer.
pub mod error;
#[cfg(feature = "loggers")]
/// Logging setup.
pub mod loggers;

pub use crate::configs::EngineConfig;
pub use crate::core::{platform_status, Engine, EngineSnapshot, PlatformStarter, PlatformStatus};
pub use crate::error::{CatalogError, ConfigError, DriverError, EngineError};
