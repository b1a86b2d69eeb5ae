//! # Configuration Modules
//!
//! Engine tuning knobs, loaded from JSON with defaults for every key.

/// Engine configuration and its JSON loader.
pub mod engine_config;

pub use engine_config::{EngineConfig, DEFAULT_ENGINE_CONSUMER, DEFAULT_IDLE_CHECK_DELAY_MS};
