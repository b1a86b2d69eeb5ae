/// Subscriber setup (console and JSON file) and log file pruning.
pub mod setup;

pub use setup::{cleanup_old_logs, setup_logging, LoggingError, LoggingOptions};
