use anyhow::{Context, Result};
use clap::Parser;
use das_core::configs::{EngineConfig, DEFAULT_ENGINE_CONSUMER, DEFAULT_IDLE_CHECK_DELAY_MS};
use das_core::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Device access engine: attaches drivers to devices from a scenario file", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "DAS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DAS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DAS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DAS_IDLE_CHECK_DELAY_MS", help = "Delay in milliseconds between a driver disappearing and the idle sweep.")]
    pub idle_check_delay_ms: Option<u64>,

    #[clap(long, env = "DAS_ENGINE_CONSUMER", help = "Consumer id the engine itself holds devices under.")]
    pub engine_consumer: Option<String>,

    #[clap(long, env = "DAS_MAX_SESSION_ATTEMPTS", help = "Upper bound on attach attempts per device session.")]
    pub max_session_attempts: Option<usize>,

    #[clap(long, env = "DAS_SCENARIO_PATH", help = "JSON file with the devices, drivers and locator drivers to register.")]
    pub scenario_path: Option<PathBuf>,

    #[clap(
        long,
        env = "DAS_RUN_ONCE",
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Print the engine snapshot after the scenario settles and exit."
    )]
    pub run_once: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            idle_check_delay_ms: other.idle_check_delay_ms.or(self.idle_check_delay_ms),
            engine_consumer: other.engine_consumer.or(self.engine_consumer),
            max_session_attempts: other.max_session_attempts.or(self.max_session_attempts),
            scenario_path: other.scenario_path.or(self.scenario_path),
            run_once: other.run_once.or(self.run_once),
        }
    }

    fn defaults() -> Config {
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            idle_check_delay_ms: Some(DEFAULT_IDLE_CHECK_DELAY_MS),
            engine_consumer: Some(DEFAULT_ENGINE_CONSUMER.to_string()),
            run_once: Some(false),
            ..Default::default()
        }
    }

    /// The engine part of the merged configuration, validated.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            idle_check_delay_ms: self.idle_check_delay_ms.unwrap_or(defaults.idle_check_delay_ms),
            engine_consumer: self.engine_consumer.clone().unwrap_or(defaults.engine_consumer),
            max_session_attempts: self.max_session_attempts,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Resolves the configuration: defaults < config file < environment/CLI.
pub fn load_config() -> Result<Config> {
    let cli = Config::parse();
    let file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_das.conf"));
    merge_sources(cli, &file_path)
}

fn merge_sources(cli: Config, file_path: &Path) -> Result<Config> {
    let mut current = Config::defaults();

    if file_path.exists() {
        let text = fs::read_to_string(file_path)
            .with_context(|| format!("failed to read config file {}", file_path.display()))?;
        let file_config: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", file_path.display()))?;
        current = current.merge(file_config);
    }

    // clap has already folded the environment into `cli`.
    Ok(current.merge(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_das.conf");
        fs::write(&path, r#"{ "logLevel": "debug", "idleCheckDelayMs": 50, "maxSessionAttempts": 4 }"#).unwrap();

        let cli = Config {
            log_level: Some("warn".to_string()),
            ..Default::default()
        };
        let merged = merge_sources(cli, &path).unwrap();

        assert_eq!(merged.log_level.as_deref(), Some("warn"));
        assert_eq!(merged.idle_check_delay_ms, Some(50));
        assert_eq!(merged.log_dir, Some(PathBuf::from("./logs")));

        let engine = merged.engine_config().unwrap();
        assert_eq!(engine.max_session_attempts, Some(4));
        assert_eq!(engine.engine_consumer, DEFAULT_ENGINE_CONSUMER);
    }

    #[test]
    fn missing_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let merged = merge_sources(Config::default(), &dir.path().join("absent.conf")).unwrap();
        assert_eq!(merged.run_once, Some(false));
        assert_eq!(merged.engine_config().unwrap(), EngineConfig::default());
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_das.conf");
        fs::write(&path, "{ not json").unwrap();
        assert!(merge_sources(Config::default(), &path).is_err());
    }

    #[test]
    fn run_once_works_as_a_bare_flag() {
        let bare = Config::try_parse_from(["server_das", "--run-once"]).unwrap();
        assert_eq!(bare.run_once, Some(true));

        let explicit = Config::try_parse_from(["server_das", "--run-once", "false"]).unwrap();
        assert_eq!(explicit.run_once, Some(false));
    }

    #[test]
    fn invalid_engine_values_are_rejected() {
        let config = Config {
            max_session_attempts: Some(0),
            ..Config::defaults()
        };
        assert!(config.engine_config().is_err());
    }
}
