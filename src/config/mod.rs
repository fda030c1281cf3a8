//! Application configuration.
//!
//! Loads the `event_bus` section from YAML files and environment variables.

mod event_bus;

pub use event_bus::EventBusOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "topicbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TOPICBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TOPICBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TOPICBUS_LOG";
/// Name of the configuration section holding the bus options.
pub const EVENT_BUS_SECTION: &str = "event_bus";

use serde::Deserialize;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Section '{0}' is not present in configuration")]
    MissingSection(&'static str),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus options (required by producers and consumers).
    pub event_bus: Option<EventBusOptions>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `topicbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// The validated event bus options.
    ///
    /// Fails if the section is absent or any value is out of range.
    pub fn event_bus(&self) -> Result<EventBusOptions, ConfigError> {
        let options = self
            .event_bus
            .clone()
            .ok_or(ConfigError::MissingSection(EVENT_BUS_SECTION))?;
        options.validate()?;
        Ok(options)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            event_bus: Some(EventBusOptions::for_test()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default_has_no_bus_section() {
        let config = Config::default();
        assert!(config.event_bus.is_none());
        assert!(matches!(
            config.event_bus(),
            Err(ConfigError::MissingSection(EVENT_BUS_SECTION))
        ));
    }

    #[test]
    fn test_config_for_test() {
        let options = Config::for_test().event_bus().unwrap();
        assert_eq!(options.max_concurrent_calls, 10);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "event_bus:\n  connection_string: \"memory://local\"\n  topic: \"edge-device\"\n  subscription: \"edge-worker\"\n  use_sessions: true\n  max_concurrent_calls: 4"
        )
        .unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
        let options = config.event_bus().unwrap();

        assert_eq!(options.topic, "edge-device");
        assert_eq!(options.subscription, "edge-worker");
        assert!(options.use_sessions);
        assert_eq!(options.max_concurrent_calls, 4);
        // Unset values keep their defaults.
        assert_eq!(options.max_delivery_count, 10);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "event_bus:\n  connection_string: \"memory://local\"\n  topic: \"edge-device\"\n  subscription: \"edge-worker\""
        )
        .unwrap();

        std::env::set_var("TOPICBUS__EVENT_BUS__MAX_DELIVERY_COUNT", "3");
        let result = Config::load(Some(file.path().to_str().unwrap()));
        std::env::remove_var("TOPICBUS__EVENT_BUS__MAX_DELIVERY_COUNT");

        let options = result.unwrap().event_bus().unwrap();
        assert_eq!(options.max_delivery_count, 3);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        let result = Config::load(Some("/nonexistent/topicbus-config.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
