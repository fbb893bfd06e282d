use respawn_config::GenericConfiguration;
use respawn_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LogLevel(LevelFilter::INFO.to_string())
}

/// Logging configuration.
///
/// Read from the top level of the configuration, so `RESPAWN_LOG_LEVEL` and `RESPAWN_LOG_FORMAT_JSON` override it
/// when environment variables are loaded.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, such as `info` or `respawn_core=debug,warn`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to emit JSON instead of human-readable lines.
    #[serde(default)]
    pub log_format_json: bool,
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
        }
    }
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }
}

/// Validated filtering directives.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct LogLevel(String);

impl LogLevel {
    /// Builds an `EnvFilter` from the directives.
    pub fn as_env_filter(&self) -> EnvFilter {
        EnvFilter::builder().parse_lossy(&self.0)
    }

    /// Returns the directives as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&value)
            .map(|_| Self(value))
            .error_context("Failed to parse valid log level.")
    }
}

#[cfg(test)]
mod tests {
    use respawn_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn defaults_to_info() {
        let config = LoggingConfiguration::from_configuration(&GenericConfiguration::empty()).unwrap();
        assert_eq!(config.log_level.as_str(), "info");
        assert!(!config.log_format_json);
    }

    #[test]
    fn reads_top_level_keys() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("log_level: respawn_core=debug,warn\nlog_format_json: true\n")
            .unwrap()
            .into_generic();

        let config = LoggingConfiguration::from_configuration(&config).unwrap();
        assert_eq!(config.log_level.as_str(), "respawn_core=debug,warn");
        assert!(config.log_format_json);
    }

    #[test]
    fn rejects_invalid_directives() {
        assert!(LogLevel::try_from(String::new()).is_err());
        assert!(LogLevel::try_from("respawn=loud".to_string()).is_err());
        assert!(LogLevel::try_from("debug".to_string()).is_ok());
    }
}
