//! Agent configuration loading and validation.
//!
//! `AgentConfig` aggregates the logger, device client and telemetry sections
//! of a single TOML file. It is loaded once at startup and stays immutable
//! afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use iothub_device_client::{ClientConfig, ConnectionString};
use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};
use validator::Validate;

use self::{logger::LoggerConfig, telemetry::TelemetryConfig};

pub mod logger;
pub mod telemetry;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "IOTHUB_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/iothub-agent/config.toml";

/// UTC timestamp used by the `print_*` macros.
pub fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .unwrap_or_default()
}

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level agent configuration.
///
/// ```toml
/// connection_string = "HostName=myhub.azure-devices.net;DeviceId=edge-7;SharedAccessKey=..."
///
/// [logger]
/// level = "debug"
///
/// [client]
/// max_inflight = 20
///
/// [client.retry]
/// policy = "interval"
/// timeout_secs = 600
///
/// [telemetry]
/// heartbeat_interval_secs = 30
/// ```
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// When set, overrides the client's host, device id and credential.
    pub connection_string: Option<String>,

    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub client: ClientConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

impl AgentConfig {
    /// Locates, loads and validates the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// `$IOTHUB_AGENT_CONFIG` first, then `/etc/iothub-agent/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses TOML, applies the connection string and validates the result.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut config: AgentConfig =
            toml::from_str(input).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(connection_string) = config.connection_string.as_deref() {
            let parsed = ConnectionString::parse(connection_string)
                .map_err(|e| ConfigError::ValidationError(format!("connection_string: {e}")))?;
            config.client.host_name = parsed.host_name;
            config.client.device_id = parsed.device_id;
            config.client.credential = parsed.credential;
            config.client.gateway_host_name = parsed.gateway_host_name;
        }

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use iothub_device_client::RetryPolicy;

    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = AgentConfig::parse("").unwrap();
        assert_eq!(config.logger.level, "info");
        assert_eq!(config.telemetry.heartbeat_interval_secs, 60);
        assert_eq!(
            config.client.retry.policy,
            RetryPolicy::ExponentialBackoffWithJitter
        );
    }

    #[test]
    fn test_connection_string_overrides_client_identity() {
        let config = AgentConfig::parse(
            r#"
            connection_string = "HostName=plant.azure-devices.net;DeviceId=press-4;SharedAccessKey=a2V5"

            [client]
            device_id = "ignored"
            max_inflight = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.client.host_name, "plant.azure-devices.net");
        assert_eq!(config.client.device_id, "press-4");
        assert_eq!(config.client.credential.kind(), "shared_access_key");
        assert_eq!(config.client.max_inflight, 3);
    }

    #[test]
    fn test_bad_connection_string_is_a_validation_error() {
        let err = AgentConfig::parse(r#"connection_string = "HostName=;DeviceId=x""#).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_nested_client_validation() {
        let err = AgentConfig::parse(
            r#"
            [client]
            max_inflight = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = AgentConfig::parse("[client").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = AgentConfig::load(Path::new("/nonexistent/iothub-agent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000000Z".len());
    }
}
