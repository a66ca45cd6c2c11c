//! Client configuration.
//!
//! `ClientConfig` collects everything needed to build a [`DeviceClient`]. It
//! deserializes from any serde format (the agent reads it from a TOML table),
//! every field has a default, and constraints are checked with `validator`
//! before a client is created.
//!
//! ```toml
//! host_name = "myhub.azure-devices.net"
//! device_id = "sensor-17"
//! max_inflight = 10
//! message_timeout_ms = 60000
//!
//! [credential]
//! type = "shared_access_key"
//! key = "c2VjcmV0"
//!
//! [retry]
//! policy = "exponential_backoff_with_jitter"
//! timeout_secs = 0
//! ```
//!
//! [`DeviceClient`]: crate::DeviceClient

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    connection_string::HubUri,
    retry::{RetryPolicy, RetryTiming},
    transport::TransportSettings,
};

/// How the device proves its identity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Symmetric device key; the transport derives SAS tokens from it.
    SharedAccessKey { key: String },
    /// A pre-generated SAS token.
    SharedAccessSignature { signature: String },
    /// Client certificate configured on the transport (`TrustedCerts`, TLS).
    X509,
    /// Credentials come from an external device-auth provider.
    DeviceAuth,
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::SharedAccessKey { .. } => "shared_access_key",
            Credential::SharedAccessSignature { .. } => "shared_access_signature",
            Credential::X509 => "x509",
            Credential::DeviceAuth => "device_auth",
        }
    }
}

impl Default for Credential {
    fn default() -> Self {
        Credential::X509
    }
}

// secrets stay out of logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SharedAccessKey { .. } => f.write_str("SharedAccessKey(<redacted>)"),
            Credential::SharedAccessSignature { .. } => {
                f.write_str("SharedAccessSignature(<redacted>)")
            }
            Credential::X509 => f.write_str("X509"),
            Credential::DeviceAuth => f.write_str("DeviceAuth"),
        }
    }
}

/// Reconnect behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    pub policy: RetryPolicy,

    /// Give up after this many seconds of failed reconnects. 0 retries forever.
    pub timeout_secs: u64,

    #[validate(nested)]
    pub timing: RetryTiming,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            timeout_secs: 0,
            timing: RetryTiming::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Fully qualified hub host name, `<hub>.<suffix>`.
    #[validate(custom(function = "validate_host_name"))]
    pub host_name: String,

    #[validate(length(
        min = 1,
        max = 128,
        message = "Device id must be between 1 and 128 characters"
    ))]
    pub device_id: String,

    #[validate(custom(function = "validate_credential"))]
    pub credential: Credential,

    /// Connect through an edge gateway instead of the hub directly.
    #[validate(length(min = 1, max = 255, message = "Gateway host name must not be empty"))]
    pub gateway_host_name: Option<String>,

    #[validate(nested)]
    pub retry: RetryConfig,

    /// Seconds a connection attempt may take before it counts as failed.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Keep-alive interval in seconds, forwarded to the transport.
    #[validate(range(
        min = 1,
        max = 1740,
        message = "Keep alive must be between 1 and 1740 seconds"
    ))]
    pub keep_alive: u64,

    /// Telemetry messages handed to the transport but not yet acknowledged.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: usize,

    /// Largest telemetry payload accepted by `send_event`, in bytes.
    #[validate(range(
        min = 1,
        max = 1_048_576,
        message = "Max message size must be between 1 byte and 1 MiB"
    ))]
    pub max_message_size: usize,

    /// Milliseconds a telemetry message may wait for its ack. Unset waits forever.
    pub message_timeout_ms: Option<u64>,

    /// Cap on queued plus in-flight telemetry. Unset is unbounded.
    #[validate(range(min = 1, message = "Max pending messages must be at least 1"))]
    pub max_pending_messages: Option<usize>,

    #[validate(range(
        min = 1,
        max = 104_857_600,
        message = "Upload block size must be between 1 byte and 100 MiB"
    ))]
    pub upload_block_size: usize,

    /// Transport events handled per `dispatch_once` call.
    #[validate(range(
        min = 1,
        max = 10_000,
        message = "Max events per dispatch must be between 1 and 10000"
    ))]
    pub max_events_per_dispatch: usize,

    pub product_info: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_name: "iothub.local".to_string(),
            device_id: Uuid::new_v4().to_string(),
            credential: Credential::default(),
            gateway_host_name: None,
            retry: RetryConfig::default(),
            connection_timeout: 30,
            keep_alive: 240,
            max_inflight: 10,
            max_message_size: 256 * 1024,
            message_timeout_ms: None,
            max_pending_messages: None,
            upload_block_size: 4 * 1024 * 1024,
            max_events_per_dispatch: 64,
            product_info: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn message_timeout(&self) -> Option<Duration> {
        self.message_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            host_name: self.host_name.clone(),
            device_id: self.device_id.clone(),
            gateway_host_name: self.gateway_host_name.clone(),
            credential: self.credential.clone(),
            keep_alive: Duration::from_secs(self.keep_alive),
            connection_timeout: Duration::from_secs(self.connection_timeout),
            product_info: self.product_info.clone(),
        }
    }
}

fn validate_host_name(host: &str) -> Result<(), ValidationError> {
    HubUri::parse(host).map(|_| ()).map_err(|e| {
        ValidationError::new("invalid_host_name").with_message(e.to_string().into())
    })
}

fn validate_credential(credential: &Credential) -> Result<(), ValidationError> {
    let empty = match credential {
        Credential::SharedAccessKey { key } => key.trim().is_empty(),
        Credential::SharedAccessSignature { signature } => signature.trim().is_empty(),
        Credential::X509 | Credential::DeviceAuth => false,
    };
    if empty {
        return Err(ValidationError::new("empty_credential")
            .with_message(format!("{} must not be empty", credential.kind()).into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.policy, RetryPolicy::ExponentialBackoffWithJitter);
        assert_eq!(config.retry.timeout_secs, 0);
        assert_eq!(config.max_message_size, 262_144);
        assert_eq!(config.upload_block_size, 4_194_304);
        assert!(Uuid::parse_str(&config.device_id).is_ok());
    }

    #[test]
    fn test_invalid_host_name() {
        let config = ClientConfig::new("localhost", "dev");
        let errors = config.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("host_name"));
    }

    #[test]
    fn test_empty_key_rejected() {
        let config = ClientConfig::new("hub.example.net", "dev")
            .with_credential(Credential::SharedAccessKey { key: " ".into() });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_retry_timing_validated() {
        let mut config = ClientConfig::new("hub.example.net", "dev");
        config.retry.timing.jitter_ratio = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_from_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
            host_name = "myhub.azure-devices.net"
            device_id = "sensor-17"
            message_timeout_ms = 5000

            [credential]
            type = "shared_access_key"
            key = "c2VjcmV0"

            [retry]
            policy = "interval"
            timeout_secs = 120

            [retry.timing]
            interval_secs = 10
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.device_id, "sensor-17");
        assert_eq!(config.retry.policy, RetryPolicy::Interval);
        assert_eq!(config.retry.timing.interval_secs, 10);
        assert_eq!(config.retry.timing.max_delay_secs, 60);
        assert_eq!(config.message_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.max_inflight, 10);
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let credential = Credential::SharedAccessKey {
            key: "super-secret".into(),
        };
        assert!(!format!("{credential:?}").contains("super-secret"));
    }

    #[test]
    fn test_transport_settings_copy_durations() {
        let settings = ClientConfig::new("hub.example.net", "dev").transport_settings();
        assert_eq!(settings.keep_alive, Duration::from_secs(240));
        assert_eq!(settings.connection_timeout, Duration::from_secs(30));
        assert_eq!(settings.endpoint(), "hub.example.net");
    }
}
