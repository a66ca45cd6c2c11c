//! Runtime options.
//!
//! Options are addressed by their wire names (`messageTimeout`, `keepalive`,
//! ...). Some are applied by the engine itself, the rest are forwarded to the
//! transport; both kinds are remembered so [`DeviceClient::option`] can report
//! them back.
//!
//! [`DeviceClient::option`]: crate::DeviceClient::option

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Proxy settings for `proxy_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    U64(u64),
    Text(String),
    Proxy(ProxyOptions),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::U64(_) => "integer",
            OptionValue::Text(_) => "string",
            OptionValue::Proxy(_) => "proxy",
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            OptionValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<u64> for OptionValue {
    fn from(v: u64) -> Self {
        OptionValue::U64(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

impl From<ProxyOptions> for OptionValue {
    fn from(v: ProxyOptions) -> Self {
        OptionValue::Proxy(v)
    }
}

/// Who acts on an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionOwner {
    Engine,
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientOption {
    /// Milliseconds a telemetry message may wait for its ack; 0 disables.
    MessageTimeout,
    /// Seconds between keep-alive pings.
    KeepAlive,
    ProxyData,
    /// PEM bundle used to verify the hub.
    TrustedCerts,
    /// Appended to the user agent reported to the hub.
    ProductInfo,
    RetryIntervalSec,
    RetryMaxDelaySecs,
    LogTrace,
    Compression,
}

impl ClientOption {
    pub const ALL: [ClientOption; 9] = [
        ClientOption::MessageTimeout,
        ClientOption::KeepAlive,
        ClientOption::ProxyData,
        ClientOption::TrustedCerts,
        ClientOption::ProductInfo,
        ClientOption::RetryIntervalSec,
        ClientOption::RetryMaxDelaySecs,
        ClientOption::LogTrace,
        ClientOption::Compression,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ClientOption::MessageTimeout => "messageTimeout",
            ClientOption::KeepAlive => "keepalive",
            ClientOption::ProxyData => "proxy_data",
            ClientOption::TrustedCerts => "TrustedCerts",
            ClientOption::ProductInfo => "product_info",
            ClientOption::RetryIntervalSec => "retry_interval_sec",
            ClientOption::RetryMaxDelaySecs => "retry_max_delay_secs",
            ClientOption::LogTrace => "logtrace",
            ClientOption::Compression => "compression",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ClientError> {
        Self::ALL
            .into_iter()
            .find(|option| option.name() == name)
            .ok_or_else(|| ClientError::InvalidArgument(format!("unknown option '{name}'")))
    }

    pub fn owner(&self) -> OptionOwner {
        match self {
            ClientOption::MessageTimeout
            | ClientOption::ProductInfo
            | ClientOption::RetryIntervalSec
            | ClientOption::RetryMaxDelaySecs => OptionOwner::Engine,
            ClientOption::KeepAlive
            | ClientOption::ProxyData
            | ClientOption::TrustedCerts
            | ClientOption::LogTrace
            | ClientOption::Compression => OptionOwner::Transport,
        }
    }

    /// Checks that `value` has the type and range this option accepts.
    pub fn check(&self, value: &OptionValue) -> Result<(), ClientError> {
        let ok = match (self, value) {
            (ClientOption::MessageTimeout, OptionValue::U64(_)) => true,
            (
                ClientOption::KeepAlive
                | ClientOption::RetryIntervalSec
                | ClientOption::RetryMaxDelaySecs,
                OptionValue::U64(v),
            ) => {
                if *v == 0 {
                    return Err(ClientError::InvalidArgument(format!(
                        "option '{}' must be greater than zero",
                        self.name()
                    )));
                }
                true
            }
            (ClientOption::ProxyData, OptionValue::Proxy(proxy)) => {
                if proxy.host.is_empty() {
                    return Err(ClientError::InvalidArgument(
                        "proxy host must not be empty".into(),
                    ));
                }
                // credentials come as a pair or not at all
                if proxy.username.is_some() != proxy.password.is_some() {
                    return Err(ClientError::InvalidArgument(
                        "proxy username and password must be set together".into(),
                    ));
                }
                true
            }
            (ClientOption::TrustedCerts | ClientOption::ProductInfo, OptionValue::Text(_)) => true,
            (ClientOption::LogTrace | ClientOption::Compression, OptionValue::Bool(_)) => true,
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(ClientError::InvalidArgument(format!(
                "option '{}' does not accept a {} value",
                self.name(),
                value.type_name()
            )))
        }
    }
}

impl fmt::Display for ClientOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last value set for each option.
#[derive(Debug, Clone, Default)]
pub struct OptionStore {
    values: HashMap<ClientOption, OptionValue>,
}

impl OptionStore {
    pub fn insert(&mut self, option: ClientOption, value: OptionValue) {
        self.values.insert(option, value);
    }

    pub fn get(&self, option: ClientOption) -> Option<&OptionValue> {
        self.values.get(&option)
    }
}
