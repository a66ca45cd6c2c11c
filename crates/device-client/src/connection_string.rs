//! Device connection strings and hub host names.
//!
//! A connection string is a `;`-separated list of `key=value` pairs:
//!
//! ```text
//! HostName=myhub.azure-devices.net;DeviceId=dev-01;SharedAccessKey=c2VjcmV0
//! HostName=myhub.azure-devices.net;DeviceId=dev-01;x509=true;GatewayHostName=edge.local
//! ```
//!
//! Exactly one credential (`SharedAccessKey`, `SharedAccessSignature` or
//! `x509=true`) must be present.

use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::config::Credential;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionStringError {
    #[error("connection string is empty")]
    Empty,

    #[error("malformed segment '{0}', expected key=value")]
    MalformedSegment(String),

    #[error("duplicate key '{0}'")]
    DuplicateKey(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("exactly one of SharedAccessKey, SharedAccessSignature or x509=true is required")]
    Credential,

    #[error("invalid host name '{0}', expected <hub>.<suffix>")]
    InvalidHostName(String),
}

/// A hub host name split into the hub name and the domain suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubUri {
    pub hub_name: String,
    pub suffix: String,
}

impl HubUri {
    /// Splits `host` at its first dot: `myhub.azure-devices.net` gives
    /// `myhub` and `azure-devices.net`.
    pub fn parse(host: &str) -> Result<Self, ConnectionStringError> {
        let invalid = || ConnectionStringError::InvalidHostName(host.to_string());
        let (hub_name, suffix) = host.split_once('.').ok_or_else(invalid)?;
        if hub_name.is_empty() || suffix.is_empty() || suffix.starts_with('.') {
            return Err(invalid());
        }
        if host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Self {
            hub_name: hub_name.to_string(),
            suffix: suffix.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub credential: Credential,
    pub gateway_host_name: Option<String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self, ConnectionStringError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ConnectionStringError::Empty);
        }

        let mut host_name = None;
        let mut device_id = None;
        let mut key = None;
        let mut signature = None;
        let mut x509 = false;
        let mut gateway = None;

        for segment in input.split(';').filter(|s| !s.trim().is_empty()) {
            // values may contain '=' (base64 padding), so split on the first one only
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::MalformedSegment(segment.to_string()))?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() {
                return Err(ConnectionStringError::MalformedSegment(segment.to_string()));
            }

            let slot = match name {
                "HostName" => &mut host_name,
                "DeviceId" => &mut device_id,
                "SharedAccessKey" => &mut key,
                "SharedAccessSignature" => &mut signature,
                "GatewayHostName" => &mut gateway,
                "x509" => {
                    x509 = value.eq_ignore_ascii_case("true");
                    continue;
                }
                other => {
                    debug!(key = other, "ignoring unknown connection string key");
                    continue;
                }
            };
            if slot.replace(value.to_string()).is_some() {
                return Err(ConnectionStringError::DuplicateKey(name.to_string()));
            }
        }

        let host_name = host_name
            .filter(|v| !v.is_empty())
            .ok_or(ConnectionStringError::MissingField("HostName"))?;
        HubUri::parse(&host_name)?;
        let device_id = device_id
            .filter(|v| !v.is_empty())
            .ok_or(ConnectionStringError::MissingField("DeviceId"))?;

        let credential = match (key, signature, x509) {
            (Some(key), None, false) if !key.is_empty() => Credential::SharedAccessKey { key },
            (None, Some(signature), false) if !signature.is_empty() => {
                Credential::SharedAccessSignature { signature }
            }
            (None, None, true) => Credential::X509,
            _ => return Err(ConnectionStringError::Credential),
        };

        Ok(Self {
            host_name,
            device_id,
            credential,
            gateway_host_name: gateway.filter(|v| !v.is_empty()),
        })
    }

    pub fn hub(&self) -> Result<HubUri, ConnectionStringError> {
        HubUri::parse(&self.host_name)
    }
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
