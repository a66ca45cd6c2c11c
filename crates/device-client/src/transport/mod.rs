//! Transport abstraction.
//!
//! The engine never speaks a wire protocol itself. A [`Transport`] owns the
//! link to the hub; the engine hands it [`Outbound`] work and drains
//! [`TransportEvent`]s from [`Transport::poll`] once per dispatch. Every
//! method is non-blocking: `open` only starts an attempt, and its outcome
//! arrives later as `Connected` or `ConnectFailed`.
//!
//! A [`TransportProvider`] builds the transport for a client. Closures of the
//! right shape are providers, so a custom binding can be plugged in without a
//! new type:
//!
//! ```ignore
//! let provider = |settings: &TransportSettings| -> Result<Box<dyn Transport>, TransportError> {
//!     Ok(Box::new(MyBinding::new(settings)?))
//! };
//! let client = DeviceClient::create(config, &provider)?;
//! ```

pub mod loopback;

use std::{fmt, time::Duration};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    config::Credential,
    message::{DispositionToken, Message, MessageDisposition, SendId, SendResult},
    options::OptionValue,
    state::ConnectionStatusReason,
    twin::{ItemId, TwinUpdateState},
};

pub use loopback::{ConnectMode, LoopbackTransport};

/// Errors returned synchronously by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link is down. The request can be retried after reconnect.
    #[error("Transport is not connected")]
    NotConnected,

    /// The transport cannot take more work right now.
    #[error("Transport is busy")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup failed, usually bad certificates or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The request itself is unacceptable (oversized, malformed, not allowed).
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Unsupported option: {0}")]
    UnsupportedOption(String),
}

impl TransportError {
    /// Whether retrying the same request later is reasonable.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::NotConnected | TransportError::Busy => true,

            TransportError::Io(e) => !matches!(
                e.kind(),
                // local misconfiguration, not a network condition
                std::io::ErrorKind::AddrInUse
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::InvalidData
            ),

            TransportError::Tls(_)
            | TransportError::Rejected(_)
            | TransportError::UnsupportedOption(_) => false,
        }
    }
}

/// Why a link went down or an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    NoNetwork,
    CommunicationError,
    NoPingResponse,
    ExpiredSasToken,
    BadCredential,
    DeviceDisabled,
}

impl DisconnectReason {
    pub fn status_reason(&self) -> ConnectionStatusReason {
        match self {
            DisconnectReason::NoNetwork => ConnectionStatusReason::NoNetwork,
            DisconnectReason::CommunicationError => ConnectionStatusReason::CommunicationError,
            DisconnectReason::NoPingResponse => ConnectionStatusReason::NoPingResponse,
            DisconnectReason::ExpiredSasToken => ConnectionStatusReason::ExpiredSasToken,
            DisconnectReason::BadCredential => ConnectionStatusReason::BadCredential,
            DisconnectReason::DeviceDisabled => ConnectionStatusReason::DeviceDisabled,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.status_reason(), f)
    }
}

/// Inbound streams a transport can be asked to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subscription {
    CloudToDevice,
    DesiredProperties,
    Methods,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::CloudToDevice => "c2d",
            Subscription::DesiredProperties => "twin/desired",
            Subscription::Methods => "methods",
        }
    }
}

/// Correlates a method invocation with its response on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRequestId(pub u64);

/// Work handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Telemetry {
        id: SendId,
        message: Message,
    },
    ReportedState {
        item_id: ItemId,
        payload: Bytes,
    },
    MethodResponse {
        request_id: MethodRequestId,
        status: i32,
        payload: Bytes,
    },
    Disposition {
        token: DispositionToken,
        disposition: MessageDisposition,
    },
    /// Ask for the full twin document; answered with a `Complete` desired push.
    GetTwin,
}

/// Everything a transport reports back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected(DisconnectReason),
    ConnectFailed(DisconnectReason),
    SendComplete {
        id: SendId,
        result: SendResult,
    },
    MessageReceived {
        token: DispositionToken,
        message: Message,
    },
    DesiredProperties {
        state: TwinUpdateState,
        payload: Bytes,
    },
    ReportedStateAck {
        item_id: ItemId,
        status: i32,
    },
    MethodInvoked {
        request_id: MethodRequestId,
        name: String,
        payload: Bytes,
    },
}

/// What a transport needs to reach the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    pub host_name: String,
    pub device_id: String,
    pub gateway_host_name: Option<String>,
    pub credential: Credential,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub product_info: Option<String>,
}

impl TransportSettings {
    /// Host the link should actually connect to.
    pub fn endpoint(&self) -> &str {
        self.gateway_host_name.as_deref().unwrap_or(&self.host_name)
    }
}

/// A non-blocking link to the hub.
pub trait Transport: Send {
    /// Starts a connection attempt. The outcome is reported through `poll`.
    fn open(&mut self, settings: &TransportSettings) -> Result<(), TransportError>;

    fn close(&mut self);

    fn subscribe(&mut self, subscription: Subscription) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, subscription: Subscription) -> Result<(), TransportError>;

    /// Queues `item` for transmission. Completion of telemetry is reported by
    /// `SendComplete`, of reported state by `ReportedStateAck`.
    fn send(&mut self, item: Outbound) -> Result<(), TransportError>;

    /// Returns the next pending event without waiting.
    fn poll(&mut self) -> Option<TransportEvent>;

    fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<(), TransportError>;
}

/// Builds the transport a client will use.
pub trait TransportProvider {
    fn create(&self, settings: &TransportSettings) -> Result<Box<dyn Transport>, TransportError>;
}

impl<F> TransportProvider for F
where
    F: Fn(&TransportSettings) -> Result<Box<dyn Transport>, TransportError>,
{
    fn create(&self, settings: &TransportSettings) -> Result<Box<dyn Transport>, TransportError> {
        self(settings)
    }
}
