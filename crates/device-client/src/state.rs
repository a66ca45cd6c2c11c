//! Connection state of a device client.
//!
//! [`ConnectionState`] is the engine's own view of the session and drives the
//! dispatch loop. [`ConnectionStatus`] and [`ConnectionStatusReason`] are what
//! the caller sees through the connection-status callback.
//!
//! ```ignore
//! client.set_connection_status_callback(|status, reason| {
//!     println!("{status} ({reason})");  // "Authenticated (CONNECTION_OK)"
//! });
//! ```

use std::fmt;

/// Lifecycle of the hub session.
///
/// - `Disconnected` -> `Connecting` (retry engine said RetryNow)
/// - `Connecting` -> `Connected` (transport reported the handshake)
/// - `Connecting` -> `DisconnectedRetrying` (attempt failed or timed out)
/// - `Connected` -> `DisconnectedRetrying` (link lost)
/// - `DisconnectedRetrying` -> `Connecting` (backoff elapsed)
/// - any -> `Disconnected` (retry policy stopped; terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and no attempt scheduled. Initial state, and the terminal
    /// state once the retry policy gives up.
    Disconnected,

    /// `Transport::open` was called; waiting for the transport to report the
    /// outcome.
    Connecting,

    /// Subscriptions are live and queued work is transmitted.
    Connected,

    /// The link was lost. Sends are still accepted and queued, nothing is
    /// transmitted until the retry engine reconnects.
    DisconnectedRetrying,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::DisconnectedRetrying => "DisconnectedRetrying",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True while an attempt is in progress or scheduled.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::DisconnectedRetrying
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing authentication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Authenticated,
    Unauthenticated,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Authenticated => "Authenticated",
            ConnectionStatus::Unauthenticated => "Unauthenticated",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatusReason {
    ExpiredSasToken,
    DeviceDisabled,
    BadCredential,
    /// The retry policy stopped. Always paired with `Unauthenticated` and
    /// reported at most once per client.
    RetryExpired,
    NoNetwork,
    CommunicationError,
    ConnectionOk,
    NoPingResponse,
}

impl ConnectionStatusReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatusReason::ExpiredSasToken => "EXPIRED_SAS_TOKEN",
            ConnectionStatusReason::DeviceDisabled => "DEVICE_DISABLED",
            ConnectionStatusReason::BadCredential => "BAD_CREDENTIAL",
            ConnectionStatusReason::RetryExpired => "RETRY_EXPIRED",
            ConnectionStatusReason::NoNetwork => "NO_NETWORK",
            ConnectionStatusReason::CommunicationError => "COMMUNICATION_ERROR",
            ConnectionStatusReason::ConnectionOk => "CONNECTION_OK",
            ConnectionStatusReason::NoPingResponse => "NO_PING_RESPONSE",
        }
    }
}

impl fmt::Display for ConnectionStatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_as_str() {
        assert_eq!(ConnectionState::Disconnected.as_str(), "Disconnected");
        assert_eq!(ConnectionState::Connecting.as_str(), "Connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "Connected");
        assert_eq!(
            ConnectionState::DisconnectedRetrying.to_string(),
            "DisconnectedRetrying"
        );
    }

    #[test]
    fn test_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::DisconnectedRetrying.is_connected());
    }

    #[test]
    fn test_is_connecting() {
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(ConnectionState::DisconnectedRetrying.is_connecting());
        assert!(!ConnectionState::Connected.is_connecting());
        assert!(!ConnectionState::Disconnected.is_connecting());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::Unauthenticated.to_string(), "Unauthenticated");
        assert_eq!(
            ConnectionStatusReason::RetryExpired.to_string(),
            "RETRY_EXPIRED"
        );
    }
}
