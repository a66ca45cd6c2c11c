//! Error handling for the device client engine.
//!
//! `ClientError` is the single error type returned by every synchronous
//! operation on [`DeviceClient`](crate::DeviceClient). Asynchronous outcomes
//! (telemetry dispositions, reported-state acks, upload results) never travel
//! through this type; they are delivered to the callback registered with the
//! operation.
//!
//! # Error Categories
//!
//! Every variant maps onto one [`ErrorKind`]:
//!
//! - `InvalidArgument`: malformed input, rejected before any state changes
//! - `InvalidState`: the call is legal but not right now (busy upload session,
//!   stale method handle, unknown disposition token)
//! - `ResourceExhausted`: a configured capacity limit was hit
//! - `TransientConnection`: the transport failed in a way the retry policy
//!   will handle
//! - `FatalConnection`: the retry policy gave up
//! - `DispositionError`: a per-message terminal result other than OK
//!
//! ```ignore
//! match client.send_event(message, |result| println!("{result}")) {
//!     Ok(id) => println!("queued as {id}"),
//!     Err(e) if e.kind() == ErrorKind::InvalidArgument => eprintln!("bad message: {e}"),
//!     Err(e) => eprintln!("cannot send right now: {e}"),
//! }
//! ```

use thiserror::Error;

use super::{
    connection_string::ConnectionStringError, message::SendResult, transport::TransportError,
};

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    ResourceExhausted,
    TransientConnection,
    FatalConnection,
    DispositionError,
}

/// The unified error type for device client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Input was missing, empty, oversized, or otherwise malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation conflicts with the current state of the client.
    ///
    /// Examples: starting a second upload while one is active, responding to
    /// a method invocation twice, settling a C2D message that was already
    /// settled.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A configured capacity (pending message limit) is exhausted.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// A connection string or hub URI could not be parsed.
    #[error("Connection string error: {0}")]
    ConnectionString(#[from] ConnectionStringError),

    /// The transport reported an error for a synchronous request.
    ///
    /// Whether this is transient is decided by
    /// [`TransportError::is_transient`].
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The retry policy stopped reconnecting. The handle must be recreated;
    /// new work is refused with this error.
    #[error("Connection retry policy exhausted after {attempts} attempts")]
    FatalConnection { attempts: u32 },

    /// A message reached a terminal result other than OK.
    #[error("Message disposition: {0}")]
    Disposition(SendResult),

    /// A typed payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No cloud-to-device message has been received yet.
    #[error("No message has been received yet")]
    IndefiniteTime,
}

impl ClientError {
    /// Maps the error onto the engine's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::InvalidArgument(_)
            | ClientError::Config(_)
            | ClientError::ConnectionString(_)
            | ClientError::Serialization(_) => ErrorKind::InvalidArgument,
            ClientError::InvalidState(_) | ClientError::IndefiniteTime => ErrorKind::InvalidState,
            ClientError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ClientError::Transport(e) if e.is_transient() => ErrorKind::TransientConnection,
            ClientError::Transport(_) => ErrorKind::InvalidState,
            ClientError::FatalConnection { .. } => ErrorKind::FatalConnection,
            ClientError::Disposition(_) => ErrorKind::DispositionError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = ClientError::InvalidArgument("payload is empty".into());
        assert_eq!(err.to_string(), "Invalid argument: payload is empty");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_transport_error_kind_follows_classification() {
        let transient = ClientError::from(TransportError::NotConnected);
        assert_eq!(transient.kind(), ErrorKind::TransientConnection);

        let rejected = ClientError::from(TransportError::Rejected("too large".into()));
        assert_eq!(rejected.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_fatal_connection_display() {
        let err = ClientError::FatalConnection { attempts: 7 };
        assert!(err.to_string().contains("7 attempts"));
        assert_eq!(err.kind(), ErrorKind::FatalConnection);
    }

    #[test]
    fn test_disposition_kind() {
        let err = ClientError::Disposition(SendResult::MessageTimeout);
        assert_eq!(err.kind(), ErrorKind::DispositionError);
    }

    #[test]
    fn test_client_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(ClientError::IndefiniteTime);
        assert_eq!(err.to_string(), "No message has been received yet");
    }
}
