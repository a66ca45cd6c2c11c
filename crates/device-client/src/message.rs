//! Telemetry and cloud-to-device message model.

use std::{collections::HashMap, fmt, time::SystemTime};

use bytes::Bytes;
use serde::Serialize;

use crate::error::ClientError;

/// A message sent to or received from the hub.
///
/// The payload is opaque bytes; application properties and the system
/// properties the hub understands travel alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    properties: HashMap<String, String>,
    message_id: Option<String>,
    correlation_id: Option<String>,
    content_type: Option<String>,
    content_encoding: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Serializes `value` as JSON and marks the message accordingly.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(payload)
            .with_content_type("application/json")
            .with_content_encoding("utf-8"))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Identifies a received message for later settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispositionToken(pub u64);

impl fmt::Display for DispositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c2d#{}", self.0)
    }
}

/// A cloud-to-device message as handed to the message callback.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    pub token: DispositionToken,
    pub received_at: SystemTime,
}

/// How the device settles a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageDisposition {
    /// Completed; the hub drops the message.
    Accepted,
    /// Dead-lettered; the hub will not redeliver.
    Rejected,
    /// Returned to the hub for redelivery.
    Abandoned,
    /// Settled later with `send_message_disposition`.
    Deferred,
}

impl MessageDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDisposition::Accepted => "accepted",
            MessageDisposition::Rejected => "rejected",
            MessageDisposition::Abandoned => "abandoned",
            MessageDisposition::Deferred => "deferred",
        }
    }
}

impl fmt::Display for MessageDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a telemetry send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendResult {
    Ok,
    /// The client was destroyed before the hub confirmed the message.
    BecauseDestroy,
    /// The message waited longer than the configured `messageTimeout`.
    MessageTimeout,
    /// The transport reported a failure for this message.
    Error,
}

impl SendResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendResult::Ok => "OK",
            SendResult::BecauseDestroy => "BECAUSE_DESTROY",
            SendResult::MessageTimeout => "MESSAGE_TIMEOUT",
            SendResult::Error => "ERROR",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SendResult::Ok)
    }

    /// `Ok(())` for a delivered message, a `Disposition` error otherwise.
    pub fn into_result(self) -> Result<(), ClientError> {
        match self {
            SendResult::Ok => Ok(()),
            other => Err(ClientError::Disposition(other)),
        }
    }
}

impl fmt::Display for SendResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a queued telemetry message, used to match acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(pub u64);

impl fmt::Display for SendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    Busy,
}
