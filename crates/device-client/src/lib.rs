//! # iothub-device-client: non-blocking device client engine
//!
//! A single-threaded, cooperatively scheduled engine that manages one device's
//! session with a cloud message hub:
//!
//! - **Telemetry** with FIFO ordering, in-flight tracking and per-message
//!   completion callbacks
//! - **Cloud-to-device messages** with accept / reject / abandon / deferred
//!   settlement
//! - **Device twin**: reported-state patches matched to acks by item id, and
//!   desired-state pushes (partial or complete)
//! - **Direct methods** with one response per invocation and an automatic 404
//!   for unhandled methods
//! - **Reconnect retry policies** (none, immediate, interval, exponential,
//!   exponential with jitter, random) with an overall timeout
//! - **Chunked blob upload** through a pluggable storage collaborator
//!
//! The engine never blocks and never spawns. The wire protocol lives behind
//! the [`Transport`] trait; the caller drives all progress with
//! [`DeviceClient::dispatch_once`].
//!
//! # Quick Start
//!
//! ```ignore
//! use iothub_device_client::{ClientConfig, DeviceClient, LoopbackTransport, Message};
//!
//! let hub = LoopbackTransport::new();
//! let mut client = DeviceClient::create(ClientConfig::new("myhub.azure-devices.net", "dev-1"), &hub)?;
//!
//! client.set_connection_status_callback(|status, reason| println!("{status}: {reason}"));
//! client.send_event(Message::new(r#"{"temp":21.5}"#), |result| println!("sent: {result}"))?;
//!
//! for _ in 0..10 {
//!     client.dispatch_once();
//! }
//! client.destroy();
//! ```
//!
//! # Reconnection
//!
//! With the default policy (exponential backoff with jitter, no timeout) the
//! engine waits 1s, 2s, 4s, ... up to 60s between attempts, plus up to 50%
//! random jitter. A non-zero timeout turns an outage that long into a fatal
//! `(Unauthenticated, RETRY_EXPIRED)` status, after which the client stays
//! disconnected.
//!
//! # Logging
//!
//! The crate logs through `tracing`: lifecycle and status changes at `info`,
//! per-message flow at `debug`/`trace`, dropped or refused work at `warn`, and
//! retry exhaustion at `error`. Install a subscriber in the host application to
//! see them.

// Module declarations
pub mod client;
pub mod clock;
pub mod config;
pub mod connection_string;
pub mod error;
pub mod message;
pub mod method;
pub mod options;
pub mod queue;
pub mod retry;
pub mod state;
pub mod transport;
pub mod twin;
pub mod upload;

// Re-exports: the client handle
pub use client::DeviceClient;
// Re-exports: configuration
pub use config::{ClientConfig, Credential, RetryConfig};
pub use connection_string::{ConnectionString, HubUri};
// Re-exports: error handling
//
// Every synchronous operation returns ClientError
pub use error::{ClientError, ErrorKind};
// Re-exports: messages
pub use message::{
    DispositionToken, Message, MessageDisposition, ReceivedMessage, SendId, SendResult, SendStatus,
};
// Re-exports: twin and methods
pub use method::{MethodInvocation, ResponseHandle};
pub use twin::{ItemId, ReportedStateResult, TwinUpdateState};
// Re-exports: connection
pub use clock::{Clock, ManualClock, SystemClock};
pub use options::{OptionValue, ProxyOptions};
pub use retry::{RetryDecision, RetryPolicy, RetryTiming};
pub use state::{ConnectionState, ConnectionStatus, ConnectionStatusReason};
pub use transport::{
    ConnectMode, DisconnectReason, LoopbackTransport, Transport, TransportError, TransportEvent,
    TransportProvider, TransportSettings,
};
// Re-exports: upload
pub use upload::{BlobStorage, BlockSource, MemoryBlobStorage, StorageError, UploadResult};

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
