//! The device client handle and its dispatch loop.
//!
//! [`DeviceClient`] owns every piece of session state: the telemetry queue,
//! the twin synchronizer, the method dispatcher, the upload orchestrator, the
//! retry state and the transport. Nothing happens on its own; the caller drives
//! all progress by calling [`DeviceClient::dispatch_once`] periodically, and
//! every callback runs on the stack of that call (or of `destroy`).
//!
//! # Dispatch order
//!
//! Each `dispatch_once` performs, in order:
//!
//! 1. Drain up to `max_events_per_dispatch` transport events and route them.
//! 2. If not connected, consult the retry engine and (re)open the transport.
//! 3. Expire stale telemetry, then transmit queued telemetry up to
//!    `max_inflight` while connected.
//! 4. Send one reported-state patch, one method response and one deferred C2D
//!    disposition, and advance the upload session by one step.
//!
//! ```ignore
//! let hub = LoopbackTransport::new();
//! let mut client = DeviceClient::create(ClientConfig::new("hub.example.net", "dev-1"), &hub)?;
//! client.send_event(Message::new("21.5"), |result| println!("telemetry: {result}"))?;
//! loop {
//!     client.dispatch_once();
//!     std::thread::sleep(Duration::from_millis(100));
//! }
//! ```

use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    fmt,
    time::{Duration, Instant, SystemTime},
};

use bytes::Bytes;
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    clock::{Clock, SystemClock},
    config::{ClientConfig, Credential},
    connection_string::{ConnectionString, HubUri},
    error::ClientError,
    message::{
        DispositionToken, Message, MessageDisposition, ReceivedMessage, SendId, SendResult,
        SendStatus,
    },
    method::{
        MethodDispatcher, MethodInvocation, MethodResponse, ResponseHandle, METHOD_NOT_FOUND,
        METHOD_NOT_FOUND_BODY,
    },
    options::{ClientOption, OptionOwner, OptionStore, OptionValue},
    queue::MessageQueue,
    retry::{RetryDecision, RetryPolicy, RetryState},
    state::{ConnectionState, ConnectionStatus, ConnectionStatusReason},
    transport::{
        DisconnectReason, Outbound, Subscription, Transport, TransportEvent, TransportProvider,
        TransportSettings,
    },
    twin::{ItemId, ReportedStateResult, TwinSynchronizer, TwinUpdateState},
    upload::{buffer_source, split_blocks, BlobStorage, BlockSource, UploadOrchestrator, UploadResult},
    Result,
};

pub type MessageCallback = Box<dyn FnMut(&ReceivedMessage) -> MessageDisposition + Send>;
pub type ConnectionStatusCallback = Box<dyn FnMut(ConnectionStatus, ConnectionStatusReason) + Send>;

/// A single device's session with the hub.
pub struct DeviceClient {
    config: ClientConfig,
    settings: TransportSettings,
    transport: Box<dyn Transport>,
    clock: Box<dyn Clock>,
    rng: StdRng,

    state: ConnectionState,
    connecting_since: Option<Instant>,
    retry: RetryState,
    /// Set once the retry policy gave up; no reconnects after that.
    retry_expired: bool,
    subscriptions: BTreeSet<Subscription>,

    queue: MessageQueue,
    twin: TwinSynchronizer,
    methods: MethodDispatcher,
    uploads: UploadOrchestrator,

    message_callback: Option<MessageCallback>,
    status_callback: Option<ConnectionStatusCallback>,
    /// Deferred C2D messages the application has not settled yet.
    unsettled: HashSet<DispositionToken>,
    dispositions: VecDeque<(DispositionToken, MessageDisposition)>,
    last_receive: Option<SystemTime>,

    options: OptionStore,
    message_timeout: Option<Duration>,
    destroyed: bool,
}

impl DeviceClient {
    /// Builds a client from a validated configuration. The first connection
    /// attempt happens on the first `dispatch_once`.
    pub fn create(config: ClientConfig, provider: &dyn TransportProvider) -> Result<Self> {
        config.validate()?;
        let settings = config.transport_settings();
        let transport = provider.create(&settings)?;

        info!(
            device_id = %config.device_id,
            host = %settings.endpoint(),
            credential = config.credential.kind(),
            retry_policy = %config.retry.policy,
            "device client created"
        );

        Ok(Self {
            retry: RetryState::new(
                config.retry.policy,
                config.retry.timeout_secs,
                config.retry.timing.clone(),
            ),
            queue: MessageQueue::new(config.max_pending_messages),
            message_timeout: config.message_timeout(),
            settings,
            transport,
            clock: Box::new(SystemClock),
            rng: StdRng::from_rng(&mut rand::rng()),
            state: ConnectionState::Disconnected,
            connecting_since: None,
            retry_expired: false,
            subscriptions: BTreeSet::new(),
            twin: TwinSynchronizer::new(),
            methods: MethodDispatcher::new(),
            uploads: UploadOrchestrator::new(None),
            message_callback: None,
            status_callback: None,
            unsettled: HashSet::new(),
            dispositions: VecDeque::new(),
            last_receive: None,
            options: OptionStore::default(),
            destroyed: false,
            config,
        })
    }

    /// Builds a client from a `HostName=...;DeviceId=...;...` string, with
    /// defaults for everything else.
    pub fn from_connection_string(
        connection_string: &str,
        provider: &dyn TransportProvider,
    ) -> Result<Self> {
        let parsed = ConnectionString::parse(connection_string)?;
        let config = ClientConfig {
            host_name: parsed.host_name,
            device_id: parsed.device_id,
            credential: parsed.credential,
            gateway_host_name: parsed.gateway_host_name,
            ..Default::default()
        };
        Self::create(config, provider)
    }

    /// Builds a client whose credentials come from an external device-auth
    /// provider.
    pub fn from_device_auth(
        hub_uri: &str,
        device_id: &str,
        provider: &dyn TransportProvider,
    ) -> Result<Self> {
        HubUri::parse(hub_uri)?;
        let config =
            ClientConfig::new(hub_uri, device_id).with_credential(Credential::DeviceAuth);
        Self::create(config, provider)
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Makes jittered and random retry delays reproducible.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Enables blob upload through `storage`.
    pub fn with_blob_storage(mut self, storage: impl BlobStorage + 'static) -> Self {
        self.uploads.set_storage(Box::new(storage));
        self
    }

    /// Tears the client down: every outstanding callback runs with a
    /// shutting-down result, then the transport is closed.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Performs one bounded, non-blocking unit of work.
    pub fn dispatch_once(&mut self) {
        if self.destroyed {
            return;
        }
        self.process_events();
        self.drive_connection();
        self.transmit_telemetry();
        self.advance_twin();
        self.advance_methods();
        self.advance_dispositions();
        self.uploads.step();
    }

    fn process_events(&mut self) {
        for _ in 0..self.config.max_events_per_dispatch {
            let Some(event) = self.transport.poll() else {
                break;
            };
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        trace!(?event, "transport event");
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected(reason) => self.on_link_lost(reason),
            TransportEvent::ConnectFailed(reason) => self.on_attempt_failed(reason),
            TransportEvent::SendComplete { id, result } => {
                self.queue.mark_disposed(id, result);
            }
            TransportEvent::MessageReceived { token, message } => {
                self.on_message(token, message);
            }
            TransportEvent::DesiredProperties { state, payload } => {
                self.twin.deliver_desired(state, &payload);
            }
            TransportEvent::ReportedStateAck { item_id, status } => {
                self.twin.acknowledge(item_id, status);
            }
            TransportEvent::MethodInvoked {
                request_id,
                name,
                payload,
            } => {
                if !self.methods.invoke(request_id, name, payload) {
                    self.send_method_response(MethodResponse {
                        request_id,
                        status: METHOD_NOT_FOUND,
                        payload: Bytes::from_static(METHOD_NOT_FOUND_BODY),
                    });
                }
            }
        }
    }

    fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            warn!(state = %self.state, "ignoring connected event outside of a connection attempt");
            return;
        }

        self.state = ConnectionState::Connected;
        self.connecting_since = None;
        self.retry.reset();
        info!(device_id = %self.config.device_id, "connected to hub");

        self.resubscribe_all();
        if self.twin.has_desired_callback() {
            self.request_full_twin();
        }
        self.notify_status(ConnectionStatus::Authenticated, ConnectionStatusReason::ConnectionOk);
    }

    fn on_link_lost(&mut self, reason: DisconnectReason) {
        match self.state {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => {
                self.on_attempt_failed(reason);
                return;
            }
            _ => {
                debug!(state = %self.state, %reason, "ignoring disconnect while not connected");
                return;
            }
        }

        self.transport.close();
        let telemetry = self.queue.requeue_in_flight();
        self.twin.requeue_in_flight();
        warn!(%reason, requeued = telemetry, "connection to hub lost");

        self.record_failure();
        self.state = ConnectionState::DisconnectedRetrying;
        self.notify_status(ConnectionStatus::Unauthenticated, reason.status_reason());
    }

    fn on_attempt_failed(&mut self, reason: DisconnectReason) {
        if self.state != ConnectionState::Connecting {
            debug!(state = %self.state, %reason, "ignoring connect failure outside of an attempt");
            return;
        }

        self.transport.close();
        self.connecting_since = None;
        self.record_failure();
        self.state = ConnectionState::DisconnectedRetrying;
        warn!(%reason, attempt = self.retry.attempt(), "connection attempt failed");
        self.notify_status(ConnectionStatus::Unauthenticated, reason.status_reason());
    }

    fn on_message(&mut self, token: DispositionToken, message: Message) {
        let received_at = SystemTime::now();
        self.last_receive = Some(received_at);

        let Some(callback) = self.message_callback.as_mut() else {
            debug!(%token, "no message callback registered, abandoning message");
            self.send_disposition(token, MessageDisposition::Abandoned);
            return;
        };

        let received = ReceivedMessage {
            message,
            token,
            received_at,
        };
        match callback(&received) {
            MessageDisposition::Deferred => {
                debug!(%token, "message settlement deferred");
                self.unsettled.insert(token);
            }
            disposition => self.send_disposition(token, disposition),
        }
    }

    fn drive_connection(&mut self) {
        let now = self.clock.now();
        match self.state {
            ConnectionState::Connected => return,
            ConnectionState::Connecting => {
                let started = self.connecting_since.unwrap_or(now);
                if now.saturating_duration_since(started) >= self.settings.connection_timeout {
                    warn!(
                        timeout_secs = self.settings.connection_timeout.as_secs(),
                        "connection attempt timed out"
                    );
                    self.transport.close();
                    self.connecting_since = None;
                    self.record_failure();
                    self.state = ConnectionState::DisconnectedRetrying;
                    self.notify_status(
                        ConnectionStatus::Unauthenticated,
                        ConnectionStatusReason::NoNetwork,
                    );
                }
                return;
            }
            ConnectionState::Disconnected if self.retry_expired => return,
            ConnectionState::Disconnected | ConnectionState::DisconnectedRetrying => {}
        }

        match self.retry.decide(now) {
            RetryDecision::RetryNow => self.open(now),
            RetryDecision::Wait(delay) => {
                trace!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            }
            RetryDecision::Stop => self.give_up(),
        }
    }

    fn open(&mut self, now: Instant) {
        debug!(
            endpoint = %self.settings.endpoint(),
            attempt = self.retry.attempt() + 1,
            "opening transport"
        );
        match self.transport.open(&self.settings) {
            Ok(()) => {
                self.state = ConnectionState::Connecting;
                self.connecting_since = Some(now);
            }
            Err(e) => {
                // every failure goes through the retry policy, transient or not
                warn!(error = %e, transient = e.is_transient(), "transport open failed");
                self.record_failure();
                self.state = ConnectionState::DisconnectedRetrying;
                self.notify_status(
                    ConnectionStatus::Unauthenticated,
                    ConnectionStatusReason::CommunicationError,
                );
            }
        }
    }

    fn give_up(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.retry_expired = true;
        error!(
            attempts = self.retry.attempt(),
            policy = %self.retry.policy(),
            timeout_secs = self.retry.timeout_secs(),
            "retry policy exhausted, giving up on the connection"
        );
        self.notify_status(
            ConnectionStatus::Unauthenticated,
            ConnectionStatusReason::RetryExpired,
        );
    }

    fn record_failure(&mut self) {
        let now = self.clock.now();
        self.retry.record_failure(now, &mut self.rng);
    }

    fn resubscribe_all(&mut self) {
        let subscriptions: Vec<Subscription> = self.subscriptions.iter().copied().collect();
        for subscription in subscriptions {
            if let Err(e) = self.transport.subscribe(subscription) {
                warn!(subscription = subscription.as_str(), error = %e, "resubscribe failed");
            }
        }
    }

    fn request_full_twin(&mut self) {
        if let Err(e) = self.transport.send(Outbound::GetTwin) {
            warn!(error = %e, "full twin request failed");
        }
    }

    fn transmit_telemetry(&mut self) {
        if let Some(timeout) = self.message_timeout {
            let expired = self.queue.expire(self.clock.now(), timeout);
            if expired > 0 {
                warn!(expired, timeout_ms = timeout.as_millis() as u64, "telemetry timed out");
            }
        }

        if !self.state.is_connected() {
            return;
        }

        while self.queue.in_flight_len() < self.config.max_inflight {
            let Some((id, message)) = self.queue.front() else {
                break;
            };
            match self.transport.send(Outbound::Telemetry { id, message }) {
                Ok(()) => {
                    trace!(%id, "telemetry sent");
                    self.queue.mark_front_sent();
                }
                Err(e) if e.is_transient() => {
                    debug!(%id, error = %e, "transport not ready for telemetry");
                    break;
                }
                Err(e) => {
                    warn!(%id, error = %e, "telemetry rejected by transport");
                    self.queue.fail_front(SendResult::Error);
                }
            }
        }
    }

    fn advance_twin(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        let Some((item_id, payload)) = self.twin.front() else {
            return;
        };
        match self.transport.send(Outbound::ReportedState { item_id, payload }) {
            Ok(()) => self.twin.mark_front_sent(),
            Err(e) if e.is_transient() => {
                debug!(%item_id, error = %e, "transport not ready for reported state");
            }
            Err(_) => self.twin.fail_front(),
        }
    }

    fn advance_methods(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        let Some(response) = self.methods.front().cloned() else {
            return;
        };
        match self.transport.send(outbound_response(response)) {
            Ok(()) => {
                self.methods.pop_front();
            }
            Err(e) if e.is_transient() => {
                debug!(error = %e, "transport not ready for method response");
            }
            Err(e) => {
                warn!(error = %e, "method response rejected by transport");
                self.methods.pop_front();
            }
        }
    }

    fn advance_dispositions(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        let Some(&(token, disposition)) = self.dispositions.front() else {
            return;
        };
        match self.transport.send(Outbound::Disposition { token, disposition }) {
            Ok(()) => {
                self.dispositions.pop_front();
            }
            Err(e) if e.is_transient() => {
                debug!(%token, error = %e, "transport not ready for disposition");
            }
            Err(e) => {
                warn!(%token, error = %e, "disposition rejected by transport");
                self.dispositions.pop_front();
            }
        }
    }

    /// Sends a method response now, queueing it if the link is busy.
    fn send_method_response(&mut self, response: MethodResponse) {
        match self.transport.send(outbound_response(response.clone())) {
            Ok(()) => {}
            Err(e) if e.is_transient() => self.methods.push_response(response),
            Err(e) => warn!(error = %e, status = response.status, "method response rejected"),
        }
    }

    /// Sends a disposition now, queueing it if the link is busy.
    fn send_disposition(&mut self, token: DispositionToken, disposition: MessageDisposition) {
        match self.transport.send(Outbound::Disposition { token, disposition }) {
            Ok(()) => debug!(%token, %disposition, "message settled"),
            Err(e) if e.is_transient() => self.dispositions.push_back((token, disposition)),
            Err(e) => warn!(%token, error = %e, "disposition rejected by transport"),
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.retry_expired {
            return Err(ClientError::FatalConnection {
                attempts: self.retry.attempt(),
            });
        }
        Ok(())
    }

    fn notify_status(&mut self, status: ConnectionStatus, reason: ConnectionStatusReason) {
        info!(%status, %reason, "connection status changed");
        if let Some(callback) = self.status_callback.as_mut() {
            callback(status, reason);
        }
    }

    fn add_subscription(&mut self, subscription: Subscription) {
        if self.subscriptions.insert(subscription) && self.state.is_connected() {
            if let Err(e) = self.transport.subscribe(subscription) {
                warn!(subscription = subscription.as_str(), error = %e, "subscribe failed");
            }
        }
    }

    fn remove_subscription(&mut self, subscription: Subscription) {
        if self.subscriptions.remove(&subscription) && self.state.is_connected() {
            if let Err(e) = self.transport.unsubscribe(subscription) {
                warn!(subscription = subscription.as_str(), error = %e, "unsubscribe failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Telemetry and C2D
    // ------------------------------------------------------------------

    /// Queues a telemetry message. Works in any connection state; the message
    /// goes out in FIFO order once connected and `on_complete` runs exactly
    /// once. Refused with `FatalConnection` once the retry policy gave up.
    pub fn send_event<F>(&mut self, message: Message, on_complete: F) -> Result<SendId>
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        self.ensure_alive()?;
        if message.len() > self.config.max_message_size {
            return Err(ClientError::InvalidArgument(format!(
                "message of {} bytes exceeds the {} byte limit",
                message.len(),
                self.config.max_message_size
            )));
        }
        let id = self
            .queue
            .enqueue(message, Box::new(on_complete), self.clock.now())?;
        debug!(%id, state = %self.state, pending = self.queue.len(), "telemetry queued");
        Ok(id)
    }

    /// Like [`send_event`](Self::send_event), but the result arrives on a
    /// channel resolved by the dispatch loop.
    pub fn send_event_with_receipt(
        &mut self,
        message: Message,
    ) -> Result<oneshot::Receiver<SendResult>> {
        let (tx, rx) = oneshot::channel();
        self.send_event(message, move |result| {
            let _ = tx.send(result);
        })?;
        Ok(rx)
    }

    pub fn send_status(&self) -> SendStatus {
        if self.queue.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    /// Telemetry messages queued or in flight.
    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    /// Registers the C2D message callback, replacing any previous one, and
    /// subscribes to cloud-to-device messages.
    pub fn set_message_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&ReceivedMessage) -> MessageDisposition + Send + 'static,
    {
        self.message_callback = Some(Box::new(callback));
        self.add_subscription(Subscription::CloudToDevice);
    }

    pub fn clear_message_callback(&mut self) {
        self.message_callback = None;
        self.remove_subscription(Subscription::CloudToDevice);
    }

    /// Settles a message whose callback returned `Deferred`.
    pub fn send_message_disposition(
        &mut self,
        token: DispositionToken,
        disposition: MessageDisposition,
    ) -> Result<()> {
        if disposition == MessageDisposition::Deferred {
            return Err(ClientError::InvalidArgument(
                "a deferred message must be settled with a final disposition".into(),
            ));
        }
        if !self.unsettled.remove(&token) {
            return Err(ClientError::InvalidState(format!(
                "{token} is unknown or already settled"
            )));
        }
        self.dispositions.push_back((token, disposition));
        Ok(())
    }

    /// When the last C2D message arrived.
    pub fn last_message_receive_time(&self) -> Result<SystemTime> {
        self.last_receive.ok_or(ClientError::IndefiniteTime)
    }

    pub fn set_connection_status_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ConnectionStatus, ConnectionStatusReason) + Send + 'static,
    {
        self.status_callback = Some(Box::new(callback));
    }

    // ------------------------------------------------------------------
    // Retry policy and options
    // ------------------------------------------------------------------

    /// Replaces the reconnect policy. `timeout_secs == 0` retries forever.
    pub fn set_retry_policy(&mut self, policy: RetryPolicy, timeout_secs: u64) {
        info!(%policy, timeout_secs, "retry policy changed");
        self.retry.set_policy(policy, timeout_secs);
    }

    pub fn retry_policy(&self) -> (RetryPolicy, u64) {
        (self.retry.policy(), self.retry.timeout_secs())
    }

    /// Sets a runtime option by name.
    pub fn set_option(&mut self, name: &str, value: impl Into<OptionValue>) -> Result<()> {
        let option = ClientOption::parse(name)?;
        let value = value.into();
        option.check(&value)?;

        if option.owner() == OptionOwner::Transport {
            self.transport.set_option(option.name(), &value)?;
        }

        match option {
            ClientOption::MessageTimeout => {
                self.message_timeout = value
                    .as_u64()
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis);
            }
            ClientOption::ProductInfo => {
                self.settings.product_info = value.as_str().map(str::to_string);
            }
            ClientOption::RetryIntervalSec | ClientOption::RetryMaxDelaySecs => {
                let mut timing = self.retry.timing().clone();
                if let Some(secs) = value.as_u64() {
                    if option == ClientOption::RetryIntervalSec {
                        timing.interval_secs = secs;
                    } else {
                        timing.max_delay_secs = secs;
                    }
                }
                timing.validate()?;
                *self.retry.timing_mut() = timing;
            }
            // also applies to the next open
            ClientOption::KeepAlive => {
                if let Some(secs) = value.as_u64() {
                    self.settings.keep_alive = Duration::from_secs(secs);
                }
            }
            ClientOption::ProxyData
            | ClientOption::TrustedCerts
            | ClientOption::LogTrace
            | ClientOption::Compression => {}
        }

        debug!(option = option.name(), "option set");
        self.options.insert(option, value);
        Ok(())
    }

    /// Current value of an option, or `None` if it was never set and has no
    /// engine default.
    pub fn option(&self, name: &str) -> Result<Option<OptionValue>> {
        let option = ClientOption::parse(name)?;
        let timing = self.retry.timing();
        Ok(match option {
            ClientOption::MessageTimeout => Some(OptionValue::U64(
                self.message_timeout.map_or(0, |d| d.as_millis() as u64),
            )),
            ClientOption::KeepAlive => Some(OptionValue::U64(self.settings.keep_alive.as_secs())),
            ClientOption::ProductInfo => self.settings.product_info.clone().map(OptionValue::Text),
            ClientOption::RetryIntervalSec => Some(OptionValue::U64(timing.interval_secs)),
            ClientOption::RetryMaxDelaySecs => Some(OptionValue::U64(timing.max_delay_secs)),
            ClientOption::ProxyData
            | ClientOption::TrustedCerts
            | ClientOption::LogTrace
            | ClientOption::Compression => self.options.get(option).cloned(),
        })
    }

    // ------------------------------------------------------------------
    // Device twin
    // ------------------------------------------------------------------

    /// Registers the desired-state callback and subscribes to desired-state
    /// pushes. The full twin is requested now if connected, and again after
    /// every reconnect.
    pub fn set_device_twin_callback<F>(&mut self, callback: F)
    where
        F: FnMut(TwinUpdateState, &[u8]) + Send + 'static,
    {
        self.twin.set_desired_callback(Box::new(callback));
        self.add_subscription(Subscription::DesiredProperties);
        if self.state.is_connected() {
            self.request_full_twin();
        }
    }

    pub fn clear_device_twin_callback(&mut self) {
        self.twin.clear_desired_callback();
        self.remove_subscription(Subscription::DesiredProperties);
    }

    /// Queues a reported-state patch. `on_ack` receives the hub's status.
    pub fn send_reported_state<F>(&mut self, payload: impl Into<Bytes>, on_ack: F) -> Result<ItemId>
    where
        F: FnOnce(ReportedStateResult) + Send + 'static,
    {
        self.ensure_alive()?;
        self.twin.enqueue(payload.into(), Box::new(on_ack))
    }

    /// Serializes `properties` as JSON and queues them as a reported-state
    /// patch.
    pub fn send_reported_properties<T, F>(&mut self, properties: &T, on_ack: F) -> Result<ItemId>
    where
        T: Serialize + ?Sized,
        F: FnOnce(ReportedStateResult) + Send + 'static,
    {
        let payload = serde_json::to_vec(properties)?;
        self.send_reported_state(payload, on_ack)
    }

    // ------------------------------------------------------------------
    // Direct methods
    // ------------------------------------------------------------------

    /// Registers the method callback and subscribes to method invocations.
    /// Without a callback every invocation is answered with 404.
    pub fn set_device_method_callback<F>(&mut self, callback: F)
    where
        F: FnMut(MethodInvocation) + Send + 'static,
    {
        self.methods.set_callback(Box::new(callback));
        self.add_subscription(Subscription::Methods);
    }

    pub fn clear_device_method_callback(&mut self) {
        self.methods.clear_callback();
        self.remove_subscription(Subscription::Methods);
    }

    /// Answers an invocation. Each handle can be answered once.
    pub fn device_method_response(
        &mut self,
        handle: ResponseHandle,
        payload: impl Into<Bytes>,
        status: i32,
    ) -> Result<()> {
        self.methods.respond(handle, status, payload.into())
    }

    // ------------------------------------------------------------------
    // Blob upload
    // ------------------------------------------------------------------

    /// Uploads `data` as one blob, split into `upload_block_size` blocks.
    pub fn upload_to_blob<F>(
        &mut self,
        destination: &str,
        data: impl Into<Bytes>,
        on_complete: F,
    ) -> Result<Uuid>
    where
        F: FnOnce(UploadResult) + Send + 'static,
    {
        if self.uploads.is_active() {
            return Err(ClientError::InvalidState("upload busy".into()));
        }
        let blocks = split_blocks(&data.into(), self.config.upload_block_size)?;
        self.uploads
            .start(destination, buffer_source(blocks), Box::new(on_complete))
    }

    /// Uploads a blob whose blocks are pulled from `source` by index.
    pub fn upload_multiple_blocks_to_blob<S, F>(
        &mut self,
        destination: &str,
        source: S,
        on_complete: F,
    ) -> Result<Uuid>
    where
        S: FnMut(u32) -> BlockSource + Send + 'static,
        F: FnOnce(UploadResult) + Send + 'static,
    {
        self.uploads
            .start(destination, Box::new(source), Box::new(on_complete))
    }

    /// Cancels the active upload. Its callback runs with `Cancelled` on the
    /// next dispatch.
    pub fn cancel_upload(&mut self) -> Result<()> {
        if self.uploads.cancel() {
            Ok(())
        } else {
            Err(ClientError::InvalidState("no upload in progress".into()))
        }
    }

    // ------------------------------------------------------------------

    fn shutdown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        info!(
            device_id = %self.config.device_id,
            pending = self.queue.len(),
            "destroying device client"
        );

        self.queue.drain_all(SendResult::BecauseDestroy);
        self.twin.shutdown();
        self.methods.shutdown();
        self.uploads.shutdown();
        self.unsettled.clear();
        self.dispositions.clear();
        self.transport.close();
        self.state = ConnectionState::Disconnected;
    }
}

fn outbound_response(response: MethodResponse) -> Outbound {
    Outbound::MethodResponse {
        request_id: response.request_id,
        status: response.status,
        payload: response.payload,
    }
}

impl Drop for DeviceClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClient")
            .field("device_id", &self.config.device_id)
            .field("state", &self.state)
            .field("retry", &self.retry)
            .field("queue", &self.queue)
            .field("twin", &self.twin)
            .field("methods", &self.methods)
            .field("uploads", &self.uploads)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        error::ErrorKind,
        transport::{ConnectMode, LoopbackTransport},
    };

    fn client(hub: &LoopbackTransport) -> DeviceClient {
        DeviceClient::create(ClientConfig::new("hub.example.net", "dev-1"), hub)
            .unwrap()
            .with_rng_seed(1)
    }

    fn connect(client: &mut DeviceClient) {
        client.dispatch_once();
        client.dispatch_once();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let hub = LoopbackTransport::new();
        let err = DeviceClient::create(ClientConfig::new("no-dots", "dev"), &hub).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_from_connection_string() {
        let hub = LoopbackTransport::new();
        let client = DeviceClient::from_connection_string(
            "HostName=hub.example.net;DeviceId=thermo;SharedAccessKey=a2V5",
            &hub,
        )
        .unwrap();
        assert_eq!(client.device_id(), "thermo");
        assert_eq!(client.config().credential.kind(), "shared_access_key");
    }

    #[test]
    fn test_from_device_auth() {
        let hub = LoopbackTransport::new();
        let client = DeviceClient::from_device_auth("hub.example.net", "dps-1", &hub).unwrap();
        assert_eq!(client.config().credential, Credential::DeviceAuth);
        assert!(DeviceClient::from_device_auth("bad", "dps-1", &hub).is_err());
    }

    #[test]
    fn test_first_dispatch_opens_and_second_connects() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        client.dispatch_once();
        assert_eq!(client.connection_state(), ConnectionState::Connecting);
        assert_eq!(hub.open_count(), 1);

        client.dispatch_once();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(hub.open_count(), 1);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        let big = Message::new(vec![0u8; 256 * 1024 + 1]);
        let err = client.send_event(big, |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(client.send_status(), SendStatus::Idle);
    }

    #[test]
    fn test_send_status_tracks_queue() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        client.send_event(Message::new("a"), |_| {}).unwrap();
        assert_eq!(client.send_status(), SendStatus::Busy);

        connect(&mut client);
        client.dispatch_once();
        assert_eq!(client.send_status(), SendStatus::Idle);
    }

    #[test]
    fn test_receipt_channel_resolves() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        let mut receipt = client.send_event_with_receipt(Message::new("a")).unwrap();
        assert!(receipt.try_recv().is_err());

        connect(&mut client);
        client.dispatch_once();
        assert_eq!(receipt.try_recv().unwrap(), SendResult::Ok);
    }

    #[test]
    fn test_options_round_trip() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);

        client.set_option("messageTimeout", 2_500u64).unwrap();
        assert_eq!(
            client.option("messageTimeout").unwrap(),
            Some(OptionValue::U64(2_500))
        );

        client.set_option("logtrace", true).unwrap();
        assert_eq!(hub.option("logtrace"), Some(OptionValue::Bool(true)));
        assert_eq!(client.option("logtrace").unwrap(), Some(OptionValue::Bool(true)));

        client.set_option("retry_interval_sec", 9u64).unwrap();
        assert_eq!(client.retry_state().timing().interval_secs, 9);

        assert!(client.set_option("nope", 1u64).is_err());
        assert!(client.set_option("keepalive", "soon").is_err());
        assert_eq!(client.option("TrustedCerts").unwrap(), None);
    }

    #[test]
    fn test_keepalive_option_reaches_next_open() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        client.set_option("keepalive", 30u64).unwrap();
        client.dispatch_once();
        assert_eq!(hub.settings().unwrap().keep_alive, Duration::from_secs(30));
    }

    #[test]
    fn test_retry_policy_accessors() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        assert_eq!(
            client.retry_policy(),
            (RetryPolicy::ExponentialBackoffWithJitter, 0)
        );
        client.set_retry_policy(RetryPolicy::Interval, 60);
        assert_eq!(client.retry_policy(), (RetryPolicy::Interval, 60));
    }

    #[test]
    fn test_deferred_message_settled_later() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        client.set_message_callback(|_| MessageDisposition::Deferred);
        connect(&mut client);
        assert!(hub.is_subscribed(Subscription::CloudToDevice));

        let token = hub.deliver_c2d(Message::new("cmd"));
        client.dispatch_once();
        assert!(client.last_message_receive_time().is_ok());

        client
            .send_message_disposition(token, MessageDisposition::Accepted)
            .unwrap();
        let err = client
            .send_message_disposition(token, MessageDisposition::Accepted)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        client.dispatch_once();
        assert!(hub.sent().contains(&Outbound::Disposition {
            token,
            disposition: MessageDisposition::Accepted
        }));
    }

    #[test]
    fn test_last_receive_time_indefinite() {
        let hub = LoopbackTransport::new();
        let client = client(&hub);
        let err = client.last_message_receive_time().unwrap_err();
        assert!(matches!(err, ClientError::IndefiniteTime));
    }

    #[test]
    fn test_twin_callback_requests_full_twin() {
        let hub = LoopbackTransport::new();
        hub.set_twin_document(r#"{"desired":{"interval":10}}"#);
        let mut client = client(&hub);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.set_device_twin_callback(move |state, payload| {
            sink.lock().unwrap().push((state, payload.to_vec()));
        });

        connect(&mut client);
        client.dispatch_once();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, TwinUpdateState::Complete);
        assert!(hub.is_subscribed(Subscription::DesiredProperties));
    }

    #[test]
    fn test_reported_properties_serialized() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);

        client
            .send_reported_properties(&serde_json::json!({"firmware": "1.2.0"}), move |r| {
                *sink.lock().unwrap() = Some(r);
            })
            .unwrap();

        connect(&mut client);
        client.dispatch_once();
        assert_eq!(*result.lock().unwrap(), Some(ReportedStateResult::Status(204)));
    }

    #[test]
    fn test_connect_timeout_counts_as_failure() {
        let hub = LoopbackTransport::new();
        hub.set_connect_mode(ConnectMode::Hang);
        let clock = crate::clock::ManualClock::new();
        let mut client = client(&hub).with_clock(clock.clone());

        client.dispatch_once();
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        clock.advance(Duration::from_secs(29));
        client.dispatch_once();
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        clock.advance(Duration::from_secs(1));
        client.dispatch_once();
        assert_eq!(client.connection_state(), ConnectionState::DisconnectedRetrying);
        assert_eq!(client.retry_state().attempt(), 1);
    }

    fn track_status(
        client: &mut DeviceClient,
    ) -> Arc<Mutex<Vec<(ConnectionStatus, ConnectionStatusReason)>>> {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        client.set_connection_status_callback(move |status, reason| {
            sink.lock().unwrap().push((status, reason));
        });
        statuses
    }

    #[test]
    fn test_open_error_reports_status() {
        let hub = LoopbackTransport::new();
        hub.set_connect_mode(ConnectMode::Unreachable);
        let mut client = client(&hub);
        let statuses = track_status(&mut client);

        client.dispatch_once();

        assert_eq!(client.connection_state(), ConnectionState::DisconnectedRetrying);
        assert_eq!(client.retry_state().attempt(), 1);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![(
                ConnectionStatus::Unauthenticated,
                ConnectionStatusReason::CommunicationError
            )]
        );
    }

    #[test]
    fn test_disconnect_while_connecting_fails_the_attempt() {
        let hub = LoopbackTransport::new();
        hub.set_connect_mode(ConnectMode::Hang);
        let mut client = client(&hub);
        let statuses = track_status(&mut client);

        client.dispatch_once();
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        hub.drop_connection(DisconnectReason::NoNetwork);
        client.dispatch_once();

        assert_eq!(client.connection_state(), ConnectionState::DisconnectedRetrying);
        assert_eq!(client.retry_state().attempt(), 1);
        assert_eq!(
            statuses.lock().unwrap().last(),
            Some(&(ConnectionStatus::Unauthenticated, ConnectionStatusReason::NoNetwork))
        );
    }

    #[test]
    fn test_retry_timing_options_are_range_checked() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);

        let err = client
            .set_option("retry_max_delay_secs", u64::MAX)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(client.set_option("retry_interval_sec", 3_601u64).is_err());

        // rejected values leave the timing and the reported option untouched
        assert_eq!(client.retry_state().timing().max_delay_secs, 60);
        assert_eq!(
            client.option("retry_max_delay_secs").unwrap(),
            Some(OptionValue::U64(60))
        );

        client.set_option("retry_max_delay_secs", 3_600u64).unwrap();
        assert_eq!(client.retry_state().timing().max_delay_secs, 3_600);
    }

    #[test]
    fn test_sends_refused_after_retry_policy_gives_up() {
        let hub = LoopbackTransport::new();
        hub.set_connect_mode(ConnectMode::Refuse(DisconnectReason::NoNetwork));
        let mut client = client(&hub);
        client.set_retry_policy(RetryPolicy::None, 0);

        client.dispatch_once();
        client.dispatch_once();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        let err = client.send_event(Message::new("late"), |_| {}).unwrap_err();
        assert!(matches!(err, ClientError::FatalConnection { attempts: 1 }));
        assert_eq!(err.kind(), ErrorKind::FatalConnection);

        let err = client.send_reported_state("{}", |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalConnection);
        assert_eq!(client.pending_messages(), 0);
    }

    #[test]
    fn test_cancel_upload_without_session() {
        let hub = LoopbackTransport::new();
        let mut client = client(&hub);
        assert_eq!(client.cancel_upload().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_client_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<DeviceClient>();
    }
}
