//! In-memory hub.
//!
//! `LoopbackTransport` plays both ends of the link: the engine drives it
//! through the [`Transport`] trait, while a test (or the demo agent) holds a
//! clone and plays the hub: it injects C2D messages, desired-property pushes,
//! method calls and link drops, and inspects everything the device sent.
//!
//! Clones share one state, so the clone handed to the client and the one kept
//! by the caller observe the same link.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use tracing::trace;

use super::{
    DisconnectReason, MethodRequestId, Outbound, Subscription, Transport, TransportError,
    TransportEvent, TransportProvider, TransportSettings,
};
use crate::{
    message::{DispositionToken, Message, SendId, SendResult},
    options::OptionValue,
    twin::{ItemId, TwinUpdateState},
};

/// How the loopback hub answers `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    Refuse(DisconnectReason),
    /// Never answer; the attempt runs into the connection timeout.
    Hang,
    /// `open` itself fails with a refused connection.
    Unreachable,
}

#[derive(Debug)]
struct Hub {
    connect_mode: ConnectMode,
    connected: bool,
    open_count: u32,
    settings: Option<TransportSettings>,
    subscriptions: HashSet<Subscription>,
    events: VecDeque<TransportEvent>,
    sent: Vec<Outbound>,
    options: HashMap<String, OptionValue>,
    auto_ack_telemetry: bool,
    auto_ack_reported: Option<i32>,
    twin_document: Bytes,
    next_token: u64,
    next_request: u64,
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            connect_mode: ConnectMode::Accept,
            connected: false,
            open_count: 0,
            settings: None,
            subscriptions: HashSet::new(),
            events: VecDeque::new(),
            sent: Vec::new(),
            options: HashMap::new(),
            auto_ack_telemetry: true,
            auto_ack_reported: Some(204),
            twin_document: Bytes::from_static(b"{\"desired\":{},\"reported\":{}}"),
            next_token: 1,
            next_request: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connect_mode(&self, mode: ConnectMode) {
        self.hub().connect_mode = mode;
    }

    /// When enabled (the default), every telemetry message is acknowledged
    /// with `SendResult::Ok` as soon as it is sent.
    pub fn set_auto_ack_telemetry(&self, enabled: bool) {
        self.hub().auto_ack_telemetry = enabled;
    }

    /// Status used to acknowledge reported state automatically; `None` leaves
    /// acknowledgement to [`LoopbackTransport::ack_reported`].
    pub fn set_auto_ack_reported(&self, status: Option<i32>) {
        self.hub().auto_ack_reported = status;
    }

    /// Document returned for a full twin request.
    pub fn set_twin_document(&self, document: impl Into<Bytes>) {
        self.hub().twin_document = document.into();
    }

    pub fn is_connected(&self) -> bool {
        self.hub().connected
    }

    pub fn open_count(&self) -> u32 {
        self.hub().open_count
    }

    pub fn settings(&self) -> Option<TransportSettings> {
        self.hub().settings.clone()
    }

    pub fn is_subscribed(&self, subscription: Subscription) -> bool {
        self.hub().subscriptions.contains(&subscription)
    }

    pub fn option(&self, name: &str) -> Option<OptionValue> {
        self.hub().options.get(name).cloned()
    }

    /// Everything the device has sent, in order.
    pub fn sent(&self) -> Vec<Outbound> {
        self.hub().sent.clone()
    }

    /// Ids of sent telemetry in wire order, retransmissions included.
    pub fn telemetry_ids(&self) -> Vec<SendId> {
        self.hub()
            .sent
            .iter()
            .filter_map(|item| match item {
                Outbound::Telemetry { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn method_responses(&self) -> Vec<(MethodRequestId, i32, Bytes)> {
        self.hub()
            .sent
            .iter()
            .filter_map(|item| match item {
                Outbound::MethodResponse {
                    request_id,
                    status,
                    payload,
                } => Some((*request_id, *status, payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn reported_items(&self) -> Vec<ItemId> {
        self.hub()
            .sent
            .iter()
            .filter_map(|item| match item {
                Outbound::ReportedState { item_id, .. } => Some(*item_id),
                _ => None,
            })
            .collect()
    }

    /// Drops the link as the network would.
    pub fn drop_connection(&self, reason: DisconnectReason) {
        let mut hub = self.hub();
        hub.connected = false;
        hub.subscriptions.clear();
        hub.events.push_back(TransportEvent::Disconnected(reason));
    }

    /// Delivers a cloud-to-device message. Returns the token the device must
    /// settle it with.
    pub fn deliver_c2d(&self, message: Message) -> DispositionToken {
        let mut hub = self.hub();
        let token = DispositionToken(hub.next_token);
        hub.next_token += 1;
        hub.events
            .push_back(TransportEvent::MessageReceived { token, message });
        token
    }

    pub fn push_desired(&self, state: TwinUpdateState, payload: impl Into<Bytes>) {
        self.hub().events.push_back(TransportEvent::DesiredProperties {
            state,
            payload: payload.into(),
        });
    }

    pub fn invoke_method(&self, name: &str, payload: impl Into<Bytes>) -> MethodRequestId {
        let mut hub = self.hub();
        let request_id = MethodRequestId(hub.next_request);
        hub.next_request += 1;
        hub.events.push_back(TransportEvent::MethodInvoked {
            request_id,
            name: name.to_string(),
            payload: payload.into(),
        });
        request_id
    }

    pub fn ack_telemetry(&self, id: SendId, result: SendResult) {
        self.hub()
            .events
            .push_back(TransportEvent::SendComplete { id, result });
    }

    pub fn ack_reported(&self, item_id: ItemId, status: i32) {
        self.hub()
            .events
            .push_back(TransportEvent::ReportedStateAck { item_id, status });
    }
}

impl Transport for LoopbackTransport {
    fn open(&mut self, settings: &TransportSettings) -> Result<(), TransportError> {
        let mut hub = self.hub();
        hub.open_count += 1;
        hub.settings = Some(settings.clone());
        trace!(attempt = hub.open_count, endpoint = settings.endpoint(), "loopback open");

        let mode = hub.connect_mode;
        match mode {
            ConnectMode::Accept => {
                hub.connected = true;
                hub.events.push_back(TransportEvent::Connected);
            }
            ConnectMode::Refuse(reason) => {
                hub.events.push_back(TransportEvent::ConnectFailed(reason));
            }
            ConnectMode::Hang => {}
            ConnectMode::Unreachable => {
                return Err(TransportError::Io(io::ErrorKind::ConnectionRefused.into()));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut hub = self.hub();
        hub.connected = false;
        hub.subscriptions.clear();
    }

    fn subscribe(&mut self, subscription: Subscription) -> Result<(), TransportError> {
        let mut hub = self.hub();
        if !hub.connected {
            return Err(TransportError::NotConnected);
        }
        hub.subscriptions.insert(subscription);
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: Subscription) -> Result<(), TransportError> {
        let mut hub = self.hub();
        if !hub.connected {
            return Err(TransportError::NotConnected);
        }
        hub.subscriptions.remove(&subscription);
        Ok(())
    }

    fn send(&mut self, item: Outbound) -> Result<(), TransportError> {
        let mut hub = self.hub();
        if !hub.connected {
            return Err(TransportError::NotConnected);
        }
        let auto_ack_telemetry = hub.auto_ack_telemetry;
        let auto_ack_reported = hub.auto_ack_reported;

        match &item {
            Outbound::Telemetry { id, .. } if auto_ack_telemetry => {
                let id = *id;
                hub.events.push_back(TransportEvent::SendComplete {
                    id,
                    result: SendResult::Ok,
                });
            }
            Outbound::ReportedState { item_id, .. } => {
                if let Some(status) = auto_ack_reported {
                    let item_id = *item_id;
                    hub.events
                        .push_back(TransportEvent::ReportedStateAck { item_id, status });
                }
            }
            Outbound::GetTwin => {
                let payload = hub.twin_document.clone();
                hub.events.push_back(TransportEvent::DesiredProperties {
                    state: TwinUpdateState::Complete,
                    payload,
                });
            }
            _ => {}
        }

        hub.sent.push(item);
        Ok(())
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.hub().events.pop_front()
    }

    fn set_option(&mut self, name: &str, value: &OptionValue) -> Result<(), TransportError> {
        self.hub().options.insert(name.to_string(), value.clone());
        Ok(())
    }
}

impl TransportProvider for LoopbackTransport {
    fn create(&self, _settings: &TransportSettings) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Credential;

    fn settings() -> TransportSettings {
        TransportSettings {
            host_name: "hub.example.net".into(),
            device_id: "dev-1".into(),
            gateway_host_name: None,
            credential: Credential::X509,
            keep_alive: Duration::from_secs(240),
            connection_timeout: Duration::from_secs(30),
            product_info: None,
        }
    }

    #[test]
    fn test_open_accept_reports_connected() {
        let hub = LoopbackTransport::new();
        let mut link = hub.clone();

        link.open(&settings()).unwrap();
        assert!(hub.is_connected());
        assert_eq!(link.poll(), Some(TransportEvent::Connected));
        assert_eq!(link.poll(), None);
    }

    #[test]
    fn test_open_refused_reports_failure() {
        let hub = LoopbackTransport::new();
        hub.set_connect_mode(ConnectMode::Refuse(DisconnectReason::BadCredential));
        let mut link = hub.clone();

        link.open(&settings()).unwrap();
        assert!(!hub.is_connected());
        assert_eq!(
            link.poll(),
            Some(TransportEvent::ConnectFailed(DisconnectReason::BadCredential))
        );
    }

    #[test]
    fn test_open_unreachable_fails_synchronously() {
        let hub = LoopbackTransport::new();
        hub.set_connect_mode(ConnectMode::Unreachable);
        let mut link = hub.clone();

        let err = link.open(&settings()).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(hub.open_count(), 1);
        assert_eq!(link.poll(), None);
    }

    #[test]
    fn test_send_requires_connection() {
        let mut link = LoopbackTransport::new();
        let err = link.send(Outbound::GetTwin).unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn test_telemetry_is_auto_acked() {
        let hub = LoopbackTransport::new();
        let mut link = hub.clone();
        link.open(&settings()).unwrap();
        link.poll();

        link.send(Outbound::Telemetry {
            id: SendId(1),
            message: Message::new("x"),
        })
        .unwrap();

        assert_eq!(hub.telemetry_ids(), vec![SendId(1)]);
        assert_eq!(
            link.poll(),
            Some(TransportEvent::SendComplete {
                id: SendId(1),
                result: SendResult::Ok
            })
        );
    }

    #[test]
    fn test_get_twin_answers_complete_document() {
        let hub = LoopbackTransport::new();
        hub.set_twin_document(r#"{"desired":{"rate":5}}"#);
        let mut link = hub.clone();
        link.open(&settings()).unwrap();
        link.poll();

        link.send(Outbound::GetTwin).unwrap();
        assert_eq!(
            link.poll(),
            Some(TransportEvent::DesiredProperties {
                state: TwinUpdateState::Complete,
                payload: Bytes::from_static(br#"{"desired":{"rate":5}}"#),
            })
        );
    }

    #[test]
    fn test_drop_connection_clears_subscriptions() {
        let hub = LoopbackTransport::new();
        let mut link = hub.clone();
        link.open(&settings()).unwrap();
        link.subscribe(Subscription::Methods).unwrap();
        assert!(hub.is_subscribed(Subscription::Methods));

        hub.drop_connection(DisconnectReason::NoNetwork);
        assert!(!hub.is_subscribed(Subscription::Methods));
        assert_eq!(link.poll(), Some(TransportEvent::Connected));
        assert_eq!(
            link.poll(),
            Some(TransportEvent::Disconnected(DisconnectReason::NoNetwork))
        );
    }

    #[test]
    fn test_tokens_and_request_ids_are_unique() {
        let hub = LoopbackTransport::new();
        let a = hub.deliver_c2d(Message::new("a"));
        let b = hub.deliver_c2d(Message::new("b"));
        assert_ne!(a, b);

        let r1 = hub.invoke_method("reboot", "{}");
        let r2 = hub.invoke_method("reboot", "{}");
        assert_ne!(r1, r2);
    }
}
