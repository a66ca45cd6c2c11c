//! Telemetry agent.
//!
//! Owns one [`DeviceClient`] and drives it from the tokio runtime:
//! `dispatch_once` on a short interval, a JSON heartbeat on a long one, and
//! method answers right after each dispatch. The client itself stays
//! single-threaded; every callback it runs either logs or hands work back to
//! the agent through a channel.

use std::time::{Duration, Instant};

use iothub_device_client::{
    ClientError, DeviceClient, LoopbackTransport, Message, MethodInvocation, SendId,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{telemetry::TelemetryConfig, AgentConfig},
    status::{LinkStatus, StatusBoard},
};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Device client error: {0}")]
    Client(#[from] ClientError),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Heartbeat<'a> {
    device_id: &'a str,
    sequence: u64,
    uptime_secs: u64,
    link: &'static str,
    timestamp: String,
}

pub struct Agent {
    client: DeviceClient,
    hub: LoopbackTransport,
    telemetry: TelemetryConfig,
    status: StatusBoard,
    invocations: mpsc::UnboundedReceiver<MethodInvocation>,
    started: Instant,
    sequence: u64,
}

impl Agent {
    /// Builds the agent over an in-process loopback hub.
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        Self::with_hub(config, LoopbackTransport::new())
    }

    pub fn with_hub(config: &AgentConfig, hub: LoopbackTransport) -> Result<Self, AgentError> {
        let mut client = DeviceClient::create(config.client.clone(), &hub)?;
        let status = StatusBoard::new();

        let board = status.clone();
        client.set_connection_status_callback(move |status, reason| {
            board.publish(LinkStatus::from((status, reason)));
        });

        client.set_device_twin_callback(|state, payload| {
            info!(?state, bytes = payload.len(), "Desired properties received");
        });

        let (tx, invocations) = mpsc::unbounded_channel();
        client.set_device_method_callback(move |invocation| {
            if let Err(e) = tx.send(invocation) {
                warn!(method = %e.0.name, "Method channel closed, invocation dropped");
            }
        });

        let reported = json!({
            "agent": {
                "version": env!("CARGO_PKG_VERSION"),
                "heartbeatIntervalSecs": config.telemetry.heartbeat_interval_secs,
            }
        });
        client.send_reported_properties(&reported, |result| {
            if result.is_success() {
                debug!(?result, "Agent properties reported");
            } else {
                warn!(?result, "Hub did not accept agent properties");
            }
        })?;

        Ok(Self {
            client,
            hub,
            telemetry: config.telemetry.clone(),
            status,
            invocations,
            started: Instant::now(),
            sequence: 0,
        })
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn hub(&self) -> &LoopbackTransport {
        &self.hub
    }

    pub fn client(&self) -> &DeviceClient {
        &self.client
    }

    /// Runs until `cancel` fires, then destroys the client.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut dispatch = interval(Duration::from_millis(self.telemetry.dispatch_interval_ms));
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval(Duration::from_secs(self.telemetry.heartbeat_interval_secs));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            device_id = self.client.device_id(),
            dispatch_ms = self.telemetry.dispatch_interval_ms,
            heartbeat_secs = self.telemetry.heartbeat_interval_secs,
            "Agent started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = dispatch.tick() => self.tick(),
                _ = heartbeat.tick() => {
                    self.send_heartbeat();
                }
            }
        }

        self.shutdown();
    }

    /// One dispatch, then answers for any methods it delivered.
    pub fn tick(&mut self) {
        self.client.dispatch_once();
        self.answer_methods();
    }

    fn answer_methods(&mut self) {
        while let Ok(invocation) = self.invocations.try_recv() {
            let (status, body) = match invocation.name.as_str() {
                "ping" => (
                    200,
                    json!({ "pong": true, "uptimeSecs": self.started.elapsed().as_secs() }),
                ),
                other => {
                    warn!(method = other, "Unsupported method invoked");
                    (404, json!({ "message": format!("method '{other}' is not supported") }))
                }
            };
            debug!(method = %invocation.name, status, "Answering method");
            if let Err(e) = self
                .client
                .device_method_response(invocation.handle, body.to_string(), status)
            {
                warn!(method = %invocation.name, error = %e, "Method response failed");
            }
        }
    }

    /// Queues a heartbeat unless the unsent backlog is already full.
    pub fn send_heartbeat(&mut self) -> Option<SendId> {
        let backlog = self.client.pending_messages();
        if backlog >= self.telemetry.max_backlog {
            warn!(backlog, link = %self.status.current(), "Telemetry backlog full, skipping heartbeat");
            return None;
        }

        self.sequence += 1;
        let sequence = self.sequence;
        let heartbeat = Heartbeat {
            device_id: self.client.device_id(),
            sequence,
            uptime_secs: self.started.elapsed().as_secs(),
            link: self.status.current().as_str(),
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        };
        let message = match Message::from_json(&heartbeat) {
            Ok(message) => message.with_property("kind", "heartbeat"),
            Err(e) => {
                error!(error = %e, "Failed to serialize heartbeat");
                return None;
            }
        };

        let queued = self.client.send_event(message, move |result| match result.into_result() {
            Ok(()) => debug!(sequence, "Heartbeat delivered"),
            Err(e) => warn!(sequence, error = %e, "Heartbeat not delivered"),
        });
        match queued {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "Failed to queue heartbeat");
                None
            }
        }
    }

    fn shutdown(self) {
        info!(
            pending = self.client.pending_messages(),
            sent = self.hub.sent().len(),
            "Destroying device client"
        );
        self.client.destroy();
    }
}

#[cfg(test)]
mod tests {
    use iothub_device_client::ConnectionState;

    use super::*;

    fn agent() -> Agent {
        Agent::new(&AgentConfig::default()).unwrap()
    }

    fn connect(agent: &mut Agent) {
        agent.tick();
        agent.tick();
        assert_eq!(agent.client().connection_state(), ConnectionState::Connected);
        assert!(agent.status().current().is_online());
    }

    #[test]
    fn test_agent_reports_properties_on_connect() {
        let mut agent = agent();
        connect(&mut agent);
        assert_eq!(agent.hub().reported_items().len(), 1);
    }

    #[test]
    fn test_heartbeat_reaches_hub() {
        let mut agent = agent();
        connect(&mut agent);

        let id = agent.send_heartbeat().unwrap();
        agent.tick();
        assert_eq!(agent.hub().telemetry_ids(), vec![id]);
        // sent, the hub's ack is picked up on the next dispatch
        assert_eq!(agent.client().pending_messages(), 1);

        agent.tick();
        assert_eq!(agent.client().pending_messages(), 0);
    }

    #[test]
    fn test_heartbeat_skipped_when_backlog_full() {
        let mut config = AgentConfig::default();
        config.telemetry.max_backlog = 2;
        let mut agent = Agent::new(&config).unwrap();

        // not connected yet, so heartbeats pile up
        assert!(agent.send_heartbeat().is_some());
        assert!(agent.send_heartbeat().is_some());
        assert!(agent.send_heartbeat().is_none());
    }

    #[test]
    fn test_ping_is_answered() {
        let mut agent = agent();
        connect(&mut agent);

        let request = agent.hub().invoke_method("ping", "{}");
        agent.tick();
        agent.tick();

        let responses = agent.hub().method_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, request);
        assert_eq!(responses[0].1, 200);
        let body: serde_json::Value = serde_json::from_slice(&responses[0].2).unwrap();
        assert_eq!(body["pong"], true);
    }

    #[test]
    fn test_unknown_method_gets_404() {
        let mut agent = agent();
        connect(&mut agent);

        agent.hub().invoke_method("selfDestruct", "{}");
        agent.tick();
        agent.tick();

        assert_eq!(agent.hub().method_responses()[0].1, 404);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let agent = agent();
        let hub = agent.hub().clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), agent.run(cancel))
            .await
            .unwrap();
        assert!(!hub.is_connected());
    }
}
