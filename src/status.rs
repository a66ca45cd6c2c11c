//! Hub link status shared between the agent and its observers.
//!
//! The device client reports `(status, reason)` pairs from inside
//! `dispatch_once`; the agent publishes them on a watch channel so other
//! tasks can wait for the link instead of polling the client.

use std::{fmt, time::Duration};

use iothub_device_client::{ConnectionStatus, ConnectionStatusReason};
use tokio::{sync::watch, time::sleep};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Online,
    /// Not connected. `fatal` is set once the retry policy has given up.
    Offline {
        reason: ConnectionStatusReason,
        fatal: bool,
    },
    /// No status reported yet.
    Unknown,
}

impl LinkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, LinkStatus::Online)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkStatus::Offline { fatal: true, .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Online => "Online",
            LinkStatus::Offline { .. } => "Offline",
            LinkStatus::Unknown => "Unknown",
        }
    }
}

impl From<(ConnectionStatus, ConnectionStatusReason)> for LinkStatus {
    fn from((status, reason): (ConnectionStatus, ConnectionStatusReason)) -> Self {
        match status {
            ConnectionStatus::Authenticated => LinkStatus::Online,
            ConnectionStatus::Unauthenticated => LinkStatus::Offline {
                reason,
                fatal: reason == ConnectionStatusReason::RetryExpired,
            },
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Offline { reason, fatal: true } => write!(f, "Offline ({reason}, giving up)"),
            LinkStatus::Offline { reason, .. } => write!(f, "Offline ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Watch-backed holder of the latest [`LinkStatus`].
#[derive(Debug, Clone)]
pub struct StatusBoard {
    tx: watch::Sender<LinkStatus>,
    rx: watch::Receiver<LinkStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(LinkStatus::Unknown);
        Self { tx, rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.rx.clone()
    }

    pub fn current(&self) -> LinkStatus {
        self.rx.borrow().clone()
    }

    pub fn publish(&self, status: LinkStatus) {
        let old = self.tx.send_replace(status.clone());
        if old != status {
            debug!("Link status changed: {} -> {}", old, status);
        }
    }

    /// Resolves once the link is online. Returns false if the retry policy
    /// gave up first.
    pub async fn wait_online(&self) -> bool {
        let mut rx = self.subscribe();
        loop {
            {
                let status = rx.borrow_and_update();
                if status.is_online() {
                    return true;
                }
                if status.is_fatal() {
                    return false;
                }
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = sleep(Duration::from_secs(30)) => {
                    warn!("Still waiting for the hub link... Current: {}", *rx.borrow());
                }
            }
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
