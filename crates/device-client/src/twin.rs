//! Device twin synchronization.
//!
//! Two independent streams live here:
//!
//! - **Reported state**: patches the device sends to the hub. Each patch gets
//!   an [`ItemId`] (monotonic from 1, never reused) and waits in a FIFO until
//!   the dispatch loop hands it to the transport. The hub acknowledges by item
//!   id, possibly out of order, and the patch's callback receives the status.
//! - **Desired state**: pushes from the hub, delivered to a single registered
//!   callback as either a partial patch or the complete document.
//!
//! Acks for unknown ids (duplicates, or acks for patches already failed on
//! shutdown) are logged and dropped.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Correlates a reported-state patch with its acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "twin#{}", self.0)
    }
}

/// Scope of a desired-state push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TwinUpdateState {
    /// Only the changed properties.
    Partial,
    /// The full twin document.
    Complete,
}

/// Outcome handed to a reported-state callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStateResult {
    /// The hub answered with this status code.
    Status(i32),
    /// The transport refused the patch.
    Failed,
    /// The client was destroyed first.
    ShuttingDown,
}

impl ReportedStateResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ReportedStateResult::Status(code) if (200..300).contains(code))
    }
}

pub type ReportedStateCallback = Box<dyn FnOnce(ReportedStateResult) + Send>;
pub type DesiredStateCallback = Box<dyn FnMut(TwinUpdateState, &[u8]) + Send>;

struct Patch {
    item_id: ItemId,
    payload: Bytes,
    callback: ReportedStateCallback,
}

#[derive(Default)]
pub struct TwinSynchronizer {
    last_item: u32,
    pending: VecDeque<Patch>,
    in_flight: BTreeMap<ItemId, Patch>,
    desired: Option<DesiredStateCallback>,
}

impl TwinSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reported-state patch.
    pub fn enqueue(
        &mut self,
        payload: Bytes,
        callback: ReportedStateCallback,
    ) -> Result<ItemId, ClientError> {
        if payload.is_empty() {
            return Err(ClientError::InvalidArgument(
                "reported state must not be empty".into(),
            ));
        }
        let next = self.last_item.checked_add(1).ok_or_else(|| {
            ClientError::ResourceExhausted("reported state item ids exhausted".into())
        })?;
        self.last_item = next;

        let item_id = ItemId(next);
        debug!(%item_id, bytes = payload.len(), "reported state queued");
        self.pending.push_back(Patch {
            item_id,
            payload,
            callback,
        });
        Ok(item_id)
    }

    /// The next patch to transmit, without removing it.
    pub fn front(&self) -> Option<(ItemId, Bytes)> {
        self.pending
            .front()
            .map(|patch| (patch.item_id, patch.payload.clone()))
    }

    /// Moves the front patch in flight after the transport accepted it.
    pub fn mark_front_sent(&mut self) {
        if let Some(patch) = self.pending.pop_front() {
            self.in_flight.insert(patch.item_id, patch);
        }
    }

    /// Fails the front patch after the transport refused it.
    pub fn fail_front(&mut self) {
        if let Some(patch) = self.pending.pop_front() {
            warn!(item_id = %patch.item_id, "reported state refused by transport");
            (patch.callback)(ReportedStateResult::Failed);
        }
    }

    /// Completes the in-flight patch `item_id`. Returns false for an
    /// unmatched ack, which is dropped.
    pub fn acknowledge(&mut self, item_id: ItemId, status: i32) -> bool {
        match self.in_flight.remove(&item_id) {
            Some(patch) => {
                debug!(%item_id, status, "reported state acknowledged");
                (patch.callback)(ReportedStateResult::Status(status));
                true
            }
            None => {
                warn!(%item_id, status, "dropping ack for unknown reported state item");
                false
            }
        }
    }

    /// Returns in-flight patches to the head of the FIFO in id order, so they
    /// are retransmitted first after reconnect.
    pub fn requeue_in_flight(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for (_, patch) in in_flight.into_iter().rev() {
            self.pending.push_front(patch);
        }
    }

    /// Runs every outstanding callback with `ShuttingDown`.
    pub fn shutdown(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for (_, patch) in in_flight {
            (patch.callback)(ReportedStateResult::ShuttingDown);
        }
        for patch in self.pending.drain(..) {
            (patch.callback)(ReportedStateResult::ShuttingDown);
        }
    }

    pub fn set_desired_callback(&mut self, callback: DesiredStateCallback) {
        self.desired = Some(callback);
    }

    pub fn clear_desired_callback(&mut self) {
        self.desired = None;
    }

    pub fn has_desired_callback(&self) -> bool {
        self.desired.is_some()
    }

    /// Hands a desired-state push to the callback. Returns false when no
    /// callback is registered.
    pub fn deliver_desired(&mut self, state: TwinUpdateState, payload: &[u8]) -> bool {
        match self.desired.as_mut() {
            Some(callback) => {
                callback(state, payload);
                true
            }
            None => {
                debug!(?state, "desired state push without a registered callback");
                false
            }
        }
    }
}

impl fmt::Debug for TwinSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwinSynchronizer")
            .field("last_item", &self.last_item)
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .field("desired", &self.desired.is_some())
            .finish()
    }
}
