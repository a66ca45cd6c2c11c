//! Outgoing telemetry queue.
//!
//! Messages wait in FIFO order until the dispatch loop hands them to the
//! transport, then sit in flight until the matching acknowledgement arrives.
//! Both lists are keyed by [`SendId`], which is assigned in enqueue order, so
//! "original order" is simply ascending id.
//!
//! Every entry carries a `FnOnce` completion; removing the entry is the only
//! way to run it, which keeps the exactly-once rule local to this module.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{
    error::ClientError,
    message::{Message, SendId, SendResult},
};

pub type SendCallback = Box<dyn FnOnce(SendResult) + Send>;

struct Entry {
    id: SendId,
    message: Message,
    callback: SendCallback,
    enqueued_at: Instant,
    attempts: u32,
}

impl Entry {
    fn complete(self, result: SendResult) {
        trace!(id = %self.id, %result, attempts = self.attempts, "telemetry completed");
        (self.callback)(result);
    }
}

#[derive(Default)]
pub struct MessageQueue {
    last_id: u64,
    waiting: VecDeque<Entry>,
    in_flight: BTreeMap<SendId, Entry>,
    max_pending: Option<usize>,
}

impl MessageQueue {
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            max_pending,
            ..Default::default()
        }
    }

    /// Appends a message. Works in any connection state.
    pub fn enqueue(
        &mut self,
        message: Message,
        callback: SendCallback,
        now: Instant,
    ) -> Result<SendId, ClientError> {
        if let Some(limit) = self.max_pending {
            if self.len() >= limit {
                return Err(ClientError::ResourceExhausted(format!(
                    "{limit} telemetry messages already pending"
                )));
            }
        }

        self.last_id += 1;
        let id = SendId(self.last_id);
        self.waiting.push_back(Entry {
            id,
            message,
            callback,
            enqueued_at: now,
            attempts: 0,
        });
        Ok(id)
    }

    /// The next message to transmit, without removing it.
    pub fn front(&self) -> Option<(SendId, Message)> {
        self.waiting
            .front()
            .map(|entry| (entry.id, entry.message.clone()))
    }

    /// Moves the front message in flight after the transport accepted it.
    pub fn mark_front_sent(&mut self) {
        if let Some(mut entry) = self.waiting.pop_front() {
            entry.attempts += 1;
            self.in_flight.insert(entry.id, entry);
        }
    }

    /// Completes the front message without sending it.
    pub fn fail_front(&mut self, result: SendResult) {
        if let Some(entry) = self.waiting.pop_front() {
            entry.complete(result);
        }
    }

    /// Completes message `id` wherever it is. Returns false if it is unknown,
    /// e.g. already completed by a timeout.
    pub fn mark_disposed(&mut self, id: SendId, result: SendResult) -> bool {
        if let Some(entry) = self.in_flight.remove(&id) {
            entry.complete(result);
            return true;
        }
        if let Some(pos) = self.waiting.iter().position(|entry| entry.id == id) {
            if let Some(entry) = self.waiting.remove(pos) {
                entry.complete(result);
                return true;
            }
        }
        debug!(%id, %result, "ack for unknown telemetry message");
        false
    }

    /// Returns in-flight messages to the head of the waiting list in their
    /// original order.
    pub fn requeue_in_flight(&mut self) -> usize {
        let in_flight = std::mem::take(&mut self.in_flight);
        let count = in_flight.len();
        for (_, entry) in in_flight.into_iter().rev() {
            self.waiting.push_front(entry);
        }
        count
    }

    /// Completes every message older than `timeout` with `MessageTimeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let expired = |entry: &Entry| now.saturating_duration_since(entry.enqueued_at) >= timeout;

        let mut timed_out: Vec<Entry> = Vec::new();

        let stale: Vec<SendId> = self
            .in_flight
            .values()
            .filter(|&entry| expired(entry))
            .map(|entry| entry.id)
            .collect();
        for id in stale {
            if let Some(entry) = self.in_flight.remove(&id) {
                timed_out.push(entry);
            }
        }

        let (old, fresh): (VecDeque<Entry>, VecDeque<Entry>) =
            std::mem::take(&mut self.waiting)
                .into_iter()
                .partition(|entry| expired(entry));
        self.waiting = fresh;
        timed_out.extend(old);

        timed_out.sort_by_key(|entry| entry.id);
        let count = timed_out.len();
        for entry in timed_out {
            entry.complete(SendResult::MessageTimeout);
        }
        count
    }

    /// Completes everything with `result`, in-flight messages first.
    pub fn drain_all(&mut self, result: SendResult) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for (_, entry) in in_flight {
            entry.complete(result);
        }
        for entry in self.waiting.drain(..) {
            entry.complete(result);
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("last_id", &self.last_id)
            .field("waiting", &self.waiting.len())
            .field("in_flight", &self.in_flight.len())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Log = Arc<Mutex<Vec<(u64, SendResult)>>>;

    fn recorder(log: &Log, tag: u64) -> SendCallback {
        let log = Arc::clone(log);
        Box::new(move |result| log.lock().unwrap().push((tag, result)))
    }

    fn fill(queue: &mut MessageQueue, log: &Log, n: u64, now: Instant) -> Vec<SendId> {
        (1..=n)
            .map(|tag| {
                queue
                    .enqueue(Message::new(format!("m{tag}")), recorder(log, tag), now)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = MessageQueue::new(None);
        let log = Log::default();
        let ids = fill(&mut queue, &log, 3, Instant::now());

        let mut sent = Vec::new();
        while let Some((id, message)) = queue.front() {
            sent.push(id);
            assert_eq!(message.payload().as_ref(), format!("m{}", id.0).as_bytes());
            queue.mark_front_sent();
        }
        assert_eq!(sent, ids);
        assert_eq!(queue.in_flight_len(), 3);
    }

    #[test]
    fn test_pending_limit() {
        let mut queue = MessageQueue::new(Some(2));
        let log = Log::default();
        fill(&mut queue, &log, 2, Instant::now());

        let err = queue
            .enqueue(Message::new("x"), Box::new(|_| {}), Instant::now())
            .unwrap_err();
        assert!(matches!(err, ClientError::ResourceExhausted(_)));
    }

    #[test]
    fn test_disposed_exactly_once() {
        let mut queue = MessageQueue::new(None);
        let log = Log::default();
        let ids = fill(&mut queue, &log, 1, Instant::now());
        queue.mark_front_sent();

        assert!(queue.mark_disposed(ids[0], SendResult::Ok));
        assert!(!queue.mark_disposed(ids[0], SendResult::Ok));
        assert_eq!(*log.lock().unwrap(), vec![(1, SendResult::Ok)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_disposed_while_waiting() {
        let mut queue = MessageQueue::new(None);
        let log = Log::default();
        let ids = fill(&mut queue, &log, 2, Instant::now());

        assert!(queue.mark_disposed(ids[1], SendResult::Error));
        assert_eq!(queue.waiting_len(), 1);
        assert_eq!(queue.front().map(|(id, _)| id), Some(ids[0]));
    }

    #[test]
    fn test_requeue_restores_original_order() {
        let mut queue = MessageQueue::new(None);
        let log = Log::default();
        let ids = fill(&mut queue, &log, 4, Instant::now());
        queue.mark_front_sent();
        queue.mark_front_sent();

        assert_eq!(queue.requeue_in_flight(), 2);

        let mut order = Vec::new();
        while let Some((id, _)) = queue.front() {
            order.push(id);
            queue.mark_front_sent();
        }
        assert_eq!(order, ids);
    }

    #[test]
    fn test_expire_times_out_old_entries_only() {
        let mut queue = MessageQueue::new(None);
        let log = Log::default();
        let start = Instant::now();
        fill(&mut queue, &log, 2, start);
        queue.mark_front_sent();
        queue
            .enqueue(Message::new("late"), recorder(&log, 3), start + Duration::from_secs(5))
            .unwrap();

        let expired = queue.expire(start + Duration::from_secs(10), Duration::from_secs(8));
        assert_eq!(expired, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(1, SendResult::MessageTimeout), (2, SendResult::MessageTimeout)]
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_all_completes_everything() {
        let mut queue = MessageQueue::new(None);
        let log = Log::default();
        fill(&mut queue, &log, 3, Instant::now());
        queue.mark_front_sent();

        queue.drain_all(SendResult::BecauseDestroy);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|(_, r)| *r == SendResult::BecauseDestroy));
        assert!(queue.is_empty());
    }
}
