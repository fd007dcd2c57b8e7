use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::message::{parse_meta, MessageMeta};

/// A message waiting its turn, plus its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub raw: String,
    pub attempts: usize,
    pub not_before: Instant,
    pub meta: MessageMeta,
    /// Synthetic messages (the drop warning) bypass the sent/failed
    /// callbacks.
    pub synthetic: bool,
}

impl QueuedMessage {
    pub fn new(raw: String) -> QueuedMessage {
        let meta = parse_meta(&raw);
        QueuedMessage {
            raw,
            attempts: 0,
            not_before: Instant::now(),
            meta,
            synthetic: false,
        }
    }
}

/// Byte-bounded FIFO with oldest-first overflow drops. The drop count
/// is remembered and surfaced as a synthetic warning message ahead of
/// the next dequeue, so an operator can tell that a gap exists.
pub struct BoundedQueue {
    msgs: VecDeque<QueuedMessage>,
    stored_bytes: usize,
    max_bytes: usize,
    num_dropped: u64,
}

impl BoundedQueue {
    pub fn new(max_bytes: usize) -> BoundedQueue {
        BoundedQueue {
            msgs: VecDeque::new(),
            stored_bytes: 0,
            max_bytes,
            num_dropped: 0,
        }
    }

    /// Adjust the byte bound. A smaller bound takes effect on the next
    /// insert; nothing already queued is dropped here.
    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn stored_bytes(&self) -> usize {
        self.stored_bytes
    }

    pub fn dropped(&self) -> u64 {
        self.num_dropped
    }

    /// Enqueue at the tail. A message bigger than the whole queue is
    /// dropped on the spot; otherwise the oldest entries make room.
    pub fn push(&mut self, msg: QueuedMessage) -> bool {
        if msg.raw.len() > self.max_bytes {
            self.num_dropped = self.num_dropped.saturating_add(1);
            return false;
        }
        self.stored_bytes += msg.raw.len();
        self.msgs.push_back(msg);
        while self.stored_bytes > self.max_bytes {
            if let Some(old) = self.msgs.pop_front() {
                self.stored_bytes -= old.raw.len();
                self.num_dropped = self.num_dropped.saturating_add(1);
            } else {
                break;
            }
        }
        true
    }

    /// Re-enqueue a failed message at the head so it retries before
    /// newer traffic. Enforces the same size bound.
    pub fn push_front(&mut self, msg: QueuedMessage) -> bool {
        if msg.raw.len() > self.max_bytes
            || self.stored_bytes + msg.raw.len() > self.max_bytes
        {
            self.num_dropped = self.num_dropped.saturating_add(1);
            return false;
        }
        self.stored_bytes += msg.raw.len();
        self.msgs.push_front(msg);
        true
    }

    /// Take the next deliverable message. When drops happened since
    /// the last dequeue, a synthetic warning is produced first.
    pub fn pop(&mut self, now: Instant) -> Option<QueuedMessage> {
        if self.num_dropped > 0 {
            let warning = format!(
                "Subject: mail queue overflow\r\n\r\nWarning: {} messages were dropped (buffer full)\r\n",
                self.num_dropped
            );
            self.num_dropped = 0;
            let mut msg = QueuedMessage::new(warning);
            msg.synthetic = true;
            return Some(msg);
        }
        let ready = self
            .msgs
            .iter()
            .position(|m| m.not_before <= now)?;
        let msg = self.msgs.remove(ready)?;
        self.stored_bytes -= msg.raw.len();
        Some(msg)
    }

    /// The shortest wait until a parked message becomes deliverable.
    pub fn next_ready_in(&self, now: Instant) -> Option<Duration> {
        self.msgs
            .iter()
            .map(|m| m.not_before.saturating_duration_since(now))
            .min()
    }

    /// Drain everything, for `dump_queue`.
    pub fn drain(&mut self) -> Vec<String> {
        self.stored_bytes = 0;
        self.msgs.drain(..).map(|m| m.raw).collect()
    }
}
