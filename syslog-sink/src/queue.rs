use std::collections::VecDeque;

use netbuf::Buf;

use crate::frame::{frame_message, Facility, Priority};

/// Byte-bounded FIFO of framed syslog messages. Overflow drops the
/// oldest entries; the count of everything lost is remembered and
/// surfaced as a synthetic WARNING record ahead of the next dequeue.
pub(crate) struct FramedQueue {
    msgs: VecDeque<Vec<u8>>,
    stored_bytes: usize,
    max_bytes: usize,
    num_dropped: u64,
}

impl FramedQueue {
    pub fn new(max_bytes: usize) -> FramedQueue {
        FramedQueue {
            msgs: VecDeque::new(),
            stored_bytes: 0,
            max_bytes,
            num_dropped: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn stored_bytes(&self) -> usize {
        self.stored_bytes
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    #[cfg(test)]
    pub fn dropped(&self) -> u64 {
        self.num_dropped
    }

    /// Enqueue one framed message. A message that could never fit is
    /// dropped immediately without disturbing what is queued.
    pub fn push(&mut self, framed: Vec<u8>) -> bool {
        if framed.len() > self.max_bytes {
            self.num_dropped = self.num_dropped.saturating_add(1);
            return false;
        }
        self.stored_bytes += framed.len();
        self.msgs.push_back(framed);
        while self.stored_bytes > self.max_bytes {
            if let Some(old) = self.msgs.pop_front() {
                self.stored_bytes -= old.len();
                self.num_dropped = self.num_dropped.saturating_add(1);
            } else {
                break;
            }
        }
        true
    }

    /// Move the next message into `buf`, preceded by a drop warning
    /// when messages were lost since the last dequeue. Returns false
    /// when there was nothing to move.
    pub fn fill_next(
        &mut self,
        buf: &mut Buf,
        facility: Facility,
        src_host: &str,
        product: &str,
    ) -> bool {
        let mut moved = false;
        if self.num_dropped > 0 {
            let warning = frame_message(
                &format!("{} messages were dropped (buffer full)\n", self.num_dropped),
                facility,
                Priority::Warning,
                src_host,
                product,
            );
            self.num_dropped = 0;
            buf.add_bytes(&warning);
            moved = true;
        }
        if let Some(msg) = self.msgs.pop_front() {
            self.stored_bytes -= msg.len();
            buf.add_bytes(&msg);
            moved = true;
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest_and_warns() {
        let mut q = FramedQueue::new(200);
        for i in 0..3 {
            q.push(vec![b'0' + i; 150]);
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.dropped(), 2);
        assert!(q.stored_bytes() <= 200);

        let mut buf = Buf::new();
        assert!(q.fill_next(&mut buf, Facility::User, "h", "p"));
        let text = String::from_utf8_lossy(buf.peek()).to_string();
        assert!(text.contains("2 messages were dropped (buffer full)"));
        // The warning is followed by the surviving message.
        assert!(text.contains(&"2".repeat(150)));
        assert!(q.is_empty());
        // The counter reset with the warning.
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn oversized_message_dropped_immediately() {
        let mut q = FramedQueue::new(100);
        assert!(q.push(vec![b'a'; 50]));
        assert!(!q.push(vec![b'b'; 101]));
        assert_eq!(q.len(), 1);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn fifo_order() {
        let mut q = FramedQueue::new(1000);
        q.push(b"first".to_vec());
        q.push(b"second".to_vec());
        let mut buf = Buf::new();
        q.fill_next(&mut buf, Facility::User, "h", "p");
        assert_eq!(buf.peek(), b"first");
    }
}
