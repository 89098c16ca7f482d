//! Bounded buffer of messages pushed by a slave.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Default queue capacity.
pub const OUTBOUND_CAPACITY: usize = 100;

/// Opaque payload with its enqueue timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Wrap a payload, stamped with the current time.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Fixed-capacity FIFO with drop-oldest overflow.
///
/// `push` never blocks and never fails: on overflow the oldest
/// unconsumed entry is discarded.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<OutboundMessage>>,
    capacity: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    /// Create a queue with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(OUTBOUND_CAPACITY)
    }

    /// Create a queue holding at most `capacity` messages (minimum 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a message, evicting the oldest one first if the queue is full.
    ///
    /// Returns `true` when an entry was dropped to make room.
    pub fn push(&self, msg: OutboundMessage) -> bool {
        let mut inner = self.inner.lock();
        let dropped = if inner.len() >= self.capacity {
            inner.pop_front().is_some()
        } else {
            false
        };
        inner.push_back(msg);
        dropped
    }

    /// Take every queued message, oldest first.
    pub fn drain(&self) -> Vec<OutboundMessage> {
        self.inner.lock().drain(..).collect()
    }

    /// Copy of the queued messages, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.inner.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
