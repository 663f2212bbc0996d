use crate::frame::Message;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Bounded multi-producer queue of messages waiting for one destination.
///
/// Producers are application threads calling `send`; the single consumer is
/// the send pump. A full queue rejects the push and the caller drops the
/// message.
pub struct HandoffQueue {
    inner: ArrayQueue<Arc<Message>>,
}

impl HandoffQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Enqueue `msg`. Returns `false` (and drops `msg`) when the queue is full.
    pub fn push(&self, msg: Arc<Message>) -> bool {
        self.inner.push(msg).is_ok()
    }

    pub fn pop(&self) -> Option<Arc<Message>> {
        self.inner.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl std::fmt::Debug for HandoffQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
