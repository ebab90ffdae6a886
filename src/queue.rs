//! Thread-safe-by-convention FIFO of outgoing data messages (§4.B).
//!
//! `MessageQueue` itself holds no lock — it is always mutated by a caller
//! already holding `ProxyHandle::handle_lock`. Keeping the queue lock-free
//! and letting the caller own synchronization matches invariant #1 (slot
//! locks and `handle_lock` are never nested) since the queue is part of the
//! state `handle_lock` protects, not a second lock on the same path.

use crate::broker::GatewayMessage;
use std::collections::VecDeque;

/// An owned FIFO of pending outgoing messages, queued before wire encoding.
#[derive(Default)]
pub struct MessageQueue {
    inner: VecDeque<Box<dyn GatewayMessage>>,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.inner.len())
            .finish()
    }
}

impl MessageQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        MessageQueue {
            inner: VecDeque::new(),
        }
    }

    /// Pushes a message onto the back of the queue, taking ownership.
    pub fn push(&mut self, msg: Box<dyn GatewayMessage>) {
        self.inner.push_back(msg);
    }

    /// Pops the oldest message off the queue, if any.
    pub fn pop(&mut self) -> Option<Box<dyn GatewayMessage>> {
        self.inner.pop_front()
    }

    /// Returns whether the queue currently holds no messages.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Drains and drops every queued message. Used by `destroy` to ensure
    /// undelivered messages are released rather than leaked (invariant #4).
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
