//! Serialization of GATT operations
//!
//! A BLE central may only have one read or write outstanding per connection.
//! Every subsystem (serial packets, firmware blocks, device-info reads) shares
//! this queue, so operations go out strictly in the order they were queued.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct OperationQueue<T> {
    waiting: VecDeque<T>,
    in_flight: bool,
}

impl<T> Default for OperationQueue<T> {
    fn default() -> Self {
        Self {
            waiting: VecDeque::new(),
            in_flight: false,
        }
    }
}

impl<T> OperationQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `op`. Returns it straight back if the link is idle, in which case
    /// the caller must start it now and report its completion.
    #[must_use]
    pub fn enqueue(&mut self, op: T) -> Option<T> {
        if self.in_flight {
            self.waiting.push_back(op);
            None
        } else {
            self.in_flight = true;
            Some(op)
        }
    }

    /// The in-flight operation finished. Returns the next operation to start,
    /// or `None` once the queue is drained and the link is idle.
    #[must_use]
    pub fn on_operation_complete(&mut self) -> Option<T> {
        let next = self.waiting.pop_front();
        self.in_flight = next.is_some();
        next
    }

    /// Forget everything. Returns the operations that never started.
    pub fn on_disconnect(&mut self) -> Vec<T> {
        self.in_flight = false;
        self.waiting.drain(..).collect()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Operations waiting behind the in-flight one
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
