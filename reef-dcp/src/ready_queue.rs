//! Per-stream FIFO of pending protocol messages with byte accounting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::DcpMessage;

/// FIFO of protocol messages awaiting the network layer's pull.
///
/// The queue itself is only touched under the owning stream's mutex. The byte counter is an
/// atomic shared out through [`ReadyQueue::bytes_handle`], so stats and slow-stream checks read
/// it without taking that mutex.
#[derive(Debug)]
pub struct ReadyQueue {
    messages: VecDeque<DcpMessage>,
    bytes: Arc<AtomicU64>,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the shared lock-free byte counter handle.
    #[must_use]
    pub fn bytes_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes)
    }

    /// Appends one message, accounting its bytes.
    pub fn push(&mut self, message: DcpMessage) {
        let _ = self.bytes.fetch_add(message.size(), Ordering::AcqRel);
        self.messages.push_back(message);
    }

    /// Pops the head message, releasing its bytes.
    pub fn pop(&mut self) -> Option<DcpMessage> {
        let message = self.messages.pop_front()?;
        let _ = self.bytes.fetch_sub(message.size(), Ordering::AcqRel);
        Some(message)
    }

    /// Drops all pending messages and resets the byte accounting.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.bytes.store(0, Ordering::Release);
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of queued non-meta (document change) messages.
    #[must_use]
    pub fn non_meta_len(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| !message.is_meta())
            .count()
    }
}
