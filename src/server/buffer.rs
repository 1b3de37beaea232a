//! Bounded per-agent output history.

use crate::protocol::OutputMessage;
use std::collections::VecDeque;

/// Ring buffer holding the most recent output messages of one agent.
#[derive(Debug)]
pub struct OutputBuffer {
    /// Maximum number of messages kept.
    capacity: usize,
    messages: VecDeque<OutputMessage>,
}

impl OutputBuffer {
    /// Create an empty buffer. Nothing is allocated until the first push.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::new(),
        }
    }

    /// Append a message, dropping the oldest ones past capacity.
    pub fn push(&mut self, message: OutputMessage) {
        if self.capacity == 0 {
            return;
        }

        while self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// The last `n` messages, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<OutputMessage> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputMessage> {
        self.messages.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
