//! Bounded outgoing queue with drop-oldest overflow.

use std::collections::VecDeque;

use crate::bridge::protocol::Message;

#[derive(Debug)]
pub struct OutgoingQueue {
    entries: VecDeque<Message>,
    capacity: usize,
}

impl OutgoingQueue {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append `message`, evicting and returning the oldest entry if full.
    pub fn push(&mut self, message: Message) -> Option<Message> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        evicted
    }

    pub fn front(&self) -> Option<&Message> {
        self.entries.front()
    }

    /// Pop the head only if it is still the message with `id`.
    ///
    /// The head can change while a write is in flight (eviction or `clear`), so the
    /// drainer confirms identity before removing.
    pub fn pop_front_if(&mut self, id: &str) -> Option<Message> {
        match self.entries.front() {
            Some(head) if head.id == id => self.entries.pop_front(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
