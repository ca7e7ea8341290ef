//! Bounded FIFO of operations deferred while the device is offline.

use crate::models::{SyncProfile, Timestamp};
use std::collections::VecDeque;

/// Kind of deferred relay call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedOperation {
    Push,
    Pull,
}

/// One deferred operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub operation: QueuedOperation,
    /// Sync-safe profile for pushes. Never carries photo bytes.
    pub payload: Option<SyncProfile>,
    pub timestamp: Timestamp,
}

/// Ring buffer keeping the most recent `capacity` entries.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, returning the oldest one if it had to be dropped.
    pub fn push(&mut self, entry: QueueEntry) -> Option<QueueEntry> {
        let dropped = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        dropped
    }

    /// Take every entry in FIFO order.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    /// Put entries back at the front, ahead of anything queued meanwhile.
    ///
    /// Entries beyond capacity are dropped oldest first.
    pub fn requeue_front(&mut self, entries: Vec<QueueEntry>) {
        let newer: Vec<QueueEntry> = self.entries.drain(..).collect();
        for entry in entries.into_iter().chain(newer) {
            self.push(entry);
        }
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_at(timestamp: Timestamp) -> QueueEntry {
        QueueEntry {
            operation: QueuedOperation::Pull,
            payload: None,
            timestamp,
        }
    }

    #[test]
    fn keeps_most_recent_entries() {
        let mut queue = OfflineQueue::new(10);
        let mut dropped = Vec::new();
        for i in 0..12 {
            if let Some(old) = queue.push(pull_at(i)) {
                dropped.push(old.timestamp);
            }
        }

        assert_eq!(queue.len(), 10);
        assert_eq!(dropped, vec![0, 1]);
        let kept: Vec<Timestamp> = queue.drain().iter().map(|e| e.timestamp).collect();
        assert_eq!(kept, (2..12).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_front_preserves_order() {
        let mut queue = OfflineQueue::new(4);
        queue.push(pull_at(1));
        queue.push(pull_at(2));
        let taken = queue.drain();
        queue.push(pull_at(3));

        queue.requeue_front(taken);
        let order: Vec<Timestamp> = queue.snapshot().iter().map(|e| e.timestamp).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn requeue_front_respects_capacity() {
        let mut queue = OfflineQueue::new(2);
        queue.push(pull_at(3));
        queue.requeue_front(vec![pull_at(1), pull_at(2)]);
        let order: Vec<Timestamp> = queue.snapshot().iter().map(|e| e.timestamp).collect();
        assert_eq!(order, vec![2, 3]);
    }
}
