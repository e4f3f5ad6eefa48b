//! Bounded per-recipient priority queues.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use super::types::Priority;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedMessage {
    priority: Priority,
    seq: u64,
    message_id: String,
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier arrival.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Undelivered message ids for one recipient, highest priority first.
#[derive(Debug, Default)]
pub struct RecipientQueue {
    heap: BinaryHeap<QueuedMessage>,
}

impl RecipientQueue {
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn push(&mut self, message_id: String, priority: Priority, seq: u64) {
        self.heap.push(QueuedMessage {
            priority,
            seq,
            message_id,
        });
    }

    fn pop(&mut self) -> Option<String> {
        self.heap.pop().map(|q| q.message_id)
    }
}

/// All recipient queues of one protocol instance.
#[derive(Debug)]
pub struct QueueSet {
    queues: HashMap<String, RecipientQueue>,
    max_queue_size: usize,
    next_seq: u64,
}

impl QueueSet {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_queue_size,
            next_seq: 0,
        }
    }

    /// Enqueue for `recipient`. Returns `false` if that recipient's queue is full.
    pub fn push(&mut self, recipient: &str, message_id: String, priority: Priority) -> bool {
        let queue = self.queues.entry(recipient.to_string()).or_default();
        if queue.len() >= self.max_queue_size {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        queue.push(message_id, priority, seq);
        true
    }

    pub fn is_full(&self, recipient: &str) -> bool {
        self.len(recipient) >= self.max_queue_size
    }

    /// Next message id for `recipient`; drops the queue once empty.
    pub fn pop(&mut self, recipient: &str) -> Option<String> {
        let queue = self.queues.get_mut(recipient)?;
        let next = queue.pop();
        if queue.is_empty() {
            self.queues.remove(recipient);
        }
        next
    }

    pub fn len(&self, recipient: &str) -> usize {
        self.queues.get(recipient).map_or(0, RecipientQueue::len)
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(RecipientQueue::len).sum()
    }

    pub fn lengths(&self) -> HashMap<String, usize> {
        self.queues
            .iter()
            .map(|(id, q)| (id.clone(), q.len()))
            .collect()
    }

    /// Drop every queue, returning the ids that were still waiting.
    pub fn clear(&mut self) -> Vec<String> {
        let mut ids = Vec::new();
        for (_, mut queue) in self.queues.drain() {
            while let Some(id) = queue.pop() {
                ids.push(id);
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_arrival_order() {
        let mut queues = QueueSet::new(10);
        queues.push("b", "low".into(), Priority::Low);
        queues.push("b", "normal-1".into(), Priority::Normal);
        queues.push("b", "urgent".into(), Priority::Urgent);
        queues.push("b", "normal-2".into(), Priority::Normal);
        queues.push("b", "high".into(), Priority::High);

        let mut order = Vec::new();
        while let Some(id) = queues.pop("b") {
            order.push(id);
        }
        assert_eq!(order, vec!["urgent", "high", "normal-1", "normal-2", "low"]);
        assert_eq!(queues.len("b"), 0);
    }

    #[test]
    fn test_capacity_is_per_recipient() {
        let mut queues = QueueSet::new(2);
        assert!(queues.push("b", "1".into(), Priority::Normal));
        assert!(queues.push("b", "2".into(), Priority::Normal));
        assert!(queues.is_full("b"));
        assert!(!queues.push("b", "3".into(), Priority::Urgent));
        assert!(!queues.is_full("c"));
        assert!(queues.push("c", "4".into(), Priority::Normal));
        assert_eq!(queues.len("b"), 2);
        assert_eq!(queues.len("c"), 1);
        assert_eq!(queues.total(), 3);
    }

    #[test]
    fn test_clear_returns_waiting_ids() {
        let mut queues = QueueSet::new(5);
        queues.push("b", "1".into(), Priority::Normal);
        queues.push("c", "2".into(), Priority::Normal);
        let mut cleared = queues.clear();
        cleared.sort();
        assert_eq!(cleared, vec!["1", "2"]);
        assert_eq!(queues.total(), 0);
    }
}
