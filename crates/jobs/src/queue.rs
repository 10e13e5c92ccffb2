//! Priority ready queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use jobflow_core::JobId;

#[derive(Debug, Clone)]
struct QueuedJob {
    priority: i32,
    seq: u64,
    id: JobId,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Jobs waiting for a concurrency slot.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
}

impl ReadyQueue {
    pub(crate) fn push(&mut self, id: JobId, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedJob { priority, seq, id });
    }

    pub(crate) fn pop(&mut self) -> Option<JobId> {
        self.heap.pop().map(|q| q.id)
    }

    pub(crate) fn remove(&mut self, id: &JobId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|q| &q.id != id);
        self.heap.len() != before
    }

    pub(crate) fn contains(&self, id: &JobId) -> bool {
        self.heap.iter().any(|q| &q.id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let mut q = ReadyQueue::default();
        q.push(id("low-1"), 0);
        q.push(id("high"), 5);
        q.push(id("low-2"), 0);

        assert_eq!(q.pop(), Some(id("high")));
        assert_eq!(q.pop(), Some(id("low-1")));
        assert_eq!(q.pop(), Some(id("low-2")));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn remove_by_id() {
        let mut q = ReadyQueue::default();
        q.push(id("a"), 0);
        q.push(id("b"), 0);
        assert!(q.remove(&id("a")));
        assert!(!q.remove(&id("a")));
        assert!(!q.contains(&id("a")));
        assert_eq!(q.len(), 1);
    }
}
