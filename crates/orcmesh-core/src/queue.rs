//! Priority queue of ready tasks: strict tier ordering, FIFO within a tier.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::types::{TaskId, TaskPriority};

#[derive(Debug, Clone, Eq, PartialEq)]
struct Entry {
    priority: TaskPriority,
    sequence: u64,
    task_id: TaskId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first; within a tier, lower sequence (older) first;
        // final tiebreak on task id for total determinism.
        self.priority
            .cmp(&other.priority)
            .then_with(|| Reverse(self.sequence).cmp(&Reverse(other.sequence)))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A 4-tier FIFO-within-tier queue, backed by a single binary heap.
///
/// Both the tier ordering and FIFO-within-tier ordering fall out of one
/// total order on `(priority, Reverse(sequence))`, so no auxiliary
/// per-tier bookkeeping is needed.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `task_id` at `priority`. Assigns the next monotonic sequence
    /// number, so concurrent callers still get strict FIFO-within-tier.
    pub fn push(&mut self, task_id: TaskId, priority: TaskPriority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Entry {
            priority,
            sequence,
            task_id,
        });
    }

    /// Pop the highest-priority, oldest-within-tier task id.
    pub fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|entry| entry.task_id)
    }

    /// Push `task_id` back in with a priority, preserving a fresh sequence
    /// number -- used when the Scheduler cannot find a worker for the
    /// popped task and needs to put it back at the head of its tier.
    ///
    /// To truly reinsert "at the head" (ahead of anything enqueued since),
    /// callers pass the original sequence via [`PriorityQueue::push_front`].
    pub fn push_front(&mut self, task_id: TaskId, priority: TaskPriority, sequence: u64) {
        self.heap.push(Entry {
            priority,
            sequence,
            task_id,
        });
    }

    /// The sequence number that would be assigned to the next `push`.
    pub fn peek_next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_highest_priority_first() {
        let mut q = PriorityQueue::new();
        q.push("low".into(), TaskPriority::Low);
        q.push("critical".into(), TaskPriority::Critical);
        q.push("medium".into(), TaskPriority::Medium);

        assert_eq!(q.pop(), Some("critical".to_string()));
        assert_eq!(q.pop(), Some("medium".to_string()));
        assert_eq!(q.pop(), Some("low".to_string()));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn fifo_within_tier() {
        let mut q = PriorityQueue::new();
        q.push("a".into(), TaskPriority::High);
        q.push("b".into(), TaskPriority::High);
        q.push("c".into(), TaskPriority::High);

        assert_eq!(q.pop(), Some("a".to_string()));
        assert_eq!(q.pop(), Some("b".to_string()));
        assert_eq!(q.pop(), Some("c".to_string()));
    }

    #[test]
    fn priority_preempts_older_lower_tier_tasks() {
        let mut q = PriorityQueue::new();
        for i in 0..5 {
            q.push(format!("low-{i}"), TaskPriority::Low);
        }
        q.push("urgent".into(), TaskPriority::Critical);

        assert_eq!(q.pop(), Some("urgent".to_string()));
        assert_eq!(q.pop(), Some("low-0".to_string()));
    }

    #[test]
    fn len_and_is_empty_track_contents() {
        let mut q = PriorityQueue::new();
        assert!(q.is_empty());
        q.push("a".into(), TaskPriority::Low);
        assert_eq!(q.len(), 1);
        assert!(!q.is_empty());
        q.pop();
        assert!(q.is_empty());
    }

    #[test]
    fn push_front_preserves_original_sequence_for_reinsertion() {
        let mut q = PriorityQueue::new();
        q.push("a".into(), TaskPriority::Medium);
        let seq = 0u64; // "a" got sequence 0
        q.push("b".into(), TaskPriority::Medium);

        let popped = q.pop().unwrap(); // "a"
        assert_eq!(popped, "a");
        q.push_front(popped, TaskPriority::Medium, seq);

        // "a" is reinserted with its original (earlier) sequence, so it
        // still comes out ahead of "b".
        assert_eq!(q.pop(), Some("a".to_string()));
        assert_eq!(q.pop(), Some("b".to_string()));
    }
}
