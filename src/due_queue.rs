// Due queue - schedule keys ordered by their next trigger time
//
// Binary min-heap plus a key index. Removal only drops the index entry; the
// heap slot goes stale and is skipped when it surfaces. Stale slots are
// compacted away once they outnumber the live ones.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tokio::time::Instant;

use crate::schedule::ScheduleKey;

/// Stale slots tolerated before the heap is rebuilt
const COMPACTION_SLACK: usize = 64;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    due: Instant,
    /// Insertion order, breaks ties between equally due keys
    seq: u64,
    key: ScheduleKey,
}

/// Priority queue of schedule keys awaiting dispatch
#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<Reverse<Slot>>,

    /// Live slot per key: (seq, due)
    index: HashMap<ScheduleKey, (u64, Instant)>,

    next_seq: u64,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `key` to become due at `due`
    ///
    /// # Returns
    /// * `true` - The key was queued
    /// * `false` - The key was already queued; nothing changed
    pub fn insert(&mut self, key: ScheduleKey, due: Instant) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(key.clone(), (seq, due));
        self.heap.push(Reverse(Slot { due, seq, key }));
        true
    }

    /// Removes `key` if queued. Calling it for an absent key is a no-op.
    pub fn remove(&mut self, key: &ScheduleKey) -> bool {
        let removed = self.index.remove(key).is_some();
        if removed {
            self.maybe_compact();
        }
        removed
    }

    /// Removes and returns every key due at or before `now`, earliest first.
    /// Keys with the same due time come out in insertion order.
    pub fn pop_due_before(&mut self, now: Instant) -> Vec<(ScheduleKey, Instant)> {
        let mut due = Vec::new();

        while let Some(Reverse(head)) = self.heap.peek() {
            if head.due > now {
                break;
            }
            let Some(Reverse(slot)) = self.heap.pop() else {
                break;
            };
            if self.is_live(&slot) {
                self.index.remove(&slot.key);
                due.push((slot.key, slot.due));
            }
        }

        due
    }

    /// Earliest due time among queued keys
    pub fn next_due(&mut self) -> Option<Instant> {
        self.prune_stale_head();
        self.heap.peek().map(|Reverse(slot)| slot.due)
    }

    pub fn contains(&self, key: &ScheduleKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn is_live(&self, slot: &Slot) -> bool {
        self.index
            .get(&slot.key)
            .is_some_and(|(seq, _)| *seq == slot.seq)
    }

    fn prune_stale_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_live(head) {
                break;
            }
            self.heap.pop();
        }
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() <= self.index.len() * 2 + COMPACTION_SLACK {
            return;
        }

        let index = &self.index;
        let heap = std::mem::take(&mut self.heap);
        self.heap = heap
            .into_iter()
            .filter(|Reverse(slot)| index.get(&slot.key).is_some_and(|(seq, _)| *seq == slot.seq))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(metric: &str) -> ScheduleKey {
        ScheduleKey::new("host", metric)
    }

    fn names(popped: &[(ScheduleKey, Instant)]) -> Vec<&str> {
        popped.iter().map(|(k, _)| k.metric_name.as_str()).collect()
    }

    #[test]
    fn test_pops_in_due_order() {
        let t0 = Instant::now();
        let mut queue = DueQueue::new();

        queue.insert(key("c"), t0 + Duration::from_secs(30));
        queue.insert(key("a"), t0 + Duration::from_secs(10));
        queue.insert(key("b"), t0 + Duration::from_secs(20));

        assert_eq!(queue.next_due(), Some(t0 + Duration::from_secs(10)));
        assert!(queue.pop_due_before(t0).is_empty());

        let due = queue.pop_due_before(t0 + Duration::from_secs(25));
        assert_eq!(names(&due), vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_due(), Some(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn test_ties_are_fifo() {
        let t0 = Instant::now();
        let mut queue = DueQueue::new();

        for name in ["m3", "m1", "m2"] {
            queue.insert(key(name), t0);
        }

        let due = queue.pop_due_before(t0);
        assert_eq!(names(&due), vec!["m3", "m1", "m2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let t0 = Instant::now();
        let mut queue = DueQueue::new();

        assert!(queue.insert(key("a"), t0 + Duration::from_secs(5)));
        assert!(!queue.insert(key("a"), t0));

        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&key("a")));
        assert_eq!(queue.next_due(), Some(t0 + Duration::from_secs(5)));
        assert!(queue.pop_due_before(t0).is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let t0 = Instant::now();
        let mut queue = DueQueue::new();

        queue.insert(key("a"), t0);
        queue.insert(key("b"), t0);

        assert!(queue.remove(&key("a")));
        assert!(!queue.remove(&key("a")));
        assert!(!queue.remove(&key("missing")));

        assert_eq!(names(&queue.pop_due_before(t0)), vec!["b"]);
    }

    #[test]
    fn test_reinsert_after_remove_uses_new_due_time() {
        let t0 = Instant::now();
        let mut queue = DueQueue::new();

        queue.insert(key("a"), t0);
        queue.remove(&key("a"));
        queue.insert(key("a"), t0 + Duration::from_secs(60));

        // the stale slot at t0 must not surface
        assert!(queue.pop_due_before(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(queue.next_due(), Some(t0 + Duration::from_secs(60)));
        assert_eq!(queue.pop_due_before(t0 + Duration::from_secs(60)).len(), 1);
    }

    #[test]
    fn test_churn_compacts_stale_slots() {
        let t0 = Instant::now();
        let mut queue = DueQueue::new();

        for round in 0..50u64 {
            for i in 0..20 {
                let k = key(&format!("m{i}"));
                queue.remove(&k);
                queue.insert(k, t0 + Duration::from_secs(round + i));
            }
        }

        assert_eq!(queue.len(), 20);
        assert!(queue.heap.len() <= queue.len() * 2 + COMPACTION_SLACK + 1);
        assert_eq!(queue.pop_due_before(t0 + Duration::from_secs(1_000)).len(), 20);
    }
}
