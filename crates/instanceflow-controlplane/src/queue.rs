//! Per-key work queue
//!
//! Keys are deduplicated while waiting. A key that is triggered while its
//! pass is running is marked dirty and handed out again once that pass is
//! done, so two passes for the same record never overlap.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

#[derive(Debug)]
pub struct WorkQueue<K> {
    waiting: VecDeque<K>,
    queued: HashSet<K>,
    in_flight: HashSet<K>,
    dirty: HashSet<K>,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
        }
    }

    pub fn add(&mut self, key: K) {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
        } else if self.queued.insert(key.clone()) {
            self.waiting.push_back(key);
        }
    }

    /// Take the next key and mark it in flight
    pub fn next(&mut self) -> Option<K> {
        let key = self.waiting.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Finish a pass; a key triggered meanwhile goes back in line
    pub fn done(&mut self, key: &K) {
        self.in_flight.remove(key);
        if self.dirty.remove(key) {
            self.add(key.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_keys_are_deduplicated() {
        let mut queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.add("a");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next(), Some("a"));
        assert_eq!(queue.next(), Some("b"));
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn test_in_flight_key_is_deferred() {
        let mut queue = WorkQueue::new();
        queue.add("a");
        assert_eq!(queue.next(), Some("a"));

        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 1);

        queue.done(&"a");
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.next(), Some("a"));
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn test_done_without_trigger_does_not_requeue() {
        let mut queue = WorkQueue::new();
        queue.add("a");
        queue.next();
        queue.done(&"a");

        assert!(queue.is_empty());
    }
}
