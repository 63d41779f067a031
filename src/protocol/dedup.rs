//! Duplicate suppression for acknowledged TCP packets.
//!
//! A peer that never saw our ACK may send the same packet again. The window
//! remembers the ids of the most recently processed packets so the connection
//! can re-acknowledge a repeat without handing it to handlers twice.

use std::collections::{HashSet, VecDeque};
use tracing::{debug, instrument};

/// Bounded FIFO of recently processed packet ids with O(1) membership.
#[derive(Debug)]
pub struct DedupWindow {
    seen: HashSet<u64>,
    /// Insertion order for FIFO eviction
    order: VecDeque<u64>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `packet_id` as processed.
    ///
    /// Returns true if the id is already in the window (a duplicate), in which
    /// case the window is left unchanged.
    #[instrument(level = "trace", skip(self))]
    pub fn check_and_insert(&mut self, packet_id: u64) -> bool {
        if self.seen.contains(&packet_id) {
            debug!(packet_id, "Duplicate packet id within window");
            return true;
        }

        if self.capacity == 0 {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(packet_id);
        self.order.push_back(packet_id);
        false
    }

    pub fn contains(&self, packet_id: u64) -> bool {
        self.seen.contains(&packet_id)
    }

    /// Forget `packet_id` so a retry of it is dispatched again.
    pub fn remove(&mut self, packet_id: u64) -> bool {
        if self.seen.remove(&packet_id) {
            self.order.retain(|id| *id != packet_id);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection() {
        let mut window = DedupWindow::new(25);
        assert!(!window.check_and_insert(7));
        assert!(window.check_and_insert(7));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = DedupWindow::new(25);
        for id in 1..=26 {
            assert!(!window.check_and_insert(id));
        }
        // 26 ids through a window of 25: the first one has aged out
        assert!(!window.contains(1));
        assert!(window.contains(2));
        assert!(!window.check_and_insert(1));
        assert!(window.check_and_insert(26));
        assert_eq!(window.len(), 25);
    }

    #[test]
    fn test_remove_allows_redispatch() {
        let mut window = DedupWindow::new(4);
        window.check_and_insert(10);
        window.check_and_insert(11);
        assert!(window.remove(10));
        assert!(!window.remove(10));
        assert!(!window.check_and_insert(10));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_zero_capacity_never_remembers() {
        let mut window = DedupWindow::new(0);
        assert!(!window.check_and_insert(1));
        assert!(!window.check_and_insert(1));
        assert!(window.is_empty());
    }
}
