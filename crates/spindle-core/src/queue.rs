//! Sequenced queue — ordered buffer with O(1) push/shift.
//!
//! Backs the pending-publish-request FIFO and the per-subscription
//! notification backlogs. The queue itself is unbounded; bounding (and the
//! discard policy on overflow) is owned by the caller, because the right
//! policy differs per use: publish requests fail loudly on overflow while
//! notification backlogs silently drop the oldest entry.

use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// SequencedQueue
// ---------------------------------------------------------------------------

/// Insertion-ordered buffer with O(1) push/pop-front and predicate-based
/// bulk removal.
#[derive(Debug, Clone)]
pub struct SequencedQueue<T> {
    items: VecDeque<T>,
}

impl<T> SequencedQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Creates an empty queue with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a value at the back.
    pub fn push(&mut self, value: T) {
        self.items.push_back(value);
    }

    /// Removes and returns the oldest value, or `None` when empty.
    pub fn shift(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Returns a reference to the oldest value without removing it.
    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.items.front()
    }

    /// Removes every element matching the predicate, preserving the relative
    /// order of survivors. Returns the number of removed elements.
    pub fn filter_out(&mut self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|v| !predicate(v));
        before - self.items.len()
    }

    /// Removes and returns every element matching the predicate, preserving
    /// the relative order of both the removed elements and the survivors.
    pub fn take_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        while let Some(v) = self.items.pop_front() {
            if predicate(&v) {
                taken.push(v);
            } else {
                kept.push_back(v);
            }
        }
        self.items = kept;
        taken
    }

    /// Returns a restartable, insertion-ordered iterator over the current
    /// contents.
    pub fn values(&self) -> impl Iterator<Item = &T> + Clone {
        self.items.iter()
    }

    /// Returns the number of queued elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when no elements are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes all elements.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T> Default for SequencedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for SequencedQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // --- Push / shift tests ---

    #[test]
    fn test_queue_push_shift_fifo() {
        let mut q = SequencedQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);

        assert_eq!(q.len(), 3);
        assert_eq!(q.shift(), Some(1));
        assert_eq!(q.shift(), Some(2));
        assert_eq!(q.shift(), Some(3));
        assert_eq!(q.shift(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_first_does_not_remove() {
        let mut q = SequencedQueue::new();
        assert_eq!(q.first(), None);

        q.push("a");
        q.push("b");
        assert_eq!(q.first(), Some(&"a"));
        assert_eq!(q.len(), 2);
    }

    // --- filter_out tests ---

    #[test]
    fn test_queue_filter_out_counts_and_preserves_order() {
        let mut q: SequencedQueue<i32> = (0..10).collect();
        let removed = q.filter_out(|v| v % 2 == 0);

        assert_eq!(removed, 5);
        let rest: Vec<i32> = q.values().copied().collect();
        assert_eq!(rest, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_queue_filter_out_no_match() {
        let mut q: SequencedQueue<i32> = (0..4).collect();
        assert_eq!(q.filter_out(|v| *v > 100), 0);
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_queue_take_where_returns_removed() {
        let mut q: SequencedQueue<i32> = (0..6).collect();
        let taken = q.take_where(|v| v % 2 == 1);

        assert_eq!(taken, vec![1, 3, 5]);
        let rest: Vec<i32> = q.values().copied().collect();
        assert_eq!(rest, vec![0, 2, 4]);
    }

    // --- values tests ---

    #[test]
    fn test_queue_values_snapshot_restartable() {
        let q: SequencedQueue<i32> = (1..=3).collect();
        let iter = q.values();

        let once: Vec<i32> = iter.clone().copied().collect();
        let twice: Vec<i32> = iter.copied().collect();
        assert_eq!(once, vec![1, 2, 3]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_queue_clear() {
        let mut q: SequencedQueue<i32> = (0..5).collect();
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.shift(), None);
    }
}
