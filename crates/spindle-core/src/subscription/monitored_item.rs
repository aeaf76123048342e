//! Monitored items — sampled data points owned by a subscription.
//!
//! A monitored item buffers sampled values between publishing cycles in a
//! bounded queue (discard-oldest). Disposal is synchronous with respect to
//! the scheduler, but a sample completion may already be in flight when an
//! item is deleted; the shared liveness flag turns such completions into
//! no-ops without consulting the sampler group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::address_space::{DataValue, NodeId};
use crate::queue::SequencedQueue;

// ---------------------------------------------------------------------------
// MonitoredItemId
// ---------------------------------------------------------------------------

/// Unique monitored item identifier, assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitoredItemId(pub u32);

impl std::fmt::Display for MonitoredItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MonitoredItem
// ---------------------------------------------------------------------------

/// A monitored data point.
#[derive(Debug)]
pub struct MonitoredItem {
    id: MonitoredItemId,
    node: NodeId,
    sampling_interval_ms: i64,
    queue: SequencedQueue<DataValue>,
    queue_size: usize,
    /// Cleared on disposal; checked by in-flight sample completions.
    live: Arc<AtomicBool>,
    last_value: Option<DataValue>,
    overflowed: bool,
}

impl MonitoredItem {
    /// Creates a live item. `queue_size` is clamped to at least 1.
    #[must_use]
    pub fn new(
        id: MonitoredItemId,
        node: NodeId,
        sampling_interval_ms: i64,
        queue_size: usize,
    ) -> Self {
        Self {
            id,
            node,
            sampling_interval_ms,
            queue: SequencedQueue::new(),
            queue_size: queue_size.max(1),
            live: Arc::new(AtomicBool::new(true)),
            last_value: None,
            overflowed: false,
        }
    }

    /// Returns the item id.
    #[must_use]
    pub fn id(&self) -> MonitoredItemId {
        self.id
    }

    /// Returns the sampled node.
    #[must_use]
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Returns the sampling interval in milliseconds.
    #[must_use]
    pub fn sampling_interval_ms(&self) -> i64 {
        self.sampling_interval_ms
    }

    /// Returns a handle to the liveness flag, shared with in-flight sample
    /// completions.
    #[must_use]
    pub fn liveness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.live)
    }

    /// Returns `true` until the item is retired.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Applies a revised sampling interval and queue size.
    pub fn modify(&mut self, sampling_interval_ms: i64, queue_size: usize) {
        self.sampling_interval_ms = sampling_interval_ms;
        self.queue_size = queue_size.max(1);
        while self.queue.len() > self.queue_size {
            self.queue.shift();
            self.overflowed = true;
        }
    }

    /// Enqueues a sampled value, discarding the oldest entry on overflow.
    ///
    /// A completion arriving after disposal is dropped here.
    pub fn enqueue(&mut self, value: DataValue) {
        if !self.is_live() {
            return;
        }
        self.last_value = Some(value.clone());
        if self.queue.len() >= self.queue_size {
            self.queue.shift();
            self.overflowed = true;
        }
        self.queue.push(value);
    }

    /// Re-queues the most recently sampled value, if any. Used when a
    /// transferred subscription must resend initial values.
    pub fn requeue_last(&mut self) {
        if let Some(v) = self.last_value.clone() {
            self.enqueue(v);
        }
    }

    /// Drains all queued values, oldest first, and reports whether any value
    /// was discarded since the previous drain.
    pub fn drain_queued(&mut self) -> (Vec<DataValue>, bool) {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(v) = self.queue.shift() {
            out.push(v);
        }
        let overflowed = std::mem::take(&mut self.overflowed);
        (out, overflowed)
    }

    /// Returns the number of queued values.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Marks the item dead and drops its queue. In-flight completions become
    /// no-ops from this point on.
    pub fn retire(&mut self) {
        self.live.store(false, Ordering::Release);
        self.queue.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::Variant;

    fn value(n: i64) -> DataValue {
        DataValue::good(Variant::Int64(n), n)
    }

    fn item() -> MonitoredItem {
        MonitoredItem::new(MonitoredItemId(1), NodeId::from("ns=1;s=Temp"), 100, 3)
    }

    // --- Queueing tests ---

    #[test]
    fn test_item_enqueue_and_drain_in_order() {
        let mut it = item();
        it.enqueue(value(1));
        it.enqueue(value(2));

        let (vals, overflowed) = it.drain_queued();
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0].source_timestamp, 1);
        assert_eq!(vals[1].source_timestamp, 2);
        assert!(!overflowed);
        assert_eq!(it.queued_len(), 0);
    }

    #[test]
    fn test_item_overflow_discards_oldest() {
        let mut it = item();
        for n in 1..=5 {
            it.enqueue(value(n));
        }

        let (vals, overflowed) = it.drain_queued();
        assert_eq!(vals.len(), 3);
        assert_eq!(vals[0].source_timestamp, 3);
        assert!(overflowed);

        // Flag is consumed by the drain.
        it.enqueue(value(6));
        let (_, overflowed) = it.drain_queued();
        assert!(!overflowed);
    }

    #[test]
    fn test_item_requeue_last() {
        let mut it = item();
        it.enqueue(value(7));
        it.drain_queued();

        it.requeue_last();
        let (vals, _) = it.drain_queued();
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0].source_timestamp, 7);
    }

    // --- Liveness tests ---

    #[test]
    fn test_item_retire_drops_late_completions() {
        let mut it = item();
        let live = it.liveness();
        assert!(live.load(Ordering::Acquire));

        it.retire();
        assert!(!it.is_live());
        assert!(!live.load(Ordering::Acquire));

        // A completion that was already scheduled is a no-op.
        it.enqueue(value(1));
        assert_eq!(it.queued_len(), 0);
    }

    #[test]
    fn test_item_modify_shrinks_queue() {
        let mut it = item();
        it.enqueue(value(1));
        it.enqueue(value(2));
        it.enqueue(value(3));

        it.modify(200, 1);
        assert_eq!(it.sampling_interval_ms(), 200);
        let (vals, overflowed) = it.drain_queued();
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0].source_timestamp, 3);
        assert!(overflowed);
    }
}
