//! Notification payloads and sequence numbering.

use crate::address_space::{DataValue, Variant};
use crate::subscription::monitored_item::MonitoredItemId;

// ---------------------------------------------------------------------------
// SequenceNumberGenerator
// ---------------------------------------------------------------------------

/// Sequence number value reserved for "not yet assigned".
pub const SEQUENCE_UNASSIGNED: u32 = u32::MAX;

/// Monotonic per-subscription sequence number generator.
///
/// Numbers are 1-based. `u32::MAX` is reserved as [`SEQUENCE_UNASSIGNED`]
/// and `0` is never produced: after `0xFFFF_FFFE` the generator restarts at
/// `1`.
#[derive(Debug, Clone)]
pub struct SequenceNumberGenerator {
    next: u32,
}

impl SequenceNumberGenerator {
    /// Creates a generator whose first value is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Returns the value the next call to [`next`](Self::next) will produce.
    #[must_use]
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// Produces the next sequence number.
    pub fn next(&mut self) -> u32 {
        let n = self.next;
        self.next = if n >= SEQUENCE_UNASSIGNED - 1 { 1 } else { n + 1 };
        n
    }
}

impl Default for SequenceNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Value change of one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemNotification {
    /// The item the value belongs to.
    pub item: MonitoredItemId,
    /// The sampled value.
    pub value: DataValue,
}

/// Event fired by one monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct EventNotification {
    /// The item the event belongs to.
    pub item: MonitoredItemId,
    /// Selected event fields, in clause order.
    pub fields: Vec<Variant>,
}

/// The payload of one notification message.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationPayload {
    /// A batch of data changes.
    DataChange(Vec<MonitoredItemNotification>),
    /// A batch of events.
    Events(Vec<EventNotification>),
}

impl NotificationPayload {
    /// Returns the number of item-level entries in the payload.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            NotificationPayload::DataChange(v) => v.len(),
            NotificationPayload::Events(v) => v.len(),
        }
    }

    /// Returns `true` when the payload carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One notification message, queued on and published by exactly one
/// subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Sequence number, [`SEQUENCE_UNASSIGNED`] until published.
    pub sequence_number: u32,
    /// Millisecond timestamp at which the message was built.
    pub publish_time: i64,
    /// The batch payload.
    pub payload: NotificationPayload,
    /// Set when older notifications were discarded before this one was sent,
    /// so the client can detect loss.
    pub notifications_lost: bool,
}

impl Notification {
    /// Builds an unpublished data-change notification.
    #[must_use]
    pub fn data_change(changes: Vec<MonitoredItemNotification>, publish_time: i64) -> Self {
        Self {
            sequence_number: SEQUENCE_UNASSIGNED,
            publish_time,
            payload: NotificationPayload::DataChange(changes),
            notifications_lost: false,
        }
    }

    /// Builds an unpublished event notification.
    #[must_use]
    pub fn events(events: Vec<EventNotification>, publish_time: i64) -> Self {
        Self {
            sequence_number: SEQUENCE_UNASSIGNED,
            publish_time,
            payload: NotificationPayload::Events(events),
            notifications_lost: false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::Variant;

    // --- Sequence number tests ---

    #[test]
    fn test_sequence_starts_at_one() {
        let mut gen = SequenceNumberGenerator::new();
        assert_eq!(gen.peek(), 1);
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);
        assert_eq!(gen.peek(), 3);
    }

    #[test]
    fn test_sequence_never_emits_zero_or_unassigned() {
        let mut gen = SequenceNumberGenerator { next: u32::MAX - 1 };
        assert_eq!(gen.next(), u32::MAX - 1);
        // Restarts at 1: neither 0 nor the reserved value appears.
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);
    }

    // --- Payload tests ---

    #[test]
    fn test_notification_unassigned_until_published() {
        let n = Notification::data_change(Vec::new(), 1_000);
        assert_eq!(n.sequence_number, SEQUENCE_UNASSIGNED);
        assert!(!n.notifications_lost);
        assert!(n.payload.is_empty());
    }

    #[test]
    fn test_payload_len() {
        let events = Notification::events(
            vec![EventNotification {
                item: MonitoredItemId(1),
                fields: vec![Variant::Text("overheat".into())],
            }],
            0,
        );
        assert_eq!(events.payload.len(), 1);
        assert!(!events.payload.is_empty());
    }
}
