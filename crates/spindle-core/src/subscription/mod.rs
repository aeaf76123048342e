//! Subscription state machine.
//!
//! A subscription runs one tick per publishing interval and decides whether
//! to emit data, fall late, keep-alive, or expire:
//!
//! ```text
//!              ┌────────── data published ──────────┐
//!              ▼                                    │
//! CREATING → NORMAL ⇄ LATE (data queued, no request)│
//!              │ ⇅ KEEPALIVE (queue empty for k ticks)
//!              └── lifetime exhausted ──► CLOSED (terminal)
//! ```
//!
//! Counter rules: the lifetime counter resets on every successful publish
//! (data or keep-alive) and increments on every other tick, so a client that
//! stops polling cannot pin resources even while notifications pile up. The
//! keep-alive counter resets only when something is actually sent.
//!
//! Lifecycle signals (`StateChanged`, `Expired`) are delivered synchronously
//! within the tick to registered [`SubscriptionObserver`]s; observers are
//! deregistered before the subscription is disposed.

pub mod monitored_item;
pub mod notification;

pub use monitored_item::{MonitoredItem, MonitoredItemId};
pub use notification::{
    EventNotification, MonitoredItemNotification, Notification, NotificationPayload,
    SequenceNumberGenerator, SEQUENCE_UNASSIGNED,
};

use fxhash::FxHashMap;

use crate::queue::SequencedQueue;
use crate::session::SessionId;
use crate::transfer::SessionIdentity;

// ---------------------------------------------------------------------------
// SubscriptionId
// ---------------------------------------------------------------------------

/// Unique subscription identifier, assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u32);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SubscriptionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created, no tick has run yet.
    Creating,
    /// Publishing normally.
    Normal,
    /// Notifications are queued but no publish request was available.
    Late,
    /// The last emission was an empty keep-alive.
    KeepAlive,
    /// Expired or deleted. Terminal.
    Closed,
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Lifecycle signal emitted by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The state machine moved between states.
    StateChanged {
        /// Previous state.
        from: SubscriptionState,
        /// New state.
        to: SubscriptionState,
    },
    /// The lifetime counter reached its limit; the subscription is closed.
    Expired,
}

/// Observer of subscription lifecycle signals.
///
/// Invoked synchronously within the owning tick. Any number of observers may
/// register; deregistration is guaranteed before the subscription is
/// disposed.
pub trait SubscriptionObserver {
    /// Called for each lifecycle event.
    fn on_event(&self, subscription: SubscriptionId, event: &SubscriptionEvent);
}

/// Handle for deregistering an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

// ---------------------------------------------------------------------------
// SubscriptionParams
// ---------------------------------------------------------------------------

/// Client-negotiated subscription parameters.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionParams {
    /// Period of the publishing tick, in milliseconds.
    pub publishing_interval_ms: i64,
    /// Publishing cycles tolerated without a successful publish.
    pub lifetime_count: u32,
    /// Empty cycles before a keep-alive is emitted.
    pub max_keep_alive_count: u32,
    /// Maximum item entries per published notification; `0` is unlimited.
    pub max_notifications_per_publish: usize,
    /// Client-requested priority, stored for diagnostics.
    pub priority: u8,
}

// ---------------------------------------------------------------------------
// Tick outcome
// ---------------------------------------------------------------------------

/// What a tick (or an out-of-tick servicing pass) decided to emit.
#[derive(Debug)]
pub enum TickAction {
    /// Emit a data notification; the engine must consume one publish request.
    Publish(Notification),
    /// Emit an empty keep-alive carrying the next expected sequence number;
    /// the engine must consume one publish request.
    KeepAlive {
        /// Sequence number the next data notification will carry.
        next_sequence: u32,
    },
    /// Data is queued but no request was available.
    Late,
    /// Nothing to emit this cycle.
    Idle,
}

/// Result of one publishing tick.
#[derive(Debug)]
pub struct TickOutcome {
    /// The emission decision.
    pub action: TickAction,
    /// Set when the lifetime counter reached its limit during this tick.
    pub expired: bool,
}

/// Service-order class used by the publish engine when several subscriptions
/// are ready in the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Readiness {
    /// Backlogged: has queued notifications it could not send.
    Late,
    /// An empty keep-alive is due or was held pending.
    KeepAliveDue,
    /// Neither backlogged nor keep-alive due.
    Normal,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Per-subscription state: counters, notification queues, monitored items,
/// sequence numbering, and observers.
pub struct Subscription {
    id: SubscriptionId,
    params: SubscriptionParams,
    state: SubscriptionState,
    current_keep_alive_count: u32,
    current_lifetime_count: u32,
    /// Keep-alive reached its threshold but no request was available.
    keep_alive_pending: bool,
    publishing_enabled: bool,
    next_tick_at: i64,

    pending: SequencedQueue<Notification>,
    max_queued_notifications: usize,
    notifications_lost: bool,

    seq: SequenceNumberGenerator,
    retransmission: SequencedQueue<Notification>,
    max_retransmission: usize,

    items: FxHashMap<MonitoredItemId, MonitoredItem>,

    session: Option<SessionId>,
    /// Identity of the most recent owning session; `None` if never owned.
    owner_identity: Option<SessionIdentity>,

    observers: Vec<(ObserverId, Box<dyn SubscriptionObserver>)>,
    next_observer_id: u64,
}

// The observer list holds trait objects, so the derive is written by hand.
impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("current_lifetime_count", &self.current_lifetime_count)
            .field("current_keep_alive_count", &self.current_keep_alive_count)
            .field("pending", &self.pending.len())
            .field("items", &self.items.len())
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Creates a subscription in the `Creating` state with its first tick
    /// one publishing interval from `now`.
    #[must_use]
    pub fn new(
        id: SubscriptionId,
        params: SubscriptionParams,
        max_queued_notifications: usize,
        max_retransmission: usize,
        now: i64,
    ) -> Self {
        let params = Self::clamp_interval(params);
        Self {
            id,
            params,
            state: SubscriptionState::Creating,
            current_keep_alive_count: 0,
            current_lifetime_count: 0,
            keep_alive_pending: false,
            publishing_enabled: true,
            next_tick_at: now + params.publishing_interval_ms,
            pending: SequencedQueue::new(),
            max_queued_notifications: max_queued_notifications.max(1),
            notifications_lost: false,
            seq: SequenceNumberGenerator::new(),
            retransmission: SequencedQueue::new(),
            max_retransmission: max_retransmission.max(1),
            items: FxHashMap::default(),
            session: None,
            owner_identity: None,
            observers: Vec::new(),
            next_observer_id: 1,
        }
    }

    // --- accessors -------------------------------------------------------

    /// Returns the subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Returns the negotiated parameters.
    #[must_use]
    pub fn params(&self) -> &SubscriptionParams {
        &self.params
    }

    /// Returns the owning session, absent while orphaned.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Identity of the most recent owning session; `None` when the
    /// subscription has never been owned.
    #[must_use]
    pub fn owner_identity(&self) -> Option<&SessionIdentity> {
        self.owner_identity.as_ref()
    }

    /// Current lifetime counter, in publishing cycles.
    #[must_use]
    pub fn current_lifetime_count(&self) -> u32 {
        self.current_lifetime_count
    }

    /// Current keep-alive counter, in publishing cycles.
    #[must_use]
    pub fn current_keep_alive_count(&self) -> u32 {
        self.current_keep_alive_count
    }

    /// Returns `true` when publishing is enabled.
    #[must_use]
    pub fn publishing_enabled(&self) -> bool {
        self.publishing_enabled
    }

    // --- ownership -------------------------------------------------------

    /// Attaches the subscription to a session, snapshotting its identity for
    /// later transfer-compatibility checks.
    pub fn attach(&mut self, session: SessionId, identity: SessionIdentity) {
        self.session = Some(session);
        self.owner_identity = Some(identity);
    }

    /// Clears the owning session. Sequence numbers, pending notifications,
    /// and the retransmission cache are untouched so a later transfer keeps
    /// continuity.
    pub fn detach(&mut self) {
        self.session = None;
    }

    // --- observers -------------------------------------------------------

    /// Registers a lifecycle observer.
    pub fn register_observer(&mut self, observer: Box<dyn SubscriptionObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push((id, observer));
        id
    }

    /// Deregisters an observer. Returns `true` when it was registered.
    pub fn deregister_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() < before
    }

    fn emit(&self, event: SubscriptionEvent) {
        for (_, observer) in &self.observers {
            observer.on_event(self.id, &event);
        }
    }

    fn set_state(&mut self, to: SubscriptionState) {
        if self.state != to {
            let from = self.state;
            self.state = to;
            self.emit(SubscriptionEvent::StateChanged { from, to });
        }
    }

    // --- monitored items -------------------------------------------------

    /// Adds a monitored item to this subscription.
    pub fn add_item(&mut self, item: MonitoredItem) {
        self.items.insert(item.id(), item);
    }

    /// Retires and removes one monitored item.
    pub fn remove_item(&mut self, id: MonitoredItemId) -> Option<MonitoredItem> {
        let mut item = self.items.remove(&id)?;
        item.retire();
        Some(item)
    }

    /// Returns a mutable handle to one owned item.
    pub fn item_mut(&mut self, id: MonitoredItemId) -> Option<&mut MonitoredItem> {
        self.items.get_mut(&id)
    }

    /// Returns the ids of all owned items.
    #[must_use]
    pub fn item_ids(&self) -> Vec<MonitoredItemId> {
        self.items.keys().copied().collect()
    }

    /// Retires every owned item and returns their ids for scheduler
    /// deregistration. Observers are dropped afterwards, per the contract
    /// that deregistration happens before disposal.
    pub fn release_items(&mut self) -> Vec<MonitoredItemId> {
        let ids: Vec<MonitoredItemId> = self.items.keys().copied().collect();
        for item in self.items.values_mut() {
            item.retire();
        }
        self.items.clear();
        ids
    }

    // --- notification queue ----------------------------------------------

    /// Moves values queued on monitored items into pending notifications,
    /// batched per `max_notifications_per_publish`.
    pub fn coalesce_queued(&mut self, now: i64) {
        let mut changes: Vec<MonitoredItemNotification> = Vec::new();
        let mut lost = false;
        let mut ids: Vec<MonitoredItemId> = self.items.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(item) = self.items.get_mut(&id) else {
                continue;
            };
            let (values, overflowed) = item.drain_queued();
            lost |= overflowed;
            changes.extend(
                values
                    .into_iter()
                    .map(|value| MonitoredItemNotification { item: id, value }),
            );
        }
        if lost {
            self.notifications_lost = true;
        }
        if changes.is_empty() {
            return;
        }

        let cap = self.params.max_notifications_per_publish;
        if cap == 0 {
            self.enqueue_notification(Notification::data_change(changes, now));
        } else {
            let mut rest = changes;
            while !rest.is_empty() {
                let tail = rest.split_off(rest.len().min(cap));
                self.enqueue_notification(Notification::data_change(rest, now));
                rest = tail;
            }
        }
    }

    /// Queues a notification, discarding the oldest entry when the bound is
    /// reached and flagging the loss on the next emitted notification.
    pub fn enqueue_notification(&mut self, notification: Notification) {
        if self.pending.len() >= self.max_queued_notifications {
            self.pending.shift();
            self.notifications_lost = true;
            tracing::debug!("{}: notification queue overflow, oldest dropped", self.id);
        }
        self.pending.push(notification);
    }

    /// Queues an event notification directly.
    pub fn post_events(&mut self, events: Vec<EventNotification>, now: i64) {
        self.enqueue_notification(Notification::events(events, now));
    }

    /// Returns `true` when notifications are waiting to be published.
    #[must_use]
    pub fn has_pending_notifications(&self) -> bool {
        !self.pending.is_empty()
    }

    // --- scheduling ------------------------------------------------------

    /// Returns `true` when the publishing tick is due.
    #[must_use]
    pub fn is_due(&self, now: i64) -> bool {
        self.state != SubscriptionState::Closed && now >= self.next_tick_at
    }

    fn schedule_next(&mut self, now: i64) {
        while self.next_tick_at <= now {
            self.next_tick_at += self.params.publishing_interval_ms;
        }
    }

    /// Service-order class for the publish engine's tie-break rule.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        if self.state == SubscriptionState::Late && self.has_pending_notifications() {
            Readiness::Late
        } else if !self.has_pending_notifications()
            && (self.keep_alive_pending
                || self.current_keep_alive_count + 1 >= self.params.max_keep_alive_count)
        {
            Readiness::KeepAliveDue
        } else {
            Readiness::Normal
        }
    }

    // --- the tick --------------------------------------------------------

    /// Runs one publishing cycle.
    ///
    /// `request_available` reports whether the engine holds an unconsumed
    /// publish request for the owning session. When the returned action is
    /// [`TickAction::Publish`] or [`TickAction::KeepAlive`], the engine must
    /// dequeue exactly one request for the response.
    pub fn tick(&mut self, now: i64, request_available: bool) -> TickOutcome {
        if self.state == SubscriptionState::Closed {
            return TickOutcome {
                action: TickAction::Idle,
                expired: false,
            };
        }
        self.schedule_next(now);

        let has_data = self.publishing_enabled && self.has_pending_notifications();
        let action = if has_data && request_available {
            let n = self.take_next_publishable();
            self.current_keep_alive_count = 0;
            self.current_lifetime_count = 0;
            self.keep_alive_pending = false;
            self.set_state(SubscriptionState::Normal);
            TickAction::Publish(n)
        } else if has_data {
            self.current_lifetime_count += 1;
            self.set_state(SubscriptionState::Late);
            TickAction::Late
        } else {
            self.current_keep_alive_count += 1;
            if self.current_keep_alive_count >= self.params.max_keep_alive_count {
                if request_available {
                    self.current_keep_alive_count = 0;
                    self.current_lifetime_count = 0;
                    self.keep_alive_pending = false;
                    self.set_state(SubscriptionState::KeepAlive);
                    TickAction::KeepAlive {
                        next_sequence: self.seq.peek(),
                    }
                } else {
                    self.keep_alive_pending = true;
                    self.current_lifetime_count += 1;
                    TickAction::Idle
                }
            } else {
                self.current_lifetime_count += 1;
                TickAction::Idle
            }
        };

        let expired = self.current_lifetime_count >= self.params.lifetime_count;
        if expired {
            self.set_state(SubscriptionState::Closed);
            self.emit(SubscriptionEvent::Expired);
        }
        TickOutcome { action, expired }
    }

    /// Out-of-tick servicing when a publish request arrives between cycles:
    /// a late subscription may publish immediately and a held keep-alive may
    /// fire, without waiting for the next tick and without touching the
    /// lifetime bookkeeping of a full cycle beyond the publish reset.
    pub fn try_service_pending(&mut self) -> Option<TickAction> {
        if self.state == SubscriptionState::Closed {
            return None;
        }
        if self.publishing_enabled
            && self.state == SubscriptionState::Late
            && self.has_pending_notifications()
        {
            let n = self.take_next_publishable();
            self.current_keep_alive_count = 0;
            self.current_lifetime_count = 0;
            self.keep_alive_pending = false;
            self.set_state(SubscriptionState::Normal);
            return Some(TickAction::Publish(n));
        }
        if self.keep_alive_pending && !self.has_pending_notifications() {
            self.current_keep_alive_count = 0;
            self.current_lifetime_count = 0;
            self.keep_alive_pending = false;
            self.set_state(SubscriptionState::KeepAlive);
            return Some(TickAction::KeepAlive {
                next_sequence: self.seq.peek(),
            });
        }
        None
    }

    fn take_next_publishable(&mut self) -> Notification {
        // Caller guarantees the queue is non-empty.
        let mut n = self
            .pending
            .shift()
            .unwrap_or_else(|| Notification::data_change(Vec::new(), 0));
        n.sequence_number = self.seq.next();
        n.notifications_lost = std::mem::take(&mut self.notifications_lost);

        if self.retransmission.len() >= self.max_retransmission {
            self.retransmission.shift();
        }
        self.retransmission.push(n.clone());
        n
    }

    // --- retransmission --------------------------------------------------

    /// Returns the cached notification with the given sequence number.
    #[must_use]
    pub fn republish(&self, sequence_number: u32) -> Option<Notification> {
        self.retransmission
            .values()
            .find(|n| n.sequence_number == sequence_number)
            .cloned()
    }

    /// Sequence numbers still held in the retransmission cache, oldest first.
    #[must_use]
    pub fn available_sequence_numbers(&self) -> Vec<u32> {
        self.retransmission
            .values()
            .map(|n| n.sequence_number)
            .collect()
    }

    // --- modification ----------------------------------------------------

    /// Applies revised parameters to a live subscription.
    pub fn modify(&mut self, params: SubscriptionParams, now: i64) {
        let params = Self::clamp_interval(params);
        self.params = params;
        self.next_tick_at = now + params.publishing_interval_ms;
    }

    /// The tick schedule advances in whole intervals, so the interval must
    /// be at least one millisecond.
    fn clamp_interval(params: SubscriptionParams) -> SubscriptionParams {
        SubscriptionParams {
            publishing_interval_ms: params.publishing_interval_ms.max(1),
            ..params
        }
    }

    /// Enables or disables notification emission. A disabled subscription
    /// still keep-alives and still expires.
    pub fn set_publishing_mode(&mut self, enabled: bool) {
        self.publishing_enabled = enabled;
    }

    /// Closes the subscription without the expiry signal (client delete).
    pub fn close(&mut self) {
        self.set_state(SubscriptionState::Closed);
        self.observers.clear();
    }

    /// Drops all observers. Must be the last call before disposal.
    pub fn clear_observers(&mut self) {
        self.observers.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::address_space::{DataValue, NodeId, Variant};

    fn params(lifetime: u32, keep_alive: u32) -> SubscriptionParams {
        SubscriptionParams {
            publishing_interval_ms: 100,
            lifetime_count: lifetime,
            max_keep_alive_count: keep_alive,
            max_notifications_per_publish: 0,
            priority: 0,
        }
    }

    fn sub(lifetime: u32, keep_alive: u32) -> Subscription {
        Subscription::new(SubscriptionId(1), params(lifetime, keep_alive), 16, 16, 0)
    }

    fn queue_value(s: &mut Subscription, n: i64) {
        s.enqueue_notification(Notification::data_change(
            vec![MonitoredItemNotification {
                item: MonitoredItemId(1),
                value: DataValue::good(Variant::Int64(n), n),
            }],
            n,
        ));
    }

    // --- Tick case 1: data + request ---

    #[test]
    fn test_subscription_publish_resets_counters() {
        let mut s = sub(10, 3);
        queue_value(&mut s, 1);
        // Build up some counter state first.
        s.tick(100, false);
        assert_eq!(s.current_lifetime_count(), 1);
        assert_eq!(s.state(), SubscriptionState::Late);

        queue_value(&mut s, 2);
        let out = s.tick(200, true);
        assert!(matches!(out.action, TickAction::Publish(_)));
        assert!(!out.expired);
        assert_eq!(s.current_lifetime_count(), 0);
        assert_eq!(s.current_keep_alive_count(), 0);
        assert_eq!(s.state(), SubscriptionState::Normal);
    }

    #[test]
    fn test_subscription_sequence_numbers_increase() {
        let mut s = sub(100, 10);
        let mut seqs = Vec::new();
        for t in 1..=4 {
            queue_value(&mut s, t);
            let out = s.tick(t * 100, true);
            if let TickAction::Publish(n) = out.action {
                seqs.push(n.sequence_number);
            }
        }
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    // --- Tick case 2: data, no request ---

    #[test]
    fn test_subscription_goes_late_without_request() {
        let mut s = sub(10, 3);
        queue_value(&mut s, 1);
        let out = s.tick(100, false);
        assert!(matches!(out.action, TickAction::Late));
        assert_eq!(s.state(), SubscriptionState::Late);
        assert_eq!(s.current_lifetime_count(), 1);
    }

    // --- Tick case 3: keep-alive ---

    #[test]
    fn test_subscription_keep_alive_after_k_empty_ticks() {
        let mut s = sub(100, 3);
        // Two empty ticks: no keep-alive yet.
        for t in 1..=2 {
            let out = s.tick(t * 100, true);
            assert!(matches!(out.action, TickAction::Idle));
        }
        // Third empty tick fires exactly one keep-alive.
        let out = s.tick(300, true);
        assert!(matches!(out.action, TickAction::KeepAlive { next_sequence: 1 }));
        assert_eq!(s.state(), SubscriptionState::KeepAlive);
        assert_eq!(s.current_keep_alive_count(), 0);
        assert_eq!(s.current_lifetime_count(), 0);

        // Counter restarted: next keep-alive three ticks later, not sooner.
        let out = s.tick(400, true);
        assert!(matches!(out.action, TickAction::Idle));
        let out = s.tick(500, true);
        assert!(matches!(out.action, TickAction::Idle));
        let out = s.tick(600, true);
        assert!(matches!(out.action, TickAction::KeepAlive { .. }));
    }

    #[test]
    fn test_subscription_keep_alive_does_not_reset_on_data() {
        // Keep-alive counter resets only when a data notification is sent.
        let mut s = sub(100, 5);
        s.tick(100, true); // empty, ka = 1
        assert_eq!(s.current_keep_alive_count(), 1);

        queue_value(&mut s, 1);
        s.tick(200, true); // data publish resets both counters
        assert_eq!(s.current_keep_alive_count(), 0);
    }

    #[test]
    fn test_subscription_keep_alive_held_pending() {
        let mut s = sub(100, 2);
        s.tick(100, false);
        let out = s.tick(200, false); // threshold reached, no request
        assert!(matches!(out.action, TickAction::Idle));
        assert_eq!(s.readiness(), Readiness::KeepAliveDue);

        // Request arrives between ticks: the held keep-alive fires.
        let action = s.try_service_pending().unwrap();
        assert!(matches!(action, TickAction::KeepAlive { .. }));
        assert_eq!(s.current_lifetime_count(), 0);
    }

    // --- Expiry ---

    #[test]
    fn test_subscription_lifetime_expiry_worked_example() {
        // lifeTimeCount = 5, maxKeepAliveCount = 3, no client requests.
        let mut s = sub(5, 3);
        for t in 1..=4 {
            let out = s.tick(t * 100, false);
            assert!(!out.expired, "must not expire at tick {t}");
        }
        let out = s.tick(500, false);
        assert!(out.expired);
        assert_eq!(s.state(), SubscriptionState::Closed);
    }

    #[test]
    fn test_subscription_expires_while_late() {
        // Expiry fires even while notifications pile up unserved.
        let mut s = sub(3, 10);
        for t in 1..=2 {
            queue_value(&mut s, t);
            let out = s.tick(t * 100, false);
            assert!(!out.expired);
            assert_eq!(s.state(), SubscriptionState::Late);
        }
        queue_value(&mut s, 3);
        let out = s.tick(300, false);
        assert!(out.expired);
        assert_eq!(s.state(), SubscriptionState::Closed);
    }

    #[test]
    fn test_subscription_lifetime_strictly_increases_until_reset() {
        let mut s = sub(50, 100);
        let mut last = 0;
        for t in 1..=10 {
            s.tick(t * 100, false);
            assert!(s.current_lifetime_count() > last);
            last = s.current_lifetime_count();
        }
        queue_value(&mut s, 1);
        s.tick(1_100, true);
        assert_eq!(s.current_lifetime_count(), 0);
    }

    #[test]
    fn test_subscription_closed_tick_is_noop() {
        let mut s = sub(1, 10);
        let out = s.tick(100, false);
        assert!(out.expired);

        let out = s.tick(200, true);
        assert!(matches!(out.action, TickAction::Idle));
        assert!(!out.expired);
    }

    // --- Overflow flag ---

    #[test]
    fn test_subscription_overflow_sets_lost_flag_once() {
        let mut s = Subscription::new(SubscriptionId(1), params(100, 10), 2, 16, 0);
        for t in 1..=4 {
            queue_value(&mut s, t);
        }
        // Bound is 2: two oldest were discarded.
        let out = s.tick(100, true);
        let TickAction::Publish(n) = out.action else {
            panic!("expected publish");
        };
        assert!(n.notifications_lost);

        let out = s.tick(200, true);
        let TickAction::Publish(n) = out.action else {
            panic!("expected publish");
        };
        assert!(!n.notifications_lost);
    }

    // --- Late servicing between ticks ---

    #[test]
    fn test_subscription_late_serviced_on_request_arrival() {
        let mut s = sub(10, 3);
        queue_value(&mut s, 1);
        s.tick(100, false);
        assert_eq!(s.state(), SubscriptionState::Late);

        let action = s.try_service_pending().unwrap();
        assert!(matches!(action, TickAction::Publish(_)));
        assert_eq!(s.state(), SubscriptionState::Normal);
        assert!(s.try_service_pending().is_none());
    }

    // --- Republish cache ---

    #[test]
    fn test_subscription_republish_hit_and_miss() {
        let mut s = sub(100, 10);
        queue_value(&mut s, 1);
        s.tick(100, true);
        queue_value(&mut s, 2);
        s.tick(200, true);

        assert_eq!(s.available_sequence_numbers(), vec![1, 2]);
        assert!(s.republish(1).is_some());
        assert!(s.republish(2).is_some());
        assert!(s.republish(3).is_none());
    }

    #[test]
    fn test_subscription_retransmission_bounded() {
        let mut s = Subscription::new(SubscriptionId(1), params(100, 10), 16, 2, 0);
        for t in 1..=4 {
            queue_value(&mut s, t);
            s.tick(t * 100, true);
        }
        // Only the two newest survive.
        assert_eq!(s.available_sequence_numbers(), vec![3, 4]);
        assert!(s.republish(1).is_none());
        assert!(s.republish(4).is_some());
    }

    // --- Publishing mode ---

    #[test]
    fn test_subscription_disabled_still_keep_alives_and_expires() {
        let mut s = sub(4, 2);
        s.set_publishing_mode(false);
        queue_value(&mut s, 1);

        // Queued data is ignored while disabled: keep-alive path runs.
        let out = s.tick(100, true);
        assert!(matches!(out.action, TickAction::Idle));
        let out = s.tick(200, true);
        assert!(matches!(out.action, TickAction::KeepAlive { .. }));

        // And with no requests the lifetime still runs out.
        for t in 3..=6 {
            let out = s.tick(t * 100, false);
            if t == 6 {
                assert!(out.expired);
            }
        }
    }

    // --- Observers ---

    struct Recorder(Rc<RefCell<Vec<SubscriptionEvent>>>);

    impl SubscriptionObserver for Recorder {
        fn on_event(&self, _subscription: SubscriptionId, event: &SubscriptionEvent) {
            self.0.borrow_mut().push(*event);
        }
    }

    #[test]
    fn test_subscription_observers_see_expiry() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut s = sub(1, 10);
        s.register_observer(Box::new(Recorder(Rc::clone(&events))));

        s.tick(100, false);
        let seen = events.borrow();
        assert!(seen.contains(&SubscriptionEvent::Expired));
        assert!(seen.iter().any(|e| matches!(
            e,
            SubscriptionEvent::StateChanged {
                to: SubscriptionState::Closed,
                ..
            }
        )));
    }

    #[test]
    fn test_subscription_observer_deregister() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut s = sub(10, 1);
        let id = s.register_observer(Box::new(Recorder(Rc::clone(&events))));
        assert!(s.deregister_observer(id));
        assert!(!s.deregister_observer(id));

        s.tick(100, true); // keep-alive state change would have been seen
        assert!(events.borrow().is_empty());
    }

    // --- Coalescing ---

    #[test]
    fn test_subscription_coalesce_batches_by_cap() {
        let mut p = params(100, 10);
        p.max_notifications_per_publish = 2;
        let mut s = Subscription::new(SubscriptionId(1), p, 16, 16, 0);

        let mut item = MonitoredItem::new(MonitoredItemId(7), NodeId::from("n"), 100, 10);
        for n in 1..=5 {
            item.enqueue(DataValue::good(Variant::Int64(n), n));
        }
        s.add_item(item);
        s.coalesce_queued(100);

        // 5 changes with cap 2: 3 pending notifications of sizes 2, 2, 1.
        let mut sizes = Vec::new();
        for t in 1..=3 {
            let out = s.tick(t * 100, true);
            if let TickAction::Publish(n) = out.action {
                sizes.push(n.payload.len());
            }
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_subscription_debug_skips_observers() {
        let mut s = sub(10, 3);
        s.register_observer(Box::new(Recorder(Rc::new(RefCell::new(Vec::new())))));

        let rendered = format!("{s:?}");
        assert!(rendered.contains("Subscription"));
        assert!(rendered.contains("observers: 1"));
    }

    #[test]
    fn test_subscription_nonpositive_interval_clamped() {
        let mut p = params(10, 3);
        p.publishing_interval_ms = 0;
        let mut s = Subscription::new(SubscriptionId(1), p, 16, 16, 0);
        assert_eq!(s.params().publishing_interval_ms, 1);

        // The first due tick terminates and reschedules past `now`.
        queue_value(&mut s, 1);
        assert!(s.is_due(5));
        let out = s.tick(5, true);
        assert!(matches!(out.action, TickAction::Publish(_)));
        assert!(!s.is_due(5));

        p.publishing_interval_ms = -100;
        s.modify(p, 10);
        assert_eq!(s.params().publishing_interval_ms, 1);
    }

    #[test]
    fn test_subscription_detach_preserves_continuity() {
        let mut s = sub(100, 10);
        s.attach(SessionId(1), None);
        queue_value(&mut s, 1);
        s.tick(100, true);

        s.detach();
        assert!(s.session().is_none());
        assert_eq!(s.available_sequence_numbers(), vec![1]);
        // Next sequence number continues where it left off.
        queue_value(&mut s, 2);
        let out = s.tick(200, true);
        let TickAction::Publish(n) = out.action else {
            panic!("expected publish");
        };
        assert_eq!(n.sequence_number, 2);
    }
}
