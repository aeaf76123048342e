//! Sampling scheduler — shared timers for monitored items.
//!
//! Monitored items with the same sampling interval share one logical timer:
//! a [`SamplerGroup`] keyed by the interval value. The group is created when
//! its first member registers and destroyed when the last member leaves, so
//! no timer outlives its subscribers.
//!
//! The scheduler is polled with a millisecond clock and emits [`SampleTask`]s
//! for the caller to resolve against the address space. Dispatch is
//! two-phase by design: polling never touches a data source, so a slow node
//! cannot stall the timer loop or starve sibling groups. Completions are
//! routed back through a liveness-checked entry point on the server, which
//! makes a late completion for a disposed item a no-op.
//!
//! The scheduler is plain state owned by one server instance. It is created
//! at server init and cleared at shutdown; there is no process-wide registry.

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::subscription::MonitoredItemId;

// ---------------------------------------------------------------------------
// SamplingError
// ---------------------------------------------------------------------------

/// Errors raised when registering monitored items with the scheduler.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SamplingError {
    /// Sampling intervals must be strictly positive.
    #[error("invalid sampling interval: {0} ms")]
    InvalidInterval(i64),
}

// ---------------------------------------------------------------------------
// SampleTask
// ---------------------------------------------------------------------------

/// One pending sample read emitted by [`SamplingScheduler::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTask {
    /// The item to sample.
    pub item: MonitoredItemId,
    /// The interval of the group that fired.
    pub interval_ms: i64,
    /// The deadline that triggered this task.
    pub due_at: i64,
}

/// Tasks fired by one poll. Sized for the common case of a few due groups.
pub type SampleTasks = SmallVec<[SampleTask; 8]>;

// ---------------------------------------------------------------------------
// SamplerGroup
// ---------------------------------------------------------------------------

/// All monitored items sharing one sampling interval, plus the shared timer
/// deadline.
#[derive(Debug)]
pub struct SamplerGroup {
    interval_ms: i64,
    members: Vec<MonitoredItemId>,
    next_due: i64,
}

impl SamplerGroup {
    fn new(interval_ms: i64, now: i64) -> Self {
        Self {
            interval_ms,
            members: Vec::new(),
            next_due: now + interval_ms,
        }
    }

    /// Returns the member item ids.
    #[must_use]
    pub fn members(&self) -> &[MonitoredItemId] {
        &self.members
    }

    /// Returns the next deadline of the shared timer.
    #[must_use]
    pub fn next_due(&self) -> i64 {
        self.next_due
    }
}

// ---------------------------------------------------------------------------
// SamplingScheduler
// ---------------------------------------------------------------------------

/// Groups monitored items by sampling interval onto shared timers.
pub struct SamplingScheduler {
    groups: FxHashMap<i64, SamplerGroup>,
    /// Reverse index: item id → its group's interval key.
    memberships: FxHashMap<MonitoredItemId, i64>,
}

impl SamplingScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: FxHashMap::default(),
            memberships: FxHashMap::default(),
        }
    }

    /// Registers an item with the group for `interval_ms`, creating the group
    /// (and its shared timer) if this is the first member.
    ///
    /// An item already registered under another interval is moved.
    ///
    /// # Errors
    ///
    /// [`SamplingError::InvalidInterval`] when `interval_ms <= 0`.
    pub fn register(
        &mut self,
        item: MonitoredItemId,
        interval_ms: i64,
        now: i64,
    ) -> Result<(), SamplingError> {
        if interval_ms <= 0 {
            return Err(SamplingError::InvalidInterval(interval_ms));
        }

        if let Some(old) = self.memberships.get(&item).copied() {
            if old == interval_ms {
                return Ok(());
            }
            self.deregister(item);
        }

        let group = self
            .groups
            .entry(interval_ms)
            .or_insert_with(|| SamplerGroup::new(interval_ms, now));
        group.members.push(item);
        self.memberships.insert(item, interval_ms);
        Ok(())
    }

    /// Removes an item from its group, destroying the group (and cancelling
    /// its shared timer) when it becomes empty.
    ///
    /// Membership is gone before this returns; only an already scheduled
    /// completion can still reference the item, which the owner's liveness
    /// flag turns into a no-op.
    ///
    /// Returns `true` when the item was registered.
    pub fn deregister(&mut self, item: MonitoredItemId) -> bool {
        let Some(interval) = self.memberships.remove(&item) else {
            return false;
        };
        if let Some(group) = self.groups.get_mut(&interval) {
            group.members.retain(|&m| m != item);
            if group.members.is_empty() {
                self.groups.remove(&interval);
            }
        }
        true
    }

    /// Fires all due groups, emitting one [`SampleTask`] per member, and
    /// advances each fired group's deadline past `now`.
    ///
    /// A group that fell several intervals behind fires once per poll, not
    /// once per missed interval; the deadline catches up in whole intervals
    /// so the timer does not drift.
    pub fn poll(&mut self, now: i64) -> SampleTasks {
        let mut fired = SampleTasks::new();
        for group in self.groups.values_mut() {
            if group.next_due > now {
                continue;
            }
            let due_at = group.next_due;
            for &item in &group.members {
                fired.push(SampleTask {
                    item,
                    interval_ms: group.interval_ms,
                    due_at,
                });
            }
            while group.next_due <= now {
                group.next_due += group.interval_ms;
            }
        }
        fired
    }

    /// Returns the deadline of the earliest timer, if any group exists.
    #[must_use]
    pub fn next_deadline(&self) -> Option<i64> {
        self.groups.values().map(SamplerGroup::next_due).min()
    }

    /// Returns `true` when a shared timer exists for the interval.
    #[must_use]
    pub fn timer_exists(&self, interval_ms: i64) -> bool {
        self.groups.contains_key(&interval_ms)
    }

    /// Returns the number of live sampler groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Returns the number of registered items.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.memberships.len()
    }

    /// Drops all groups and memberships. Called at server shutdown.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.memberships.clear();
    }
}

impl Default for SamplingScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: u32) -> MonitoredItemId {
        MonitoredItemId(n)
    }

    // --- Registration tests ---

    #[test]
    fn test_sampling_same_interval_shares_one_timer() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();
        sched.register(item(2), 100, 0).unwrap();

        assert_eq!(sched.group_count(), 1);
        assert!(sched.timer_exists(100));
        assert_eq!(sched.item_count(), 2);
    }

    #[test]
    fn test_sampling_distinct_intervals_distinct_timers() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();
        sched.register(item(2), 250, 0).unwrap();

        assert_eq!(sched.group_count(), 2);
        assert!(sched.timer_exists(100));
        assert!(sched.timer_exists(250));
    }

    #[test]
    fn test_sampling_invalid_interval_rejected() {
        let mut sched = SamplingScheduler::new();
        assert_eq!(
            sched.register(item(1), 0, 0),
            Err(SamplingError::InvalidInterval(0))
        );
        assert_eq!(
            sched.register(item(1), -50, 0),
            Err(SamplingError::InvalidInterval(-50))
        );
        assert_eq!(sched.group_count(), 0);
    }

    #[test]
    fn test_sampling_reregister_moves_groups() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();
        sched.register(item(1), 200, 0).unwrap();

        assert!(!sched.timer_exists(100));
        assert!(sched.timer_exists(200));
        assert_eq!(sched.item_count(), 1);
    }

    // --- Deregistration tests ---

    #[test]
    fn test_sampling_last_removal_cancels_timer() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();
        sched.register(item(2), 100, 0).unwrap();

        assert!(sched.deregister(item(1)));
        assert!(sched.timer_exists(100));

        assert!(sched.deregister(item(2)));
        assert!(!sched.timer_exists(100));
        assert_eq!(sched.group_count(), 0);
    }

    #[test]
    fn test_sampling_deregister_unknown() {
        let mut sched = SamplingScheduler::new();
        assert!(!sched.deregister(item(9)));
    }

    // --- Poll tests ---

    #[test]
    fn test_sampling_poll_fires_due_group_members() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();
        sched.register(item(2), 100, 0).unwrap();

        assert!(sched.poll(50).is_empty());

        let fired = sched.poll(100);
        assert_eq!(fired.len(), 2);
        let items: Vec<MonitoredItemId> = fired.iter().map(|t| t.item).collect();
        assert!(items.contains(&item(1)));
        assert!(items.contains(&item(2)));
        assert!(fired.iter().all(|t| t.interval_ms == 100 && t.due_at == 100));
    }

    #[test]
    fn test_sampling_poll_advances_deadline() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();

        assert_eq!(sched.poll(100).len(), 1);
        // Same instant again: nothing more to fire.
        assert!(sched.poll(100).is_empty());
        assert_eq!(sched.next_deadline(), Some(200));
        assert_eq!(sched.poll(200).len(), 1);
    }

    #[test]
    fn test_sampling_poll_catches_up_without_flood() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();

        // Four intervals elapsed: one task, deadline realigned past now.
        let fired = sched.poll(450);
        assert_eq!(fired.len(), 1);
        assert_eq!(sched.next_deadline(), Some(500));
    }

    #[test]
    fn test_sampling_poll_mixed_intervals() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();
        sched.register(item(2), 300, 0).unwrap();

        let fired = sched.poll(100);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].item, item(1));

        let fired = sched.poll(300);
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn test_sampling_clear() {
        let mut sched = SamplingScheduler::new();
        sched.register(item(1), 100, 0).unwrap();
        sched.register(item(2), 200, 0).unwrap();
        sched.clear();

        assert_eq!(sched.group_count(), 0);
        assert_eq!(sched.item_count(), 0);
        assert!(sched.poll(1_000).is_empty());
    }
}
