//! Retention policy injected into the publish engine.
//!
//! The tick/match algorithm is written once in the engine; what happens to a
//! live subscription when its owner goes away is policy. A session engine
//! configured with [`RetentionPolicy::RetainForTransfer`] hands its
//! subscriptions to the orphan pool on close; one configured with
//! [`RetentionPolicy::DestroyOnDetach`] disposes them immediately.

/// What the engine does with live subscriptions when its owner closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Close and dispose every subscription on owner detach.
    DestroyOnDetach,
    /// Detach subscriptions intact so they can be reclaimed by transfer or
    /// expire on their own.
    RetainForTransfer,
}

impl RetentionPolicy {
    /// Returns `true` when detached subscriptions survive their owner.
    #[must_use]
    pub fn retains(self) -> bool {
        matches!(self, RetentionPolicy::RetainForTransfer)
    }
}
