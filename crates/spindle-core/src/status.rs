//! Status codes for per-item service results.
//!
//! Every batch operation in the service layer returns one [`StatusCode`] per
//! item, so a failed item never fails its siblings. Fatal conditions (broken
//! invariants, unsupported token kinds) use the crate [`Error`](crate::Error)
//! type instead and are never encoded as a status.

use serde::Serialize;

// ---------------------------------------------------------------------------
// StatusCode
// ---------------------------------------------------------------------------

/// Per-item result status.
///
/// `Good*` variants indicate success, `Bad*` variants indicate the item
/// failed. Statuses are values, not errors: they travel inside result
/// batches and are never propagated with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatusCode {
    /// The operation succeeded.
    Good,
    /// The operation succeeded and more data is available via continuation.
    GoodMoreData,
    /// The continuation point is unknown or has expired.
    BadContinuationPointInvalid,
    /// The subscription id does not identify a live subscription.
    BadSubscriptionIdInvalid,
    /// The requested retransmission sequence number is no longer cached.
    BadMessageNotAvailable,
    /// The timestamps-to-return selector is not a valid value.
    BadTimestampsToReturnInvalid,
    /// The requesting identity may not take ownership of the subscription.
    BadUserAccessDenied,
    /// The publish request aged out before any subscription consumed it.
    BadRequestTimeout,
    /// The owning session was closed while the request was queued.
    BadSessionClosed,
    /// The session id does not identify a live session.
    BadSessionIdInvalid,
    /// The aggregate configuration on a history read is malformed.
    BadAggregateInvalidInputs,
    /// The monitored item id does not identify a live item.
    BadMonitoredItemIdInvalid,
    /// The request batch was empty.
    BadNothingToDo,
    /// More publish requests are queued than the server allows.
    BadTooManyPublishRequests,
    /// The requested sampling interval is zero or negative.
    BadSamplingIntervalInvalid,
    /// The node id is unknown to the address space.
    BadNodeIdUnknown,
}

impl StatusCode {
    /// Returns `true` for `Good*` statuses.
    #[inline]
    #[must_use]
    pub fn is_good(self) -> bool {
        matches!(self, StatusCode::Good | StatusCode::GoodMoreData)
    }

    /// Returns `true` for `Bad*` statuses.
    #[inline]
    #[must_use]
    pub fn is_bad(self) -> bool {
        !self.is_good()
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
