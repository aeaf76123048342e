//! Continuation point manager — pagination of oversized result sets.
//!
//! Browse and history-read calls that produce more items than the caller's
//! page size hand the remainder to a [`ContinuationPointManager`] and return
//! an opaque [`ContinuationPoint`] token. The caller retrieves the remaining
//! pages with `get_next` and may abandon the set early with `cancel`.
//!
//! Tokens are minted from a monotonically increasing counter, so a token is
//! unique among live tokens and is never reissued after deletion. Tokens are
//! predictable by design and must not be treated as a capability boundary.

use std::collections::VecDeque;

use bytes::Bytes;
use fxhash::FxHashMap;

// ---------------------------------------------------------------------------
// ContinuationPoint
// ---------------------------------------------------------------------------

/// Opaque continuation token.
///
/// Carried verbatim as a byte sequence through the service layer; only the
/// manager that minted it can interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationPoint(Bytes);

impl ContinuationPoint {
    fn mint(counter: u64) -> Self {
        Self(Bytes::copy_from_slice(&counter.to_be_bytes()))
    }

    /// Reconstructs a token from bytes received on the wire.
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Returns the raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// ContinuationError
// ---------------------------------------------------------------------------

/// Errors raised by continuation point operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContinuationError {
    /// The token is unknown, already consumed, or expired.
    #[error("unknown or expired continuation point")]
    Invalid,
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// One page of a paginated result set.
#[derive(Debug)]
pub struct Page<T> {
    /// The items of this page, in original order.
    pub items: Vec<T>,
    /// Token for the next page; `None` on the final page.
    pub token: Option<ContinuationPoint>,
}

// ---------------------------------------------------------------------------
// ContinuationPointManager
// ---------------------------------------------------------------------------

struct Entry<T> {
    page_size: usize,
    remaining: VecDeque<T>,
    created_at: i64,
}

/// Stores the unread remainders of paginated result sets.
///
/// One manager instance exists per result kind (browse references, history
/// values) and is owned by the server, not shared globally.
pub struct ContinuationPointManager<T> {
    entries: FxHashMap<ContinuationPoint, Entry<T>>,
    next_token: u64,
}

impl<T> ContinuationPointManager<T> {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            next_token: 1,
        }
    }

    /// Registers a result set and returns its first page.
    ///
    /// A `page_size` of `0` means unbounded: all items are returned and no
    /// continuation point is created. Otherwise, when `items` exceeds the
    /// page size, the remainder is stored under a freshly minted token.
    pub fn register(&mut self, page_size: usize, items: Vec<T>, now: i64) -> Page<T> {
        if page_size == 0 || items.len() <= page_size {
            return Page { items, token: None };
        }

        let mut remaining: VecDeque<T> = items.into();
        let first: Vec<T> = remaining.drain(..page_size).collect();

        let token = ContinuationPoint::mint(self.next_token);
        self.next_token += 1;
        self.entries.insert(
            token.clone(),
            Entry {
                page_size,
                remaining,
                created_at: now,
            },
        );

        Page {
            items: first,
            token: Some(token),
        }
    }

    /// Pops the next page for a live token.
    ///
    /// The entry is deleted, and no token returned, once the remainder is
    /// drained.
    ///
    /// # Errors
    ///
    /// [`ContinuationError::Invalid`] when the token is unknown.
    pub fn get_next(&mut self, token: &ContinuationPoint) -> Result<Page<T>, ContinuationError> {
        let entry = self
            .entries
            .get_mut(token)
            .ok_or(ContinuationError::Invalid)?;

        let take = entry.page_size.min(entry.remaining.len());
        let items: Vec<T> = entry.remaining.drain(..take).collect();

        if entry.remaining.is_empty() {
            self.entries.remove(token);
            Ok(Page { items, token: None })
        } else {
            Ok(Page {
                items,
                token: Some(token.clone()),
            })
        }
    }

    /// Deletes a live continuation point without reading further pages.
    ///
    /// # Errors
    ///
    /// [`ContinuationError::Invalid`] when the token is unknown.
    pub fn cancel(&mut self, token: &ContinuationPoint) -> Result<(), ContinuationError> {
        self.entries
            .remove(token)
            .map(|_| ())
            .ok_or(ContinuationError::Invalid)
    }

    /// Deletes entries older than `max_age_ms` and returns how many were
    /// removed. Bounds memory held for clients that never finish reading.
    pub fn purge_expired(&mut self, now: i64, max_age_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now - e.created_at < max_age_ms);
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::debug!("purged {purged} expired continuation points");
        }
        purged
    }

    /// Returns the number of live continuation points.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.len()
    }
}

impl<T> Default for ContinuationPointManager<T> {
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

    fn items(n: usize) -> Vec<u32> {
        #[allow(clippy::cast_possible_truncation)]
        (0..n as u32).collect()
    }

    // --- register tests ---

    #[test]
    fn test_continuation_register_fits_in_one_page() {
        let mut mgr = ContinuationPointManager::new();
        let page = mgr.register(10, items(5), 0);

        assert_eq!(page.items, items(5));
        assert!(page.token.is_none());
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn test_continuation_register_page_size_zero_unbounded() {
        let mut mgr = ContinuationPointManager::new();
        let page = mgr.register(0, items(1000), 0);

        assert_eq!(page.items.len(), 1000);
        assert!(page.token.is_none());
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn test_continuation_register_exact_page_size_no_token() {
        let mut mgr = ContinuationPointManager::new();
        let page = mgr.register(5, items(5), 0);

        assert_eq!(page.items.len(), 5);
        assert!(page.token.is_none());
    }

    #[test]
    fn test_continuation_register_overflow_creates_token() {
        let mut mgr = ContinuationPointManager::new();
        let page = mgr.register(3, items(8), 0);

        assert_eq!(page.items, vec![0, 1, 2]);
        assert!(page.token.is_some());
        assert_eq!(mgr.live_count(), 1);
    }

    // --- get_next tests ---

    #[test]
    fn test_continuation_round_trip_preserves_order() {
        // N = 10, p = 3: ceil(10/3) = 4 pages, concatenation == original.
        let mut mgr = ContinuationPointManager::new();
        let mut collected = Vec::new();
        let mut pages = 1;

        let mut page = mgr.register(3, items(10), 0);
        collected.extend(page.items.drain(..));

        let mut token = page.token;
        while let Some(t) = token {
            let mut next = mgr.get_next(&t).unwrap();
            collected.extend(next.items.drain(..));
            token = next.token;
            pages += 1;
        }

        assert_eq!(pages, 4);
        assert_eq!(collected, items(10));
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn test_continuation_final_page_returns_no_token() {
        let mut mgr = ContinuationPointManager::new();
        let page = mgr.register(4, items(8), 0);
        let token = page.token.unwrap();

        let last = mgr.get_next(&token).unwrap();
        assert_eq!(last.items, vec![4, 5, 6, 7]);
        assert!(last.token.is_none());

        // Entry deleted; token no longer valid.
        assert_eq!(mgr.get_next(&token).unwrap_err(), ContinuationError::Invalid);
    }

    #[test]
    fn test_continuation_get_next_unknown_token() {
        let mut mgr: ContinuationPointManager<u32> = ContinuationPointManager::new();
        let bogus = ContinuationPoint::from_bytes(Bytes::from_static(b"\0\0\0\0\0\0\0\x63"));
        assert_eq!(mgr.get_next(&bogus).unwrap_err(), ContinuationError::Invalid);
    }

    // --- cancel tests ---

    #[test]
    fn test_continuation_cancel_live_token() {
        let mut mgr = ContinuationPointManager::new();
        let page = mgr.register(2, items(6), 0);
        let token = page.token.unwrap();

        assert!(mgr.cancel(&token).is_ok());
        assert_eq!(mgr.live_count(), 0);

        // Cancelled token behaves like an unknown one.
        assert_eq!(mgr.get_next(&token).unwrap_err(), ContinuationError::Invalid);
        assert_eq!(mgr.cancel(&token).unwrap_err(), ContinuationError::Invalid);
    }

    #[test]
    fn test_continuation_cancel_unknown_token() {
        let mut mgr: ContinuationPointManager<u32> = ContinuationPointManager::new();
        let bogus = ContinuationPoint::from_bytes(Bytes::from_static(b"nope"));
        assert_eq!(mgr.cancel(&bogus).unwrap_err(), ContinuationError::Invalid);
    }

    // --- token uniqueness tests ---

    #[test]
    fn test_continuation_tokens_never_reissued() {
        let mut mgr = ContinuationPointManager::new();
        let t1 = mgr.register(1, items(3), 0).token.unwrap();
        mgr.cancel(&t1).unwrap();

        let t2 = mgr.register(1, items(3), 0).token.unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_continuation_concurrent_sets_independent() {
        let mut mgr = ContinuationPointManager::new();
        let a = mgr.register(2, vec![1, 2, 3, 4], 0).token.unwrap();
        let b = mgr.register(2, vec![10, 20, 30, 40], 0).token.unwrap();
        assert_ne!(a, b);

        let pa = mgr.get_next(&a).unwrap();
        assert_eq!(pa.items, vec![3, 4]);
        let pb = mgr.get_next(&b).unwrap();
        assert_eq!(pb.items, vec![30, 40]);
    }

    // --- purge tests ---

    #[test]
    fn test_continuation_purge_expired() {
        let mut mgr = ContinuationPointManager::new();
        let old = mgr.register(1, items(3), 1_000).token.unwrap();
        let fresh = mgr.register(1, items(3), 9_500).token.unwrap();

        let purged = mgr.purge_expired(10_000, 5_000);
        assert_eq!(purged, 1);
        assert_eq!(mgr.get_next(&old).unwrap_err(), ContinuationError::Invalid);
        assert!(mgr.get_next(&fresh).is_ok());
    }
}
