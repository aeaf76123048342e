//! Publish engine — matches publish requests against ready subscriptions.
//!
//! One engine exists per session, plus one session-less engine holding
//! orphaned subscriptions. The engine owns the FIFO of queued publish
//! requests and the subscriptions of its owner, and runs their publishing
//! ticks:
//!
//! ```text
//! publish requests ──► ┌──────────────┐ ◄── subscription ticks
//!   (per-session FIFO) │ PublishEngine │
//!    timeout enforced  │  match + order│──► responses / retired subs
//!                      └──────────────┘
//! ```
//!
//! When several subscriptions become ready in the same instant the service
//! order is: late before keep-alive-due before normal, ties broken by
//! ascending subscription id. Request timeouts are enforced here, not by the
//! transport.

pub mod retention;

pub use retention::RetentionPolicy;

use fxhash::FxHashMap;

use crate::queue::SequencedQueue;
use crate::session::SessionId;
use crate::status::StatusCode;
use crate::subscription::{
    MonitoredItemId, Notification, Readiness, Subscription, SubscriptionId, TickAction,
};

// ---------------------------------------------------------------------------
// PublishRequest / PublishResponse
// ---------------------------------------------------------------------------

/// A client publish request, scoped to one session.
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest {
    /// Client correlation handle, echoed in the response.
    pub handle: u32,
    /// Client-supplied timeout in milliseconds; `0` means no timeout.
    pub timeout_ms: i64,
}

#[derive(Debug)]
struct QueuedRequest {
    request: PublishRequest,
    queued_at: i64,
}

/// Body of a publish response.
#[derive(Debug)]
pub enum ResponseBody {
    /// A data or event notification.
    Notification(Notification),
    /// An empty keep-alive proving liveness.
    KeepAlive {
        /// Sequence number the next data notification will carry.
        next_sequence: u32,
    },
    /// The request failed (timeout, session closed, queue overflow).
    Fault(StatusCode),
}

/// One response emitted by the engine.
#[derive(Debug)]
pub struct PublishResponse {
    /// Correlation handle of the consumed request.
    pub request_handle: u32,
    /// The subscription that produced the response, absent for faults.
    pub subscription: Option<SubscriptionId>,
    /// Retransmission sequence numbers still cached, for client reconcile.
    pub available_sequence_numbers: Vec<u32>,
    /// The response body.
    pub body: ResponseBody,
}

impl PublishResponse {
    fn fault(handle: u32, status: StatusCode) -> Self {
        Self {
            request_handle: handle,
            subscription: None,
            available_sequence_numbers: Vec::new(),
            body: ResponseBody::Fault(status),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine output
// ---------------------------------------------------------------------------

/// A subscription disposed by the engine, with the item ids the server must
/// deregister from the sampling scheduler.
#[derive(Debug)]
pub struct RetiredSubscription {
    /// The disposed subscription.
    pub id: SubscriptionId,
    /// Its released monitored items.
    pub items: Vec<MonitoredItemId>,
}

/// Everything one engine pass produced.
#[derive(Debug, Default)]
pub struct EngineOutput {
    /// Responses to hand to the transport.
    pub responses: Vec<PublishResponse>,
    /// Subscriptions disposed during the pass.
    pub retired: Vec<RetiredSubscription>,
}

impl EngineOutput {
    fn merge(&mut self, other: EngineOutput) {
        self.responses.extend(other.responses);
        self.retired.extend(other.retired);
    }
}

/// Result of closing the engine's owner, shaped by the retention policy.
#[derive(Debug, Default)]
pub struct CloseOutcome {
    /// Subscriptions that survive for transfer (retaining policy).
    pub detached: Vec<Subscription>,
    /// Subscriptions disposed outright (destroying policy).
    pub retired: Vec<RetiredSubscription>,
    /// Failure responses for requests still queued at close.
    pub failed_requests: Vec<PublishResponse>,
}

// ---------------------------------------------------------------------------
// RepublishError
// ---------------------------------------------------------------------------

/// Errors raised by retransmission requests.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RepublishError {
    /// The engine owns no subscription with that id.
    #[error("subscription id is not known to this engine")]
    SubscriptionIdInvalid,
    /// The sequence number is no longer in the retransmission cache.
    #[error("requested sequence number is no longer available")]
    MessageNotAvailable,
}

// ---------------------------------------------------------------------------
// PublishEngine
// ---------------------------------------------------------------------------

/// Matches queued publish requests against ready subscriptions for one owner.
pub struct PublishEngine {
    session: Option<SessionId>,
    retention: RetentionPolicy,
    requests: SequencedQueue<QueuedRequest>,
    max_queued_requests: usize,
    subscriptions: FxHashMap<SubscriptionId, Subscription>,
}

impl PublishEngine {
    /// Creates the engine for a session.
    #[must_use]
    pub fn for_session(
        session: SessionId,
        retention: RetentionPolicy,
        max_queued_requests: usize,
    ) -> Self {
        Self {
            session: Some(session),
            retention,
            requests: SequencedQueue::new(),
            max_queued_requests: max_queued_requests.max(1),
            subscriptions: FxHashMap::default(),
        }
    }

    /// Creates the session-less engine that retains orphaned subscriptions
    /// until they are reclaimed or expire.
    #[must_use]
    pub fn orphanage() -> Self {
        Self {
            session: None,
            retention: RetentionPolicy::RetainForTransfer,
            requests: SequencedQueue::new(),
            max_queued_requests: 1,
            subscriptions: FxHashMap::default(),
        }
    }

    /// Returns the owning session, if any.
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    // --- subscription ownership ------------------------------------------

    /// Takes ownership of a subscription.
    pub fn adopt(&mut self, subscription: Subscription) {
        self.subscriptions.insert(subscription.id(), subscription);
    }

    /// Releases a subscription intact (transfer path).
    pub fn take(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.remove(&id)
    }

    /// Returns `true` when the engine owns the subscription.
    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    /// Shared access to one owned subscription.
    #[must_use]
    pub fn subscription(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    /// Mutable access to one owned subscription.
    pub fn subscription_mut(&mut self, id: SubscriptionId) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(&id)
    }

    /// Ids of all owned subscriptions.
    #[must_use]
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions.keys().copied().collect()
    }

    /// Returns the number of owned subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Closes and disposes one subscription (client delete).
    pub fn delete_subscription(&mut self, id: SubscriptionId) -> Option<RetiredSubscription> {
        let mut sub = self.subscriptions.remove(&id)?;
        sub.close();
        let items = sub.release_items();
        Some(RetiredSubscription { id, items })
    }

    // --- request queue ---------------------------------------------------

    /// Queues a publish request and immediately services any subscription
    /// already waiting for one (a late backlog or a held keep-alive).
    ///
    /// When the FIFO is full the oldest queued request is failed with
    /// `BadTooManyPublishRequests` to make room, matching the rule that the
    /// most recent request is the one the client still cares about.
    pub fn enqueue_request(&mut self, request: PublishRequest, now: i64) -> EngineOutput {
        let mut out = EngineOutput::default();

        if self.requests.len() >= self.max_queued_requests {
            if let Some(old) = self.requests.shift() {
                tracing::debug!(
                    "publish queue overflow, failing oldest request {}",
                    old.request.handle
                );
                out.responses.push(PublishResponse::fault(
                    old.request.handle,
                    StatusCode::BadTooManyPublishRequests,
                ));
            }
        }
        self.requests.push(QueuedRequest {
            request,
            queued_at: now,
        });

        out.merge(self.service_pending());
        out
    }

    /// Returns the number of queued publish requests.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Fails every queued request with the given status (session close).
    pub fn fail_all_requests(&mut self, status: StatusCode) -> Vec<PublishResponse> {
        let mut responses = Vec::with_capacity(self.requests.len());
        while let Some(q) = self.requests.shift() {
            responses.push(PublishResponse::fault(q.request.handle, status));
        }
        responses
    }

    // --- tick ------------------------------------------------------------

    /// Runs one engine pass: request timeouts first, then the publishing
    /// tick of every due subscription in service order.
    pub fn tick(&mut self, now: i64) -> EngineOutput {
        let mut out = EngineOutput::default();

        // A request fails once it has waited longer than its timeout, so at
        // exactly the timeout it is still eligible. Failed requests are not
        // retried.
        let expired = self
            .requests
            .take_where(|q| q.request.timeout_ms > 0 && now - q.queued_at > q.request.timeout_ms);
        for q in expired {
            tracing::debug!("publish request {} timed out", q.request.handle);
            out.responses.push(PublishResponse::fault(
                q.request.handle,
                StatusCode::BadRequestTimeout,
            ));
        }

        // Gather due subscriptions, fold in freshly sampled values, then
        // order by readiness class and ascending id.
        let mut due: Vec<SubscriptionId> = Vec::new();
        for (id, sub) in &mut self.subscriptions {
            if sub.is_due(now) {
                sub.coalesce_queued(now);
                due.push(*id);
            }
        }
        let mut order: Vec<(Readiness, SubscriptionId)> = due
            .into_iter()
            .filter_map(|id| self.subscriptions.get(&id).map(|s| (s.readiness(), id)))
            .collect();
        order.sort_unstable();

        for (_, id) in order {
            let request_available = !self.requests.is_empty();
            let Some(sub) = self.subscriptions.get_mut(&id) else {
                continue;
            };
            let outcome = sub.tick(now, request_available);
            match outcome.action {
                TickAction::Publish(n) => {
                    let avail = sub.available_sequence_numbers();
                    // The tick only publishes when told a request is available.
                    let q = self.requests.shift().expect("request availability was checked");
                    out.responses.push(PublishResponse {
                        request_handle: q.request.handle,
                        subscription: Some(id),
                        available_sequence_numbers: avail,
                        body: ResponseBody::Notification(n),
                    });
                }
                TickAction::KeepAlive { next_sequence } => {
                    let q = self.requests.shift().expect("request availability was checked");
                    out.responses.push(PublishResponse {
                        request_handle: q.request.handle,
                        subscription: Some(id),
                        available_sequence_numbers: Vec::new(),
                        body: ResponseBody::KeepAlive { next_sequence },
                    });
                }
                TickAction::Late | TickAction::Idle => {}
            }
            if outcome.expired {
                out.retired.extend(self.retire(id));
            }
        }
        out
    }

    /// Services subscriptions already waiting for a request, in service
    /// order, until requests run out or nothing is waiting.
    fn service_pending(&mut self) -> EngineOutput {
        let mut out = EngineOutput::default();

        let mut order: Vec<(Readiness, SubscriptionId)> = self
            .subscriptions
            .values()
            .map(|s| (s.readiness(), s.id()))
            .collect();
        order.sort_unstable();

        for (_, id) in order {
            if self.requests.is_empty() {
                break;
            }
            let Some(sub) = self.subscriptions.get_mut(&id) else {
                continue;
            };
            let Some(action) = sub.try_service_pending() else {
                continue;
            };
            match action {
                TickAction::Publish(n) => {
                    let avail = sub.available_sequence_numbers();
                    let q = self.requests.shift().expect("loop guards a non-empty queue");
                    out.responses.push(PublishResponse {
                        request_handle: q.request.handle,
                        subscription: Some(id),
                        available_sequence_numbers: avail,
                        body: ResponseBody::Notification(n),
                    });
                }
                TickAction::KeepAlive { next_sequence } => {
                    let q = self.requests.shift().expect("loop guards a non-empty queue");
                    out.responses.push(PublishResponse {
                        request_handle: q.request.handle,
                        subscription: Some(id),
                        available_sequence_numbers: Vec::new(),
                        body: ResponseBody::KeepAlive { next_sequence },
                    });
                }
                TickAction::Late | TickAction::Idle => {}
            }
        }
        out
    }

    fn retire(&mut self, id: SubscriptionId) -> Option<RetiredSubscription> {
        let mut sub = self.subscriptions.remove(&id)?;
        let items = sub.release_items();
        sub.clear_observers();
        tracing::debug!("{id} expired and was disposed");
        Some(RetiredSubscription { id, items })
    }

    // --- republish -------------------------------------------------------

    /// Returns the cached notification for a retransmission request.
    ///
    /// # Errors
    ///
    /// [`RepublishError::SubscriptionIdInvalid`] for an unknown subscription,
    /// [`RepublishError::MessageNotAvailable`] when the sequence number fell
    /// out of the retransmission window.
    pub fn republish(
        &self,
        id: SubscriptionId,
        sequence_number: u32,
    ) -> Result<Notification, RepublishError> {
        let sub = self
            .subscriptions
            .get(&id)
            .ok_or(RepublishError::SubscriptionIdInvalid)?;
        sub.republish(sequence_number)
            .ok_or(RepublishError::MessageNotAvailable)
    }

    // --- owner close -----------------------------------------------------

    /// Closes the engine's owner. Per the retention policy, live
    /// subscriptions are either detached intact for the orphan pool or
    /// disposed outright; queued requests always fail with `BadSessionClosed`.
    pub fn close_owner(&mut self) -> CloseOutcome {
        let mut outcome = CloseOutcome {
            failed_requests: self.fail_all_requests(StatusCode::BadSessionClosed),
            ..CloseOutcome::default()
        };

        let ids: Vec<SubscriptionId> = self.subscriptions.keys().copied().collect();
        for id in ids {
            let Some(mut sub) = self.subscriptions.remove(&id) else {
                continue;
            };
            if self.retention.retains() && sub.state() != crate::subscription::SubscriptionState::Closed
            {
                sub.detach();
                outcome.detached.push(sub);
            } else {
                sub.close();
                let items = sub.release_items();
                outcome.retired.push(RetiredSubscription { id, items });
            }
        }
        outcome
    }
}

// ===========================================================================
// Tests
// ===========================================================================
