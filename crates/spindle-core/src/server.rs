//! Subscription server — the service façade over the publishing core.
//!
//! One [`SubscriptionServer`] owns everything with state: sessions and their
//! publish engines, the orphaned-subscription pool, the sampling scheduler,
//! and the continuation point managers. Requests enter either through the
//! typed operation methods or through [`SubscriptionServer::dispatch`]:
//!
//! ```text
//!              ┌────────────────────────────────────────────┐
//! requests ──► │ SubscriptionServer                         │
//!              │   sessions ──► PublishEngine ──► Subs      │
//!              │   orphans  ──► PublishEngine ──► Subs      │──► responses
//!              │   SamplingScheduler ──► AddressSpace reads │
//!              │   ContinuationPointManager (browse/history)│
//!              └────────────────────────────────────────────┘
//! ```
//!
//! The server is single-threaded state driven by [`SubscriptionServer::tick`]
//! with a millisecond clock; [`SubscriptionServer::run`] wraps the tick in a
//! tokio interval loop with watch-channel shutdown. Batched operations return
//! one status per item and only fail the whole call for session-level
//! problems (unknown session, empty batch, bad selector).

use std::sync::Arc;

use fxhash::FxHashMap;
use serde::Deserialize;

use crate::address_space::{
    AddressSpace, BrowseDescription, CallMethodRequest, CallMethodResult, CallerContext,
    DataValue, HistoryReadPage, HistoryReadRequest, NodeId, ReadValueId, ReferenceDescription,
    TimestampsToReturn, WriteValue,
};
use crate::continuation::{ContinuationPoint, ContinuationPointManager};
use crate::publish::{
    PublishEngine, PublishRequest, PublishResponse, RepublishError, RetentionPolicy,
    RetiredSubscription,
};
use crate::sampling::SamplingScheduler;
use crate::session::{Session, SessionId};
use crate::status::StatusCode;
use crate::subscription::{
    MonitoredItem, MonitoredItemId, Notification, ObserverId, Subscription, SubscriptionEvent,
    SubscriptionId, SubscriptionObserver, SubscriptionParams,
};
use crate::transfer::{self, SessionIdentity};

// ---------------------------------------------------------------------------
// ServerLimits
// ---------------------------------------------------------------------------

/// Operational limits, loadable from configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerLimits {
    /// Floor for revised publishing intervals.
    pub min_publishing_interval_ms: i64,
    /// Floor for revised sampling intervals.
    pub min_sampling_interval_ms: i64,
    /// Bound of each subscription's pending notification queue.
    pub max_queued_notifications: usize,
    /// Bound of each subscription's retransmission cache.
    pub max_retransmission_queue: usize,
    /// Bound of each session's publish request FIFO.
    pub max_queued_publish_requests: usize,
    /// Ceiling for revised monitored item queue sizes.
    pub max_item_queue_size: usize,
    /// Age after which unread continuation points are purged.
    pub continuation_max_age_ms: i64,
    /// Whether subscriptions survive their session for later transfer.
    pub retain_orphaned_subscriptions: bool,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            min_publishing_interval_ms: 50,
            min_sampling_interval_ms: 10,
            max_queued_notifications: 1024,
            max_retransmission_queue: 256,
            max_queued_publish_requests: 64,
            max_item_queue_size: 128,
            continuation_max_age_ms: 600_000,
            retain_orphaned_subscriptions: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation payloads
// ---------------------------------------------------------------------------

/// One monitored item to create.
#[derive(Debug, Clone)]
pub struct MonitoredItemCreateRequest {
    /// The node to sample.
    pub node: NodeId,
    /// Requested sampling interval in milliseconds.
    pub sampling_interval_ms: i64,
    /// Requested queue size.
    pub queue_size: usize,
}

/// Per-item result of a create-monitored-items call.
#[derive(Debug)]
pub struct MonitoredItemCreateResult {
    /// Per-item status.
    pub status: StatusCode,
    /// Assigned id when the item was created.
    pub id: Option<MonitoredItemId>,
    /// Sampling interval after server revision.
    pub revised_sampling_interval_ms: i64,
    /// Queue size after server revision.
    pub revised_queue_size: usize,
}

impl MonitoredItemCreateResult {
    fn rejected(status: StatusCode) -> Self {
        Self {
            status,
            id: None,
            revised_sampling_interval_ms: 0,
            revised_queue_size: 0,
        }
    }
}

/// One monitored item to modify.
#[derive(Debug, Clone)]
pub struct MonitoredItemModifyRequest {
    /// The item to modify.
    pub id: MonitoredItemId,
    /// Requested sampling interval in milliseconds.
    pub sampling_interval_ms: i64,
    /// Requested queue size.
    pub queue_size: usize,
}

/// Per-item result of a modify-monitored-items call.
#[derive(Debug)]
pub struct MonitoredItemModifyResult {
    /// Per-item status.
    pub status: StatusCode,
    /// Sampling interval after server revision.
    pub revised_sampling_interval_ms: i64,
    /// Queue size after server revision.
    pub revised_queue_size: usize,
}

impl MonitoredItemModifyResult {
    fn rejected(status: StatusCode) -> Self {
        Self {
            status,
            revised_sampling_interval_ms: 0,
            revised_queue_size: 0,
        }
    }
}

/// Outcome of a publish call.
#[derive(Debug)]
pub enum PublishOutcome {
    /// The request (or an older one it displaced) was answered immediately.
    Responded(Vec<PublishResponse>),
    /// The request was queued; a later tick will consume it.
    Pending,
}

/// Per-subscription result of a transfer call.
#[derive(Debug)]
pub struct TransferResult {
    /// Per-subscription status.
    pub status: StatusCode,
    /// Retransmission sequence numbers preserved across the transfer.
    pub available_sequence_numbers: Vec<u32>,
}

impl TransferResult {
    fn rejected(status: StatusCode) -> Self {
        Self {
            status,
            available_sequence_numbers: Vec::new(),
        }
    }
}

/// One page of browse references handed to the client.
#[derive(Debug)]
pub struct BrowsePage {
    /// Per-node status.
    pub status: StatusCode,
    /// References of this page.
    pub references: Vec<ReferenceDescription>,
    /// Continuation token when more references remain.
    pub continuation: Option<ContinuationPoint>,
}

impl BrowsePage {
    fn rejected(status: StatusCode) -> Self {
        Self {
            status,
            references: Vec::new(),
            continuation: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Orphan bookkeeping
// ---------------------------------------------------------------------------

/// Which engine currently owns a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Session(SessionId),
    Orphaned,
}

/// Logs lifetime expiry of subscriptions that died without an owner.
struct OrphanExpiryLog;

impl SubscriptionObserver for OrphanExpiryLog {
    fn on_event(&self, subscription: SubscriptionId, event: &SubscriptionEvent) {
        if matches!(event, SubscriptionEvent::Expired) {
            tracing::info!("{subscription} expired while orphaned");
        }
    }
}

// ---------------------------------------------------------------------------
// SubscriptionServer
// ---------------------------------------------------------------------------

/// The service façade owning sessions, subscriptions, sampling, and
/// pagination state.
pub struct SubscriptionServer {
    limits: ServerLimits,
    address_space: Arc<dyn AddressSpace>,

    sessions: FxHashMap<SessionId, Session>,
    orphans: PublishEngine,
    /// Expiry-log observer handle per orphaned subscription.
    orphan_watch: FxHashMap<SubscriptionId, ObserverId>,

    scheduler: SamplingScheduler,
    browse_continuations: ContinuationPointManager<ReferenceDescription>,
    history_continuations: ContinuationPointManager<DataValue>,

    /// Reverse indexes for routing completions and transfers.
    item_owner: FxHashMap<MonitoredItemId, SubscriptionId>,
    sub_owner: FxHashMap<SubscriptionId, Owner>,

    next_session: u32,
    next_subscription: u32,
    next_item: u32,
}

impl SubscriptionServer {
    /// Creates a server over the given address space.
    #[must_use]
    pub fn new(limits: ServerLimits, address_space: Arc<dyn AddressSpace>) -> Self {
        Self {
            limits,
            address_space,
            sessions: FxHashMap::default(),
            orphans: PublishEngine::orphanage(),
            orphan_watch: FxHashMap::default(),
            scheduler: SamplingScheduler::new(),
            browse_continuations: ContinuationPointManager::new(),
            history_continuations: ContinuationPointManager::new(),
            item_owner: FxHashMap::default(),
            sub_owner: FxHashMap::default(),
            next_session: 1,
            next_subscription: 1,
            next_item: 1,
        }
    }

    /// Returns the configured limits.
    #[must_use]
    pub fn limits(&self) -> &ServerLimits {
        &self.limits
    }

    /// Returns the number of subscriptions currently without an owner.
    #[must_use]
    pub fn orphan_count(&self) -> usize {
        self.orphans.subscription_count()
    }

    /// Returns the number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // --- sessions --------------------------------------------------------

    /// Opens a session authenticated with the given identity.
    pub fn create_session(&mut self, identity: SessionIdentity) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let retention = if self.limits.retain_orphaned_subscriptions {
            RetentionPolicy::RetainForTransfer
        } else {
            RetentionPolicy::DestroyOnDetach
        };
        let engine =
            PublishEngine::for_session(id, retention, self.limits.max_queued_publish_requests);
        self.sessions.insert(id, Session::new(id, identity, engine));
        tracing::debug!("{id} opened");
        id
    }

    /// Closes a session. Live subscriptions are orphaned or disposed per the
    /// retention policy; still-queued publish requests fail with
    /// `BadSessionClosed` and are returned for the transport to flush.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session.
    pub fn close_session(&mut self, id: SessionId) -> Result<Vec<PublishResponse>, StatusCode> {
        let mut session = self
            .sessions
            .remove(&id)
            .ok_or(StatusCode::BadSessionIdInvalid)?;
        let outcome = session.engine_mut().close_owner();

        for retired in &outcome.retired {
            self.cleanup_retired(retired);
        }
        for mut sub in outcome.detached {
            let sub_id = sub.id();
            let watch = sub.register_observer(Box::new(OrphanExpiryLog));
            self.orphan_watch.insert(sub_id, watch);
            self.sub_owner.insert(sub_id, Owner::Orphaned);
            self.orphans.adopt(sub);
            tracing::debug!("{sub_id} orphaned by {id} closing");
        }
        tracing::debug!("{id} closed");
        Ok(outcome.failed_requests)
    }

    // --- subscriptions ---------------------------------------------------

    /// Creates a subscription for a session and returns its id along with
    /// the revised parameters.
    ///
    /// Revision rules: the publishing interval is raised to the configured
    /// floor, the keep-alive count to at least one cycle, and the lifetime
    /// count to at least three keep-alive periods.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session.
    pub fn create_subscription(
        &mut self,
        session: SessionId,
        requested: SubscriptionParams,
        now: i64,
    ) -> Result<(SubscriptionId, SubscriptionParams), StatusCode> {
        let identity = self
            .sessions
            .get(&session)
            .ok_or(StatusCode::BadSessionIdInvalid)?
            .identity()
            .clone();

        let params = self.revise_params(requested);
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;

        let mut sub = Subscription::new(
            id,
            params,
            self.limits.max_queued_notifications,
            self.limits.max_retransmission_queue,
            now,
        );
        sub.attach(session, identity);

        let engine = self
            .sessions
            .get_mut(&session)
            .expect("session existence was checked")
            .engine_mut();
        engine.adopt(sub);
        self.sub_owner.insert(id, Owner::Session(session));
        tracing::debug!("{id} created for {session}");
        Ok((id, params))
    }

    /// Applies revised parameters to a live subscription.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session,
    /// `BadSubscriptionIdInvalid` when the session does not own the
    /// subscription.
    pub fn modify_subscription(
        &mut self,
        session: SessionId,
        id: SubscriptionId,
        requested: SubscriptionParams,
        now: i64,
    ) -> Result<SubscriptionParams, StatusCode> {
        let params = self.revise_params(requested);
        let sub = self
            .session_engine_mut(session)?
            .subscription_mut(id)
            .ok_or(StatusCode::BadSubscriptionIdInvalid)?;
        sub.modify(params, now);
        Ok(params)
    }

    /// Deletes subscriptions owned by the session, one status per id.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session, `BadNothingToDo` for an
    /// empty batch.
    pub fn delete_subscriptions(
        &mut self,
        session: SessionId,
        ids: &[SubscriptionId],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        if ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        self.session_engine_mut(session)?;

        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let retired = self
                .sessions
                .get_mut(&session)
                .expect("session existence was checked")
                .engine_mut()
                .delete_subscription(id);
            match retired {
                Some(retired) => {
                    self.cleanup_retired(&retired);
                    results.push(StatusCode::Good);
                }
                None => results.push(StatusCode::BadSubscriptionIdInvalid),
            }
        }
        Ok(results)
    }

    /// Enables or disables publishing on subscriptions, one status per id.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session, `BadNothingToDo` for an
    /// empty batch.
    pub fn set_publishing_mode(
        &mut self,
        session: SessionId,
        ids: &[SubscriptionId],
        enabled: bool,
    ) -> Result<Vec<StatusCode>, StatusCode> {
        if ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let engine = self.session_engine_mut(session)?;

        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            match engine.subscription_mut(id) {
                Some(sub) => {
                    sub.set_publishing_mode(enabled);
                    results.push(StatusCode::Good);
                }
                None => results.push(StatusCode::BadSubscriptionIdInvalid),
            }
        }
        Ok(results)
    }

    // --- monitored items -------------------------------------------------

    /// Creates monitored items on a subscription, one result per request.
    ///
    /// Items with a non-positive sampling interval are rejected individually
    /// with `BadSamplingIntervalInvalid`; valid siblings in the same batch
    /// are still created.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session,
    /// `BadSubscriptionIdInvalid` when the session does not own the
    /// subscription, `BadNothingToDo` for an empty batch.
    pub fn create_monitored_items(
        &mut self,
        session: SessionId,
        subscription: SubscriptionId,
        requests: Vec<MonitoredItemCreateRequest>,
        now: i64,
    ) -> Result<Vec<MonitoredItemCreateResult>, StatusCode> {
        if requests.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        if !self.session_engine_mut(session)?.contains(subscription) {
            return Err(StatusCode::BadSubscriptionIdInvalid);
        }

        let mut results = Vec::with_capacity(requests.len());
        for req in requests {
            if req.sampling_interval_ms <= 0 {
                results.push(MonitoredItemCreateResult::rejected(
                    StatusCode::BadSamplingIntervalInvalid,
                ));
                continue;
            }
            let interval = req
                .sampling_interval_ms
                .max(self.limits.min_sampling_interval_ms);
            let queue_size = req.queue_size.clamp(1, self.limits.max_item_queue_size);

            let id = MonitoredItemId(self.next_item);
            self.next_item += 1;
            self.scheduler
                .register(id, interval, now)
                .expect("interval was clamped positive");

            let item = MonitoredItem::new(id, req.node, interval, queue_size);
            self.sessions
                .get_mut(&session)
                .expect("session existence was checked")
                .engine_mut()
                .subscription_mut(subscription)
                .expect("subscription ownership was checked")
                .add_item(item);
            self.item_owner.insert(id, subscription);

            results.push(MonitoredItemCreateResult {
                status: StatusCode::Good,
                id: Some(id),
                revised_sampling_interval_ms: interval,
                revised_queue_size: queue_size,
            });
        }
        Ok(results)
    }

    /// Modifies monitored items on a subscription, one result per request.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session,
    /// `BadSubscriptionIdInvalid` when the session does not own the
    /// subscription, `BadNothingToDo` for an empty batch.
    pub fn modify_monitored_items(
        &mut self,
        session: SessionId,
        subscription: SubscriptionId,
        requests: Vec<MonitoredItemModifyRequest>,
        now: i64,
    ) -> Result<Vec<MonitoredItemModifyResult>, StatusCode> {
        if requests.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        if !self.session_engine_mut(session)?.contains(subscription) {
            return Err(StatusCode::BadSubscriptionIdInvalid);
        }

        let mut results = Vec::with_capacity(requests.len());
        for req in requests {
            if self.item_owner.get(&req.id) != Some(&subscription) {
                results.push(MonitoredItemModifyResult::rejected(
                    StatusCode::BadMonitoredItemIdInvalid,
                ));
                continue;
            }
            if req.sampling_interval_ms <= 0 {
                results.push(MonitoredItemModifyResult::rejected(
                    StatusCode::BadSamplingIntervalInvalid,
                ));
                continue;
            }
            let interval = req
                .sampling_interval_ms
                .max(self.limits.min_sampling_interval_ms);
            let queue_size = req.queue_size.clamp(1, self.limits.max_item_queue_size);

            let item = self
                .sessions
                .get_mut(&session)
                .expect("session existence was checked")
                .engine_mut()
                .subscription_mut(subscription)
                .expect("subscription ownership was checked")
                .item_mut(req.id);
            let Some(item) = item else {
                results.push(MonitoredItemModifyResult::rejected(
                    StatusCode::BadMonitoredItemIdInvalid,
                ));
                continue;
            };
            item.modify(interval, queue_size);
            self.scheduler
                .register(req.id, interval, now)
                .expect("interval was clamped positive");

            results.push(MonitoredItemModifyResult {
                status: StatusCode::Good,
                revised_sampling_interval_ms: interval,
                revised_queue_size: queue_size,
            });
        }
        Ok(results)
    }

    /// Deletes monitored items from a subscription, one status per id.
    ///
    /// The shared sampler timer of an interval is cancelled when the last
    /// member leaves; an in-flight sample for a deleted item becomes a no-op
    /// via the item's liveness flag.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session,
    /// `BadSubscriptionIdInvalid` when the session does not own the
    /// subscription, `BadNothingToDo` for an empty batch.
    pub fn delete_monitored_items(
        &mut self,
        session: SessionId,
        subscription: SubscriptionId,
        ids: &[MonitoredItemId],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        if ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        if !self.session_engine_mut(session)?.contains(subscription) {
            return Err(StatusCode::BadSubscriptionIdInvalid);
        }

        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            if self.item_owner.get(&id) != Some(&subscription) {
                results.push(StatusCode::BadMonitoredItemIdInvalid);
                continue;
            }
            let removed = self
                .sessions
                .get_mut(&session)
                .expect("session existence was checked")
                .engine_mut()
                .subscription_mut(subscription)
                .expect("subscription ownership was checked")
                .remove_item(id);
            match removed {
                Some(_) => {
                    self.scheduler.deregister(id);
                    self.item_owner.remove(&id);
                    results.push(StatusCode::Good);
                }
                None => results.push(StatusCode::BadMonitoredItemIdInvalid),
            }
        }
        Ok(results)
    }

    // --- publish / republish ---------------------------------------------

    /// Queues a publish request for the session's engine. A subscription
    /// already waiting for a request (a late backlog or a held keep-alive)
    /// is serviced immediately.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session.
    pub fn publish(
        &mut self,
        session: SessionId,
        request: PublishRequest,
        now: i64,
    ) -> Result<PublishOutcome, StatusCode> {
        let out = self.session_engine_mut(session)?.enqueue_request(request, now);
        if out.responses.is_empty() {
            Ok(PublishOutcome::Pending)
        } else {
            Ok(PublishOutcome::Responded(out.responses))
        }
    }

    /// Retransmits a cached notification.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session,
    /// `BadSubscriptionIdInvalid` when the session does not own the
    /// subscription, `BadMessageNotAvailable` when the sequence number fell
    /// out of the retransmission window.
    pub fn republish(
        &self,
        session: SessionId,
        subscription: SubscriptionId,
        sequence_number: u32,
    ) -> Result<Notification, StatusCode> {
        let engine = self
            .sessions
            .get(&session)
            .ok_or(StatusCode::BadSessionIdInvalid)?
            .engine();
        engine
            .republish(subscription, sequence_number)
            .map_err(|e| match e {
                RepublishError::SubscriptionIdInvalid => StatusCode::BadSubscriptionIdInvalid,
                RepublishError::MessageNotAvailable => StatusCode::BadMessageNotAvailable,
            })
    }

    // --- transfer --------------------------------------------------------

    /// Transfers subscriptions to a session, one result per id.
    ///
    /// A subscription may be reclaimed from the orphan pool or taken from
    /// another live session, provided its last owner's identity is
    /// compatible with the destination's; an incompatible (or uncheckable)
    /// pairing yields `BadUserAccessDenied`. Sequence numbering, pending
    /// notifications, and the retransmission cache survive the move. With
    /// `send_initial_values` each item re-queues its most recent sample.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session, `BadNothingToDo` for an
    /// empty batch.
    pub fn transfer_subscriptions(
        &mut self,
        session: SessionId,
        ids: &[SubscriptionId],
        send_initial_values: bool,
    ) -> Result<Vec<TransferResult>, StatusCode> {
        if ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let dest_identity = self
            .sessions
            .get(&session)
            .ok_or(StatusCode::BadSessionIdInvalid)?
            .identity()
            .clone();

        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let Some(&owner) = self.sub_owner.get(&id) else {
                results.push(TransferResult::rejected(
                    StatusCode::BadSubscriptionIdInvalid,
                ));
                continue;
            };

            if owner == Owner::Session(session) {
                // Already owned by the destination.
                let seqs = self
                    .engine_for(owner)
                    .and_then(|e| e.subscription(id))
                    .map(Subscription::available_sequence_numbers)
                    .unwrap_or_default();
                results.push(TransferResult {
                    status: StatusCode::Good,
                    available_sequence_numbers: seqs,
                });
                continue;
            }

            let source_identity: Option<SessionIdentity> = self
                .engine_for(owner)
                .and_then(|e| e.subscription(id))
                .and_then(|s| s.owner_identity().cloned());
            match transfer::compatible(source_identity.as_ref(), &dest_identity) {
                Ok(true) => {}
                Ok(false) => {
                    results.push(TransferResult::rejected(StatusCode::BadUserAccessDenied));
                    continue;
                }
                Err(e) => {
                    tracing::error!("transfer compatibility check failed for {id}: {e}");
                    results.push(TransferResult::rejected(StatusCode::BadUserAccessDenied));
                    continue;
                }
            }

            let taken = match self.engine_for_mut(owner) {
                Some(engine) => engine.take(id),
                None => None,
            };
            let Some(mut sub) = taken else {
                results.push(TransferResult::rejected(
                    StatusCode::BadSubscriptionIdInvalid,
                ));
                continue;
            };

            if let Some(watch) = self.orphan_watch.remove(&id) {
                sub.deregister_observer(watch);
            }
            sub.attach(session, dest_identity.clone());
            if send_initial_values {
                for item_id in sub.item_ids() {
                    if let Some(item) = sub.item_mut(item_id) {
                        item.requeue_last();
                    }
                }
            }
            let seqs = sub.available_sequence_numbers();
            self.sessions
                .get_mut(&session)
                .expect("session existence was checked")
                .engine_mut()
                .adopt(sub);
            self.sub_owner.insert(id, Owner::Session(session));
            tracing::debug!("{id} transferred to {session}");

            results.push(TransferResult {
                status: StatusCode::Good,
                available_sequence_numbers: seqs,
            });
        }
        Ok(results)
    }

    // --- address-space passthroughs --------------------------------------

    /// Browses nodes, paginating each node's references.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session, `BadNothingToDo` for an
    /// empty batch.
    pub fn browse(
        &mut self,
        session: SessionId,
        nodes: &[BrowseDescription],
        max_references_per_node: usize,
        now: i64,
    ) -> Result<Vec<BrowsePage>, StatusCode> {
        self.require_session(session)?;
        if nodes.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let ctx = CallerContext {
            session: Some(session),
        };
        let results = self.address_space.browse(&ctx, nodes);

        let mut pages = Vec::with_capacity(results.len());
        for result in results {
            if result.status.is_bad() {
                pages.push(BrowsePage::rejected(result.status));
                continue;
            }
            let page =
                self.browse_continuations
                    .register(max_references_per_node, result.references, now);
            pages.push(BrowsePage {
                status: result.status,
                references: page.items,
                continuation: page.token,
            });
        }
        Ok(pages)
    }

    /// Continues or releases a browse continuation point.
    pub fn browse_next(&mut self, token: &ContinuationPoint, release: bool) -> BrowsePage {
        if release {
            return match self.browse_continuations.cancel(token) {
                Ok(()) => BrowsePage::rejected(StatusCode::Good),
                Err(_) => BrowsePage::rejected(StatusCode::BadContinuationPointInvalid),
            };
        }
        match self.browse_continuations.get_next(token) {
            Ok(page) => BrowsePage {
                status: StatusCode::Good,
                references: page.items,
                continuation: page.token,
            },
            Err(_) => BrowsePage::rejected(StatusCode::BadContinuationPointInvalid),
        }
    }

    /// Reads attribute values.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session,
    /// `BadTimestampsToReturnInvalid` for an out-of-range selector,
    /// `BadNothingToDo` for an empty batch.
    pub fn read(
        &self,
        session: SessionId,
        ids: &[ReadValueId],
        timestamps: TimestampsToReturn,
    ) -> Result<Vec<DataValue>, StatusCode> {
        self.require_session(session)?;
        let selector = timestamps.validate();
        if selector.is_bad() {
            return Err(selector);
        }
        if ids.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let ctx = CallerContext {
            session: Some(session),
        };
        Ok(self.address_space.read(&ctx, ids, timestamps))
    }

    /// Writes attribute values, one status per item.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session, `BadNothingToDo` for an
    /// empty batch.
    pub fn write(
        &self,
        session: SessionId,
        writes: &[WriteValue],
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.require_session(session)?;
        if writes.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let ctx = CallerContext {
            session: Some(session),
        };
        Ok(self.address_space.write(&ctx, writes))
    }

    /// Invokes methods, one result per call.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session, `BadNothingToDo` for an
    /// empty batch.
    pub fn call(
        &self,
        session: SessionId,
        calls: &[CallMethodRequest],
    ) -> Result<Vec<CallMethodResult>, StatusCode> {
        self.require_session(session)?;
        if calls.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }
        let ctx = CallerContext {
            session: Some(session),
        };
        Ok(self.address_space.call(&ctx, calls))
    }

    /// Reads node histories, paginating each node's values.
    ///
    /// A request with an invalid aggregate configuration is rejected
    /// per-item with `BadAggregateInvalidInputs` before any dispatch; valid
    /// siblings still run.
    ///
    /// # Errors
    ///
    /// `BadSessionIdInvalid` for an unknown session,
    /// `BadTimestampsToReturnInvalid` for an out-of-range selector,
    /// `BadNothingToDo` for an empty batch.
    pub fn history_read(
        &mut self,
        session: SessionId,
        requests: Vec<HistoryReadRequest>,
        timestamps: TimestampsToReturn,
        page_size: usize,
        now: i64,
    ) -> Result<Vec<HistoryReadPage>, StatusCode> {
        self.require_session(session)?;
        let selector = timestamps.validate();
        if selector.is_bad() {
            return Err(selector);
        }
        if requests.is_empty() {
            return Err(StatusCode::BadNothingToDo);
        }

        // Reject invalid aggregates up front, dispatch only the rest.
        let mut valid: Vec<(usize, HistoryReadRequest)> = Vec::with_capacity(requests.len());
        let mut pages: Vec<HistoryReadPage> = requests
            .iter()
            .map(|_| HistoryReadPage {
                status: StatusCode::BadAggregateInvalidInputs,
                values: Vec::new(),
                continuation: None,
            })
            .collect();
        for (index, request) in requests.into_iter().enumerate() {
            let ok = request
                .aggregate
                .as_ref()
                .map_or(true, |a| !a.validate().is_bad());
            if ok {
                valid.push((index, request));
            }
        }

        let ctx = CallerContext {
            session: Some(session),
        };
        let batch: Vec<HistoryReadRequest> = valid.iter().map(|(_, r)| r.clone()).collect();
        let results = self.address_space.history_read(&ctx, &batch);

        for ((index, _), result) in valid.into_iter().zip(results) {
            if result.status.is_bad() {
                pages[index] = HistoryReadPage {
                    status: result.status,
                    values: Vec::new(),
                    continuation: None,
                };
                continue;
            }
            let page = self
                .history_continuations
                .register(page_size, result.values, now);
            pages[index] = HistoryReadPage {
                status: result.status,
                values: page.items,
                continuation: page.token,
            };
        }
        Ok(pages)
    }

    /// Continues or releases a history continuation point.
    pub fn history_read_next(
        &mut self,
        token: &ContinuationPoint,
        release: bool,
    ) -> HistoryReadPage {
        if release {
            let status = match self.history_continuations.cancel(token) {
                Ok(()) => StatusCode::Good,
                Err(_) => StatusCode::BadContinuationPointInvalid,
            };
            return HistoryReadPage {
                status,
                values: Vec::new(),
                continuation: None,
            };
        }
        match self.history_continuations.get_next(token) {
            Ok(page) => HistoryReadPage {
                status: StatusCode::Good,
                values: page.items,
                continuation: page.token,
            },
            Err(_) => HistoryReadPage {
                status: StatusCode::BadContinuationPointInvalid,
                values: Vec::new(),
                continuation: None,
            },
        }
    }

    // --- events ----------------------------------------------------------

    /// Queues event notifications on a subscription, wherever it currently
    /// lives (session or orphan pool).
    ///
    /// # Errors
    ///
    /// `BadSubscriptionIdInvalid` for an unknown subscription.
    pub fn post_events(
        &mut self,
        subscription: SubscriptionId,
        events: Vec<crate::subscription::EventNotification>,
        now: i64,
    ) -> Result<(), StatusCode> {
        let sub = self
            .subscription_mut(subscription)
            .ok_or(StatusCode::BadSubscriptionIdInvalid)?;
        sub.post_events(events, now);
        Ok(())
    }

    // --- sampling --------------------------------------------------------

    /// Routes one resolved sample to its monitored item.
    ///
    /// The item's liveness flag makes a completion for an already deleted
    /// item a no-op, so late completions need no coordination with the
    /// scheduler.
    pub fn complete_sample(&mut self, item: MonitoredItemId, value: DataValue) {
        let Some(&subscription) = self.item_owner.get(&item) else {
            return;
        };
        let Some(sub) = self.subscription_mut(subscription) else {
            return;
        };
        if let Some(item) = sub.item_mut(item) {
            item.enqueue(value);
        }
    }

    fn run_sampling(&mut self, now: i64) {
        let tasks = self.scheduler.poll(now);
        if tasks.is_empty() {
            return;
        }
        let address_space = Arc::clone(&self.address_space);
        for task in tasks {
            let Some(&subscription) = self.item_owner.get(&task.item) else {
                continue;
            };
            let Some((node, session)) = self
                .subscription_mut(subscription)
                .and_then(|sub| {
                    let session = sub.session();
                    sub.item_mut(task.item).map(|i| (i.node().clone(), session))
                })
            else {
                continue;
            };

            let ctx = CallerContext { session };
            let mut values = address_space.read(
                &ctx,
                &[ReadValueId::value_of(node)],
                TimestampsToReturn::Source,
            );
            match values.pop() {
                Some(value) => self.complete_sample(task.item, value),
                None => tracing::warn!("sample read for {} returned no value", task.item),
            }
        }
    }

    // --- tick ------------------------------------------------------------

    /// Runs one server cycle: sampling, then every engine's publishing pass,
    /// then continuation point expiry. Returns the responses to deliver,
    /// tagged with the session they belong to (`None` for the orphan pool,
    /// which never holds requests).
    pub fn tick(&mut self, now: i64) -> Vec<(Option<SessionId>, PublishResponse)> {
        self.run_sampling(now);

        let mut responses: Vec<(Option<SessionId>, PublishResponse)> = Vec::new();
        let session_ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session in session_ids {
            let Some(s) = self.sessions.get_mut(&session) else {
                continue;
            };
            let out = s.engine_mut().tick(now);
            for retired in &out.retired {
                self.cleanup_retired(retired);
            }
            responses.extend(out.responses.into_iter().map(|r| (Some(session), r)));
        }

        let out = self.orphans.tick(now);
        for retired in &out.retired {
            self.cleanup_retired(retired);
        }
        responses.extend(out.responses.into_iter().map(|r| (None, r)));

        self.browse_continuations
            .purge_expired(now, self.limits.continuation_max_age_ms);
        self.history_continuations
            .purge_expired(now, self.limits.continuation_max_age_ms);

        responses
    }

    /// Drives [`SubscriptionServer::tick`] on a tokio interval until the
    /// shutdown channel flips to `true` (or its sender is dropped), handing
    /// each response to `sink`. Time is measured from loop start in
    /// milliseconds. Returns the server for inspection or reuse.
    pub async fn run<F>(
        mut self,
        tick_every: std::time::Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        mut sink: F,
    ) -> Self
    where
        F: FnMut(Option<SessionId>, PublishResponse),
    {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(tick_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("publishing loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
                    for (session, response) in self.tick(now) {
                        sink(session, response);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("publishing loop stopped");
        self.scheduler.clear();
        self
    }

    // --- internals -------------------------------------------------------

    fn revise_params(&self, requested: SubscriptionParams) -> SubscriptionParams {
        let max_keep_alive_count = requested.max_keep_alive_count.max(1);
        SubscriptionParams {
            publishing_interval_ms: requested
                .publishing_interval_ms
                .max(self.limits.min_publishing_interval_ms),
            lifetime_count: requested
                .lifetime_count
                .max(max_keep_alive_count.saturating_mul(3)),
            max_keep_alive_count,
            ..requested
        }
    }

    fn require_session(&self, session: SessionId) -> Result<(), StatusCode> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(StatusCode::BadSessionIdInvalid)
        }
    }

    fn session_engine_mut(&mut self, session: SessionId) -> Result<&mut PublishEngine, StatusCode> {
        self.sessions
            .get_mut(&session)
            .map(Session::engine_mut)
            .ok_or(StatusCode::BadSessionIdInvalid)
    }

    fn engine_for(&self, owner: Owner) -> Option<&PublishEngine> {
        match owner {
            Owner::Session(session) => self.sessions.get(&session).map(Session::engine),
            Owner::Orphaned => Some(&self.orphans),
        }
    }

    fn engine_for_mut(&mut self, owner: Owner) -> Option<&mut PublishEngine> {
        match owner {
            Owner::Session(session) => self.sessions.get_mut(&session).map(Session::engine_mut),
            Owner::Orphaned => Some(&mut self.orphans),
        }
    }

    fn subscription_mut(&mut self, id: SubscriptionId) -> Option<&mut Subscription> {
        let owner = *self.sub_owner.get(&id)?;
        self.engine_for_mut(owner)?.subscription_mut(id)
    }

    fn cleanup_retired(&mut self, retired: &RetiredSubscription) {
        for &item in &retired.items {
            self.scheduler.deregister(item);
            self.item_owner.remove(&item);
        }
        self.sub_owner.remove(&retired.id);
        self.orphan_watch.remove(&retired.id);
    }
}

// ---------------------------------------------------------------------------
// Service dispatch
// ---------------------------------------------------------------------------

/// A service request, as decoded from the wire by the transport layer.
#[derive(Debug)]
pub enum ServiceRequest {
    /// Create a subscription.
    CreateSubscription {
        /// Requested parameters.
        params: SubscriptionParams,
    },
    /// Modify a subscription.
    ModifySubscription {
        /// The subscription to modify.
        subscription: SubscriptionId,
        /// Requested parameters.
        params: SubscriptionParams,
    },
    /// Delete subscriptions.
    DeleteSubscriptions {
        /// The subscriptions to delete.
        subscriptions: Vec<SubscriptionId>,
    },
    /// Enable or disable publishing.
    SetPublishingMode {
        /// The subscriptions to change.
        subscriptions: Vec<SubscriptionId>,
        /// The new mode.
        enabled: bool,
    },
    /// Create monitored items.
    CreateMonitoredItems {
        /// The owning subscription.
        subscription: SubscriptionId,
        /// The items to create.
        items: Vec<MonitoredItemCreateRequest>,
    },
    /// Modify monitored items.
    ModifyMonitoredItems {
        /// The owning subscription.
        subscription: SubscriptionId,
        /// The modifications.
        items: Vec<MonitoredItemModifyRequest>,
    },
    /// Delete monitored items.
    DeleteMonitoredItems {
        /// The owning subscription.
        subscription: SubscriptionId,
        /// The items to delete.
        items: Vec<MonitoredItemId>,
    },
    /// Queue a publish request.
    Publish {
        /// The request.
        request: PublishRequest,
    },
    /// Retransmit a cached notification.
    Republish {
        /// The subscription holding the cache.
        subscription: SubscriptionId,
        /// The cached sequence number.
        sequence_number: u32,
    },
    /// Transfer subscriptions to the calling session.
    TransferSubscriptions {
        /// The subscriptions to transfer.
        subscriptions: Vec<SubscriptionId>,
        /// Whether each item re-queues its last sample.
        send_initial_values: bool,
    },
    /// Browse node references.
    Browse {
        /// The nodes to browse.
        nodes: Vec<BrowseDescription>,
        /// Page size; `0` is unbounded.
        max_references_per_node: usize,
    },
    /// Continue or release a browse continuation point.
    BrowseNext {
        /// The token from a previous page.
        token: ContinuationPoint,
        /// `true` to release without reading.
        release: bool,
    },
    /// Read attribute values.
    Read {
        /// The attributes to read.
        ids: Vec<ReadValueId>,
        /// Timestamp selector.
        timestamps: TimestampsToReturn,
    },
    /// Write attribute values.
    Write {
        /// The writes to apply.
        writes: Vec<WriteValue>,
    },
    /// Invoke methods.
    Call {
        /// The invocations.
        calls: Vec<CallMethodRequest>,
    },
    /// Read node histories.
    HistoryRead {
        /// The nodes whose history is requested.
        requests: Vec<HistoryReadRequest>,
        /// Timestamp selector.
        timestamps: TimestampsToReturn,
        /// Page size; `0` is unbounded.
        page_size: usize,
    },
    /// Continue or release a history continuation point.
    HistoryReadNext {
        /// The token from a previous page.
        token: ContinuationPoint,
        /// `true` to release without reading.
        release: bool,
    },
}

/// The response to one [`ServiceRequest`], mirrored arm for arm.
#[derive(Debug)]
pub enum ServiceResponse {
    /// Response to [`ServiceRequest::CreateSubscription`].
    CreateSubscription(Result<(SubscriptionId, SubscriptionParams), StatusCode>),
    /// Response to [`ServiceRequest::ModifySubscription`].
    ModifySubscription(Result<SubscriptionParams, StatusCode>),
    /// Response to [`ServiceRequest::DeleteSubscriptions`].
    DeleteSubscriptions(Result<Vec<StatusCode>, StatusCode>),
    /// Response to [`ServiceRequest::SetPublishingMode`].
    SetPublishingMode(Result<Vec<StatusCode>, StatusCode>),
    /// Response to [`ServiceRequest::CreateMonitoredItems`].
    CreateMonitoredItems(Result<Vec<MonitoredItemCreateResult>, StatusCode>),
    /// Response to [`ServiceRequest::ModifyMonitoredItems`].
    ModifyMonitoredItems(Result<Vec<MonitoredItemModifyResult>, StatusCode>),
    /// Response to [`ServiceRequest::DeleteMonitoredItems`].
    DeleteMonitoredItems(Result<Vec<StatusCode>, StatusCode>),
    /// Response to [`ServiceRequest::Publish`].
    Publish(Result<PublishOutcome, StatusCode>),
    /// Response to [`ServiceRequest::Republish`].
    Republish(Result<Notification, StatusCode>),
    /// Response to [`ServiceRequest::TransferSubscriptions`].
    TransferSubscriptions(Result<Vec<TransferResult>, StatusCode>),
    /// Response to [`ServiceRequest::Browse`].
    Browse(Result<Vec<BrowsePage>, StatusCode>),
    /// Response to [`ServiceRequest::BrowseNext`].
    BrowseNext(BrowsePage),
    /// Response to [`ServiceRequest::Read`].
    Read(Result<Vec<DataValue>, StatusCode>),
    /// Response to [`ServiceRequest::Write`].
    Write(Result<Vec<StatusCode>, StatusCode>),
    /// Response to [`ServiceRequest::Call`].
    Call(Result<Vec<CallMethodResult>, StatusCode>),
    /// Response to [`ServiceRequest::HistoryRead`].
    HistoryRead(Result<Vec<HistoryReadPage>, StatusCode>),
    /// Response to [`ServiceRequest::HistoryReadNext`].
    HistoryReadNext(HistoryReadPage),
}

impl SubscriptionServer {
    /// Routes one decoded service request to its handler. The match is
    /// exhaustive, so adding a request kind without a handler fails to
    /// compile.
    pub fn dispatch(
        &mut self,
        session: SessionId,
        request: ServiceRequest,
        now: i64,
    ) -> ServiceResponse {
        match request {
            ServiceRequest::CreateSubscription { params } => ServiceResponse::CreateSubscription(
                self.create_subscription(session, params, now),
            ),
            ServiceRequest::ModifySubscription {
                subscription,
                params,
            } => ServiceResponse::ModifySubscription(
                self.modify_subscription(session, subscription, params, now),
            ),
            ServiceRequest::DeleteSubscriptions { subscriptions } => {
                ServiceResponse::DeleteSubscriptions(
                    self.delete_subscriptions(session, &subscriptions),
                )
            }
            ServiceRequest::SetPublishingMode {
                subscriptions,
                enabled,
            } => ServiceResponse::SetPublishingMode(
                self.set_publishing_mode(session, &subscriptions, enabled),
            ),
            ServiceRequest::CreateMonitoredItems {
                subscription,
                items,
            } => ServiceResponse::CreateMonitoredItems(
                self.create_monitored_items(session, subscription, items, now),
            ),
            ServiceRequest::ModifyMonitoredItems {
                subscription,
                items,
            } => ServiceResponse::ModifyMonitoredItems(
                self.modify_monitored_items(session, subscription, items, now),
            ),
            ServiceRequest::DeleteMonitoredItems {
                subscription,
                items,
            } => ServiceResponse::DeleteMonitoredItems(
                self.delete_monitored_items(session, subscription, &items),
            ),
            ServiceRequest::Publish { request } => {
                ServiceResponse::Publish(self.publish(session, request, now))
            }
            ServiceRequest::Republish {
                subscription,
                sequence_number,
            } => ServiceResponse::Republish(self.republish(session, subscription, sequence_number)),
            ServiceRequest::TransferSubscriptions {
                subscriptions,
                send_initial_values,
            } => ServiceResponse::TransferSubscriptions(self.transfer_subscriptions(
                session,
                &subscriptions,
                send_initial_values,
            )),
            ServiceRequest::Browse {
                nodes,
                max_references_per_node,
            } => ServiceResponse::Browse(self.browse(
                session,
                &nodes,
                max_references_per_node,
                now,
            )),
            ServiceRequest::BrowseNext { token, release } => {
                ServiceResponse::BrowseNext(self.browse_next(&token, release))
            }
            ServiceRequest::Read { ids, timestamps } => {
                ServiceResponse::Read(self.read(session, &ids, timestamps))
            }
            ServiceRequest::Write { writes } => {
                ServiceResponse::Write(self.write(session, &writes))
            }
            ServiceRequest::Call { calls } => ServiceResponse::Call(self.call(session, &calls)),
            ServiceRequest::HistoryRead {
                requests,
                timestamps,
                page_size,
            } => ServiceResponse::HistoryRead(self.history_read(
                session,
                requests,
                timestamps,
                page_size,
                now,
            )),
            ServiceRequest::HistoryReadNext { token, release } => {
                ServiceResponse::HistoryReadNext(self.history_read_next(&token, release))
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
