//! Address-space collaborator surface.
//!
//! The subscription core does not own the addressable data model. It consumes
//! it through the [`AddressSpace`] trait: batched, status-coded operations for
//! browse, read, write, call, and history read. The server wraps oversized
//! browse and history results with the continuation manager before they reach
//! the client.
//!
//! Request validation that must happen *before* dispatch (timestamp selector,
//! aggregate configuration) lives here so every call site shares it.

use bytes::Bytes;
use serde::Serialize;

use crate::continuation::ContinuationPoint;
use crate::session::SessionId;
use crate::status::StatusCode;

// ---------------------------------------------------------------------------
// NodeId / Variant / DataValue
// ---------------------------------------------------------------------------

/// Identifier of a node in the address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(pub String);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A dynamically typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    /// No value.
    Null,
    /// Boolean.
    Boolean(bool),
    /// Signed 64-bit integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Blob(Bytes),
}

/// A sampled or read attribute value with its source timestamp and status.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    /// The value itself.
    pub value: Variant,
    /// Source timestamp in milliseconds.
    pub source_timestamp: i64,
    /// Quality of the value.
    pub status: StatusCode,
}

impl DataValue {
    /// Creates a `Good` value with the given source timestamp.
    #[must_use]
    pub fn good(value: Variant, source_timestamp: i64) -> Self {
        Self {
            value,
            source_timestamp,
            status: StatusCode::Good,
        }
    }
}

// ---------------------------------------------------------------------------
// TimestampsToReturn
// ---------------------------------------------------------------------------

/// Which timestamps a read-class operation should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampsToReturn {
    /// Source timestamps only.
    Source,
    /// Server timestamps only.
    Server,
    /// Both timestamps.
    Both,
    /// No timestamps.
    Neither,
    /// Out-of-range selector received on the wire.
    Invalid,
}

impl TimestampsToReturn {
    /// Validates the selector for use in a read-class call.
    #[must_use]
    pub fn validate(self) -> StatusCode {
        if self == TimestampsToReturn::Invalid {
            StatusCode::BadTimestampsToReturnInvalid
        } else {
            StatusCode::Good
        }
    }
}

// ---------------------------------------------------------------------------
// AggregateConfig
// ---------------------------------------------------------------------------

/// Aggregate configuration carried by history reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateConfig {
    /// Minimum percentage of good values in an interval.
    pub good_percent: f64,
    /// Maximum percentage of bad values in an interval.
    pub bad_percent: f64,
}

impl AggregateConfig {
    /// Validates the configuration before dispatch.
    ///
    /// Each percentage must lie in `[0, 100]` and the two together must
    /// reach at least 100, otherwise no interval could ever be classified.
    #[must_use]
    pub fn validate(&self) -> StatusCode {
        let in_range = |p: f64| (0.0..=100.0).contains(&p);
        if !in_range(self.good_percent)
            || !in_range(self.bad_percent)
            || self.good_percent + self.bad_percent < 100.0
        {
            StatusCode::BadAggregateInvalidInputs
        } else {
            StatusCode::Good
        }
    }
}

// ---------------------------------------------------------------------------
// Request / result batches
// ---------------------------------------------------------------------------

/// Caller context passed through to the address space.
#[derive(Debug, Clone, Copy)]
pub struct CallerContext {
    /// The session issuing the call; absent for server-internal reads such
    /// as sampling on behalf of an orphaned subscription.
    pub session: Option<SessionId>,
}

/// One node to browse.
#[derive(Debug, Clone)]
pub struct BrowseDescription {
    /// The node whose references are requested.
    pub node: NodeId,
}

/// One reference found while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDescription {
    /// Target node of the reference.
    pub target: NodeId,
    /// Display name of the target.
    pub display_name: String,
}

/// Result of browsing one node, before pagination.
#[derive(Debug)]
pub struct BrowseResult {
    /// Per-node status.
    pub status: StatusCode,
    /// All references of the node.
    pub references: Vec<ReferenceDescription>,
}

/// One attribute to read.
#[derive(Debug, Clone)]
pub struct ReadValueId {
    /// The node to read.
    pub node: NodeId,
    /// Attribute selector; `0` is the value attribute.
    pub attribute: u32,
}

impl ReadValueId {
    /// The value attribute of a node, the one monitored items sample.
    #[must_use]
    pub fn value_of(node: NodeId) -> Self {
        Self { node, attribute: 0 }
    }
}

/// One attribute write.
#[derive(Debug, Clone)]
pub struct WriteValue {
    /// The node to write.
    pub node: NodeId,
    /// The new value.
    pub value: DataValue,
}

/// One method invocation.
#[derive(Debug, Clone)]
pub struct CallMethodRequest {
    /// Object the method belongs to.
    pub object: NodeId,
    /// The method node.
    pub method: NodeId,
    /// Input arguments.
    pub arguments: Vec<Variant>,
}

/// Result of one method invocation.
#[derive(Debug)]
pub struct CallMethodResult {
    /// Per-call status.
    pub status: StatusCode,
    /// Output arguments when the call succeeded.
    pub outputs: Vec<Variant>,
}

/// One node's history to read.
#[derive(Debug, Clone)]
pub struct HistoryReadRequest {
    /// The node whose history is requested.
    pub node: NodeId,
    /// Optional aggregate processing.
    pub aggregate: Option<AggregateConfig>,
}

/// Raw history of one node, before pagination.
#[derive(Debug)]
pub struct HistoryReadResult {
    /// Per-node status.
    pub status: StatusCode,
    /// All historical values, oldest first.
    pub values: Vec<DataValue>,
}

/// One paginated history page handed to the client.
#[derive(Debug)]
pub struct HistoryReadPage {
    /// Per-node status.
    pub status: StatusCode,
    /// Values of this page.
    pub values: Vec<DataValue>,
    /// Continuation token when more values remain.
    pub continuation: Option<ContinuationPoint>,
}

// ---------------------------------------------------------------------------
// AddressSpace
// ---------------------------------------------------------------------------

/// The addressable data model, consumed as an external collaborator.
///
/// Each operation takes a request batch and returns one status-coded result
/// per item; implementations must never fail a whole batch for one bad item.
pub trait AddressSpace: Send + Sync {
    /// Returns the references of each requested node.
    fn browse(&self, ctx: &CallerContext, nodes: &[BrowseDescription]) -> Vec<BrowseResult>;

    /// Reads one attribute per item.
    fn read(
        &self,
        ctx: &CallerContext,
        ids: &[ReadValueId],
        timestamps: TimestampsToReturn,
    ) -> Vec<DataValue>;

    /// Writes one attribute per item.
    fn write(&self, ctx: &CallerContext, writes: &[WriteValue]) -> Vec<StatusCode>;

    /// Invokes one method per item.
    fn call(&self, ctx: &CallerContext, calls: &[CallMethodRequest]) -> Vec<CallMethodResult>;

    /// Reads the full history of each requested node. Pagination is applied
    /// by the server via the continuation manager, not here.
    fn history_read(
        &self,
        ctx: &CallerContext,
        requests: &[HistoryReadRequest],
    ) -> Vec<HistoryReadResult>;
}

// ===========================================================================
// Tests
// ===========================================================================
