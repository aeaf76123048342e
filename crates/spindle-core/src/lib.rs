//! # Spindle Core
//!
//! The subscription and publishing core of an industrial data-change server.
//!
//! This crate provides:
//! - **Subscriptions**: Per-subscription state machines with keep-alive and
//!   lifetime counters, bounded notification queues, and retransmission
//! - **Publish engine**: Matches per-session publish request FIFOs against
//!   ready subscriptions, with timeouts and deterministic service order
//! - **Sampling**: Shared timers grouping monitored items by interval, with
//!   liveness-checked completion routing
//! - **Continuation points**: Pagination of oversized browse and history
//!   results behind opaque tokens
//! - **Server**: The service façade tying sessions, orphaned subscriptions,
//!   transfer compatibility, and the address space together
//!
//! ## Design Principles
//!
//! 1. **Per-item statuses** - Batched operations report one status per item
//!    and never fail a batch for one bad entry
//! 2. **Virtual time** - All components are driven by an explicit
//!    millisecond clock, so every timing behavior is unit-testable
//! 3. **Continuity across owners** - Sequence numbering and retransmission
//!    caches survive session loss and subscription transfer
//!
//! ## Example
//!
//! ```rust,ignore
//! use spindle_core::server::{ServerLimits, SubscriptionServer};
//!
//! let mut server = SubscriptionServer::new(ServerLimits::default(), space);
//! let session = server.create_session(None);
//! let (subscription, revised) = server.create_subscription(session, params, 0)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address_space;
pub mod continuation;
pub mod publish;
pub mod queue;
pub mod sampling;
pub mod server;
pub mod session;
pub mod status;
pub mod subscription;
pub mod transfer;

// Re-export key types
pub use server::{ServerLimits, ServiceRequest, ServiceResponse, SubscriptionServer};
pub use session::SessionId;
pub use status::StatusCode;
pub use subscription::{MonitoredItemId, Subscription, SubscriptionId, SubscriptionParams};

/// Result type for spindle-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for spindle-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Continuation point errors
    #[error("Continuation error: {0}")]
    Continuation(#[from] continuation::ContinuationError),

    /// Sampling scheduler errors
    #[error("Sampling error: {0}")]
    Sampling(#[from] sampling::SamplingError),

    /// Subscription transfer errors
    #[error("Transfer error: {0}")]
    Transfer(#[from] transfer::TransferError),

    /// Retransmission errors
    #[error("Republish error: {0}")]
    Republish(#[from] publish::RepublishError),
}
