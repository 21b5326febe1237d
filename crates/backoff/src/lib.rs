//! Consecutive-failure backoff for polled upstream streams.
//!
//! - [`FailureBackoff`]: counts consecutive failures and pauses a stream for a
//!   fixed duration once a threshold is reached; the pause expires lazily on
//!   the next [`FailureBackoff::is_open`] query
//! - [`Collector`]: polls a set of [`StreamSource`]s on a background thread,
//!   each guarded by its own backoff
//! - [`SeenIds`]: bounded set of emitted item ids, so a stream only emits
//!   items it has not seen before

pub mod breaker;
pub mod collector;
pub mod dedup;
pub mod error;

pub use breaker::{BackoffConfig, BackoffSnapshot, FailureBackoff};
pub use collector::{
    CollectReport, Collector, CollectorConfig, CollectorHandle, CollectorStatus, CycleSummary,
    StreamCycle, StreamOutcome, StreamSource, StreamTracking,
};
pub use dedup::{SeenIds, Sighting, TrackingStats, DEFAULT_TRACKED_IDS};
pub use error::UpstreamError;
