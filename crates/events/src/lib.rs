//! In-process fan-out of job progress events.
//!
//! - [`ProgressRegistry`] maps a job id to its live subscribers and delivers
//!   progress snapshots to each without blocking the publishing worker.
//! - [`JobEventStream`] is the receiving half handed to a subscriber; it
//!   yields progress in publish order and then exactly one terminal event.

pub mod registry;

pub use registry::{JobEventStream, ProgressRegistry, SubscriptionId};
