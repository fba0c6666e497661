//! Asynchronous job scheduler.
//!
//! [`JobQueue`] persists submitted jobs through a [`JobStore`], hands them to
//! a fixed pool of worker tasks, tracks per-job cancellation and publishes
//! progress into a [`ProgressRegistry`]. Job types are served by
//! [`JobHandler`] implementations registered by type tag.
//!
//! [`JobStore`]: lectern_db::store::JobStore
//! [`ProgressRegistry`]: lectern_events::ProgressRegistry

pub mod config;
pub mod error;
pub mod handler;
pub mod queue;
pub mod reporter;

pub use config::WorkerConfig;
pub use error::{HandlerError, QueueError};
pub use handler::{handler_fn, HandlerRegistry, JobContext, JobHandler, Typed, TypedJobHandler};
pub use queue::JobQueue;
pub use reporter::ProgressReporter;
