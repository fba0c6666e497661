//! Shared primitives for the Lectern job platform.
//!
//! Every other crate in the workspace depends on this one for the id and
//! timestamp aliases, the domain error type, and the WebSocket channel
//! naming rules.

pub mod channels;
pub mod error;
pub mod job_events;
pub mod types;
