//! WebSocket infrastructure for real-time job progress.
//!
//! - [`hub`] -- live connections and channel fan-out with eviction.
//! - [`session`] -- per-connection subscribe/unsubscribe handling.
//! - [`authz`] -- per-channel-kind subscription authorization.
//! - [`messages`] -- the JSON wire protocol.
//!
//! Job channels are fed by a bridge task per subscription that relays the
//! scheduler's progress stream into the connection.

pub mod authz;
mod bridge;
pub mod connection;
mod handler;
pub mod hub;
pub mod messages;
pub mod session;

pub use authz::{AuthorizationTable, ChannelAuthorizer, JobOwnerAuthorizer};
pub use connection::{ClientHandle, ConnId};
pub use handler::ws_handler;
pub use hub::{Hub, HubError};
pub use messages::{ClientCommand, ServerMessage};
pub use session::ClientSession;
