//! Request extractors.
//!
//! - [`auth::AuthUser`] -- The authenticated user from a JWT Bearer token.
//! - [`auth::WsAuthUser`] -- The same, also accepting `?token=` for WebSocket upgrades.

pub mod auth;
