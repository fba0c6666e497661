use std::sync::Arc;

use lectern_worker::JobQueue;

use crate::auth::jwt::TokenVerifier;
use crate::config::ServerConfig;
use crate::ws::{AuthorizationTable, Hub};

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: lectern_db::DbPool,
    pub config: Arc<ServerConfig>,
    /// Access-token verifier built from `config.jwt`.
    pub tokens: Arc<TokenVerifier>,
    /// WebSocket hub (browser clients).
    pub hub: Arc<Hub>,
    /// Job scheduler.
    pub queue: Arc<JobQueue>,
    /// Subscription authorization per channel kind.
    pub authorizers: Arc<AuthorizationTable>,
}
