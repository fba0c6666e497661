pub mod health;
pub mod jobs;

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                  WebSocket (token via ?token= or Bearer header)
///
/// /jobs                list, submit
/// /jobs/{id}           get
/// /jobs/{id}/cancel    cancel (POST)
/// ```
///
/// `request_timeout` bounds the REST calls only. A WebSocket upgrade
/// answers at once and the connection is then governed by the hub's ping,
/// pong and write deadlines.
pub fn api_routes(request_timeout: Duration) -> Router<AppState> {
    let jobs = jobs::router().layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        request_timeout,
    ));

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/jobs", jobs)
}
