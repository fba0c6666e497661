use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lectern_core::channels::ChannelKind;
use lectern_db::store::PgJobStore;
use lectern_events::ProgressRegistry;
use lectern_worker::{HandlerRegistry, JobQueue, WorkerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lectern_api::auth::jwt::TokenVerifier;
use lectern_api::config::ServerConfig;
use lectern_api::router::build_app_router;
use lectern_api::state::AppState;
use lectern_api::ws::{AuthorizationTable, Hub, JobOwnerAuthorizer};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lectern_api=debug,lectern_worker=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = %config.port,
        workers = worker_config.worker_count,
        "Loaded server configuration",
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = lectern_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    lectern_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    lectern_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Job queue ---
    // Concrete handlers are registered by the services that own them.
    let handlers = HandlerRegistry::new();
    if handlers.job_types().is_empty() {
        tracing::warn!("No job handlers registered, every submission will be rejected");
    }

    let registry = Arc::new(ProgressRegistry::new(worker_config.subscriber_buffer));
    let queue = JobQueue::start(
        Arc::new(PgJobStore::new(pool.clone())),
        registry,
        handlers,
        worker_config,
    )
    .await
    .expect("Failed to start job queue");
    tracing::info!("Job queue started");

    // --- WebSocket hub ---
    let hub = Hub::start(config.hub.clone());
    let authorizers = AuthorizationTable::new()
        .with(ChannelKind::Job, JobOwnerAuthorizer::new(Arc::clone(&queue)));

    // --- App state ---
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        tokens: Arc::new(TokenVerifier::new(&config.jwt)),
        hub: Arc::clone(&hub),
        queue: Arc::clone(&queue),
        authorizers: Arc::new(authorizers),
    };

    let app = build_app_router(state);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // In-flight jobs still publish to live connections while draining.
    let drain = Duration::from_secs(config.shutdown_timeout_secs);
    if tokio::time::timeout(drain, queue.shutdown()).await.is_err() {
        tracing::error!(timeout_secs = config.shutdown_timeout_secs, "Job queue did not drain in time");
    } else {
        tracing::info!("Job queue shut down");
    }

    let ws_count = hub.connection_count().await;
    tracing::info!(ws_count, "Closing remaining WebSocket connections");
    hub.shutdown_all().await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
