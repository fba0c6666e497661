use std::time::Duration;

use crate::auth::jwt::JwtConfig;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Upper bound on draining the job queue after the server stops.
    pub shutdown_timeout_secs: u64,
    /// Reported to WebSocket clients in the `connected` handshake.
    pub server_version: String,
    /// Shared secret for verifying access tokens.
    pub jwt: JwtConfig,
    pub hub: HubConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    /// | `SERVER_VERSION`       | crate version              |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        let server_version = std::env::var("SERVER_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            server_version,
            jwt: JwtConfig::from_env(),
            hub: HubConfig::from_env(),
        }
    }
}

/// WebSocket hub and connection tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound messages buffered per connection before it is evicted.
    pub client_buffer: usize,
    /// Capacity of the hub's broadcast command channel.
    pub broadcast_capacity: usize,
    /// How long `broadcast` waits for room before dropping the message.
    pub broadcast_timeout: Duration,
    pub ping_interval: Duration,
    /// A peer silent for this long is disconnected.
    pub pong_wait: Duration,
    /// Deadline for writing one frame to the socket.
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_buffer: 256,
            broadcast_capacity: 1024,
            broadcast_timeout: Duration::from_millis(250),
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl HubConfig {
    /// Load hub settings from environment variables.
    ///
    /// | Env Var                   | Default |
    /// |---------------------------|---------|
    /// | `WS_CLIENT_BUFFER`        | `256`   |
    /// | `WS_BROADCAST_CAPACITY`   | `1024`  |
    /// | `WS_BROADCAST_TIMEOUT_MS` | `250`   |
    /// | `WS_PING_INTERVAL_SECS`   | `30`    |
    /// | `WS_PONG_WAIT_SECS`       | `60`    |
    /// | `WS_WRITE_TIMEOUT_SECS`   | `10`    |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let client_buffer: usize = std::env::var("WS_CLIENT_BUFFER")
            .map(|v| v.parse().expect("WS_CLIENT_BUFFER must be a valid usize"))
            .unwrap_or(defaults.client_buffer);

        let broadcast_capacity: usize = std::env::var("WS_BROADCAST_CAPACITY")
            .map(|v| v.parse().expect("WS_BROADCAST_CAPACITY must be a valid usize"))
            .unwrap_or(defaults.broadcast_capacity);

        let broadcast_timeout = std::env::var("WS_BROADCAST_TIMEOUT_MS")
            .map(|v| {
                Duration::from_millis(v.parse().expect("WS_BROADCAST_TIMEOUT_MS must be a valid u64"))
            })
            .unwrap_or(defaults.broadcast_timeout);

        let ping_interval = env_secs("WS_PING_INTERVAL_SECS").unwrap_or(defaults.ping_interval);
        let pong_wait = env_secs("WS_PONG_WAIT_SECS").unwrap_or(defaults.pong_wait);
        let write_timeout = env_secs("WS_WRITE_TIMEOUT_SECS").unwrap_or(defaults.write_timeout);

        assert!(
            pong_wait > ping_interval,
            "WS_PONG_WAIT_SECS must be greater than WS_PING_INTERVAL_SECS"
        );

        Self {
            client_buffer: client_buffer.max(1),
            broadcast_capacity: broadcast_capacity.max(1),
            broadcast_timeout,
            ping_interval,
            pong_wait,
            write_timeout,
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name).ok().map(|v| {
        Duration::from_secs(
            v.parse()
                .unwrap_or_else(|_| panic!("{name} must be a valid u64")),
        )
    })
}
