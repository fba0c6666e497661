use std::collections::HashMap;
use std::sync::Arc;

use lectern_core::types::DbId;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::HubConfig;
use crate::ws::connection::{ClientHandle, ConnId};
use crate::ws::messages::ServerMessage;

type Clients = Arc<RwLock<HashMap<ConnId, Arc<ClientHandle>>>>;

/// Errors returned by [`Hub`] operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("WebSocket hub is not running")]
    Stopped,
}

enum HubCommand {
    Register {
        client: Arc<ClientHandle>,
        done: oneshot::Sender<()>,
    },
    Unregister {
        conn_id: ConnId,
        done: oneshot::Sender<()>,
    },
    Broadcast(ServerMessage),
}

/// Registry of live WebSocket connections and channel fan-out.
///
/// Register, unregister and broadcast are serialized through a single
/// coordinating task. The client map is read-locked to find recipients and
/// write-locked only to evict clients whose outbound buffer is full.
pub struct Hub {
    clients: Clients,
    commands: mpsc::Sender<HubCommand>,
    config: HubConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Hub {
    /// Spawn the coordinating task. It stops on [`Hub::shutdown_all`] or
    /// when the hub is dropped.
    pub fn start(config: HubConfig) -> Arc<Self> {
        let (commands, receiver) = mpsc::channel(config.broadcast_capacity.max(1));
        let clients: Clients = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(run(Arc::clone(&clients), receiver, shutdown.clone()));
        tasks.close();

        Arc::new(Self {
            clients,
            commands,
            config,
            shutdown,
            tasks,
        })
    }

    /// Whether the coordinating task is still processing commands.
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Create and register a connection for `user_id`.
    ///
    /// Returns the handle and the receiver the write loop drains.
    pub async fn connect(
        &self,
        user_id: DbId,
    ) -> Result<(Arc<ClientHandle>, mpsc::Receiver<ServerMessage>), HubError> {
        let (client, receiver) = ClientHandle::new(user_id, self.config.client_buffer);
        self.register(Arc::clone(&client)).await?;
        Ok((client, receiver))
    }

    /// Add a connection. Completes once broadcasts can reach it.
    pub async fn register(&self, client: Arc<ClientHandle>) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            client.close();
            return Err(HubError::Stopped);
        }
        let (done, registered) = oneshot::channel();
        self.commands
            .send(HubCommand::Register { client, done })
            .await
            .map_err(|_| HubError::Stopped)?;
        registered.await.map_err(|_| HubError::Stopped)
    }

    /// Remove and close a connection. Unknown ids are ignored.
    pub async fn unregister(&self, conn_id: ConnId) {
        let (done, unregistered) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::Unregister { conn_id, done })
            .await
            .is_ok()
        {
            let _ = unregistered.await;
        }
    }

    /// Deliver `message` to every connection subscribed to its channel, or
    /// to every connection if it has none.
    ///
    /// Waits at most the configured broadcast timeout for room in the hub's
    /// queue; after that the message is dropped and `false` returned.
    pub async fn broadcast(&self, message: ServerMessage) -> bool {
        match self
            .commands
            .send_timeout(HubCommand::Broadcast(message), self.config.broadcast_timeout)
            .await
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(
                    timeout_ms = self.config.broadcast_timeout.as_millis() as u64,
                    "Hub broadcast queue saturated, message dropped",
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::warn!("Hub is not running, broadcast dropped");
                false
            }
        }
    }

    /// Deliver `message` to a single connection.
    ///
    /// A connection whose buffer is full is evicted, exactly as on
    /// broadcast. Returns whether the message was queued.
    pub async fn send_to(&self, conn_id: ConnId, message: ServerMessage) -> bool {
        let outcome = {
            let clients = self.clients.read().await;
            match clients.get(&conn_id) {
                Some(client) => client.try_send(message),
                None => return false,
            }
        };

        match outcome {
            Ok(()) => true,
            Err(_) => {
                evict(&self.clients, &[conn_id]).await;
                false
            }
        }
    }

    /// Return the current number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_connected(&self, conn_id: ConnId) -> bool {
        self.clients.read().await.contains_key(&conn_id)
    }

    /// Close every connection, refuse new ones and stop the coordinating
    /// task. Returns once the task has exited.
    ///
    /// Each connection's write loop sends a Close frame on its way out.
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();
        let count = {
            let mut clients = self.clients.write().await;
            let count = clients.len();
            for client in clients.values() {
                client.close();
            }
            clients.clear();
            count
        };
        self.tasks.wait().await;
        tracing::info!(count, "Closed all WebSocket connections");
    }
}

async fn run(clients: Clients, mut commands: mpsc::Receiver<HubCommand>, shutdown: CancellationToken) {
    loop {
        let command = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            HubCommand::Register { client, done } => {
                if shutdown.is_cancelled() {
                    client.close();
                } else {
                    tracing::debug!(
                        conn_id = %client.conn_id(),
                        user_id = client.user_id(),
                        "Client registered",
                    );
                    clients.write().await.insert(client.conn_id(), client);
                }
                let _ = done.send(());
            }
            HubCommand::Unregister { conn_id, done } => {
                if let Some(client) = clients.write().await.remove(&conn_id) {
                    client.close();
                    tracing::debug!(conn_id = %conn_id, "Client unregistered");
                }
                let _ = done.send(());
            }
            HubCommand::Broadcast(message) => fan_out(&clients, message).await,
        }
    }
    tracing::debug!("Hub loop stopped");
}

async fn fan_out(clients: &Clients, message: ServerMessage) {
    let mut stalled = Vec::new();
    {
        let clients = clients.read().await;
        let channel = message.channel();
        for client in clients.values() {
            if channel.is_some_and(|c| !client.is_subscribed(c)) {
                continue;
            }
            if client.try_send(message.clone()).is_err() {
                stalled.push(client.conn_id());
            }
        }
    }

    if !stalled.is_empty() {
        evict(clients, &stalled).await;
    }
}

async fn evict(clients: &Clients, conn_ids: &[ConnId]) {
    let mut clients = clients.write().await;
    for conn_id in conn_ids {
        if let Some(client) = clients.remove(conn_id) {
            client.close();
            tracing::warn!(
                conn_id = %conn_id,
                user_id = client.user_id(),
                "Evicted unresponsive WebSocket client",
            );
        }
    }
}
