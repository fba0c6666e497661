use std::sync::Arc;

use lectern_core::channels::{ChannelKind, ChannelName};
use lectern_core::types::JobId;
use lectern_worker::JobQueue;
use tokio_util::task::TaskTracker;

use crate::ws::authz::AuthorizationTable;
use crate::ws::bridge::run_job_bridge;
use crate::ws::connection::ClientHandle;
use crate::ws::hub::Hub;
use crate::ws::messages::{ClientCommand, ServerMessage};

/// Command handling for one WebSocket connection.
///
/// Malformed commands and denied subscriptions are logged and dropped; no
/// error is sent back, so clients cannot discover channels they do not own.
pub struct ClientSession {
    client: Arc<ClientHandle>,
    hub: Arc<Hub>,
    queue: Arc<JobQueue>,
    authorizers: Arc<AuthorizationTable>,
    bridges: TaskTracker,
}

impl ClientSession {
    pub fn new(
        client: Arc<ClientHandle>,
        hub: Arc<Hub>,
        queue: Arc<JobQueue>,
        authorizers: Arc<AuthorizationTable>,
    ) -> Self {
        Self {
            client,
            hub,
            queue,
            authorizers,
            bridges: TaskTracker::new(),
        }
    }

    pub fn client(&self) -> &Arc<ClientHandle> {
        &self.client
    }

    /// Parse and handle one text frame.
    pub async fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ClientCommand>(text) {
            Ok(command) => self.handle_command(command).await,
            Err(e) => tracing::debug!(
                conn_id = %self.client.conn_id(),
                error = %e,
                "Ignoring malformed client message",
            ),
        }
    }

    pub async fn handle_command(&self, command: ClientCommand) {
        match command {
            ClientCommand::Subscribe { channel } => self.subscribe(&channel).await,
            ClientCommand::Unsubscribe { channel } => self.unsubscribe(&channel).await,
        }
    }

    /// Parse a client channel name. Job ids are normalized so every
    /// spelling of one job maps to the same subscription.
    fn parse_channel(&self, raw: &str) -> Option<ChannelName> {
        let channel = match raw.parse::<ChannelName>() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::debug!(
                    conn_id = %self.client.conn_id(),
                    channel = raw,
                    error = %e,
                    "Ignoring malformed channel name",
                );
                return None;
            }
        };
        if channel.kind != ChannelKind::Job {
            return Some(channel);
        }
        match channel.id.parse::<JobId>() {
            Ok(job_id) => Some(ChannelName::job(job_id)),
            Err(e) => {
                tracing::debug!(
                    conn_id = %self.client.conn_id(),
                    channel = raw,
                    error = %e,
                    "Ignoring job channel with invalid id",
                );
                None
            }
        }
    }

    async fn subscribe(&self, raw: &str) {
        let Some(channel) = self.parse_channel(raw) else {
            return;
        };
        let conn_id = self.client.conn_id();
        if self.client.is_subscribed(&channel) {
            return;
        }

        if let Err(e) = self.authorizers.authorize(self.client.user_id(), &channel).await {
            tracing::warn!(
                conn_id = %conn_id,
                user_id = self.client.user_id(),
                channel = %channel,
                error = %e,
                "Subscription denied",
            );
            return;
        }

        // A concurrent subscribe to the same channel may have won meanwhile.
        let Some(subscription) = self.client.add_subscription(channel.clone()) else {
            return;
        };
        self.hub
            .send_to(conn_id, ServerMessage::subscribed(channel.clone()))
            .await;
        tracing::debug!(conn_id = %conn_id, channel = %channel, "Subscribed");

        if channel.kind != ChannelKind::Job {
            return;
        }
        let Ok(job_id) = channel.id.parse::<JobId>() else {
            self.client.release_subscription(&channel, subscription.id());
            return;
        };
        self.bridges.spawn(run_job_bridge(
            Arc::clone(&self.queue),
            Arc::clone(&self.hub),
            Arc::clone(&self.client),
            channel,
            job_id,
            subscription,
        ));
    }

    async fn unsubscribe(&self, raw: &str) {
        let Some(channel) = self.parse_channel(raw) else {
            return;
        };
        if self.client.remove_subscription(&channel).is_some() {
            tracing::debug!(conn_id = %self.client.conn_id(), channel = %channel, "Unsubscribed");
        }
        self.hub
            .send_to(self.client.conn_id(), ServerMessage::unsubscribed(channel))
            .await;
    }

    /// Stop every subscription, unregister from the hub and wait for the
    /// bridges to exit.
    pub async fn close(&self) {
        let cancelled = self.client.clear_subscriptions();
        self.client.close();
        self.hub.unregister(self.client.conn_id()).await;

        self.bridges.close();
        if tokio::time::timeout(self.hub.config().write_timeout, self.bridges.wait())
            .await
            .is_err()
        {
            tracing::warn!(conn_id = %self.client.conn_id(), "Job bridges did not stop in time");
        }
        tracing::debug!(conn_id = %self.client.conn_id(), cancelled, "Client session closed");
    }
}
