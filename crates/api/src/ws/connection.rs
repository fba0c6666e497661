use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lectern_core::channels::ChannelName;
use lectern_core::types::{DbId, Timestamp};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ws::messages::ServerMessage;

/// Identifier of one WebSocket connection.
pub type ConnId = Uuid;

/// One channel subscription of a connection.
///
/// The token stops whatever background task serves the subscription. It is
/// a child of the connection's close token, so closing the connection stops
/// every subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    token: CancellationToken,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Server-side handle of a live WebSocket connection.
///
/// Shared between the hub (routing), the session (commands) and the
/// connection's write loop, which drains the paired receiver.
pub struct ClientHandle {
    conn_id: ConnId,
    user_id: DbId,
    connected_at: Timestamp,
    sender: mpsc::Sender<ServerMessage>,
    subscriptions: RwLock<HashMap<ChannelName, Subscription>>,
    next_subscription: AtomicU64,
    closed: CancellationToken,
}

impl ClientHandle {
    /// Create a handle with an outbound queue of `buffer` messages.
    pub fn new(user_id: DbId, buffer: usize) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let handle = Arc::new(Self {
            conn_id: Uuid::new_v4(),
            user_id,
            connected_at: chrono::Utc::now(),
            sender,
            subscriptions: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });
        (handle, receiver)
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn user_id(&self) -> DbId {
        self.user_id
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    fn read_subscriptions(&self) -> RwLockReadGuard<'_, HashMap<ChannelName, Subscription>> {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subscriptions(&self) -> RwLockWriteGuard<'_, HashMap<ChannelName, Subscription>> {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_subscribed(&self, channel: &ChannelName) -> bool {
        self.read_subscriptions().contains_key(channel)
    }

    pub fn subscriptions(&self) -> Vec<ChannelName> {
        self.read_subscriptions().keys().cloned().collect()
    }

    /// Add a subscription. Returns `None` if the channel is already subscribed.
    pub fn add_subscription(&self, channel: ChannelName) -> Option<Subscription> {
        if self.is_closed() {
            return None;
        }
        let mut subscriptions = self.write_subscriptions();
        if subscriptions.contains_key(&channel) {
            return None;
        }
        let subscription = Subscription {
            id: self.next_subscription.fetch_add(1, Ordering::Relaxed),
            token: self.closed.child_token(),
        };
        subscriptions.insert(channel, subscription.clone());
        Some(subscription)
    }

    /// Remove a subscription and cancel its token.
    pub fn remove_subscription(&self, channel: &ChannelName) -> Option<Subscription> {
        let removed = self.write_subscriptions().remove(channel);
        if let Some(subscription) = &removed {
            subscription.token.cancel();
        }
        removed
    }

    /// Remove `channel` only if it is still served by subscription `id`.
    ///
    /// Used by tasks that end on their own, so they never tear down a newer
    /// subscription to the same channel.
    pub fn release_subscription(&self, channel: &ChannelName, id: u64) -> bool {
        let mut subscriptions = self.write_subscriptions();
        match subscriptions.get(channel) {
            Some(current) if current.id == id => {
                if let Some(subscription) = subscriptions.remove(channel) {
                    subscription.token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Cancel and drop every subscription.
    pub fn clear_subscriptions(&self) -> usize {
        let drained: Vec<Subscription> = self.write_subscriptions().drain().map(|(_, s)| s).collect();
        for subscription in &drained {
            subscription.token.cancel();
        }
        drained.len()
    }

    /// Queue a message without waiting. Fails when the buffer is full or the
    /// connection is closed.
    pub fn try_send(&self, message: ServerMessage) -> Result<(), TrySendError<ServerMessage>> {
        if self.is_closed() {
            return Err(TrySendError::Closed(message));
        }
        self.sender.try_send(message)
    }

    /// Ask the connection's loops to send a Close frame and stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("conn_id", &self.conn_id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use lectern_core::channels::ChannelKind;

    use super::*;

    fn chat(id: &str) -> ChannelName {
        ChannelName::new(ChannelKind::Chat, id)
    }

    #[test]
    fn subscriptions_are_unique_per_channel() {
        let (client, _rx) = ClientHandle::new(1, 4);

        assert!(client.add_subscription(chat("1")).is_some());
        assert!(client.add_subscription(chat("1")).is_none());
        assert!(client.add_subscription(chat("2")).is_some());
        assert!(client.is_subscribed(&chat("1")));
        assert_eq!(client.subscriptions().len(), 2);
    }

    #[test]
    fn removing_cancels_the_token() {
        let (client, _rx) = ClientHandle::new(1, 4);
        let sub = client.add_subscription(chat("1")).unwrap();

        let removed = client.remove_subscription(&chat("1")).unwrap();
        assert_eq!(removed.id(), sub.id());
        assert!(sub.token().is_cancelled());
        assert!(!client.is_subscribed(&chat("1")));
    }

    #[test]
    fn release_ignores_newer_subscription() {
        let (client, _rx) = ClientHandle::new(1, 4);
        let old = client.add_subscription(chat("1")).unwrap();
        client.remove_subscription(&chat("1"));
        let new = client.add_subscription(chat("1")).unwrap();

        assert!(!client.release_subscription(&chat("1"), old.id()));
        assert!(client.is_subscribed(&chat("1")));
        assert!(!new.token().is_cancelled());

        assert!(client.release_subscription(&chat("1"), new.id()));
        assert!(new.token().is_cancelled());
    }

    #[test]
    fn close_cancels_subscriptions_and_refuses_sends() {
        let (client, _rx) = ClientHandle::new(1, 4);
        let sub = client.add_subscription(chat("1")).unwrap();

        client.close();
        assert!(sub.token().is_cancelled());
        assert!(client.add_subscription(chat("2")).is_none());
        assert!(matches!(
            client.try_send(ServerMessage::connected("test")),
            Err(TrySendError::Closed(_))
        ));
    }

    #[test]
    fn full_buffer_is_reported() {
        let (client, _rx) = ClientHandle::new(1, 1);
        client.try_send(ServerMessage::connected("test")).unwrap();
        assert!(matches!(
            client.try_send(ServerMessage::connected("test")),
            Err(TrySendError::Full(_))
        ));
    }
}
