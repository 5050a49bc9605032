use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

use super::events::Event;

/// Unique identifier of one transport connection.
///
/// A user with several tabs open has several connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Connection {
    user_id: Uuid,
    room_id: Option<Uuid>,
    sender: UnboundedSender<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    // room_id -> connections attached to the room group
    groups: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl Inner {
    fn leave_group(&mut self, connection_id: ConnectionId, room_id: Uuid) {
        if let Some(members) = self.groups.get_mut(&room_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.groups.remove(&room_id);
                tracing::debug!(room_id = %room_id, "Removed empty room group");
            }
        }
    }
}

fn encode(event: &Event) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "Failed to serialize event");
            None
        }
    }
}

/// Live connections and the room group each one is attached to.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; frames for it arrive on the returned receiver.
    pub async fn register(&self, user_id: Uuid) -> (ConnectionId, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let connection_id = ConnectionId::new();

        let mut guard = self.inner.write().await;
        guard.connections.insert(
            connection_id,
            Connection {
                user_id,
                room_id: None,
                sender: tx,
            },
        );
        tracing::debug!(
            connection_id = %connection_id,
            user_id = %user_id,
            total = guard.connections.len(),
            "Connection registered"
        );

        (connection_id, rx)
    }

    /// Forget a connection. Returns its user and the room it was attached to.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<(Uuid, Option<Uuid>)> {
        let mut guard = self.inner.write().await;
        let connection = guard.connections.remove(&connection_id)?;
        if let Some(room_id) = connection.room_id {
            guard.leave_group(connection_id, room_id);
        }
        Some((connection.user_id, connection.room_id))
    }

    /// Attach to a room group, leaving any previous one. Returns the previous room.
    pub async fn attach(&self, connection_id: ConnectionId, room_id: Uuid) -> Option<Uuid> {
        let mut guard = self.inner.write().await;
        let previous = {
            let connection = guard.connections.get_mut(&connection_id)?;
            connection.room_id.replace(room_id)
        };
        if let Some(prev) = previous.filter(|prev| *prev != room_id) {
            guard.leave_group(connection_id, prev);
        }
        guard.groups.entry(room_id).or_default().insert(connection_id);
        previous.filter(|prev| *prev != room_id)
    }

    pub async fn room_of(&self, connection_id: ConnectionId) -> Option<Uuid> {
        let guard = self.inner.read().await;
        guard.connections.get(&connection_id)?.room_id
    }

    pub async fn user_of(&self, connection_id: ConnectionId) -> Option<Uuid> {
        let guard = self.inner.read().await;
        guard.connections.get(&connection_id).map(|c| c.user_id)
    }

    /// Connections of `user_id` currently attached to `room_id`.
    pub async fn user_connections(&self, room_id: Uuid, user_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard
            .groups
            .get(&room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| {
                        guard
                            .connections
                            .get(id)
                            .map_or(false, |c| c.user_id == user_id)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Send to one connection. Returns false when it is gone.
    pub async fn send_to(&self, connection_id: ConnectionId, event: &Event) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };
        let guard = self.inner.read().await;
        guard
            .connections
            .get(&connection_id)
            .map_or(false, |c| c.sender.send(frame).is_ok())
    }

    /// Send to every connection of the room group except `except`.
    pub async fn broadcast(&self, room_id: Uuid, event: &Event, except: Option<ConnectionId>) {
        let Some(frame) = encode(event) else {
            return;
        };
        let guard = self.inner.read().await;
        let Some(members) = guard.groups.get(&room_id) else {
            return;
        };

        let mut delivered = 0usize;
        for id in members.iter().filter(|id| Some(**id) != except) {
            if let Some(connection) = guard.connections.get(id) {
                if connection.sender.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        tracing::debug!(
            room_id = %room_id,
            event = event.name(),
            delivered,
            "Broadcast event"
        );
    }

    /// Detach every connection of `user_id` from the room group.
    pub async fn detach_user(&self, room_id: Uuid, user_id: Uuid) -> Vec<ConnectionId> {
        let mut guard = self.inner.write().await;
        let ids: Vec<ConnectionId> = guard
            .connections
            .iter()
            .filter(|(_, c)| c.user_id == user_id && c.room_id == Some(room_id))
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(connection) = guard.connections.get_mut(id) {
                connection.room_id = None;
            }
            guard.leave_group(*id, room_id);
        }
        ids
    }

    /// Detach everyone from a room group (room deleted).
    pub async fn close_room(&self, room_id: Uuid) {
        let mut guard = self.inner.write().await;
        if let Some(members) = guard.groups.remove(&room_id) {
            for id in members {
                if let Some(connection) = guard.connections.get_mut(&id) {
                    connection.room_id = None;
                }
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn subscriber_count(&self, room_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.groups.get(&room_id).map(|m| m.len()).unwrap_or(0)
    }
}
