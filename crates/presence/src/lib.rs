//! In-memory broadcast-group registry for live connections.
//!
//! Two group flavors exist: a personal group per user (joined automatically
//! on connect, spans all of that user's devices) and a conversation group per
//! chat (joined explicitly while a client is viewing it). Group membership is
//! a derived projection of connection state, never a source of truth;
//! delivery is fire-and-forget and a reconnecting client re-fetches state
//! instead of relying on replay.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;

use shared::{
    domain::{ChatId, ConnectionId, UserId},
    protocol::ServerEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    User(UserId),
    Chat(ChatId),
}

type Outbox = mpsc::UnboundedSender<ServerEvent>;

#[derive(Default)]
struct Registry {
    groups: HashMap<GroupKey, HashMap<ConnectionId, Outbox>>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

struct ConnectionEntry {
    user_id: UserId,
    outbox: Outbox,
    joined: HashSet<GroupKey>,
}

/// Concurrency-safe map from group key to the connections currently in it.
/// All mutations happen under one `std::sync::RwLock` with no awaits inside,
/// so a disconnect removes the connection from every group before any later
/// event for it can be attempted.
#[derive(Default)]
pub struct PresenceRouter {
    registry: RwLock<Registry>,
}

impl PresenceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live connection and joins it to its owner's personal
    /// group. The returned sender half is already stored; the caller keeps
    /// the receiver and drains it into the socket.
    pub fn register(&self, user_id: UserId, outbox: Outbox) -> ConnectionId {
        let connection_id = ConnectionId::random();
        let personal = GroupKey::User(user_id);

        let mut registry = self.registry.write().expect("presence registry poisoned");
        registry
            .groups
            .entry(personal)
            .or_default()
            .insert(connection_id, outbox.clone());
        registry.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                outbox,
                joined: HashSet::from([personal]),
            },
        );
        debug!(?connection_id, user_id = user_id.0, "connection registered");
        connection_id
    }

    pub fn owner_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        let registry = self.registry.read().expect("presence registry poisoned");
        registry
            .connections
            .get(&connection_id)
            .map(|entry| entry.user_id)
    }

    /// Joins an already-registered connection to a group. Unknown connections
    /// are ignored; their disconnect already ran.
    pub fn join(&self, connection_id: ConnectionId, key: GroupKey) {
        let mut registry = self.registry.write().expect("presence registry poisoned");
        let Some(entry) = registry.connections.get_mut(&connection_id) else {
            return;
        };
        if !entry.joined.insert(key) {
            return;
        }
        let outbox = entry.outbox.clone();
        registry
            .groups
            .entry(key)
            .or_default()
            .insert(connection_id, outbox);
    }

    pub fn leave(&self, connection_id: ConnectionId, key: GroupKey) {
        let mut registry = self.registry.write().expect("presence registry poisoned");
        if let Some(entry) = registry.connections.get_mut(&connection_id) {
            entry.joined.remove(&key);
        }
        if let Some(group) = registry.groups.get_mut(&key) {
            group.remove(&connection_id);
            if group.is_empty() {
                registry.groups.remove(&key);
            }
        }
    }

    /// Delivers an event to every connection currently in the group. A
    /// missing or empty group is a no-op. Connections whose receiver is gone
    /// are pruned as they are found; that delivery is simply dropped.
    pub fn broadcast(&self, key: GroupKey, event: &ServerEvent) {
        let mut dead = Vec::new();
        {
            let registry = self.registry.read().expect("presence registry poisoned");
            let Some(group) = registry.groups.get(&key) else {
                return;
            };
            for (connection_id, outbox) in group {
                if outbox.send(event.clone()).is_err() {
                    dead.push(*connection_id);
                }
            }
        }
        for connection_id in dead {
            self.disconnect(connection_id);
        }
    }

    pub fn broadcast_user(&self, user_id: UserId, event: &ServerEvent) {
        self.broadcast(GroupKey::User(user_id), event);
    }

    pub fn broadcast_chat(&self, chat_id: ChatId, event: &ServerEvent) {
        self.broadcast(GroupKey::Chat(chat_id), event);
    }

    /// Delivery to one connection only, for caller-scoped failures.
    pub fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) {
        let registry = self.registry.read().expect("presence registry poisoned");
        if let Some(entry) = registry.connections.get(&connection_id) {
            let _ = entry.outbox.send(event);
        }
    }

    /// Removes the connection from every group it joined. Idempotent.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let mut registry = self.registry.write().expect("presence registry poisoned");
        let Some(entry) = registry.connections.remove(&connection_id) else {
            return;
        };
        for key in entry.joined {
            if let Some(group) = registry.groups.get_mut(&key) {
                group.remove(&connection_id);
                if group.is_empty() {
                    registry.groups.remove(&key);
                }
            }
        }
        debug!(?connection_id, "connection removed from all groups");
    }

    pub fn group_size(&self, key: GroupKey) -> usize {
        let registry = self.registry.read().expect("presence registry poisoned");
        registry.groups.get(&key).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::ChatId;

    fn connect(router: &PresenceRouter, user: i64) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = router.register(UserId(user), tx);
        (id, rx)
    }

    #[tokio::test]
    async fn register_joins_personal_group() {
        let router = PresenceRouter::new();
        let (_id, mut rx) = connect(&router, 1);

        assert_eq!(router.group_size(GroupKey::User(UserId(1))), 1);
        router.broadcast_user(
            UserId(1),
            &ServerEvent::ReadStateChanged { chat_id: ChatId(7) },
        );
        let event = rx.recv().await.expect("event");
        assert!(matches!(
            event,
            ServerEvent::ReadStateChanged { chat_id: ChatId(7) }
        ));
    }

    #[tokio::test]
    async fn broadcast_to_empty_group_is_noop() {
        let router = PresenceRouter::new();
        router.broadcast_chat(
            ChatId(1),
            &ServerEvent::ReadStateChanged { chat_id: ChatId(1) },
        );
    }

    #[tokio::test]
    async fn chat_group_only_reaches_joined_connections() {
        let router = PresenceRouter::new();
        let (viewer, mut viewer_rx) = connect(&router, 1);
        let (_other, mut other_rx) = connect(&router, 2);

        router.join(viewer, GroupKey::Chat(ChatId(9)));
        router.broadcast_chat(
            ChatId(9),
            &ServerEvent::ConversationRemoved { chat_id: ChatId(9) },
        );

        assert!(viewer_rx.recv().await.is_some());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_connection_from_every_group() {
        let router = PresenceRouter::new();
        let (id, _rx) = connect(&router, 1);
        router.join(id, GroupKey::Chat(ChatId(3)));
        router.join(id, GroupKey::Chat(ChatId(4)));

        router.disconnect(id);

        assert_eq!(router.group_size(GroupKey::User(UserId(1))), 0);
        assert_eq!(router.group_size(GroupKey::Chat(ChatId(3))), 0);
        assert_eq!(router.group_size(GroupKey::Chat(ChatId(4))), 0);
        assert_eq!(router.owner_of(id), None);
    }

    #[tokio::test]
    async fn broadcast_prunes_dead_receivers() {
        let router = PresenceRouter::new();
        let (id, rx) = connect(&router, 1);
        drop(rx);

        router.broadcast_user(
            UserId(1),
            &ServerEvent::ReadStateChanged { chat_id: ChatId(1) },
        );
        assert_eq!(router.group_size(GroupKey::User(UserId(1))), 0);
        assert_eq!(router.owner_of(id), None);
    }

    #[tokio::test]
    async fn two_devices_of_one_user_share_the_personal_group() {
        let router = PresenceRouter::new();
        let (_phone, mut phone_rx) = connect(&router, 1);
        let (_laptop, mut laptop_rx) = connect(&router, 1);

        router.broadcast_user(
            UserId(1),
            &ServerEvent::ReadStateChanged { chat_id: ChatId(2) },
        );
        assert!(phone_rx.recv().await.is_some());
        assert!(laptop_rx.recv().await.is_some());
    }
}
