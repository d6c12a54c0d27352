use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// A broadcast frame. `room_id` scopes delivery to connections that have
/// joined the room; `echo` marks the one connection that gets the
/// `local_id` attached to its copy of a message-created event.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub room_id: Option<i64>,
    pub echo: Option<Echo>,
    pub event: GatewayEvent,
}

#[derive(Debug, Clone)]
pub struct Echo {
    pub conn_id: Uuid,
    pub local_id: String,
}

impl Outbound {
    /// Resolve this frame for one connection: `None` if the connection has
    /// not joined the scoping room, otherwise the event to deliver — with
    /// `local_id` attached only on the originating connection's copy.
    pub fn deliverable(&self, conn_id: Uuid, joined: &HashSet<i64>) -> Option<GatewayEvent> {
        if let Some(room_id) = self.room_id {
            if !joined.contains(&room_id) {
                return None;
            }
        }

        let mut event = self.event.clone();
        if let Some(echo) = &self.echo {
            if echo.conn_id == conn_id {
                if let GatewayEvent::MessageCreated { local_id, .. } = &mut event {
                    *local_id = Some(echo.local_id.clone());
                }
            }
        }
        Some(event)
    }
}

struct ConnEntry {
    user_id: Uuid,
    username: String,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    joined: HashSet<i64>,
}

struct OnlineEntry {
    username: String,
    connections: usize,
}

/// Connection Registry + Presence Tracker + broadcast fabric. One owned
/// instance per process, injected into connection handlers; tests build a
/// fresh one per case.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for gateway frames — every connection receives
    /// every frame and filters by its joined set
    broadcast_tx: broadcast::Sender<Outbound>,

    /// Connection Registry: conn_id -> identity, targeted sender, joined rooms
    connections: RwLock<HashMap<Uuid, ConnEntry>>,

    /// Presence: user_id -> username + open connection count. Keyed by
    /// user, not connection, so presence survives all but the last close.
    online_users: RwLock<HashMap<Uuid, OnlineEntry>>,

    /// Typing state: room_id -> (user_id -> username). Ephemeral, never
    /// persisted.
    typing: RwLock<HashMap<i64, HashMap<Uuid, String>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
                online_users: RwLock::new(HashMap::new()),
                typing: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the broadcast fabric. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event, scoped by its own room_id (global if None).
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(Outbound {
            room_id: event.room_id(),
            echo: None,
            event,
        });
    }

    /// Broadcast a message-created event, tagging the originating
    /// connection so only it receives the `local_id` echo.
    pub fn broadcast_created(
        &self,
        message: parley_types::models::Message,
        origin: Uuid,
        local_id: Option<String>,
    ) {
        let room_id = message.room_id;
        let _ = self.inner.broadcast_tx.send(Outbound {
            room_id: Some(room_id),
            echo: local_id.map(|local_id| Echo {
                conn_id: origin,
                local_id,
            }),
            event: GatewayEvent::MessageCreated {
                message,
                local_id: None,
            },
        });
    }

    /// Register a new connection. Returns its session id and the targeted
    /// event receiver.
    pub async fn register(
        &self,
        user_id: Uuid,
        username: String,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(
            conn_id,
            ConnEntry {
                user_id,
                username,
                tx,
                joined: HashSet::new(),
            },
        );
        (conn_id, rx)
    }

    /// Send a targeted event to a single connection (acks, scoped errors,
    /// presence snapshots).
    pub async fn send_to_conn(&self, conn_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(entry) = connections.get(&conn_id) {
            let _ = entry.tx.send(event);
        }
    }

    pub async fn join_room(&self, conn_id: Uuid, room_id: i64) {
        let mut connections = self.inner.connections.write().await;
        if let Some(entry) = connections.get_mut(&conn_id) {
            entry.joined.insert(room_id);
        }
    }

    pub async fn leave_room(&self, conn_id: Uuid, room_id: i64) {
        let mut connections = self.inner.connections.write().await;
        if let Some(entry) = connections.get_mut(&conn_id) {
            entry.joined.remove(&room_id);
        }
    }

    /// Mark a user online. Broadcasts presence-online only on the first
    /// open connection for that user.
    pub async fn user_online(&self, user_id: Uuid, username: String) {
        let first = {
            let mut online = self.inner.online_users.write().await;
            let entry = online.entry(user_id).or_insert_with(|| OnlineEntry {
                username: username.clone(),
                connections: 0,
            });
            entry.connections += 1;
            entry.connections == 1
        };

        if first {
            self.broadcast(GatewayEvent::PresenceOnline { user_id, username });
        }
    }

    /// Get the current online users.
    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        self.inner
            .online_users
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.username.clone()))
            .collect()
    }

    /// Flip the typing indicator for (room, user). Returns true if the
    /// state actually changed (duplicate starts and stops are no-ops).
    pub async fn set_typing(
        &self,
        room_id: i64,
        user_id: Uuid,
        username: &str,
        is_typing: bool,
    ) -> bool {
        let mut typing = self.inner.typing.write().await;
        if is_typing {
            typing
                .entry(room_id)
                .or_default()
                .insert(user_id, username.to_string())
                .is_none()
        } else {
            match typing.get_mut(&room_id) {
                Some(users) => users.remove(&user_id).is_some(),
                None => false,
            }
        }
    }

    /// Users currently typing in a room.
    pub async fn typing_users(&self, room_id: i64) -> Vec<(Uuid, String)> {
        self.inner
            .typing
            .read()
            .await
            .get(&room_id)
            .map(|users| users.iter().map(|(id, name)| (*id, name.clone())).collect())
            .unwrap_or_default()
    }

    /// Tear down a connection: drop it from the registry, clear the user's
    /// typing state everywhere, and broadcast presence-offline if this was
    /// their last open connection.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let (user_id, username) = {
            let mut connections = self.inner.connections.write().await;
            match connections.remove(&conn_id) {
                Some(entry) => (entry.user_id, entry.username),
                None => return,
            }
        };

        // Typing indicators must not survive the connection, even without
        // an explicit stop-typing.
        let cleared_rooms: Vec<i64> = {
            let mut typing = self.inner.typing.write().await;
            let mut cleared = Vec::new();
            typing.retain(|&room_id, users| {
                if users.remove(&user_id).is_some() {
                    cleared.push(room_id);
                }
                !users.is_empty()
            });
            cleared
        };
        for room_id in cleared_rooms {
            self.broadcast(GatewayEvent::TypingChanged {
                room_id,
                user_id,
                username: username.clone(),
                is_typing: false,
            });
        }

        let last = {
            let mut online = self.inner.online_users.write().await;
            match online.get_mut(&user_id) {
                Some(entry) => {
                    entry.connections -= 1;
                    if entry.connections == 0 {
                        online.remove(&user_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            self.broadcast(GatewayEvent::PresenceOffline { user_id });
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn drain(rx: &mut broadcast::Receiver<Outbound>) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(out) => events.push(out.event),
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("broadcast error: {:?}", e),
            }
        }
        events
    }

    fn offline_count(events: &[GatewayEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::PresenceOffline { .. }))
            .count()
    }

    #[tokio::test]
    async fn multi_device_presence_emits_single_offline() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let user = Uuid::new_v4();

        let (conn_a, _rx_a) = dispatcher.register(user, "ada".into()).await;
        dispatcher.user_online(user, "ada".into()).await;
        let (conn_b, _rx_b) = dispatcher.register(user, "ada".into()).await;
        dispatcher.user_online(user, "ada".into()).await;

        // One online event for two connections
        let events = drain(&mut rx);
        let online = events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::PresenceOnline { .. }))
            .count();
        assert_eq!(online, 1);

        // Closing the first device does not flip presence
        dispatcher.disconnect(conn_a).await;
        assert_eq!(offline_count(&drain(&mut rx)), 0);

        // Closing the last one does, exactly once
        dispatcher.disconnect(conn_b).await;
        assert_eq!(offline_count(&drain(&mut rx)), 1);
        assert!(dispatcher.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn reconnect_before_old_close_has_no_spurious_offline() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (old_conn, _rx_old) = dispatcher.register(user, "ada".into()).await;
        dispatcher.user_online(user, "ada".into()).await;

        // New connection opens before the old one is torn down
        let (_new_conn, _rx_new) = dispatcher.register(user, "ada".into()).await;
        dispatcher.user_online(user, "ada".into()).await;

        let mut rx = dispatcher.subscribe();
        dispatcher.disconnect(old_conn).await;
        assert_eq!(offline_count(&drain(&mut rx)), 0);
        assert_eq!(dispatcher.online_users().await.len(), 1);
    }

    #[tokio::test]
    async fn typing_is_cleared_on_disconnect() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (conn, _rx_conn) = dispatcher.register(user, "ada".into()).await;
        dispatcher.user_online(user, "ada".into()).await;

        assert!(dispatcher.set_typing(7, user, "ada", true).await);
        // Duplicate start is a no-op
        assert!(!dispatcher.set_typing(7, user, "ada", true).await);
        assert!(dispatcher.set_typing(9, user, "ada", true).await);

        let mut rx = dispatcher.subscribe();
        dispatcher.disconnect(conn).await;

        let stops: Vec<i64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::TypingChanged {
                    room_id,
                    is_typing: false,
                    ..
                } => Some(room_id),
                _ => None,
            })
            .collect();
        assert_eq!(stops.len(), 2);
        assert!(stops.contains(&7) && stops.contains(&9));
        assert!(dispatcher.typing_users(7).await.is_empty());
        assert!(dispatcher.typing_users(9).await.is_empty());
    }

    #[tokio::test]
    async fn presence_changes_after_subscribe_reach_the_receiver() {
        let dispatcher = Dispatcher::new();

        // Connection setup subscribes first, then snapshots: anything that
        // flips after the snapshot lands on the receiver instead of falling
        // into a gap.
        let mut rx = dispatcher.subscribe();
        assert!(dispatcher.online_users().await.is_empty());

        let user = Uuid::new_v4();
        let (_conn, _rx_conn) = dispatcher.register(user, "ada".into()).await;
        dispatcher.user_online(user, "ada".into()).await;

        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, GatewayEvent::PresenceOnline { .. }))
        );
    }

    #[tokio::test]
    async fn stop_typing_without_start_is_a_noop() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        assert!(!dispatcher.set_typing(1, user, "ada", false).await);
    }

    #[test]
    fn outbound_room_scoping_and_local_id_echo() {
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();

        let message = parley_types::models::Message {
            id: 10,
            room_id: 3,
            author_id: origin,
            author_username: "ada".into(),
            content: "hi".into(),
            parent_message_id: None,
            created_at: chrono::Utc::now(),
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            thread_reply_count: 0,
            thread_last_replied_at: None,
            thread_last_replied_by: None,
            reactions: vec![],
        };
        let out = Outbound {
            room_id: Some(3),
            echo: Some(Echo {
                conn_id: origin,
                local_id: "abc123".into(),
            }),
            event: GatewayEvent::MessageCreated {
                message,
                local_id: None,
            },
        };

        let joined: HashSet<i64> = [3].into_iter().collect();
        let not_joined: HashSet<i64> = HashSet::new();

        // Not joined: filtered out entirely
        assert!(out.deliverable(origin, &not_joined).is_none());

        // Originating connection sees its local_id
        match out.deliverable(origin, &joined) {
            Some(GatewayEvent::MessageCreated { local_id, .. }) => {
                assert_eq!(local_id.as_deref(), Some("abc123"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Any other connection never sees it
        match out.deliverable(other, &joined) {
            Some(GatewayEvent::MessageCreated { local_id, .. }) => {
                assert_eq!(local_id, None);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn join_and_leave_room_are_idempotent() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (conn, _rx) = dispatcher.register(user, "ada".into()).await;

        dispatcher.join_room(conn, 5).await;
        dispatcher.join_room(conn, 5).await;
        dispatcher.leave_room(conn, 5).await;
        // Leaving a room never joined is fine
        dispatcher.leave_room(conn, 5).await;
        dispatcher.leave_room(conn, 42).await;
    }
}
