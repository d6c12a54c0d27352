use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Commands sent FROM client TO server over the WebSocket gateway.
///
/// The tag set is closed: a frame with an unknown `type` fails to
/// deserialize and is rejected at the connection boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection with a bearer token
    Identify { token: String },

    /// Join a room; required before sending or receiving room events
    JoinRoom { room_id: i64 },

    /// Leave a room (idempotent — acknowledged even if not joined)
    LeaveRoom { room_id: i64 },

    /// Post a message. `local_id` is a client correlation token echoed
    /// back only to the sending connection for optimistic-UI reconciliation.
    SendMessage {
        room_id: i64,
        content: String,
        #[serde(default)]
        local_id: Option<String>,
    },

    /// Edit own message content
    EditMessage { message_id: i64, content: String },

    /// Soft-delete own message
    DeleteMessage { message_id: i64 },

    /// Add a reaction (no-op if this user already reacted with this emoji)
    AddReaction { message_id: i64, emoji: String },

    /// Remove a reaction (no-op if absent)
    RemoveReaction { message_id: i64, emoji: String },

    /// Reply in a thread rooted at `parent_message_id`
    CreateThreadReply {
        parent_message_id: i64,
        content: String,
        #[serde(default)]
        local_id: Option<String>,
    },

    /// Indicate typing in a room
    StartTyping { room_id: i64 },

    /// Stop the typing indicator
    StopTyping { room_id: i64 },
}

/// Events sent FROM server TO clients over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Acknowledges a successful join-room
    JoinedRoom { room_id: i64 },

    /// Acknowledges leave-room
    LeftRoom { room_id: i64 },

    /// A new message (root or thread reply) was persisted.
    /// `local_id` is only present on the copy delivered to the connection
    /// that issued the send.
    MessageCreated {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_id: Option<String>,
    },

    /// A message was edited in place
    MessageUpdated {
        id: i64,
        room_id: i64,
        content: String,
        is_edited: bool,
        edited_at: DateTime<Utc>,
    },

    /// A message was soft-deleted
    MessageDeleted { id: i64, room_id: i64 },

    /// Reaction delta — resulting count instead of the full reaction list
    ReactionAdded {
        message_id: i64,
        room_id: i64,
        emoji: String,
        user_id: Uuid,
        username: String,
        count: usize,
    },

    ReactionRemoved {
        message_id: i64,
        room_id: i64,
        emoji: String,
        user_id: Uuid,
        count: usize,
    },

    /// The denormalized thread summary on a root message changed
    ThreadSummaryUpdated {
        parent_id: i64,
        room_id: i64,
        thread_reply_count: i64,
        thread_last_replied_at: DateTime<Utc>,
        thread_last_replied_by: String,
    },

    /// A user came online (first open connection)
    PresenceOnline { user_id: Uuid, username: String },

    /// A user went offline (last open connection closed)
    PresenceOffline { user_id: Uuid },

    /// Typing indicator changed for a room
    TypingChanged {
        room_id: i64,
        user_id: Uuid,
        username: String,
        is_typing: bool,
    },

    /// Scoped error, delivered only to the originating connection
    Error { message: String },
}

impl GatewayEvent {
    /// Returns the room_id if this event is scoped to a specific room.
    /// Events that return `None` are global and reach every connection.
    pub fn room_id(&self) -> Option<i64> {
        match self {
            Self::MessageCreated { message, .. } => Some(message.room_id),
            Self::MessageUpdated { room_id, .. } => Some(*room_id),
            Self::MessageDeleted { room_id, .. } => Some(*room_id),
            Self::ReactionAdded { room_id, .. } => Some(*room_id),
            Self::ReactionRemoved { room_id, .. } => Some(*room_id),
            Self::ThreadSummaryUpdated { room_id, .. } => Some(*room_id),
            Self::TypingChanged { room_id, .. } => Some(*room_id),
            // Ready, JoinedRoom/LeftRoom (targeted), presence and Error are not room-scoped
            _ => None,
        }
    }
}
