//! Database row types — these map directly to SQLite rows.
//! Distinct from the parley-types API models to keep the DB layer
//! independent.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use parley_types::models::{Message, ReactionGroup, Room, RoomKind};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct RoomRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub description: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub room_id: i64,
    pub author_id: String,
    pub author_username: String,
    pub content: String,
    pub parent_id: Option<i64>,
    pub created_at: String,
    pub is_edited: bool,
    pub edited_at: Option<String>,
    pub is_deleted: bool,
    pub reply_count: i64,
    pub last_reply_at: Option<String>,
    pub last_reply_by: Option<String>,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: i64,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

/// Denormalized thread summary returned after a reply insert, used to
/// build the thread-summary-updated broadcast.
pub struct ThreadSummary {
    pub parent_id: i64,
    pub room_id: i64,
    pub reply_count: i64,
    pub last_reply_at: String,
    pub last_reply_by: String,
}

/// Timestamps are written as RFC 3339 UTC with millisecond precision so
/// that string comparison in SQL matches chronological order.
pub fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str, context: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite DEFAULT datetime('now') stores "YYYY-MM-DD HH:MM:SS"
            // without a timezone. Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on {}: {}", raw, context, e);
            DateTime::default()
        })
}

fn parse_user_id(raw: &str, context: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt user id '{}' on {}: {}", raw, context, e);
        Uuid::default()
    })
}

impl MessageRow {
    pub fn into_message(self, reactions: Vec<ReactionGroup>) -> Message {
        let context = format!("message {}", self.id);
        Message {
            id: self.id,
            room_id: self.room_id,
            author_id: parse_user_id(&self.author_id, &context),
            author_username: self.author_username,
            content: self.content,
            parent_message_id: self.parent_id,
            created_at: parse_timestamp(&self.created_at, &context),
            is_edited: self.is_edited,
            edited_at: self.edited_at.as_deref().map(|t| parse_timestamp(t, &context)),
            is_deleted: self.is_deleted,
            thread_reply_count: self.reply_count,
            thread_last_replied_at: self
                .last_reply_at
                .as_deref()
                .map(|t| parse_timestamp(t, &context)),
            thread_last_replied_by: self.last_reply_by,
            reactions,
        }
    }
}

impl RoomRow {
    pub fn into_room(self) -> Room {
        let context = format!("room {}", self.id);
        Room {
            id: self.id,
            name: self.name,
            kind: RoomKind::parse(&self.kind).unwrap_or_else(|| {
                warn!("Corrupt room kind '{}' on {}", self.kind, context);
                RoomKind::Public
            }),
            description: self.description,
            created_at: parse_timestamp(&self.created_at, &context),
        }
    }
}
