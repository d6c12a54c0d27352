use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};

use parley_types::models::Role;

use crate::Database;
use crate::models::{
    MessageRow, ReactionRow, RoomRow, ThreadSummary, UserRow, now_string,
};

pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.room_id, m.author_id, u.username, m.content, \
     m.parent_id, m.created_at, m.is_edited, m.edited_at, m.is_deleted, \
     m.reply_count, m.last_reply_at, m.last_reply_by";

/// Outcome of a thread-reply insert. Threads are one level deep: replying
/// to a reply is rejected.
pub enum ThreadReplyOutcome {
    Created {
        reply: MessageRow,
        summary: ThreadSummary,
    },
    ParentNotFound,
    ParentIsReply,
}

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|_| anyhow!("User not found: {}", id))
        })
    }

    // -- Rooms and membership --

    /// Create a room and make the creator its owner. Returns `None` if the
    /// room name is already taken.
    pub fn create_room(
        &self,
        name: &str,
        kind: &str,
        description: &str,
        creator_id: &str,
    ) -> Result<Option<RoomRow>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO rooms (name, kind, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, kind, description, now_string()],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
            let room_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO room_members (room_id, user_id, role) VALUES (?1, ?2, 'owner')",
                params![room_id, creator_id],
            )?;
            let row = query_room(&tx, room_id)?
                .ok_or_else(|| anyhow!("room {} missing after insert", room_id))?;
            tx.commit()?;
            Ok(Some(row))
        })
    }

    /// Rooms visible to a user: all public rooms plus private/direct rooms
    /// they are a member of.
    pub fn list_rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.name, r.kind, r.description, r.created_at
                 FROM rooms r
                 LEFT JOIN room_members m ON m.room_id = r.id AND m.user_id = ?1
                 WHERE r.kind = 'public' OR m.user_id IS NOT NULL
                 ORDER BY r.name",
            )?;
            let rows = stmt
                .query_map([user_id], map_room_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn add_member(&self, room_id: i64, user_id: &str, role: Role) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO room_members (room_id, user_id, role) VALUES (?1, ?2, ?3)",
                params![room_id, user_id, role.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn room_exists(&self, room_id: i64) -> Result<bool> {
        self.with_conn(|conn| query_room_exists(conn, room_id))
    }

    /// Membership Oracle: may this user act in this room?
    pub fn can_access(&self, user_id: &str, room_id: i64) -> Result<bool> {
        self.with_conn(|conn| query_can_access(conn, user_id, room_id))
    }

    /// Membership Oracle: the user's role in the room, if they are a member.
    pub fn role_of(&self, user_id: &str, room_id: i64) -> Result<Option<Role>> {
        self.with_conn(|conn| {
            let role: Option<String> = conn
                .query_row(
                    "SELECT role FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                    params![room_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(role.as_deref().and_then(Role::parse))
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        room_id: i64,
        author_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| insert_message_row(conn, room_id, author_id, content))
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Update content in place and stamp the edit. Author check is the
    /// caller's responsibility. Returns the edited_at timestamp.
    pub fn edit_message(&self, id: i64, content: &str) -> Result<String> {
        self.with_conn(|conn| {
            let edited_at = now_string();
            let changed = conn.execute(
                "UPDATE messages SET content = ?1, is_edited = 1, edited_at = ?2 WHERE id = ?3",
                params![content, edited_at, id],
            )?;
            if changed == 0 {
                return Err(anyhow!("message {} not found", id));
            }
            Ok(edited_at)
        })
    }

    /// Soft delete: the row stays so clients can render a placeholder and
    /// cursors pointing at it keep resolving.
    pub fn soft_delete_message(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE messages SET is_deleted = 1 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Insert a thread reply and bump the parent's denormalized summary in
    /// one transaction.
    pub fn insert_thread_reply(
        &self,
        parent_id: i64,
        author_id: &str,
        content: &str,
    ) -> Result<ThreadReplyOutcome> {
        self.with_conn_mut(|conn| insert_thread_reply_tx(conn, parent_id, author_id, content))
    }

    // -- Reactions --

    /// Add a reaction if this (message, user, emoji) tuple is absent.
    /// Returns the resulting count for the emoji, or `None` if the user
    /// had already reacted (no change).
    pub fn add_reaction(
        &self,
        id: &str,
        message_id: i64,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<usize>> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO reactions (id, message_id, user_id, emoji)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, message_id, user_id, emoji],
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            Ok(Some(query_reaction_count(conn, message_id, emoji)?))
        })
    }

    /// Remove a reaction if present. Returns the resulting count, or
    /// `None` if there was nothing to remove.
    pub fn remove_reaction(
        &self,
        message_id: i64,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<usize>> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id, user_id, emoji],
            )?;
            if removed == 0 {
                return Ok(None);
            }
            Ok(Some(query_reaction_count(conn, message_id, emoji)?))
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[i64]) -> Result<Vec<ReactionRow>> {
        self.with_conn(|conn| query_reactions_for_messages(conn, message_ids))
    }
}

// -- Free query functions, shared with the history engine and with
// callers that need to persist and act before releasing the store lock --

/// Insert a root message and return the stored row. The gateway runs this
/// inside `with_conn` and emits the broadcast before the lock is released,
/// so frame order on the fabric matches insert order.
pub fn insert_message_row(
    conn: &Connection,
    room_id: i64,
    author_id: &str,
    content: &str,
) -> Result<MessageRow> {
    conn.execute(
        "INSERT INTO messages (room_id, author_id, content, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![room_id, author_id, content, now_string()],
    )?;
    let id = conn.last_insert_rowid();
    query_message(conn, id)?.ok_or_else(|| anyhow!("message {} missing after insert", id))
}

/// Thread-reply insert with the summary bump, in one transaction.
pub fn insert_thread_reply_tx(
    conn: &mut Connection,
    parent_id: i64,
    author_id: &str,
    content: &str,
) -> Result<ThreadReplyOutcome> {
    let tx = conn.transaction()?;

    let parent = match query_message(&tx, parent_id)? {
        Some(p) => p,
        None => return Ok(ThreadReplyOutcome::ParentNotFound),
    };
    if parent.parent_id.is_some() {
        return Ok(ThreadReplyOutcome::ParentIsReply);
    }

    let created_at = now_string();
    tx.execute(
        "INSERT INTO messages (room_id, author_id, content, parent_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![parent.room_id, author_id, content, parent_id, created_at],
    )?;
    let reply_id = tx.last_insert_rowid();

    let author_username: String = tx
        .query_row("SELECT username FROM users WHERE id = ?1", [author_id], |row| {
            row.get(0)
        })
        .optional()?
        .unwrap_or_else(|| "unknown".to_string());

    tx.execute(
        "UPDATE messages
         SET reply_count = reply_count + 1, last_reply_at = ?1, last_reply_by = ?2
         WHERE id = ?3",
        params![created_at, author_username, parent_id],
    )?;

    let reply = query_message(&tx, reply_id)?
        .ok_or_else(|| anyhow!("reply {} missing after insert", reply_id))?;
    let summary = ThreadSummary {
        parent_id,
        room_id: parent.room_id,
        reply_count: parent.reply_count + 1,
        last_reply_at: created_at,
        last_reply_by: author_username,
    };

    tx.commit()?;
    Ok(ThreadReplyOutcome::Created { reply, summary })
}

pub(crate) fn query_user_by_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, username, password, created_at FROM users WHERE username = ?1")?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

pub(crate) fn query_room(conn: &Connection, room_id: i64) -> Result<Option<RoomRow>> {
    let mut stmt = conn
        .prepare("SELECT id, name, kind, description, created_at FROM rooms WHERE id = ?1")?;
    let row = stmt.query_row([room_id], map_room_row).optional()?;
    Ok(row)
}

pub(crate) fn query_room_exists(conn: &Connection, room_id: i64) -> Result<bool> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM rooms WHERE id = ?1", [room_id], |row| row.get(0))
        .optional()?;
    Ok(exists.is_some())
}

pub fn query_can_access(conn: &Connection, user_id: &str, room_id: i64) -> Result<bool> {
    let kind: Option<String> = conn
        .query_row("SELECT kind FROM rooms WHERE id = ?1", [room_id], |row| row.get(0))
        .optional()?;

    match kind.as_deref() {
        None => Ok(false),
        Some("public") => Ok(true),
        Some(_) => {
            let member: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                    params![room_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(member.is_some())
        }
    }
}

pub fn query_message(conn: &Connection, id: i64) -> Result<Option<MessageRow>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages m
         LEFT JOIN users u ON m.author_id = u.id
         WHERE m.id = ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt.query_row([id], map_message_row).optional()?;
    Ok(row)
}

pub(crate) fn query_reaction_count(conn: &Connection, message_id: i64, emoji: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM reactions WHERE message_id = ?1 AND emoji = ?2",
        params![message_id, emoji],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

pub(crate) fn query_reactions_for_messages(
    conn: &Connection,
    message_ids: &[i64],
) -> Result<Vec<ReactionRow>> {
    if message_ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT id, message_id, user_id, emoji, created_at FROM reactions WHERE message_id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(ReactionRow {
                id: row.get(0)?,
                message_id: row.get(1)?,
                user_id: row.get(2)?,
                emoji: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub(crate) fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(4)?,
        parent_id: row.get(5)?,
        created_at: row.get(6)?,
        is_edited: row.get::<_, i64>(7)? != 0,
        edited_at: row.get(8)?,
        is_deleted: row.get::<_, i64>(9)? != 0,
        reply_count: row.get(10)?,
        last_reply_at: row.get(11)?,
        last_reply_by: row.get(12)?,
    })
}

fn map_room_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}
