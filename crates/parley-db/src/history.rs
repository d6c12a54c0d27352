//! Cursor-based history retrieval, shared by room history and thread
//! history.
//!
//! The cursor is a message id. Ordering is by (created_at, id): ids are
//! monotone, so the pair gives a total order even for same-millisecond
//! messages. An unresolvable cursor (garbage or never-existed id) is
//! treated as "no cursor" rather than an error, which keeps pagination
//! robust against concurrently removed boundary messages.

use std::collections::HashMap;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use parley_types::api::{Direction, HistoryResponse, Pagination, ThreadResponse};
use parley_types::models::ReactionGroup;

use crate::Database;
use crate::models::ReactionRow;
use crate::queries::{
    MESSAGE_COLUMNS, map_message_row, query_can_access, query_message,
    query_reactions_for_messages, query_room_exists,
};

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct HistoryOptions {
    pub limit: u32,
    pub cursor: Option<i64>,
    pub direction: Direction,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            cursor: None,
            direction: Direction::Older,
        }
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("container not found")]
    NotFound,
    #[error("access denied")]
    Forbidden,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

enum Container {
    /// Root messages of a room (thread replies live under their parent)
    Room(i64),
    /// Replies whose parent_id equals the container id
    Thread(i64),
}

enum Outcome<T> {
    Page(T),
    NotFound,
    Forbidden,
}

impl Database {
    /// Room history: newest-first page of the room's root messages.
    pub fn room_history(
        &self,
        room_id: i64,
        user_id: &str,
        opts: HistoryOptions,
    ) -> Result<HistoryResponse, HistoryError> {
        let outcome = self.with_conn(|conn| {
            if !query_room_exists(conn, room_id)? {
                return Ok(Outcome::NotFound);
            }
            if !query_can_access(conn, user_id, room_id)? {
                return Ok(Outcome::Forbidden);
            }
            let page = fetch_page(conn, Container::Room(room_id), opts)?;
            Ok(Outcome::Page(page))
        })?;

        match outcome {
            Outcome::Page(page) => Ok(page),
            Outcome::NotFound => Err(HistoryError::NotFound),
            Outcome::Forbidden => Err(HistoryError::Forbidden),
        }
    }

    /// Thread history: the parent message plus a page of its replies under
    /// the same pagination contract.
    pub fn thread_history(
        &self,
        parent_id: i64,
        user_id: &str,
        opts: HistoryOptions,
    ) -> Result<ThreadResponse, HistoryError> {
        let outcome = self.with_conn(|conn| {
            let parent = match query_message(conn, parent_id)? {
                Some(p) => p,
                None => return Ok(Outcome::NotFound),
            };
            if !query_can_access(conn, user_id, parent.room_id)? {
                return Ok(Outcome::Forbidden);
            }

            let page = fetch_page(conn, Container::Thread(parent_id), opts)?;

            let reaction_rows = query_reactions_for_messages(conn, &[parent_id])?;
            let mut groups = group_reactions(reaction_rows);
            let parent = parent.into_message(groups.remove(&parent_id).unwrap_or_default());

            Ok(Outcome::Page(ThreadResponse {
                parent,
                replies: page.data,
                pagination: page.pagination,
            }))
        })?;

        match outcome {
            Outcome::Page(page) => Ok(page),
            Outcome::NotFound => Err(HistoryError::NotFound),
            Outcome::Forbidden => Err(HistoryError::Forbidden),
        }
    }
}

fn fetch_page(
    conn: &Connection,
    container: Container,
    opts: HistoryOptions,
) -> Result<HistoryResponse> {
    let limit = opts.limit.clamp(1, MAX_LIMIT) as usize;

    // Resolve the cursor to its (created_at, id) sort key. Unresolvable
    // cursors degrade to "no cursor".
    let anchor: Option<(String, i64)> = match opts.cursor {
        None => None,
        Some(cursor_id) => conn
            .query_row(
                "SELECT created_at, id FROM messages WHERE id = ?1",
                [cursor_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?,
    };

    let (container_sql, container_id) = match container {
        Container::Room(id) => ("m.room_id = ? AND m.parent_id IS NULL", id),
        Container::Thread(id) => ("m.parent_id = ?", id),
    };

    // Strict inequality on the (created_at, id) pair excludes the cursor
    // message itself.
    let (cmp, order) = match opts.direction {
        Direction::Older => ("<", "DESC"),
        Direction::Newer => (">", "ASC"),
    };

    let mut sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages m
         LEFT JOIN users u ON m.author_id = u.id
         WHERE {container_sql}"
    );
    if anchor.is_some() {
        sql.push_str(&format!(
            " AND (m.created_at {cmp} ? OR (m.created_at = ? AND m.id {cmp} ?))"
        ));
    }
    sql.push_str(&format!(" ORDER BY m.created_at {order}, m.id {order} LIMIT ?"));

    // Fetch one past the limit to learn whether more pages exist.
    let fetch_limit = (limit + 1) as i64;
    let mut binds: Vec<&dyn rusqlite::types::ToSql> = vec![&container_id];
    if let Some((ts, id)) = &anchor {
        binds.push(ts);
        binds.push(ts);
        binds.push(id);
    }
    binds.push(&fetch_limit);

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(binds.as_slice(), map_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let has_more = rows.len() > limit;
    rows.truncate(limit);

    // Returned data is always newest-first, regardless of fetch direction.
    if opts.direction == Direction::Newer {
        rows.reverse();
    }

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let reaction_rows = query_reactions_for_messages(conn, &ids)?;
    let mut groups = group_reactions(reaction_rows);

    let data: Vec<_> = rows
        .into_iter()
        .map(|row| {
            let reactions = groups.remove(&row.id).unwrap_or_default();
            row.into_message(reactions)
        })
        .collect();

    // next_cursor continues toward older messages, prev_cursor toward newer.
    let pagination = Pagination {
        has_more,
        next_cursor: data.last().map(|m| m.id),
        prev_cursor: data.first().map(|m| m.id),
    };

    Ok(HistoryResponse { data, pagination })
}

/// Group raw reaction rows into per-message `{emoji, count, user_ids}`
/// summaries.
pub(crate) fn group_reactions(rows: Vec<ReactionRow>) -> HashMap<i64, Vec<ReactionGroup>> {
    let mut by_message: HashMap<i64, HashMap<String, Vec<Uuid>>> = HashMap::new();
    for r in rows {
        let emoji_map = by_message.entry(r.message_id).or_default();
        let user_ids = emoji_map.entry(r.emoji).or_default();
        if let Ok(uid) = r.user_id.parse::<Uuid>() {
            user_ids.push(uid);
        }
    }

    by_message
        .into_iter()
        .map(|(message_id, emoji_map)| {
            let groups = emoji_map
                .into_iter()
                .map(|(emoji, user_ids)| ReactionGroup {
                    emoji,
                    count: user_ids.len(),
                    user_ids,
                })
                .collect();
            (message_id, groups)
        })
        .collect()
}
