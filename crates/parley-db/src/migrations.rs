use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            kind        TEXT NOT NULL DEFAULT 'public',
            description TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Membership relation read by the gateway on every join attempt.
        -- Role changes and invites are administered out-of-band.
        CREATE TABLE IF NOT EXISTS room_members (
            room_id     INTEGER NOT NULL REFERENCES rooms(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            role        TEXT NOT NULL DEFAULT 'member',
            starred     INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (room_id, user_id)
        );

        -- The integer message id is monotone and doubles as the pagination
        -- cursor. reply_count/last_reply_* is the denormalized thread
        -- summary, maintained on root messages only.
        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id         INTEGER NOT NULL REFERENCES rooms(id),
            author_id       TEXT NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            parent_id       INTEGER REFERENCES messages(id),
            created_at      TEXT NOT NULL,
            is_edited       INTEGER NOT NULL DEFAULT 0,
            edited_at       TEXT,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            reply_count     INTEGER NOT NULL DEFAULT 0,
            last_reply_at   TEXT,
            last_reply_by   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at, id);

        CREATE INDEX IF NOT EXISTS idx_messages_parent
            ON messages(parent_id, created_at, id);

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        -- Seed the default general room
        INSERT OR IGNORE INTO rooms (id, name, kind, description)
            VALUES (1, 'general', 'public', 'General discussion');
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
