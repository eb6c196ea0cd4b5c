//! v001 -- Initial schema creation.
//!
//! Creates the `users` directory table and the `messages` log.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (directory)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid       TEXT NOT NULL UNIQUE,          -- auth identity, message address
    name       TEXT,
    email      TEXT,
    role       TEXT,
    created_at TEXT NOT NULL                  -- RFC-3339, UTC, microseconds
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id   TEXT NOT NULL,                -- users.uuid
    receiver_id TEXT NOT NULL,                -- users.uuid
    body        TEXT NOT NULL,
    created_at  TEXT NOT NULL,                -- RFC-3339, UTC, microseconds

    CHECK (sender_id <> receiver_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_sender_ts
    ON messages(sender_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_receiver_ts
    ON messages(receiver_id, created_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
