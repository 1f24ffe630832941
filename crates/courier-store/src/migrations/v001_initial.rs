//! v001 -- Initial schema creation.
//!
//! Creates the account, relationship, group and mailbox tables.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    username            TEXT PRIMARY KEY NOT NULL,   -- case-sensitive
    password_hash       TEXT NOT NULL,               -- bcrypt, salt included
    profile             TEXT NOT NULL,               -- JSON object, opaque
    profile_picture_ref TEXT,
    created_at          TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Accepted friendships (user_a < user_b)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friend_links (
    user_a TEXT NOT NULL,
    user_b TEXT NOT NULL,
    since  TEXT NOT NULL,

    PRIMARY KEY (user_a, user_b),
    CHECK (user_a < user_b),
    FOREIGN KEY (user_a) REFERENCES users(username),
    FOREIGN KEY (user_b) REFERENCES users(username)
);

CREATE INDEX IF NOT EXISTS idx_friend_links_b ON friend_links(user_b);

-- ----------------------------------------------------------------
-- Pending friend requests
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friend_requests (
    from_user       TEXT NOT NULL,
    to_user         TEXT NOT NULL,
    requested_at    TEXT NOT NULL,
    sender_snapshot TEXT NOT NULL,                   -- JSON UserSummary

    PRIMARY KEY (from_user, to_user),
    FOREIGN KEY (from_user) REFERENCES users(username),
    FOREIGN KEY (to_user) REFERENCES users(username)
);

CREATE INDEX IF NOT EXISTS idx_friend_requests_to ON friend_requests(to_user);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    id          TEXT PRIMARY KEY NOT NULL,           -- UUID v4
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    owner       TEXT NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1,          -- boolean 0/1
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL,
    username TEXT NOT NULL,

    PRIMARY KEY (group_id, username),
    FOREIGN KEY (group_id) REFERENCES chat_groups(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Offline mailbox (FIFO per owner by seq)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS mailbox (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,                -- UUID v4
    owner       TEXT NOT NULL,
    payload     TEXT NOT NULL,                       -- JSON ServerFrame
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mailbox_owner ON mailbox(owner, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
