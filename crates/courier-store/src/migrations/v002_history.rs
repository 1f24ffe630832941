use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS history (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation TEXT NOT NULL,                      -- "dm:a:b" or "group:<uuid>"
    message_id   TEXT NOT NULL,
    sender       TEXT NOT NULL,
    payload      TEXT NOT NULL,                      -- JSON Message
    timestamp    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_conversation ON history(conversation, seq);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
