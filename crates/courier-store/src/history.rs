//! Per-conversation message history.

use rusqlite::params;

use courier_shared::types::{ConversationKey, Message};

use crate::database::Database;
use crate::error::Result;
use crate::sql::parse_json;

impl Database {
    pub fn append_history(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO history (conversation, message_id, sender, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.conversation().storage_key(),
                message.id.to_string(),
                message.sender.as_str(),
                serde_json::to_string(message)?,
                message.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The newest `limit` messages of a conversation, oldest first.
    pub fn load_history(&self, key: &ConversationKey, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT payload FROM (
                SELECT seq, payload FROM history
                WHERE conversation = ?1
                ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![key.storage_key(), limit], |row| {
            let json: String = row.get(0)?;
            parse_json(0, &json)
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}
