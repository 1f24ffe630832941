//! Offline mailbox rows, kept in FIFO order per owner.

use rusqlite::params;
use uuid::Uuid;

use courier_shared::protocol::MailboxEntry;
use courier_shared::types::Username;

use crate::database::Database;
use crate::error::Result;
use crate::sql::{parse_json, parse_timestamp, parse_uuid};

impl Database {
    pub fn push_mailbox(&self, entry: &MailboxEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO mailbox (id, owner, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id.to_string(),
                entry.owner.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.enqueued_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Queued entries of one owner, oldest first.
    pub fn list_mailbox(&self, owner: &Username) -> Result<Vec<MailboxEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, owner, payload, enqueued_at FROM mailbox
             WHERE owner = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![owner.as_str()], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Remove delivered entries. Returns how many rows went away.
    pub fn remove_mailbox(&mut self, owner: &Username, ids: &[Uuid]) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM mailbox WHERE owner = ?1 AND id = ?2")?;
            for id in ids {
                removed += stmt.execute(params![owner.as_str(), id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MailboxEntry> {
    let id_str: String = row.get(0)?;
    let owner: String = row.get(1)?;
    let payload_json: String = row.get(2)?;
    let enqueued_str: String = row.get(3)?;

    Ok(MailboxEntry {
        id: parse_uuid(0, &id_str)?,
        owner: Username::new(owner),
        payload: parse_json(2, &payload_json)?,
        enqueued_at: parse_timestamp(3, &enqueued_str)?,
    })
}
