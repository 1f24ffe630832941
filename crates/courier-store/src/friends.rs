//! Friend links and pending friend requests.

use rusqlite::params;

use courier_shared::types::{FriendLink, FriendRequest, Username};

use crate::database::Database;
use crate::error::Result;
use crate::sql::{parse_json, parse_timestamp};

impl Database {
    /// Returns `true` if a link existed.
    pub fn delete_friend_link(&self, a: &Username, b: &Username) -> Result<bool> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let n = self.conn().execute(
            "DELETE FROM friend_links WHERE user_a = ?1 AND user_b = ?2",
            params![lo.as_str(), hi.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn list_friend_links(&self) -> Result<Vec<FriendLink>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_a, user_b, since FROM friend_links ORDER BY user_a, user_b")?;
        let rows = stmt.query_map([], row_to_link)?;

        let mut links = Vec::new();
        for row in rows {
            links.push(row?);
        }
        Ok(links)
    }

    pub fn upsert_friend_request(&self, request: &FriendRequest) -> Result<()> {
        self.conn().execute(
            "INSERT INTO friend_requests (from_user, to_user, requested_at, sender_snapshot)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(from_user, to_user) DO UPDATE SET
                requested_at = excluded.requested_at,
                sender_snapshot = excluded.sender_snapshot",
            params![
                request.from.as_str(),
                request.to.as_str(),
                request.requested_at.to_rfc3339(),
                serde_json::to_string(&request.sender_snapshot)?,
            ],
        )?;
        Ok(())
    }

    /// Returns `true` if a request existed.
    pub fn delete_friend_request(&self, from: &Username, to: &Username) -> Result<bool> {
        let n = self.conn().execute(
            "DELETE FROM friend_requests WHERE from_user = ?1 AND to_user = ?2",
            params![from.as_str(), to.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn list_friend_requests(&self) -> Result<Vec<FriendRequest>> {
        let mut stmt = self.conn().prepare(
            "SELECT from_user, to_user, requested_at, sender_snapshot
             FROM friend_requests ORDER BY requested_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_request)?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    /// Drop the request (and any reverse one) and record the link in one
    /// transaction.
    pub fn accept_friend_request(&mut self, request: &FriendRequest, link: &FriendLink) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM friend_requests
             WHERE (from_user = ?1 AND to_user = ?2) OR (from_user = ?2 AND to_user = ?1)",
            params![request.from.as_str(), request.to.as_str()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO friend_links (user_a, user_b, since) VALUES (?1, ?2, ?3)",
            params![
                link.user_a.as_str(),
                link.user_b.as_str(),
                link.since.to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn row_to_link(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendLink> {
    let user_a: String = row.get(0)?;
    let user_b: String = row.get(1)?;
    let since_str: String = row.get(2)?;

    Ok(FriendLink {
        user_a: Username::new(user_a),
        user_b: Username::new(user_b),
        since: parse_timestamp(2, &since_str)?,
    })
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendRequest> {
    let from: String = row.get(0)?;
    let to: String = row.get(1)?;
    let requested_str: String = row.get(2)?;
    let snapshot_json: String = row.get(3)?;

    Ok(FriendRequest {
        from: Username::new(from),
        to: Username::new(to),
        requested_at: parse_timestamp(2, &requested_str)?,
        sender_snapshot: parse_json(3, &snapshot_json)?,
    })
}
