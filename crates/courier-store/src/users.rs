//! CRUD operations for [`StoredUser`] records.

use rusqlite::params;

use courier_shared::types::Username;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::StoredUser;
use crate::sql::{parse_json, parse_timestamp};

impl Database {
    /// Insert or replace a user row.
    pub fn upsert_user(&self, user: &StoredUser) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (username, password_hash, profile, profile_picture_ref, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(username) DO UPDATE SET
                password_hash = excluded.password_hash,
                profile = excluded.profile,
                profile_picture_ref = excluded.profile_picture_ref",
            params![
                user.username.as_str(),
                user.password_hash,
                serde_json::to_string(&user.profile)?,
                user.profile_picture_ref,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, username: &Username) -> Result<StoredUser> {
        self.conn()
            .query_row(
                "SELECT username, password_hash, profile, profile_picture_ref, created_at
                 FROM users WHERE username = ?1",
                params![username.as_str()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List all users ordered by username.
    pub fn list_users(&self) -> Result<Vec<StoredUser>> {
        let mut stmt = self.conn().prepare(
            "SELECT username, password_hash, profile, profile_picture_ref, created_at
             FROM users ORDER BY username ASC",
        )?;

        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredUser> {
    let username: String = row.get(0)?;
    let password_hash: String = row.get(1)?;
    let profile_json: String = row.get(2)?;
    let profile_picture_ref: Option<String> = row.get(3)?;
    let created_str: String = row.get(4)?;

    Ok(StoredUser {
        username: Username::new(username),
        password_hash,
        profile: parse_json(2, &profile_json)?,
        profile_picture_ref,
        created_at: parse_timestamp(4, &created_str)?,
    })
}
