//! Group rows and their membership sets.

use std::collections::BTreeSet;

use rusqlite::params;

use courier_shared::types::{Group, GroupId, Username};

use crate::database::Database;
use crate::error::Result;
use crate::sql::{parse_timestamp, parse_uuid};

impl Database {
    /// Insert or update a group and replace its member set.
    pub fn save_group(&mut self, group: &Group) -> Result<()> {
        let id = group.id.to_string();
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO chat_groups (id, name, description, owner, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                owner = excluded.owner,
                active = excluded.active",
            params![
                id,
                group.name,
                group.description,
                group.owner.as_str(),
                group.active as i32,
                group.created_at.to_rfc3339(),
            ],
        )?;

        tx.execute("DELETE FROM group_members WHERE group_id = ?1", params![id])?;
        {
            let mut insert =
                tx.prepare("INSERT INTO group_members (group_id, username) VALUES (?1, ?2)")?;
            for member in &group.members {
                insert.execute(params![id, member.as_str()])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load every group, archived ones included.
    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, description, owner, active, created_at
             FROM chat_groups ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }

        let mut members = self
            .conn()
            .prepare("SELECT username FROM group_members WHERE group_id = ?1")?;
        for group in &mut groups {
            let names = members.query_map(params![group.id.to_string()], |row| {
                row.get::<_, String>(0)
            })?;
            for name in names {
                group.members.insert(Username::new(name?));
            }
        }

        Ok(groups)
    }
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: String = row.get(2)?;
    let owner: String = row.get(3)?;
    let active: i32 = row.get(4)?;
    let created_str: String = row.get(5)?;

    Ok(Group {
        id: GroupId(parse_uuid(0, &id_str)?),
        name,
        description,
        owner: Username::new(owner),
        members: BTreeSet::new(),
        active: active != 0,
        created_at: parse_timestamp(5, &created_str)?,
    })
}
