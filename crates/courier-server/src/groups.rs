//! Group Registry. Empty groups are archived (`active = false`) rather than
//! deleted; an archived group behaves as if it did not exist.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;

use courier_shared::constants::MAX_GROUP_NAME_LEN;
use courier_shared::types::{Group, GroupId, Username};
use courier_shared::RelayError;
use courier_store::{Persistence, StoreError};

pub struct GroupRegistry {
    groups: DashMap<GroupId, Group>,
    store: Arc<dyn Persistence>,
}

impl GroupRegistry {
    pub fn load(store: Arc<dyn Persistence>) -> Result<Self, StoreError> {
        let groups = DashMap::new();
        for group in store.load_groups()? {
            groups.insert(group.id, group);
        }
        info!(count = groups.len(), "Loaded groups");
        Ok(Self { groups, store })
    }

    pub fn create_group(
        &self,
        owner: &Username,
        name: &str,
        description: &str,
    ) -> Result<Group, RelayError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(RelayError::InvalidInput(format!(
                "group name must be 1-{MAX_GROUP_NAME_LEN} characters"
            )));
        }

        let group = Group {
            id: GroupId::new(),
            name: name.to_string(),
            description: description.to_string(),
            owner: owner.clone(),
            members: [owner.clone()].into(),
            active: true,
            created_at: Utc::now(),
        };
        self.store.save_group(&group)?;
        self.groups.insert(group.id, group.clone());

        info!(group = %group.id, owner = %owner, "Group created");
        Ok(group)
    }

    /// `user` joins on their own.
    pub fn join(&self, group_id: GroupId, user: &Username) -> Result<Group, RelayError> {
        self.mutate(group_id, |group| {
            if !group.members.insert(user.clone()) {
                return Err(RelayError::AlreadyMember(user.to_string()));
            }
            Ok(())
        })
    }

    /// An existing member adds someone else.
    pub fn add_member(
        &self,
        group_id: GroupId,
        actor: &Username,
        new_member: &Username,
    ) -> Result<Group, RelayError> {
        self.mutate(group_id, |group| {
            if !group.members.contains(actor) {
                return Err(RelayError::NotMember(actor.to_string()));
            }
            if !group.members.insert(new_member.clone()) {
                return Err(RelayError::AlreadyMember(new_member.to_string()));
            }
            Ok(())
        })
    }

    /// Remove `user`. An owner who leaves hands the group to the first
    /// remaining member; the last one out archives it.
    pub fn leave(&self, group_id: GroupId, user: &Username) -> Result<Group, RelayError> {
        self.mutate(group_id, |group| {
            if !group.members.remove(user) {
                return Err(RelayError::NotMember(user.to_string()));
            }
            match group.members.first() {
                None => group.active = false,
                Some(next) if &group.owner == user => group.owner = next.clone(),
                Some(_) => {}
            }
            Ok(())
        })
    }

    pub fn is_member(&self, group_id: GroupId, user: &Username) -> bool {
        self.groups
            .get(&group_id)
            .is_some_and(|g| g.active && g.members.contains(user))
    }

    /// An active group.
    pub fn get(&self, group_id: GroupId) -> Result<Group, RelayError> {
        self.groups
            .get(&group_id)
            .filter(|g| g.active)
            .map(|g| g.value().clone())
            .ok_or_else(|| RelayError::NotFound(format!("group {group_id}")))
    }

    /// Active groups `user` belongs to, by name.
    pub fn groups_of(&self, user: &Username) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .groups
            .iter()
            .filter(|g| g.active && g.members.contains(user))
            .map(|g| g.value().clone())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        groups
    }

    pub fn active_count(&self) -> usize {
        self.groups.iter().filter(|g| g.active).count()
    }

    /// Apply `change` to a copy, persist it, then publish it. The map's
    /// entry lock is held throughout so concurrent changes cannot interleave.
    fn mutate(
        &self,
        group_id: GroupId,
        change: impl FnOnce(&mut Group) -> Result<(), RelayError>,
    ) -> Result<Group, RelayError> {
        let mut entry = self
            .groups
            .get_mut(&group_id)
            .filter(|g| g.active)
            .ok_or_else(|| RelayError::NotFound(format!("group {group_id}")))?;

        let mut updated = entry.clone();
        change(&mut updated)?;
        self.store.save_group(&updated)?;
        *entry = updated;
        Ok(entry.clone())
    }
}
