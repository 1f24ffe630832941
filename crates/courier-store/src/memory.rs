//! Volatile [`Persistence`] used by tests and throwaway instances.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use courier_shared::protocol::MailboxEntry;
use courier_shared::types::{
    ConversationKey, FriendLink, FriendRequest, Group, GroupId, Message, Username,
};

use crate::error::{Result, StoreError};
use crate::models::StoredUser;
use crate::persistence::Persistence;

#[derive(Default)]
struct State {
    users: BTreeMap<Username, StoredUser>,
    links: BTreeMap<(Username, Username), FriendLink>,
    requests: BTreeMap<(Username, Username), FriendRequest>,
    groups: BTreeMap<GroupId, Group>,
    mailbox: Vec<MailboxEntry>,
    history: HashMap<String, Vec<Message>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn link_key(a: &Username, b: &Username) -> (Username, Username) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl Persistence for MemoryStore {
    fn load_users(&self) -> Result<Vec<StoredUser>> {
        Ok(self.state()?.users.values().cloned().collect())
    }

    fn save_user(&self, user: &StoredUser) -> Result<()> {
        self.state()?
            .users
            .insert(user.username.clone(), user.clone());
        Ok(())
    }

    fn load_friend_links(&self) -> Result<Vec<FriendLink>> {
        Ok(self.state()?.links.values().cloned().collect())
    }

    fn load_friend_requests(&self) -> Result<Vec<FriendRequest>> {
        let mut requests: Vec<_> = self.state()?.requests.values().cloned().collect();
        requests.sort_by_key(|r| r.requested_at);
        Ok(requests)
    }

    fn remove_friend_link(&self, a: &Username, b: &Username) -> Result<()> {
        self.state()?.links.remove(&link_key(a, b));
        Ok(())
    }

    fn save_friend_request(&self, request: &FriendRequest) -> Result<()> {
        self.state()?.requests.insert(
            (request.from.clone(), request.to.clone()),
            request.clone(),
        );
        Ok(())
    }

    fn remove_friend_request(&self, from: &Username, to: &Username) -> Result<()> {
        self.state()?.requests.remove(&(from.clone(), to.clone()));
        Ok(())
    }

    fn accept_friend_request(&self, request: &FriendRequest, link: &FriendLink) -> Result<()> {
        let mut state = self.state()?;
        state
            .requests
            .remove(&(request.from.clone(), request.to.clone()));
        state
            .requests
            .remove(&(request.to.clone(), request.from.clone()));
        state
            .links
            .insert(link_key(&link.user_a, &link.user_b), link.clone());
        Ok(())
    }

    fn load_groups(&self) -> Result<Vec<Group>> {
        Ok(self.state()?.groups.values().cloned().collect())
    }

    fn save_group(&self, group: &Group) -> Result<()> {
        self.state()?.groups.insert(group.id, group.clone());
        Ok(())
    }

    fn load_offline_queue(&self, owner: &Username) -> Result<Vec<MailboxEntry>> {
        Ok(self
            .state()?
            .mailbox
            .iter()
            .filter(|e| &e.owner == owner)
            .cloned()
            .collect())
    }

    fn enqueue_offline(&self, entry: &MailboxEntry) -> Result<()> {
        self.state()?.mailbox.push(entry.clone());
        Ok(())
    }

    fn remove_offline(&self, owner: &Username, ids: &[Uuid]) -> Result<()> {
        self.state()?
            .mailbox
            .retain(|e| &e.owner != owner || !ids.contains(&e.id));
        Ok(())
    }

    fn append_history(&self, message: &Message) -> Result<()> {
        self.state()?
            .history
            .entry(message.conversation().storage_key())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn load_history(&self, key: &ConversationKey, limit: u32) -> Result<Vec<Message>> {
        let state = self.state()?;
        let Some(messages) = state.history.get(&key.storage_key()) else {
            return Ok(Vec::new());
        };
        let skip = messages.len().saturating_sub(limit as usize);
        Ok(messages[skip..].to_vec())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
