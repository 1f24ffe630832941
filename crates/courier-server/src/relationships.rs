//! Relationship Graph: accepted friendships and pending friend requests.
//!
//! Callers serialise mutations per user pair (see [`KeyLocks`]); this type
//! only guarantees that memory and persistence agree after each call.
//!
//! [`KeyLocks`]: crate::locks::KeyLocks

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use courier_shared::types::{Decision, FriendLink, FriendRequest, UserSummary, Username};
use courier_shared::RelayError;
use courier_store::{Persistence, StoreError};

pub struct RelationshipGraph {
    /// Symmetric adjacency: both directions of every accepted link.
    friends: DashMap<Username, BTreeSet<Username>>,
    /// Pending requests keyed by `(from, to)`.
    requests: DashMap<(Username, Username), FriendRequest>,
    store: Arc<dyn Persistence>,
}

impl RelationshipGraph {
    pub fn load(store: Arc<dyn Persistence>) -> Result<Self, StoreError> {
        let graph = Self {
            friends: DashMap::new(),
            requests: DashMap::new(),
            store,
        };
        let links = graph.store.load_friend_links()?;
        let pending = graph.store.load_friend_requests()?;
        info!(links = links.len(), pending = pending.len(), "Loaded friend graph");

        for link in links {
            graph.link(&link.user_a, &link.user_b);
        }
        for request in pending {
            graph
                .requests
                .insert((request.from.clone(), request.to.clone()), request);
        }
        Ok(graph)
    }

    /// Create a pending request from `sender` to `to`.
    pub fn request_friend(
        &self,
        sender: UserSummary,
        to: &Username,
    ) -> Result<FriendRequest, RelayError> {
        let from = &sender.username;
        if from == to {
            return Err(RelayError::SelfFriendRequest);
        }
        if self.are_friends(from, to) {
            return Err(RelayError::AlreadyFriends(to.to_string()));
        }
        if self.pending_between(from, to) {
            return Err(RelayError::DuplicateRequest(to.to_string()));
        }

        let request = FriendRequest {
            from: from.clone(),
            to: to.clone(),
            requested_at: Utc::now(),
            sender_snapshot: sender.clone(),
        };
        self.store.save_friend_request(&request)?;
        self.requests
            .insert((request.from.clone(), request.to.clone()), request.clone());

        debug!(from = %request.from, to = %request.to, "Friend request created");
        Ok(request)
    }

    /// Settle the request `from -> to`. Returns the new link on accept.
    pub fn resolve_request(
        &self,
        to: &Username,
        from: &Username,
        decision: Decision,
    ) -> Result<Option<FriendLink>, RelayError> {
        let key = (from.clone(), to.clone());
        let Some(request) = self.requests.get(&key).map(|r| r.value().clone()) else {
            return Err(RelayError::NoSuchRequest(from.to_string()));
        };

        match decision {
            Decision::Accept => {
                let link = FriendLink::new(from, to, Utc::now());
                self.store.accept_friend_request(&request, &link)?;
                self.requests.remove(&key);
                self.requests.remove(&(to.clone(), from.clone()));
                self.link(from, to);
                info!(a = %link.user_a, b = %link.user_b, "Friendship formed");
                Ok(Some(link))
            }
            Decision::Ignore => {
                self.store.remove_friend_request(from, to)?;
                self.requests.remove(&key);
                debug!(from = %from, to = %to, "Friend request ignored");
                Ok(None)
            }
        }
    }

    pub fn are_friends(&self, a: &Username, b: &Username) -> bool {
        self.friends.get(a).is_some_and(|set| set.contains(b))
    }

    /// Remove the link both ways. Returns whether there was one.
    pub fn unfriend(&self, a: &Username, b: &Username) -> Result<bool, RelayError> {
        if !self.are_friends(a, b) {
            return Ok(false);
        }
        self.store.remove_friend_link(a, b)?;
        self.unlink(a, b);
        info!(a = %a, b = %b, "Friendship removed");
        Ok(true)
    }

    /// Friends of `user`, sorted.
    pub fn friends_of(&self, user: &Username) -> Vec<Username> {
        self.friends
            .get(user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Requests waiting on `user`, oldest first.
    pub fn incoming(&self, user: &Username) -> Vec<FriendRequest> {
        let mut pending: Vec<FriendRequest> = self
            .requests
            .iter()
            .filter(|r| &r.to == user)
            .map(|r| r.value().clone())
            .collect();
        pending.sort_by_key(|r| r.requested_at);
        pending
    }

    fn pending_between(&self, a: &Username, b: &Username) -> bool {
        self.requests.contains_key(&(a.clone(), b.clone()))
            || self.requests.contains_key(&(b.clone(), a.clone()))
    }

    fn link(&self, a: &Username, b: &Username) {
        self.friends.entry(a.clone()).or_default().insert(b.clone());
        self.friends.entry(b.clone()).or_default().insert(a.clone());
    }

    fn unlink(&self, a: &Username, b: &Username) {
        if let Some(mut set) = self.friends.get_mut(a) {
            set.remove(b);
        }
        if let Some(mut set) = self.friends.get_mut(b) {
            set.remove(a);
        }
    }
}
