//! The durability seam used by the relay engine.
//!
//! Every mutation is written through as it happens; on startup the engine
//! calls the `load_*` methods once to rebuild its in-memory state.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use courier_shared::protocol::MailboxEntry;
use courier_shared::types::{ConversationKey, FriendLink, FriendRequest, Group, Message, Username};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{FriendGraph, StoredUser};

pub trait Persistence: Send + Sync {
    fn load_users(&self) -> Result<Vec<StoredUser>>;
    fn save_user(&self, user: &StoredUser) -> Result<()>;

    fn load_friend_links(&self) -> Result<Vec<FriendLink>>;
    fn load_friend_requests(&self) -> Result<Vec<FriendRequest>>;
    fn remove_friend_link(&self, a: &Username, b: &Username) -> Result<()>;
    fn save_friend_request(&self, request: &FriendRequest) -> Result<()>;
    fn remove_friend_request(&self, from: &Username, to: &Username) -> Result<()>;
    /// Resolve a request into a link atomically; a reverse request, if any,
    /// goes away too.
    fn accept_friend_request(&self, request: &FriendRequest, link: &FriendLink) -> Result<()>;

    /// One user's slice of the friend graph.
    fn load_friend_graph(&self, username: &Username) -> Result<FriendGraph> {
        let friends = self
            .load_friend_links()?
            .into_iter()
            .filter(|l| &l.user_a == username || &l.user_b == username)
            .collect();
        let (incoming, outgoing): (Vec<_>, Vec<_>) = self
            .load_friend_requests()?
            .into_iter()
            .filter(|r| &r.to == username || &r.from == username)
            .partition(|r| &r.to == username);
        Ok(FriendGraph {
            friends,
            incoming,
            outgoing,
        })
    }

    fn load_groups(&self) -> Result<Vec<Group>>;
    fn save_group(&self, group: &Group) -> Result<()>;

    /// Queued entries for one owner, oldest first.
    fn load_offline_queue(&self, owner: &Username) -> Result<Vec<MailboxEntry>>;
    fn enqueue_offline(&self, entry: &MailboxEntry) -> Result<()>;
    fn remove_offline(&self, owner: &Username, ids: &[Uuid]) -> Result<()>;

    fn append_history(&self, message: &Message) -> Result<()>;
    fn load_history(&self, key: &ConversationKey, limit: u32) -> Result<Vec<Message>>;

    /// Make everything written so far durable. Called on shutdown.
    fn flush(&self) -> Result<()>;
}

/// [`Persistence`] over a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Persistence for SqliteStore {
    fn load_users(&self) -> Result<Vec<StoredUser>> {
        self.db()?.list_users()
    }

    fn save_user(&self, user: &StoredUser) -> Result<()> {
        self.db()?.upsert_user(user)
    }

    fn load_friend_links(&self) -> Result<Vec<FriendLink>> {
        self.db()?.list_friend_links()
    }

    fn load_friend_requests(&self) -> Result<Vec<FriendRequest>> {
        self.db()?.list_friend_requests()
    }

    fn remove_friend_link(&self, a: &Username, b: &Username) -> Result<()> {
        self.db()?.delete_friend_link(a, b).map(|_| ())
    }

    fn save_friend_request(&self, request: &FriendRequest) -> Result<()> {
        self.db()?.upsert_friend_request(request)
    }

    fn remove_friend_request(&self, from: &Username, to: &Username) -> Result<()> {
        self.db()?.delete_friend_request(from, to).map(|_| ())
    }

    fn accept_friend_request(&self, request: &FriendRequest, link: &FriendLink) -> Result<()> {
        self.db()?.accept_friend_request(request, link)
    }

    fn load_groups(&self) -> Result<Vec<Group>> {
        self.db()?.list_groups()
    }

    fn save_group(&self, group: &Group) -> Result<()> {
        self.db()?.save_group(group)
    }

    fn load_offline_queue(&self, owner: &Username) -> Result<Vec<MailboxEntry>> {
        self.db()?.list_mailbox(owner)
    }

    fn enqueue_offline(&self, entry: &MailboxEntry) -> Result<()> {
        self.db()?.push_mailbox(entry)
    }

    fn remove_offline(&self, owner: &Username, ids: &[Uuid]) -> Result<()> {
        self.db()?.remove_mailbox(owner, ids).map(|_| ())
    }

    fn append_history(&self, message: &Message) -> Result<()> {
        self.db()?.append_history(message)
    }

    fn load_history(&self, key: &ConversationKey, limit: u32) -> Result<Vec<Message>> {
        self.db()?.load_history(key, limit)
    }

    fn flush(&self) -> Result<()> {
        let db = self.db()?;
        if db.path().is_some() {
            db.checkpoint()?;
        }
        Ok(())
    }
}
