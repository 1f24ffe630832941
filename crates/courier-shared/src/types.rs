use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{MAX_USERNAME_LEN, MIN_USERNAME_LEN};
use crate::error::RelayError;

// Unique, case-sensitive, immutable account key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the registration rules: 1-32 chars of `[A-Za-z0-9_.-]`.
    pub fn validate(&self) -> Result<(), RelayError> {
        let len = self.0.chars().count();
        if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
            return Err(RelayError::InvalidInput(format!(
                "username must be {MIN_USERNAME_LEN}-{MAX_USERNAME_LEN} characters"
            )));
        }
        if !self
            .0
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(RelayError::InvalidInput(
                "username may only contain letters, digits, '_', '-' and '.'".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Username {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of an uploaded blob, returned by the HTTP side API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct FileHandle(pub Uuid);

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Free-form profile metadata. The relay never interprets it; unknown
/// keys are kept in `extra` and handed back untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    /// Academic session / year, unrelated to connection sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Public view of a user. Never carries password material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub username: Username,
    pub profile: Profile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthToken {
    pub token: Uuid,
    pub username: Username,
    pub issued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Relationships
// ---------------------------------------------------------------------------

/// A pending, directed friend request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FriendRequest {
    pub from: Username,
    pub to: Username,
    pub requested_at: DateTime<Utc>,
    /// Sender's profile as it was when the request was made.
    pub sender_snapshot: UserSummary,
}

/// An accepted, symmetric friendship. `user_a < user_b` always holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendLink {
    pub user_a: Username,
    pub user_b: Username,
    pub since: DateTime<Utc>,
}

impl FriendLink {
    pub fn new(a: &Username, b: &Username, since: DateTime<Utc>) -> Self {
        let (user_a, user_b) = ordered_pair(a, b);
        Self {
            user_a,
            user_b,
            since,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendStatus {
    pub username: Username,
    pub online: bool,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    pub owner: Username,
    pub members: BTreeSet<Username>,
    /// `false` once the last member has left; the group is kept as an archive.
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageTarget {
    User(Username),
    Group(GroupId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        body: String,
    },
    File {
        handle: FileHandle,
        filename: String,
        size: u64,
    },
}

/// An immutable routed message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Username,
    pub target: MessageTarget,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: Username, target: MessageTarget, body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            target,
            body,
            timestamp: Utc::now(),
        }
    }

    /// The conversation this message belongs to.
    pub fn conversation(&self) -> ConversationKey {
        match &self.target {
            MessageTarget::User(to) => ConversationKey::pair(&self.sender, to),
            MessageTarget::Group(id) => ConversationKey::Group(*id),
        }
    }
}

/// Ordering and serialisation unit: an unordered user pair or a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// Always stored with the smaller username first.
    Pair(Username, Username),
    Group(GroupId),
}

impl ConversationKey {
    pub fn pair(a: &Username, b: &Username) -> Self {
        let (lo, hi) = ordered_pair(a, b);
        Self::Pair(lo, hi)
    }

    /// Stable string form used as the history key in persistence.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Pair(a, b) => format!("dm:{a}:{b}"),
            Self::Group(id) => format!("group:{id}"),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Where a routed message ended up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryRoute {
    Live,
    Mailbox,
}

fn ordered_pair(a: &Username, b: &Username) -> (Username, Username) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
