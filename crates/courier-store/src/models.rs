//! Records persisted by the store that are not part of the wire protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::types::{FriendLink, FriendRequest, Profile, UserSummary, Username};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account, including its password hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredUser {
    pub username: Username,
    /// bcrypt hash with embedded salt. Never leaves the server.
    pub password_hash: String,
    pub profile: Profile,
    pub profile_picture_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredUser {
    /// Public view without password material.
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            username: self.username.clone(),
            profile: self.profile.clone(),
            profile_picture_ref: self.profile_picture_ref.clone(),
            created_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Friend graph
// ---------------------------------------------------------------------------

/// Everything the relationship graph knows about one user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FriendGraph {
    pub friends: Vec<FriendLink>,
    /// Requests sent to this user and not yet resolved.
    pub incoming: Vec<FriendRequest>,
    /// Requests this user sent and that are still pending.
    pub outgoing: Vec<FriendRequest>,
}
