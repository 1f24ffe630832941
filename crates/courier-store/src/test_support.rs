use chrono::Utc;

use courier_shared::types::{FriendRequest, Profile, Username};

use crate::models::StoredUser;

pub(crate) fn user(name: &str) -> StoredUser {
    StoredUser {
        username: Username::from(name),
        password_hash: "$2b$04$not-a-real-hash".into(),
        profile: Profile::default(),
        profile_picture_ref: None,
        created_at: Utc::now(),
    }
}

pub(crate) fn request(from: &str, to: &str) -> FriendRequest {
    FriendRequest {
        from: from.into(),
        to: to.into(),
        requested_at: Utc::now(),
        sender_snapshot: user(from).summary(),
    }
}
