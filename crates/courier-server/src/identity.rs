//! Identity Store: accounts, bcrypt password hashes and the user directory.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use courier_shared::protocol::Password;
use courier_shared::types::{AuthToken, Profile, UserSummary, Username};
use courier_shared::RelayError;
use courier_store::{Persistence, StoreError, StoredUser};

pub struct IdentityStore {
    users: DashMap<Username, StoredUser>,
    store: Arc<dyn Persistence>,
    bcrypt_cost: u32,
}

impl IdentityStore {
    /// Build the in-memory index from every persisted account.
    pub fn load(store: Arc<dyn Persistence>, bcrypt_cost: u32) -> Result<Self, StoreError> {
        let users = DashMap::new();
        for user in store.load_users()? {
            users.insert(user.username.clone(), user);
        }
        info!(count = users.len(), "Loaded user accounts");
        Ok(Self {
            users,
            store,
            bcrypt_cost,
        })
    }

    pub async fn register(
        &self,
        username: Username,
        password: &Password,
        profile: Profile,
        profile_picture_ref: Option<String>,
    ) -> Result<UserSummary, RelayError> {
        username.validate()?;
        if password.expose().is_empty() {
            return Err(RelayError::InvalidInput("password must not be empty".into()));
        }
        if self.users.contains_key(&username) {
            return Err(RelayError::DuplicateUser);
        }

        let password_hash = hash_password(password, self.bcrypt_cost).await?;
        let user = StoredUser {
            username: username.clone(),
            password_hash,
            profile,
            profile_picture_ref,
            created_at: Utc::now(),
        };

        // Re-check under the entry lock: another REGISTER may have won
        // while we were hashing.
        match self.users.entry(username) {
            Entry::Occupied(_) => Err(RelayError::DuplicateUser),
            Entry::Vacant(slot) => {
                self.store.save_user(&user)?;
                info!(user = %user.username, "Registered new user");
                Ok(slot.insert(user).summary())
            }
        }
    }

    /// Check credentials. Unknown users and wrong passwords look the same.
    pub async fn authenticate(
        &self,
        username: &Username,
        password: &Password,
    ) -> Result<AuthToken, RelayError> {
        let Some(hash) = self.users.get(username).map(|u| u.password_hash.clone()) else {
            debug!(user = %username, "Login for unknown user");
            return Err(RelayError::InvalidCredentials);
        };

        if !verify_password(password, hash).await? {
            return Err(RelayError::InvalidCredentials);
        }

        Ok(AuthToken {
            token: Uuid::new_v4(),
            username: username.clone(),
            issued_at: Utc::now(),
        })
    }

    pub fn lookup(&self, username: &Username) -> Result<UserSummary, RelayError> {
        self.users
            .get(username)
            .map(|u| u.summary())
            .ok_or_else(|| RelayError::NotFound(format!("user {username}")))
    }

    pub fn exists(&self, username: &Username) -> bool {
        self.users.contains_key(username)
    }

    pub fn count(&self) -> usize {
        self.users.len()
    }

    /// Snapshot of every account, sorted by username. Each call starts over.
    pub fn search_all(&self) -> std::vec::IntoIter<UserSummary> {
        let mut all: Vec<UserSummary> = self.users.iter().map(|u| u.summary()).collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        all.into_iter()
    }

    /// Case-insensitive substring match on username and display name.
    pub fn search(&self, query: Option<&str>) -> Vec<UserSummary> {
        let needle = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);

        self.search_all()
            .filter(|u| match &needle {
                None => true,
                Some(n) => {
                    u.username.as_str().to_lowercase().contains(n)
                        || u.profile
                            .display_name
                            .as_deref()
                            .is_some_and(|d| d.to_lowercase().contains(n))
                }
            })
            .collect()
    }

    pub async fn update_profile(
        &self,
        username: &Username,
        profile: Profile,
        profile_picture_ref: Option<String>,
        new_password: Option<&Password>,
    ) -> Result<UserSummary, RelayError> {
        let password_hash = match new_password {
            Some(p) if p.expose().is_empty() => {
                return Err(RelayError::InvalidInput("password must not be empty".into()))
            }
            Some(p) => Some(hash_password(p, self.bcrypt_cost).await?),
            None => None,
        };

        let mut entry = self
            .users
            .get_mut(username)
            .ok_or_else(|| RelayError::NotFound(format!("user {username}")))?;

        let mut updated = entry.clone();
        updated.profile = profile;
        updated.profile_picture_ref = profile_picture_ref;
        if let Some(hash) = password_hash {
            updated.password_hash = hash;
        }

        self.store.save_user(&updated)?;
        *entry = updated;

        info!(user = %username, "Profile updated");
        Ok(entry.summary())
    }
}

async fn hash_password(password: &Password, cost: u32) -> Result<String, RelayError> {
    let clear = password.expose().to_owned();
    tokio::task::spawn_blocking(move || bcrypt::hash(clear, cost))
        .await
        .map_err(|e| RelayError::Transient(format!("hash task failed: {e}")))?
        .map_err(|e| RelayError::Transient(format!("bcrypt: {e}")))
}

async fn verify_password(password: &Password, hash: String) -> Result<bool, RelayError> {
    let clear = password.expose().to_owned();
    tokio::task::spawn_blocking(move || bcrypt::verify(clear, &hash))
        .await
        .map_err(|e| RelayError::Transient(format!("verify task failed: {e}")))?
        .map_err(|e| RelayError::Transient(format!("bcrypt: {e}")))
}
