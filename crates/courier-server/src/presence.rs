//! Presence Registry: which user is bound to which live session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_shared::protocol::ServerFrame;
use courier_shared::types::{SessionId, Username};
use courier_shared::RelayError;

use crate::config::SessionPolicy;

/// The registry's view of one authenticated connection.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    username: Username,
    outbound: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
    stalled: AtomicBool,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        username: Username,
        outbound: mpsc::Sender<ServerFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            username,
            outbound,
            cancel,
            stalled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Queue a frame, waiting at most `timeout` for room.
    ///
    /// On failure the frame is handed back and the session is stalled for
    /// good: it gets cancelled and every later delivery must go elsewhere.
    pub async fn deliver(&self, frame: ServerFrame, timeout: Duration) -> Result<(), ServerFrame> {
        if self.is_stalled() {
            return Err(frame);
        }
        match self.outbound.send_timeout(frame, timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(user = %self.username, session = %self.id, "Session stalled, falling back to mailbox");
                self.stalled.store(true, Ordering::Release);
                self.cancel.cancel();
                Err(e.into_inner())
            }
        }
    }

    /// Best-effort delivery that never waits. Used for presence updates.
    pub fn try_deliver(&self, frame: ServerFrame) -> bool {
        !self.is_stalled() && self.outbound.try_send(frame).is_ok()
    }

    /// Close the session after telling it why. The session is cancelled
    /// either way; returns whether the notice made it into its queue.
    pub fn force_logout(&self, reason: &str) -> bool {
        let notice = ServerFrame::ForcedLogout {
            reason: reason.to_string(),
        };
        let queued = match self.outbound.try_send(notice) {
            Ok(()) => true,
            Err(e) => {
                warn!(user = %self.username, session = %self.id, error = %e, "Forced logout notice not queued");
                false
            }
        };
        self.cancel.cancel();
        queued
    }
}

pub struct PresenceRegistry {
    sessions: DashMap<Username, Arc<SessionHandle>>,
    policy: SessionPolicy,
}

impl PresenceRegistry {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            policy,
        }
    }

    /// Make `handle` the authoritative session for its user.
    ///
    /// Returns the session it displaced, if any. The swap happens under the
    /// map's entry lock, so there is never a moment with two bound sessions
    /// or with none. A stalled incumbent is always replaced.
    pub fn bind(&self, handle: Arc<SessionHandle>) -> Result<Option<Arc<SessionHandle>>, RelayError> {
        match self.sessions.entry(handle.username.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(None)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if self.policy == SessionPolicy::Reject && !current.is_stalled() {
                    info!(user = %handle.username, "Rejected second login");
                    return Err(RelayError::DuplicateSession);
                }
                let old = slot.insert(handle);
                info!(user = %old.username, evicted = %old.id, "Evicting previous session");
                Ok(Some(old))
            }
        }
    }

    /// Remove the binding, but only if it still belongs to `session`.
    pub fn unbind(&self, username: &Username, session: SessionId) -> bool {
        let removed = self
            .sessions
            .remove_if(username, |_, handle| handle.id == session)
            .is_some();
        if removed {
            debug!(user = %username, session = %session, "Unbound session");
        }
        removed
    }

    pub fn is_online(&self, username: &Username) -> bool {
        self.sessions.contains_key(username)
    }

    pub fn resolve(&self, username: &Username) -> Option<Arc<SessionHandle>> {
        self.sessions.get(username).map(|h| h.value().clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Fan a frame out to whichever of `recipients` are online, without
    /// waiting on any of them. Returns how many accepted it.
    pub fn broadcast<'a>(
        &self,
        recipients: impl IntoIterator<Item = &'a Username>,
        frame: &ServerFrame,
    ) -> usize {
        recipients
            .into_iter()
            .filter_map(|user| self.resolve(user))
            .filter(|handle| handle.try_deliver(frame.clone()))
            .count()
    }
}
