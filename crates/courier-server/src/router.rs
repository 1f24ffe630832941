//! The dispatch core.
//!
//! Each request is handled as one independent step against the stores.
//! Work on a conversation (user pair or group) runs under that
//! conversation's lock, and every hand-off to a recipient runs under the
//! recipient's inbox lock, so per-conversation order holds for live and
//! mailboxed deliveries alike while unrelated conversations proceed in
//! parallel.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_shared::constants::{
    DEFAULT_HISTORY_LIMIT, MAX_FILE_SIZE, MAX_HISTORY_LIMIT, MAX_MESSAGE_BODY, PROTOCOL_VERSION,
};
use courier_shared::protocol::{Password, Request, ServerFrame};
use courier_shared::types::{
    ConversationKey, Decision, DeliveryRoute, FileHandle, FriendStatus, GroupId, Message,
    MessageBody, MessageId, MessageTarget, Profile, SessionId, Username,
};
use courier_shared::RelayError;
use courier_store::{Persistence, StoreError};

use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::groups::GroupRegistry;
use crate::identity::IdentityStore;
use crate::locks::KeyLocks;
use crate::mailbox::{Drain, OfflineMailbox};
use crate::offload::with_store;
use crate::presence::{PresenceRegistry, SessionHandle};
use crate::relationships::RelationshipGraph;

/// Per-connection state the router reads and updates.
pub struct SessionState {
    id: SessionId,
    user: Option<Username>,
    outbound: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
}

impl SessionState {
    pub fn new(outbound: mpsc::Sender<ServerFrame>, cancel: CancellationToken) -> Self {
        Self {
            id: SessionId::new(),
            user: None,
            outbound,
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user(&self) -> Option<&Username> {
        self.user.as_ref()
    }

    fn require_user(&self) -> Result<&Username, RelayError> {
        self.user.as_ref().ok_or(RelayError::Unauthenticated)
    }
}

/// Room kept free in every reply frame for the envelope around a list.
const FRAME_HEADROOM: usize = 4 * 1024;

/// Which end of an over-long list survives trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keep {
    Head,
    /// Newest-last lists such as history.
    Tail,
}

/// What the session should write back, in order.
#[derive(Default)]
pub struct Reply {
    pub frames: Vec<ServerFrame>,
    /// Mailbox snapshot to hand off right after `frames`.
    pub drain: Option<Drain>,
    /// Close the connection once everything is written.
    pub close: bool,
}

impl Reply {
    fn frame(frame: ServerFrame) -> Self {
        Self {
            frames: vec![frame],
            ..Self::default()
        }
    }
}

pub struct Router {
    identity: IdentityStore,
    presence: PresenceRegistry,
    relationships: RelationshipGraph,
    groups: GroupRegistry,
    mailbox: OfflineMailbox,
    history: Arc<dyn Persistence>,
    blobs: BlobStore,
    conversations: KeyLocks<ConversationKey>,
    inboxes: KeyLocks<Username>,
    delivery_timeout: Duration,
    registration_open: bool,
    /// Serialized bytes a list reply may spend on its items.
    frame_budget: usize,
}

impl Router {
    /// Rebuild all in-memory state from `store`.
    pub fn load(
        store: Arc<dyn Persistence>,
        blobs: BlobStore,
        config: &ServerConfig,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            identity: IdentityStore::load(store.clone(), config.bcrypt_cost)?,
            presence: PresenceRegistry::new(config.session_policy),
            relationships: RelationshipGraph::load(store.clone())?,
            groups: GroupRegistry::load(store.clone())?,
            mailbox: OfflineMailbox::new(store.clone()),
            history: store,
            blobs,
            conversations: KeyLocks::new(),
            inboxes: KeyLocks::new(),
            delivery_timeout: config.delivery_timeout,
            registration_open: config.registration_open,
            frame_budget: config.max_frame_size.saturating_sub(FRAME_HEADROOM),
        })
    }

    pub fn online_count(&self) -> usize {
        self.presence.count()
    }

    pub fn user_count(&self) -> usize {
        self.identity.count()
    }

    pub fn group_count(&self) -> usize {
        self.groups.active_count()
    }

    pub fn purge_idle_locks(&self) -> usize {
        self.conversations.purge_idle() + self.inboxes.purge_idle()
    }

    /// Handle one request. Failures become an `ERROR` frame.
    pub async fn handle(&self, session: &mut SessionState, request: Request) -> Reply {
        let kind = request.kind();
        match self.dispatch(session, request).await {
            Ok(reply) => reply,
            Err(err) => {
                match &err {
                    RelayError::Transient(detail) => {
                        warn!(request = kind, error = %detail, "Request failed")
                    }
                    other => debug!(request = kind, error = %other, "Request rejected"),
                }
                Reply::frame(ServerFrame::error(&err))
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut SessionState,
        request: Request,
    ) -> Result<Reply, RelayError> {
        match request {
            Request::Register {
                username,
                password,
                profile,
                profile_picture_ref,
            } => {
                self.register(username, &password, profile, profile_picture_ref)
                    .await
            }
            Request::Login { username, password } => self.login(session, username, &password).await,
            Request::Unknown => Err(RelayError::Protocol("unknown request type".into())),

            Request::Logout => {
                // Unbinding happens in `disconnect` once the session winds
                // down, so frames still queued for it can be reclaimed.
                session.require_user()?;
                Ok(Reply {
                    close: true,
                    ..Reply::default()
                })
            }
            Request::Ping => {
                session.require_user()?;
                Ok(Reply::frame(ServerFrame::Pong))
            }
            Request::SendMessage { to, body } => {
                let me = session.require_user()?;
                self.send_message(me, &to, body).await
            }
            Request::GroupMessage { group_id, body } => {
                let me = session.require_user()?;
                check_text(&body)?;
                self.route_group(me, group_id, MessageBody::Text { body })
                    .await
            }
            Request::SendFile {
                to,
                group_id,
                file_handle,
                filename,
                size,
            } => {
                let me = session.require_user()?;
                self.send_file(me, to, group_id, file_handle, filename, size)
                    .await
            }
            Request::SendFriendRequest { to } => {
                let me = session.require_user()?;
                self.send_friend_request(me, &to).await
            }
            Request::FriendResponse { from, decision } => {
                let me = session.require_user()?;
                self.friend_response(me, &from, decision).await
            }
            Request::Unfriend { target } => {
                let me = session.require_user()?;
                self.unfriend(me, &target).await
            }
            Request::GetFriendList => {
                let me = session.require_user()?;
                let friends: Vec<_> = self
                    .relationships
                    .friends_of(me)
                    .into_iter()
                    .map(|username| FriendStatus {
                        online: self.presence.is_online(&username),
                        username,
                    })
                    .collect();
                let friends = self.fit(friends, Keep::Head, "FRIEND_LIST");
                Ok(Reply::frame(ServerFrame::FriendList { friends }))
            }
            Request::GetPendingRequests => {
                let me = session.require_user()?;
                let requests = self.relationships.incoming(me);
                Ok(Reply::frame(ServerFrame::PendingRequests {
                    requests: self.fit(requests, Keep::Head, "PENDING_REQUESTS"),
                }))
            }
            Request::SearchUsers { query } => {
                let me = session.require_user()?;
                let users: Vec<_> = self
                    .identity
                    .search(query.as_deref())
                    .into_iter()
                    .filter(|u| &u.username != me)
                    .collect();
                let users = self.fit(users, Keep::Head, "USERS");
                Ok(Reply::frame(ServerFrame::Users { users }))
            }
            Request::EditProfile {
                profile,
                profile_picture_ref,
                new_password,
            } => {
                let me = session.require_user()?;
                let user = self
                    .identity
                    .update_profile(me, profile, profile_picture_ref, new_password.as_ref())
                    .await?;
                Ok(Reply::frame(ServerFrame::ProfileUpdated { user }))
            }
            Request::CreateGroup { name, description } => {
                let me = session.require_user()?;
                let group = self.groups.create_group(me, &name, &description)?;
                Ok(Reply::frame(ServerFrame::GroupCreated { group }))
            }
            Request::JoinGroup { group_id } => {
                let me = session.require_user()?;
                self.join_group(me, group_id).await
            }
            Request::AddMember { group_id, member } => {
                let me = session.require_user()?;
                self.add_member(me, group_id, &member).await
            }
            Request::LeaveGroup { group_id } => {
                let me = session.require_user()?;
                let _conv = self
                    .conversations
                    .lock(ConversationKey::Group(group_id))
                    .await;
                self.groups.leave(group_id, me)?;
                info!(user = %me, group = %group_id, "Left group");
                Ok(Reply::frame(ServerFrame::GroupLeft { group_id }))
            }
            Request::ListGroups => {
                let me = session.require_user()?;
                let groups = self.groups.groups_of(me);
                Ok(Reply::frame(ServerFrame::Groups {
                    groups: self.fit(groups, Keep::Head, "GROUPS"),
                }))
            }
            Request::GetHistory {
                with,
                group_id,
                limit,
            } => {
                let me = session.require_user()?;
                self.history(me, with, group_id, limit).await
            }
            Request::GetOnlineUsers => {
                let me = session.require_user()?;
                let users: Vec<_> = self
                    .relationships
                    .friends_of(me)
                    .into_iter()
                    .filter(|f| self.presence.is_online(f))
                    .collect();
                let users = self.fit(users, Keep::Head, "ONLINE_USERS");
                Ok(Reply::frame(ServerFrame::OnlineUsers { users }))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    async fn register(
        &self,
        username: Username,
        password: &Password,
        profile: Profile,
        profile_picture_ref: Option<String>,
    ) -> Result<Reply, RelayError> {
        if !self.registration_open {
            return Err(RelayError::RegistrationClosed);
        }
        let user = self
            .identity
            .register(username, password, profile, profile_picture_ref)
            .await?;
        Ok(Reply::frame(ServerFrame::Registered { user }))
    }

    async fn login(
        &self,
        session: &mut SessionState,
        username: Username,
        password: &Password,
    ) -> Result<Reply, RelayError> {
        if session.user.is_some() {
            return Err(RelayError::InvalidInput("already logged in".into()));
        }
        let token = self.identity.authenticate(&username, password).await?;
        let handle = Arc::new(SessionHandle::new(
            session.id,
            username.clone(),
            session.outbound.clone(),
            session.cancel.clone(),
        ));

        // Bind and snapshot the mailbox under the inbox lock: anything sent
        // before this point is in the snapshot, anything after goes live.
        let (evicted, drain) = {
            let _inbox = self.inboxes.lock(username.clone()).await;
            let evicted = self.presence.bind(handle)?;
            let drain = match self.mailbox.drain(&username).await {
                Ok(drain) => Some(drain),
                Err(e) => {
                    warn!(user = %username, error = %e, "Could not read mailbox on login");
                    None
                }
            };
            (evicted, drain)
        };

        match &evicted {
            Some(old) => {
                old.force_logout("logged in from another connection");
            }
            None => self.announce_presence(&username, true),
        }

        info!(
            user = %username,
            session = %session.id,
            pending = drain.as_ref().map_or(0, Drain::len),
            "Logged in"
        );

        let user = self.identity.lookup(&username)?;
        let groups = self.fit(self.groups.groups_of(&username), Keep::Head, "LOGGED_IN");
        session.user = Some(username);

        Ok(Reply {
            frames: vec![ServerFrame::LoggedIn {
                user,
                token,
                groups,
                protocol: PROTOCOL_VERSION.to_string(),
            }],
            drain: drain.filter(|d| !d.is_empty()),
            close: false,
        })
    }

    /// Unbind the session's user, if it is still the bound session, and
    /// move durable frames it never wrote back into the user's mailbox.
    ///
    /// `unwritten` is a frame already taken off `queue` whose write failed;
    /// it goes back first. The queue is closed under the inbox lock, so no
    /// later delivery can slip in between the reclaimed frames.
    pub async fn disconnect(
        &self,
        session: &mut SessionState,
        queue: &mut mpsc::Receiver<ServerFrame>,
        unwritten: Option<ServerFrame>,
    ) {
        let Some(user) = session.user.take() else {
            return;
        };
        let (unbound, reclaimed) = {
            let _inbox = self.inboxes.lock(user.clone()).await;
            let unbound = self.presence.unbind(&user, session.id);
            queue.close();

            let mut reclaimed = 0;
            let leftovers = unwritten
                .into_iter()
                .chain(std::iter::from_fn(|| queue.try_recv().ok()));
            for frame in leftovers.filter(ServerFrame::is_durable) {
                match self.mailbox.enqueue(&user, frame).await {
                    Ok(_) => reclaimed += 1,
                    Err(e) => warn!(user = %user, error = %e, "Could not reclaim queued frame"),
                }
            }
            (unbound, reclaimed)
        };
        if reclaimed > 0 {
            info!(user = %user, session = %session.id, reclaimed, "Unsent frames returned to mailbox");
        }
        if unbound {
            info!(user = %user, session = %session.id, "Logged out");
            self.announce_presence(&user, false);
        }
    }

    fn announce_presence(&self, user: &Username, online: bool) {
        let friends = self.relationships.friends_of(user);
        let frame = ServerFrame::Presence {
            username: user.clone(),
            online,
        };
        let reached = self.presence.broadcast(&friends, &frame);
        debug!(user = %user, online, reached, "Presence announced");
    }

    // -----------------------------------------------------------------------
    // Message routing
    // -----------------------------------------------------------------------

    async fn send_message(
        &self,
        me: &Username,
        to: &Username,
        body: String,
    ) -> Result<Reply, RelayError> {
        check_text(&body)?;
        if !self.identity.exists(to) {
            return Err(RelayError::NotFound(format!("user {to}")));
        }
        self.route_private(me, to, MessageBody::Text { body }).await
    }

    async fn send_file(
        &self,
        me: &Username,
        to: Option<Username>,
        group_id: Option<GroupId>,
        handle: FileHandle,
        filename: String,
        size: u64,
    ) -> Result<Reply, RelayError> {
        if filename.trim().is_empty() {
            return Err(RelayError::InvalidInput("filename must not be empty".into()));
        }
        if size > MAX_FILE_SIZE {
            return Err(RelayError::InvalidInput(format!(
                "file exceeds {MAX_FILE_SIZE} bytes"
            )));
        }
        if !self.blobs.exists(handle).await {
            return Err(RelayError::NotFound(format!("file {handle}")));
        }
        let body = MessageBody::File {
            handle,
            filename,
            size,
        };

        match (to, group_id) {
            (Some(to), None) => {
                if !self.identity.exists(&to) {
                    return Err(RelayError::NotFound(format!("user {to}")));
                }
                self.route_private(me, &to, body).await
            }
            (None, Some(group_id)) => self.route_group(me, group_id, body).await,
            _ => Err(RelayError::InvalidInput(
                "exactly one of `to` and `group_id` is required".into(),
            )),
        }
    }

    async fn route_private(
        &self,
        me: &Username,
        to: &Username,
        body: MessageBody,
    ) -> Result<Reply, RelayError> {
        let _conv = self
            .conversations
            .lock(ConversationKey::pair(me, to))
            .await;

        // Checked per message: friendship can end mid-session.
        if !self.relationships.are_friends(me, to) {
            return Err(RelayError::NotFriends(to.to_string()));
        }

        let message = Message::new(me.clone(), MessageTarget::User(to.clone()), body);
        let id = message.id;
        // Deliver first: a refused message must leave no trace in history.
        let route = self
            .deliver(
                to,
                ServerFrame::Message {
                    message: message.clone(),
                },
            )
            .await?;
        self.record(message).await;
        debug!(from = %me, to = %to, message = %id, ?route, "Routed private message");

        let (live, mailboxed) = match route {
            DeliveryRoute::Live => (1, 0),
            DeliveryRoute::Mailbox => (0, 1),
        };
        Ok(accepted(id, live, mailboxed))
    }

    async fn route_group(
        &self,
        me: &Username,
        group_id: GroupId,
        body: MessageBody,
    ) -> Result<Reply, RelayError> {
        let _conv = self
            .conversations
            .lock(ConversationKey::Group(group_id))
            .await;

        let group = self.groups.get(group_id)?;
        if !group.members.contains(me) {
            return Err(RelayError::NotGroupMember);
        }

        let message = Message::new(me.clone(), MessageTarget::Group(group_id), body);
        let id = message.id;
        let recipients: Vec<Username> = group.members.into_iter().filter(|m| m != me).collect();
        let (live, mailboxed) = self
            .fan_out(
                &recipients,
                ServerFrame::Message {
                    message: message.clone(),
                },
            )
            .await;
        if live + mailboxed == 0 && !recipients.is_empty() {
            return Err(RelayError::Transient(
                "message reached no group member".into(),
            ));
        }
        self.record(message).await;
        debug!(from = %me, group = %group_id, message = %id, live, mailboxed, "Routed group message");

        Ok(accepted(id, live, mailboxed))
    }

    /// Append a delivered message to its conversation's history. The
    /// message is already with its recipients, so a failure is only logged.
    async fn record(&self, message: Message) {
        let id = message.id;
        let appended = with_store(&self.history, move |s| s.append_history(&message)).await;
        if let Err(e) = appended {
            warn!(message = %id, error = %e, "History append failed");
        }
    }

    /// Hand `frame` to `recipient`'s live session, or to their mailbox if
    /// they are offline or not keeping up.
    async fn deliver(
        &self,
        recipient: &Username,
        frame: ServerFrame,
    ) -> Result<DeliveryRoute, RelayError> {
        let _inbox = self.inboxes.lock(recipient.clone()).await;

        let frame = match self.presence.resolve(recipient) {
            Some(handle) => match handle.deliver(frame, self.delivery_timeout).await {
                Ok(()) => return Ok(DeliveryRoute::Live),
                Err(frame) => frame,
            },
            None => frame,
        };

        self.mailbox.enqueue(recipient, frame).await?;
        Ok(DeliveryRoute::Mailbox)
    }

    /// Deliver to each recipient independently. One failure never blocks
    /// the others. Returns `(live, mailboxed)` counts.
    async fn fan_out(&self, recipients: &[Username], frame: ServerFrame) -> (usize, usize) {
        let results = join_all(
            recipients
                .iter()
                .map(|r| self.deliver(r, frame.clone())),
        )
        .await;

        let mut live = 0;
        let mut mailboxed = 0;
        for (recipient, result) in recipients.iter().zip(results) {
            match result {
                Ok(DeliveryRoute::Live) => live += 1,
                Ok(DeliveryRoute::Mailbox) => mailboxed += 1,
                Err(e) => warn!(recipient = %recipient, error = %e, "Delivery failed"),
            }
        }
        (live, mailboxed)
    }

    /// Like [`deliver`](Self::deliver) for notices whose underlying change
    /// has already been committed: failure is logged, not reported.
    async fn notify(&self, recipient: &Username, frame: ServerFrame) {
        if let Err(e) = self.deliver(recipient, frame).await {
            warn!(recipient = %recipient, error = %e, "Notification dropped");
        }
    }

    // -----------------------------------------------------------------------
    // Friends
    // -----------------------------------------------------------------------

    async fn send_friend_request(&self, me: &Username, to: &Username) -> Result<Reply, RelayError> {
        if me != to && !self.identity.exists(to) {
            return Err(RelayError::NotFound(format!("user {to}")));
        }
        let sender = self.identity.lookup(me)?;

        let _conv = self
            .conversations
            .lock(ConversationKey::pair(me, to))
            .await;
        let request = self.relationships.request_friend(sender, to)?;
        info!(from = %me, to = %to, "Friend request sent");

        self.notify(to, ServerFrame::FriendRequest { request }).await;
        Ok(Reply::frame(ServerFrame::FriendRequestSent { to: to.clone() }))
    }

    async fn friend_response(
        &self,
        me: &Username,
        from: &Username,
        decision: Decision,
    ) -> Result<Reply, RelayError> {
        let _conv = self
            .conversations
            .lock(ConversationKey::pair(me, from))
            .await;

        match self.relationships.resolve_request(me, from, decision)? {
            Some(_) => {
                self.notify(from, ServerFrame::FriendAccepted { by: me.clone() })
                    .await;

                // Both sides learn each other's presence straight away.
                let mut frames = vec![ServerFrame::FriendAdded {
                    friend: from.clone(),
                }];
                if let Some(theirs) = self.presence.resolve(from) {
                    theirs.try_deliver(ServerFrame::Presence {
                        username: me.clone(),
                        online: true,
                    });
                    frames.push(ServerFrame::Presence {
                        username: from.clone(),
                        online: true,
                    });
                }
                Ok(Reply {
                    frames,
                    ..Reply::default()
                })
            }
            None => Ok(Reply::frame(ServerFrame::FriendDeclined {
                from: from.clone(),
            })),
        }
    }

    async fn unfriend(&self, me: &Username, target: &Username) -> Result<Reply, RelayError> {
        let _conv = self
            .conversations
            .lock(ConversationKey::pair(me, target))
            .await;

        if self.relationships.unfriend(me, target)? {
            self.notify(target, ServerFrame::Unfriended { by: me.clone() })
                .await;
        }
        Ok(Reply::frame(ServerFrame::FriendRemoved {
            username: target.clone(),
        }))
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    async fn join_group(&self, me: &Username, group_id: GroupId) -> Result<Reply, RelayError> {
        let _conv = self
            .conversations
            .lock(ConversationKey::Group(group_id))
            .await;

        let group = self.groups.join(group_id, me)?;
        info!(user = %me, group = %group_id, "Joined group");

        let others: Vec<Username> = group.members.iter().filter(|m| *m != me).cloned().collect();
        self.fan_out(
            &others,
            ServerFrame::MemberAdded {
                group_id,
                member: me.clone(),
                by: me.clone(),
            },
        )
        .await;

        Ok(Reply::frame(ServerFrame::GroupJoined { group }))
    }

    async fn add_member(
        &self,
        me: &Username,
        group_id: GroupId,
        member: &Username,
    ) -> Result<Reply, RelayError> {
        if !self.identity.exists(member) {
            return Err(RelayError::NotFound(format!("user {member}")));
        }
        let _conv = self
            .conversations
            .lock(ConversationKey::Group(group_id))
            .await;

        let group = self.groups.add_member(group_id, me, member)?;
        info!(by = %me, member = %member, group = %group_id, "Member added");

        let notice = ServerFrame::MemberAdded {
            group_id,
            member: member.clone(),
            by: me.clone(),
        };
        let others: Vec<Username> = group
            .members
            .iter()
            .filter(|m| *m != me && *m != member)
            .cloned()
            .collect();
        self.fan_out(&others, notice.clone()).await;
        self.notify(member, ServerFrame::GroupJoined { group }).await;

        Ok(Reply::frame(notice))
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    async fn history(
        &self,
        me: &Username,
        with: Option<Username>,
        group_id: Option<GroupId>,
        limit: Option<u32>,
    ) -> Result<Reply, RelayError> {
        let key = match (with, group_id) {
            (Some(other), None) => {
                if !self.relationships.are_friends(me, &other) {
                    return Err(RelayError::NotFriends(other.to_string()));
                }
                ConversationKey::pair(me, &other)
            }
            (None, Some(group_id)) => {
                self.groups.get(group_id)?;
                if !self.groups.is_member(group_id, me) {
                    return Err(RelayError::NotGroupMember);
                }
                ConversationKey::Group(group_id)
            }
            _ => {
                return Err(RelayError::InvalidInput(
                    "exactly one of `with` and `group_id` is required".into(),
                ))
            }
        };

        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let conversation = key.storage_key();
        let messages = with_store(&self.history, move |s| s.load_history(&key, limit)).await?;

        Ok(Reply::frame(ServerFrame::History {
            conversation,
            messages: self.fit(messages, Keep::Tail, "HISTORY"),
        }))
    }

    /// Trim a list reply so its frame stays under the configured size.
    fn fit<T: Serialize>(&self, mut items: Vec<T>, keep: Keep, frame: &'static str) -> Vec<T> {
        let dropped = fit_budget(&mut items, self.frame_budget, keep);
        if dropped > 0 {
            debug!(frame, kept = items.len(), dropped, "Trimmed reply to fit one frame");
        }
        items
    }
}

/// Drop items from the far end of `items` until their JSON fits in
/// `budget` bytes. Returns how many went.
fn fit_budget<T: Serialize>(items: &mut Vec<T>, budget: usize, keep: Keep) -> usize {
    // +1 for the separating comma.
    let sizes: Vec<usize> = items
        .iter()
        .map(|item| serde_json::to_vec(item).map_or(0, |v| v.len()) + 1)
        .collect();
    if sizes.iter().sum::<usize>() <= budget {
        return 0;
    }

    let mut used = 0;
    let mut fits = |size: &usize| {
        used += size;
        used <= budget
    };
    let kept = match keep {
        Keep::Head => sizes.iter().take_while(|&s| fits(s)).count(),
        Keep::Tail => sizes.iter().rev().take_while(|&s| fits(s)).count(),
    };
    let dropped = items.len() - kept;
    match keep {
        Keep::Head => items.truncate(kept),
        Keep::Tail => {
            items.drain(..dropped);
        }
    }
    dropped
}

fn check_text(body: &str) -> Result<(), RelayError> {
    if body.is_empty() {
        return Err(RelayError::InvalidInput("message body must not be empty".into()));
    }
    if body.len() > MAX_MESSAGE_BODY {
        return Err(RelayError::InvalidInput(format!(
            "message body exceeds {MAX_MESSAGE_BODY} bytes"
        )));
    }
    Ok(())
}

fn accepted(message_id: MessageId, delivered_live: usize, mailboxed: usize) -> Reply {
    Reply::frame(ServerFrame::Accepted {
        message_id,
        delivered_live,
        mailboxed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    use courier_shared::protocol::MailboxEntry;
    use courier_shared::types::{FriendLink, FriendRequest, Group};
    use courier_shared::ErrorCode;
    use courier_store::{MemoryStore, StoredUser};
    use tempfile::TempDir;

    struct Harness {
        router: Arc<Router>,
        store: Arc<dyn Persistence>,
        _blobs: TempDir,
    }

    struct Client {
        state: SessionState,
        rx: mpsc::Receiver<ServerFrame>,
        cancel: CancellationToken,
    }

    impl Client {
        fn new(capacity: usize) -> Self {
            let (tx, rx) = mpsc::channel(capacity);
            let cancel = CancellationToken::new();
            Self {
                state: SessionState::new(tx, cancel.clone()),
                rx,
                cancel,
            }
        }

        fn next_live(&mut self) -> Option<ServerFrame> {
            self.rx.try_recv().ok()
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            bcrypt_cost: 4,
            delivery_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(MemoryStore::new()), test_config()).await
    }

    async fn harness_with(store: Arc<dyn Persistence>, config: ServerConfig) -> Harness {
        let blobs = TempDir::new().unwrap();
        let blob_store = BlobStore::new(blobs.path().to_path_buf(), 1024)
            .await
            .unwrap();
        let router = Router::load(store.clone(), blob_store, &config).unwrap();
        Harness {
            router: Arc::new(router),
            store,
            _blobs: blobs,
        }
    }

    impl Harness {
        async fn call(&self, client: &mut Client, request: Request) -> Reply {
            self.router.handle(&mut client.state, request).await
        }

        async fn register(&self, name: &str) {
            let mut c = Client::new(8);
            let reply = self
                .call(
                    &mut c,
                    Request::Register {
                        username: name.into(),
                        password: "pw".into(),
                        profile: Profile::default(),
                        profile_picture_ref: None,
                    },
                )
                .await;
            assert!(matches!(reply.frames[0], ServerFrame::Registered { .. }));
        }

        async fn login(&self, name: &str, capacity: usize) -> (Client, Reply) {
            let mut c = Client::new(capacity);
            let reply = self
                .call(
                    &mut c,
                    Request::Login {
                        username: name.into(),
                        password: "pw".into(),
                    },
                )
                .await;
            assert!(
                matches!(reply.frames[0], ServerFrame::LoggedIn { .. }),
                "login failed: {:?}",
                reply.frames
            );
            (c, reply)
        }

        async fn befriend(&self, a: &str, b: &str) {
            let (mut ca, _) = self.login(a, 8).await;
            let (mut cb, _) = self.login(b, 8).await;
            self.call(&mut ca, Request::SendFriendRequest { to: b.into() })
                .await;
            let reply = self
                .call(
                    &mut cb,
                    Request::FriendResponse {
                        from: a.into(),
                        decision: Decision::Accept,
                    },
                )
                .await;
            assert!(matches!(reply.frames[0], ServerFrame::FriendAdded { .. }));
            // Both read everything before going away.
            while ca.next_live().is_some() {}
            while cb.next_live().is_some() {}
            self.leave(&mut ca).await;
            self.leave(&mut cb).await;
        }

        async fn leave(&self, client: &mut Client) {
            self.router
                .disconnect(&mut client.state, &mut client.rx, None)
                .await;
        }

        fn mailbox_len(&self, user: &str) -> usize {
            self.store.load_offline_queue(&user.into()).unwrap().len()
        }
    }

    fn error_code(reply: &Reply) -> ErrorCode {
        match &reply.frames[0] {
            ServerFrame::Error { code, .. } => *code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    fn text(to: &str, body: &str) -> Request {
        Request::SendMessage {
            to: to.into(),
            body: body.into(),
        }
    }

    fn drained(reply: &Reply) -> Vec<ServerFrame> {
        reply
            .drain
            .as_ref()
            .map(|d| d.entries().iter().map(|e| e.payload.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn requests_need_login() {
        let h = harness().await;
        let mut c = Client::new(4);
        assert_eq!(
            error_code(&h.call(&mut c, Request::GetOnlineUsers).await),
            ErrorCode::Unauthenticated
        );
        assert_eq!(
            error_code(&h.call(&mut c, text("bob", "hi")).await),
            ErrorCode::Unauthenticated
        );
        assert_eq!(
            error_code(&h.call(&mut c, Request::Unknown).await),
            ErrorCode::ProtocolError
        );
    }

    #[tokio::test]
    async fn strangers_cannot_message() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        let (mut alice, _) = h.login("alice", 8).await;

        let reply = h.call(&mut alice, text("bob", "hello?")).await;
        assert_eq!(error_code(&reply), ErrorCode::NotFriends);
        assert_eq!(h.mailbox_len("bob"), 0);

        let key = ConversationKey::pair(&"alice".into(), &"bob".into());
        assert!(h.store.load_history(&key, 10).unwrap().is_empty());

        let reply = h.call(&mut alice, text("nobody", "hi")).await;
        assert_eq!(error_code(&reply), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn offline_friend_request_then_message() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;

        let (mut alice, _) = h.login("alice", 8).await;
        let reply = h
            .call(&mut alice, Request::SendFriendRequest { to: "bob".into() })
            .await;
        assert!(matches!(
            reply.frames[0],
            ServerFrame::FriendRequestSent { .. }
        ));

        // Bob was offline: the request waits in his mailbox.
        let (mut bob, login) = h.login("bob", 8).await;
        let pending = drained(&login);
        assert!(matches!(
            &pending[..],
            [ServerFrame::FriendRequest { request }] if request.from.as_str() == "alice"
        ));
        let drain = login.drain.unwrap();
        drain.commit(drain.entries()).await.unwrap();

        let reply = h
            .call(
                &mut bob,
                Request::FriendResponse {
                    from: "alice".into(),
                    decision: Decision::Accept,
                },
            )
            .await;
        assert!(matches!(reply.frames[0], ServerFrame::FriendAdded { .. }));
        assert!(h
            .router
            .relationships
            .are_friends(&"alice".into(), &"bob".into()));

        // Alice is online and hears about it live.
        let mut saw_accept = false;
        while let Some(frame) = alice.next_live() {
            saw_accept |= matches!(frame, ServerFrame::FriendAccepted { .. });
        }
        assert!(saw_accept);

        // Bob goes away; Alice's message is mailboxed and comes back verbatim.
        h.leave(&mut bob).await;
        let reply = h.call(&mut alice, text("bob", "see you at 5")).await;
        assert!(matches!(
            reply.frames[0],
            ServerFrame::Accepted {
                delivered_live: 0,
                mailboxed: 1,
                ..
            }
        ));

        let (_bob, login) = h.login("bob", 8).await;
        let frames = drained(&login);
        let last = frames.last().unwrap();
        match last {
            ServerFrame::Message { message } => {
                assert_eq!(message.sender.as_str(), "alice");
                assert_eq!(
                    message.body,
                    MessageBody::Text {
                        body: "see you at 5".into()
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_accept_fails() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        let (mut alice, _) = h.login("alice", 8).await;
        let (mut bob, _) = h.login("bob", 8).await;

        h.call(&mut alice, Request::SendFriendRequest { to: "bob".into() })
            .await;
        let accept = Request::FriendResponse {
            from: "alice".into(),
            decision: Decision::Accept,
        };
        h.call(&mut bob, accept.clone()).await;
        let again = h.call(&mut bob, accept).await;

        assert_eq!(error_code(&again), ErrorCode::NoSuchRequest);
        assert_eq!(h.store.load_friend_links().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ignore_is_silent_to_requester() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        let (mut alice, _) = h.login("alice", 8).await;
        let (mut bob, _) = h.login("bob", 8).await;

        h.call(&mut alice, Request::SendFriendRequest { to: "bob".into() })
            .await;
        let reply = h
            .call(
                &mut bob,
                Request::FriendResponse {
                    from: "alice".into(),
                    decision: Decision::Ignore,
                },
            )
            .await;
        assert!(matches!(reply.frames[0], ServerFrame::FriendDeclined { .. }));

        while let Some(frame) = alice.next_live() {
            assert!(matches!(frame, ServerFrame::Presence { .. }));
        }
        assert_eq!(h.mailbox_len("alice"), 0);
    }

    #[tokio::test]
    async fn per_pair_order_is_kept() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;

        let (mut alice, _) = h.login("alice", 8).await;
        let (mut bob, _) = h.login("bob", 64).await;
        while bob.next_live().is_some() {}

        for i in 0..10 {
            h.call(&mut alice, text("bob", &format!("m{i}"))).await;
        }

        let mut bodies = Vec::new();
        while let Some(frame) = bob.next_live() {
            if let ServerFrame::Message { message } = frame {
                if let MessageBody::Text { body } = message.body {
                    bodies.push(body);
                }
            }
        }
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn stalled_recipient_falls_back_to_mailbox_in_order() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;

        let (mut alice, _) = h.login("alice", 8).await;
        // Room for exactly one frame, and nobody reads it.
        let (bob, _) = h.login("bob", 1).await;

        let routes: Vec<_> = [
            h.call(&mut alice, text("bob", "one")).await,
            h.call(&mut alice, text("bob", "two")).await,
            h.call(&mut alice, text("bob", "three")).await,
        ]
        .into_iter()
        .map(|r| match r.frames[0] {
            ServerFrame::Accepted { delivered_live, .. } => delivered_live,
            _ => usize::MAX,
        })
        .collect();

        assert_eq!(routes, vec![1, 0, 0]);
        assert!(bob.cancel.is_cancelled());

        let queued: Vec<String> = h
            .store
            .load_offline_queue(&"bob".into())
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.payload {
                ServerFrame::Message { message } => match message.body {
                    MessageBody::Text { body } => Some(body),
                    MessageBody::File { .. } => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(queued, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn group_fan_out_live_and_mailbox() {
        let h = harness().await;
        for name in ["alice", "bob", "carol"] {
            h.register(name).await;
        }
        let (mut alice, _) = h.login("alice", 8).await;
        let reply = h
            .call(
                &mut alice,
                Request::CreateGroup {
                    name: "study".into(),
                    description: "exam prep".into(),
                },
            )
            .await;
        let group_id = match &reply.frames[0] {
            ServerFrame::GroupCreated { group } => group.id,
            other => panic!("unexpected {other:?}"),
        };
        for member in ["bob", "carol"] {
            let reply = h
                .call(
                    &mut alice,
                    Request::AddMember {
                        group_id,
                        member: member.into(),
                    },
                )
                .await;
            assert!(matches!(reply.frames[0], ServerFrame::MemberAdded { .. }));
        }

        let (mut bob, _) = h.login("bob", 8).await;
        while bob.next_live().is_some() {}
        let carol_before = h.mailbox_len("carol");

        let reply = h
            .call(
                &mut alice,
                Request::GroupMessage {
                    group_id,
                    body: "room 204".into(),
                },
            )
            .await;
        assert!(matches!(
            reply.frames[0],
            ServerFrame::Accepted {
                delivered_live: 1,
                mailboxed: 1,
                ..
            }
        ));

        assert!(matches!(bob.next_live(), Some(ServerFrame::Message { .. })));
        assert!(bob.next_live().is_none());
        assert_eq!(h.mailbox_len("carol"), carol_before + 1);
        assert_eq!(h.mailbox_len("alice"), 0);

        // Non-members are refused and can't read history.
        h.register("mallory").await;
        let (mut mallory, _) = h.login("mallory", 8).await;
        let reply = h
            .call(
                &mut mallory,
                Request::GroupMessage {
                    group_id,
                    body: "hi".into(),
                },
            )
            .await;
        assert_eq!(error_code(&reply), ErrorCode::NotGroupMember);
        let reply = h
            .call(
                &mut mallory,
                Request::GetHistory {
                    with: None,
                    group_id: Some(group_id),
                    limit: None,
                },
            )
            .await;
        assert_eq!(error_code(&reply), ErrorCode::NotGroupMember);

        let reply = h
            .call(
                &mut bob,
                Request::GetHistory {
                    with: None,
                    group_id: Some(group_id),
                    limit: Some(10),
                },
            )
            .await;
        assert!(matches!(
            &reply.frames[0],
            ServerFrame::History { messages, .. } if messages.len() == 1
        ));
    }

    #[tokio::test]
    async fn second_login_evicts_first() {
        let h = harness().await;
        h.register("alice").await;
        let (mut first, _) = h.login("alice", 8).await;
        let (second, _) = h.login("alice", 8).await;

        assert!(first.cancel.is_cancelled());
        assert!(matches!(
            first.next_live(),
            Some(ServerFrame::ForcedLogout { .. })
        ));
        let bound = h.router.presence.resolve(&"alice".into()).unwrap();
        assert_eq!(bound.id(), second.state.id());

        // The evicted session closing does not unbind the new one.
        h.leave(&mut first).await;
        assert_eq!(h.router.online_count(), 1);
    }

    #[tokio::test]
    async fn second_login_rejected_under_reject_policy() {
        let config = ServerConfig {
            session_policy: crate::config::SessionPolicy::Reject,
            ..test_config()
        };
        let h = harness_with(Arc::new(MemoryStore::new()), config).await;
        h.register("alice").await;
        let (first, _) = h.login("alice", 8).await;

        let mut second = Client::new(8);
        let reply = h
            .call(
                &mut second,
                Request::Login {
                    username: "alice".into(),
                    password: "pw".into(),
                },
            )
            .await;
        assert_eq!(error_code(&reply), ErrorCode::AlreadyOnline);
        assert!(second.state.user().is_none());
        assert!(!first.cancel.is_cancelled());
        assert_eq!(
            h.router.presence.resolve(&"alice".into()).unwrap().id(),
            first.state.id()
        );
    }

    #[tokio::test]
    async fn files_need_a_stored_handle() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;
        let (mut alice, _) = h.login("alice", 8).await;

        let missing = Request::SendFile {
            to: Some("bob".into()),
            group_id: None,
            file_handle: FileHandle(uuid::Uuid::new_v4()),
            filename: "notes.pdf".into(),
            size: 3,
        };
        assert_eq!(error_code(&h.call(&mut alice, missing).await), ErrorCode::NotFound);

        let blob = h.router.blobs.store_blob(b"pdf").await.unwrap();
        let reply = h
            .call(
                &mut alice,
                Request::SendFile {
                    to: Some("bob".into()),
                    group_id: None,
                    file_handle: blob.handle,
                    filename: "notes.pdf".into(),
                    size: 3,
                },
            )
            .await;
        assert!(matches!(
            reply.frames[0],
            ServerFrame::Accepted { mailboxed: 1, .. }
        ));

        let both = Request::SendFile {
            to: Some("bob".into()),
            group_id: Some(GroupId::new()),
            file_handle: blob.handle,
            filename: "notes.pdf".into(),
            size: 3,
        };
        assert_eq!(error_code(&h.call(&mut alice, both).await), ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn unfriend_blocks_messages_and_notifies() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;
        let (mut alice, _) = h.login("alice", 8).await;

        let reply = h
            .call(&mut alice, Request::Unfriend { target: "bob".into() })
            .await;
        assert!(matches!(reply.frames[0], ServerFrame::FriendRemoved { .. }));
        // Idempotent.
        let reply = h
            .call(&mut alice, Request::Unfriend { target: "bob".into() })
            .await;
        assert!(matches!(reply.frames[0], ServerFrame::FriendRemoved { .. }));

        assert_eq!(
            error_code(&h.call(&mut alice, text("bob", "still there?")).await),
            ErrorCode::NotFriends
        );

        let (_bob, login) = h.login("bob", 8).await;
        let unfriended = drained(&login)
            .into_iter()
            .filter(|f| matches!(f, ServerFrame::Unfriended { .. }))
            .count();
        assert_eq!(unfriended, 1);
    }

    #[tokio::test]
    async fn online_users_are_friends_only() {
        let h = harness().await;
        for name in ["alice", "bob", "carol"] {
            h.register(name).await;
        }
        h.befriend("alice", "bob").await;

        let (mut alice, _) = h.login("alice", 8).await;
        let (_bob, _) = h.login("bob", 8).await;
        let (_carol, _) = h.login("carol", 8).await;

        let reply = h.call(&mut alice, Request::GetOnlineUsers).await;
        assert_eq!(
            reply.frames[0],
            ServerFrame::OnlineUsers {
                users: vec!["bob".into()]
            }
        );

        let reply = h.call(&mut alice, Request::GetFriendList).await;
        assert_eq!(
            reply.frames[0],
            ServerFrame::FriendList {
                friends: vec![FriendStatus {
                    username: "bob".into(),
                    online: true
                }]
            }
        );
    }

    #[tokio::test]
    async fn history_window_for_friends() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;
        let (mut alice, _) = h.login("alice", 8).await;

        for i in 0..5 {
            h.call(&mut alice, text("bob", &format!("m{i}"))).await;
        }
        let reply = h
            .call(
                &mut alice,
                Request::GetHistory {
                    with: Some("bob".into()),
                    group_id: None,
                    limit: Some(2),
                },
            )
            .await;
        match &reply.frames[0] {
            ServerFrame::History {
                conversation,
                messages,
            } => {
                assert_eq!(conversation, "dm:alice:bob");
                let bodies: Vec<_> = messages
                    .iter()
                    .map(|m| match &m.body {
                        MessageBody::Text { body } => body.clone(),
                        MessageBody::File { filename, .. } => filename.clone(),
                    })
                    .collect();
                assert_eq!(bodies, vec!["m3", "m4"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn text_bodies(frames: impl IntoIterator<Item = ServerFrame>, from: &str) -> Vec<String> {
        frames
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::Message { message } if message.sender.as_str() == from => {
                    match message.body {
                        MessageBody::Text { body } => Some(body),
                        MessageBody::File { .. } => None,
                    }
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn unread_frames_return_to_mailbox_on_disconnect() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;
        let (mut alice, _) = h.login("alice", 8).await;
        let (mut bob, _) = h.login("bob", 8).await;

        let reply = h.call(&mut alice, text("bob", "queued")).await;
        assert!(matches!(
            reply.frames[0],
            ServerFrame::Accepted {
                delivered_live: 1,
                ..
            }
        ));
        bob.state
            .outbound
            .try_send(ServerFrame::Presence {
                username: "alice".into(),
                online: true,
            })
            .unwrap();

        // Bob's connection drops before his session wrote either frame.
        h.leave(&mut bob).await;
        assert!(!h.router.presence.is_online(&"bob".into()));

        let queued: Vec<_> = h
            .store
            .load_offline_queue(&"bob".into())
            .unwrap()
            .into_iter()
            .map(|e| e.payload)
            .collect();
        assert_eq!(text_bodies(queued.clone(), "alice"), vec!["queued"]);
        assert_eq!(queued.len(), 1);

        let (_bob, login) = h.login("bob", 8).await;
        assert_eq!(text_bodies(drained(&login), "alice"), vec!["queued"]);
    }

    #[tokio::test]
    async fn logout_reclaims_queue_and_goes_offline() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;
        let (mut alice, _) = h.login("alice", 8).await;
        let (mut bob, _) = h.login("bob", 8).await;
        while alice.next_live().is_some() {}

        h.call(&mut alice, text("bob", "bye?")).await;
        let reply = h.call(&mut bob, Request::Logout).await;
        assert!(reply.close);
        h.leave(&mut bob).await;

        assert_eq!(h.mailbox_len("bob"), 1);
        assert_eq!(
            alice.next_live(),
            Some(ServerFrame::Presence {
                username: "bob".into(),
                online: false
            })
        );
    }

    /// A store whose mailbox writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        refuse_mailbox: AtomicBool,
    }

    impl Persistence for FlakyStore {
        fn load_users(&self) -> courier_store::Result<Vec<StoredUser>> {
            self.inner.load_users()
        }
        fn save_user(&self, user: &StoredUser) -> courier_store::Result<()> {
            self.inner.save_user(user)
        }
        fn load_friend_links(&self) -> courier_store::Result<Vec<FriendLink>> {
            self.inner.load_friend_links()
        }
        fn load_friend_requests(&self) -> courier_store::Result<Vec<FriendRequest>> {
            self.inner.load_friend_requests()
        }
        fn remove_friend_link(&self, a: &Username, b: &Username) -> courier_store::Result<()> {
            self.inner.remove_friend_link(a, b)
        }
        fn save_friend_request(&self, request: &FriendRequest) -> courier_store::Result<()> {
            self.inner.save_friend_request(request)
        }
        fn remove_friend_request(&self, from: &Username, to: &Username) -> courier_store::Result<()> {
            self.inner.remove_friend_request(from, to)
        }
        fn accept_friend_request(
            &self,
            request: &FriendRequest,
            link: &FriendLink,
        ) -> courier_store::Result<()> {
            self.inner.accept_friend_request(request, link)
        }
        fn load_groups(&self) -> courier_store::Result<Vec<Group>> {
            self.inner.load_groups()
        }
        fn save_group(&self, group: &Group) -> courier_store::Result<()> {
            self.inner.save_group(group)
        }
        fn load_offline_queue(&self, owner: &Username) -> courier_store::Result<Vec<MailboxEntry>> {
            self.inner.load_offline_queue(owner)
        }
        fn enqueue_offline(&self, entry: &MailboxEntry) -> courier_store::Result<()> {
            if self.refuse_mailbox.load(AtomicOrdering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.enqueue_offline(entry)
        }
        fn remove_offline(&self, owner: &Username, ids: &[uuid::Uuid]) -> courier_store::Result<()> {
            self.inner.remove_offline(owner, ids)
        }
        fn append_history(&self, message: &Message) -> courier_store::Result<()> {
            self.inner.append_history(message)
        }
        fn load_history(
            &self,
            key: &ConversationKey,
            limit: u32,
        ) -> courier_store::Result<Vec<Message>> {
            self.inner.load_history(key, limit)
        }
        fn flush(&self) -> courier_store::Result<()> {
            self.inner.flush()
        }
    }

    #[tokio::test]
    async fn failed_delivery_leaves_no_history() {
        let flaky = Arc::new(FlakyStore::default());
        let h = harness_with(flaky.clone(), test_config()).await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;
        let (mut alice, _) = h.login("alice", 8).await;
        let key = ConversationKey::pair(&"alice".into(), &"bob".into());

        flaky.refuse_mailbox.store(true, AtomicOrdering::SeqCst);
        let reply = h.call(&mut alice, text("bob", "lost in transit")).await;
        assert_eq!(error_code(&reply), ErrorCode::Transient);
        assert!(h.store.load_history(&key, 10).unwrap().is_empty());
        assert_eq!(h.mailbox_len("bob"), 0);

        flaky.refuse_mailbox.store(false, AtomicOrdering::SeqCst);
        let reply = h.call(&mut alice, text("bob", "second try")).await;
        assert!(matches!(
            reply.frames[0],
            ServerFrame::Accepted { mailboxed: 1, .. }
        ));
        let history = h.store.load_history(&key, 10).unwrap();
        let recorded = history
            .into_iter()
            .map(|message| ServerFrame::Message { message });
        assert_eq!(text_bodies(recorded, "alice"), vec!["second try"]);
    }

    #[tokio::test]
    async fn group_message_nobody_got_is_not_recorded() {
        let flaky = Arc::new(FlakyStore::default());
        let h = harness_with(flaky.clone(), test_config()).await;
        h.register("alice").await;
        h.register("bob").await;
        let (mut alice, _) = h.login("alice", 8).await;
        let reply = h
            .call(
                &mut alice,
                Request::CreateGroup {
                    name: "lab".into(),
                    description: String::new(),
                },
            )
            .await;
        let ServerFrame::GroupCreated { group } = &reply.frames[0] else {
            panic!("unexpected {:?}", reply.frames);
        };
        let group_id = group.id;
        h.call(
            &mut alice,
            Request::AddMember {
                group_id,
                member: "bob".into(),
            },
        )
        .await;

        flaky.refuse_mailbox.store(true, AtomicOrdering::SeqCst);
        let reply = h
            .call(
                &mut alice,
                Request::GroupMessage {
                    group_id,
                    body: "anyone?".into(),
                },
            )
            .await;
        assert_eq!(error_code(&reply), ErrorCode::Transient);
        assert!(h
            .store
            .load_history(&ConversationKey::Group(group_id), 10)
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn order_holds_across_login_under_concurrent_traffic() {
        const COUNT: usize = 200;

        let h = harness().await;
        for name in ["alice", "bob", "carol", "dave"] {
            h.register(name).await;
        }
        h.befriend("alice", "bob").await;
        h.befriend("carol", "dave").await;
        let (mut alice, _) = h.login("alice", 8).await;
        let (mut carol, _) = h.login("carol", 8).await;

        let router = h.router.clone();
        let to_bob = tokio::spawn(async move {
            for i in 0..COUNT {
                router
                    .handle(&mut alice.state, text("bob", &format!("m{i}")))
                    .await;
            }
        });
        let router = h.router.clone();
        let to_dave = tokio::spawn(async move {
            for i in 0..COUNT {
                router
                    .handle(&mut carol.state, text("dave", &format!("n{i}")))
                    .await;
            }
        });

        // Bob logs in while Alice is mid-stream.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (mut bob, login) = h.login("bob", COUNT * 2).await;

        to_bob.await.unwrap();
        to_dave.await.unwrap();

        let mut seen = text_bodies(drained(&login), "alice");
        let mut live = Vec::new();
        while let Some(frame) = bob.next_live() {
            live.push(frame);
        }
        seen.extend(text_bodies(live, "alice"));
        let expected: Vec<String> = (0..COUNT).map(|i| format!("m{i}")).collect();
        assert_eq!(seen, expected);

        let mailed: Vec<_> = h
            .store
            .load_offline_queue(&"dave".into())
            .unwrap()
            .into_iter()
            .map(|e| e.payload)
            .collect();
        let expected: Vec<String> = (0..COUNT).map(|i| format!("n{i}")).collect();
        assert_eq!(text_bodies(mailed, "carol"), expected);
    }

    #[test]
    fn lists_are_trimmed_from_the_far_end() {
        // Each item is 7 bytes of JSON plus a comma.
        let items: Vec<String> = (0..10).map(|i| format!("item{i}")).collect();

        let mut head = items.clone();
        assert_eq!(fit_budget(&mut head, 8 * 3, Keep::Head), 7);
        let expected: Vec<String> = (0..3).map(|i| format!("item{i}")).collect();
        assert_eq!(head, expected);

        let mut tail = items.clone();
        assert_eq!(fit_budget(&mut tail, 8 * 3 + 5, Keep::Tail), 7);
        let expected: Vec<String> = (7..10).map(|i| format!("item{i}")).collect();
        assert_eq!(tail, expected);

        let mut all = items;
        assert_eq!(fit_budget(&mut all, usize::MAX, Keep::Head), 0);
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn long_history_keeps_the_newest_that_fit() {
        let h = harness().await;
        h.register("alice").await;
        h.register("bob").await;
        h.befriend("alice", "bob").await;
        let (mut alice, _) = h.login("alice", 8).await;

        let filler = "x".repeat(60 * 1024);
        for i in 0..20 {
            let reply = h
                .call(&mut alice, text("bob", &format!("{i:02}{filler}")))
                .await;
            assert!(matches!(reply.frames[0], ServerFrame::Accepted { .. }));
        }

        let reply = h
            .call(
                &mut alice,
                Request::GetHistory {
                    with: Some("bob".into()),
                    group_id: None,
                    limit: Some(50),
                },
            )
            .await;
        let frame = &reply.frames[0];
        assert!(serde_json::to_vec(frame).unwrap().len() <= test_config().max_frame_size);
        let ServerFrame::History { messages, .. } = frame else {
            panic!("unexpected {frame:?}");
        };
        assert!(!messages.is_empty() && messages.len() < 20);
        let bodies = text_bodies(
            messages
                .iter()
                .cloned()
                .map(|message| ServerFrame::Message { message }),
            "alice",
        );
        assert!(bodies.last().unwrap().starts_with("19"));
    }
}
