use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};
use crate::types::{
    AuthToken, Decision, FileHandle, FriendRequest, FriendStatus, Group, GroupId, Message,
    MessageId, Profile, UserSummary, Username,
};

/// Clear-text password as received in a frame. `Debug` never prints it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Password(pub String);

impl Password {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Every request a client can send, tagged by `"type"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Register {
        username: Username,
        password: Password,
        #[serde(default)]
        profile: Profile,
        profile_picture_ref: Option<String>,
    },
    Login {
        username: Username,
        password: Password,
    },
    Logout,
    Ping,

    /// Private text message to a friend
    SendMessage { to: Username, body: String },

    /// Text message to every other member of a group
    GroupMessage { group_id: GroupId, body: String },

    /// File reference to a friend (`to`) or a group (`group_id`), exactly one
    SendFile {
        to: Option<Username>,
        group_id: Option<GroupId>,
        file_handle: FileHandle,
        filename: String,
        size: u64,
    },

    SendFriendRequest { to: Username },
    FriendResponse { from: Username, decision: Decision },
    Unfriend { target: Username },
    GetFriendList,
    GetPendingRequests,
    SearchUsers { query: Option<String> },
    EditProfile {
        profile: Profile,
        profile_picture_ref: Option<String>,
        new_password: Option<Password>,
    },

    CreateGroup {
        name: String,
        #[serde(default)]
        description: String,
    },
    JoinGroup { group_id: GroupId },
    AddMember { group_id: GroupId, member: Username },
    LeaveGroup { group_id: GroupId },
    ListGroups,

    /// History of a friend conversation (`with`) or a group (`group_id`)
    GetHistory {
        with: Option<Username>,
        group_id: Option<GroupId>,
        limit: Option<u32>,
    },
    GetOnlineUsers,

    /// Any `type` this server does not know
    #[serde(other)]
    Unknown,
}

impl Request {
    /// Decode a frame body. Bad JSON is a protocol error, not a disconnect.
    pub fn decode(body: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(body).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "REGISTER",
            Self::Login { .. } => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::Ping => "PING",
            Self::SendMessage { .. } => "SEND_MESSAGE",
            Self::GroupMessage { .. } => "GROUP_MESSAGE",
            Self::SendFile { .. } => "SEND_FILE",
            Self::SendFriendRequest { .. } => "SEND_FRIEND_REQUEST",
            Self::FriendResponse { .. } => "FRIEND_RESPONSE",
            Self::Unfriend { .. } => "UNFRIEND",
            Self::GetFriendList => "GET_FRIEND_LIST",
            Self::GetPendingRequests => "GET_PENDING_REQUESTS",
            Self::SearchUsers { .. } => "SEARCH_USERS",
            Self::EditProfile { .. } => "EDIT_PROFILE",
            Self::CreateGroup { .. } => "CREATE_GROUP",
            Self::JoinGroup { .. } => "JOIN_GROUP",
            Self::AddMember { .. } => "ADD_MEMBER",
            Self::LeaveGroup { .. } => "LEAVE_GROUP",
            Self::ListGroups => "LIST_GROUPS",
            Self::GetHistory { .. } => "GET_HISTORY",
            Self::GetOnlineUsers => "GET_ONLINE_USERS",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Every frame the server sends, tagged by `"type"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Registered {
        user: UserSummary,
    },
    LoggedIn {
        user: UserSummary,
        token: AuthToken,
        groups: Vec<Group>,
        protocol: String,
    },

    /// Ack to the sender of a routed message
    Accepted {
        message_id: MessageId,
        delivered_live: usize,
        mailboxed: usize,
    },
    /// A private, group or file message for the recipient
    Message {
        message: Message,
    },

    FriendRequest {
        request: FriendRequest,
    },
    FriendRequestSent {
        to: Username,
    },
    FriendAccepted {
        by: Username,
    },
    FriendAdded {
        friend: Username,
    },
    FriendDeclined {
        from: Username,
    },
    FriendRemoved {
        username: Username,
    },
    Unfriended {
        by: Username,
    },
    Presence {
        username: Username,
        online: bool,
    },
    OnlineUsers {
        users: Vec<Username>,
    },
    FriendList {
        friends: Vec<FriendStatus>,
    },
    PendingRequests {
        requests: Vec<FriendRequest>,
    },
    Users {
        users: Vec<UserSummary>,
    },
    ProfileUpdated {
        user: UserSummary,
    },

    GroupCreated {
        group: Group,
    },
    GroupJoined {
        group: Group,
    },
    MemberAdded {
        group_id: GroupId,
        member: Username,
        by: Username,
    },
    GroupLeft {
        group_id: GroupId,
    },
    Groups {
        groups: Vec<Group>,
    },
    History {
        conversation: String,
        messages: Vec<Message>,
    },

    /// Mailbox drained on login, oldest first
    OfflineMessages {
        entries: Vec<MailboxEntry>,
    },
    ForcedLogout {
        reason: String,
    },
    Pong,
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.client_message(),
        }
    }

    /// Frames a recipient must eventually see, live or from the mailbox.
    /// Presence, replies and session notices are only worth sending live.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            Self::Message { .. }
                | Self::FriendRequest { .. }
                | Self::FriendAccepted { .. }
                | Self::Unfriended { .. }
                | Self::GroupJoined { .. }
                | Self::MemberAdded { .. }
        )
    }
}

/// One undelivered frame waiting in a user's offline mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxEntry {
    pub id: Uuid,
    pub owner: Username,
    pub payload: ServerFrame,
    pub enqueued_at: DateTime<Utc>,
}

impl MailboxEntry {
    pub fn new(owner: Username, payload: ServerFrame) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}
