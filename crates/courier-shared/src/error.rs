use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every way a relay request can fail.
///
/// Authorization failures (`Unauthenticated`, `NotFriends`,
/// `NotGroupMember`) are terminal for the request and never retried.
/// `Transient` covers store and I/O trouble and is safe to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Not logged in")]
    Unauthenticated,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Username already taken")]
    DuplicateUser,

    #[error("User is already logged in elsewhere")]
    DuplicateSession,

    #[error("Registration is closed on this server")]
    RegistrationClosed,

    #[error("You are not friends with {0}")]
    NotFriends(String),

    #[error("You are not a member of this group")]
    NotGroupMember,

    #[error("You cannot send a friend request to yourself")]
    SelfFriendRequest,

    #[error("Already friends with {0}")]
    AlreadyFriends(String),

    #[error("A friend request between you and {0} is already pending")]
    DuplicateRequest(String),

    #[error("No pending friend request from {0}")]
    NoSuchRequest(String),

    #[error("{0} is not a member of this group")]
    NotMember(String),

    #[error("{0} is already a member of this group")]
    AlreadyMember(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Temporary failure, try again")]
    Transient(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Machine-readable error code carried in `ERROR` frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthenticated,
    InvalidCredentials,
    DuplicateUser,
    AlreadyOnline,
    RegistrationClosed,
    NotFriends,
    NotGroupMember,
    SelfFriendRequest,
    AlreadyFriends,
    DuplicateRequest,
    NoSuchRequest,
    NotMember,
    AlreadyMember,
    NotFound,
    InvalidInput,
    Transient,
    ProtocolError,
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated => ErrorCode::Unauthenticated,
            Self::InvalidCredentials => ErrorCode::InvalidCredentials,
            Self::DuplicateUser => ErrorCode::DuplicateUser,
            Self::DuplicateSession => ErrorCode::AlreadyOnline,
            Self::RegistrationClosed => ErrorCode::RegistrationClosed,
            Self::NotFriends(_) => ErrorCode::NotFriends,
            Self::NotGroupMember => ErrorCode::NotGroupMember,
            Self::SelfFriendRequest => ErrorCode::SelfFriendRequest,
            Self::AlreadyFriends(_) => ErrorCode::AlreadyFriends,
            Self::DuplicateRequest(_) => ErrorCode::DuplicateRequest,
            Self::NoSuchRequest(_) => ErrorCode::NoSuchRequest,
            Self::NotMember(_) => ErrorCode::NotMember,
            Self::AlreadyMember(_) => ErrorCode::AlreadyMember,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Transient(_) => ErrorCode::Transient,
            Self::Protocol(_) => ErrorCode::ProtocolError,
        }
    }

    /// Text safe to show the client. Transient details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Transient(_) => "Temporary failure, try again".to_string(),
            other => other.to_string(),
        }
    }
}

/// Errors raised while splitting a byte stream into frames.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid frame header: {0:?}")]
    InvalidHeader(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
