//! # courier-shared
//!
//! Types shared by the relay server and its clients: the request and
//! frame enums that make up the wire protocol, the length-prefixed JSON
//! codec, identifiers, and the error taxonomy reported to clients.

pub mod codec;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use codec::FrameCodec;
pub use error::{CodecError, ErrorCode, RelayError};
pub use protocol::{MailboxEntry, Password, Request, ServerFrame};
