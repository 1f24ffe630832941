/// Protocol version string announced in `LOGGED_IN` and `/info`
pub const PROTOCOL_VERSION: &str = "/courier/1.0.0";

/// Length of the ASCII decimal frame header in bytes
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest body the 8-digit header can describe
pub const MAX_ENCODABLE_FRAME: usize = 99_999_999;

/// Default maximum frame body size in bytes (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Smallest configurable frame size. A maximal text message, escaped
/// to JSON, must always fit in one frame.
pub const MIN_FRAME_SIZE: usize = 512 * 1024;

/// Maximum text message body in bytes (64 KiB)
pub const MAX_MESSAGE_BODY: usize = 64 * 1024;

/// Maximum file transfer size in bytes (50 MiB)
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Username length bounds
pub const MIN_USERNAME_LEN: usize = 1;
pub const MAX_USERNAME_LEN: usize = 32;

/// Maximum group name length
pub const MAX_GROUP_NAME_LEN: usize = 64;

/// Default TCP relay port
pub const DEFAULT_RELAY_PORT: u16 = 9999;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// History page bounds for `GET_HISTORY`
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 500;
