//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_MAX_FRAME_SIZE, DEFAULT_RELAY_PORT, MAX_FILE_SIZE, MIN_FRAME_SIZE,
};

/// What happens when a user logs in while already bound to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// The old session gets `FORCED_LOGOUT` and is closed.
    Evict,
    /// The new login fails with `ALREADY_ONLINE`.
    Reject,
}

impl FromStr for SessionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evict" => Ok(Self::Evict),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown session policy '{other}'")),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address of the relay protocol listener.
    /// Env: `LISTEN_ADDR`
    /// Default: `127.0.0.1:9999`
    pub listen_addr: SocketAddr,

    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `127.0.0.1:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./data/courier.db`
    pub database_path: PathBuf,

    /// Filesystem path where uploaded blobs are stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./data/blobs`
    pub blob_storage_path: PathBuf,

    /// Maximum blob size in bytes.
    /// Env: `MAX_BLOB_SIZE`
    pub max_blob_size: usize,

    /// Maximum frame body on the relay socket.
    /// Env: `MAX_FRAME_SIZE`
    pub max_frame_size: usize,

    /// Env: `SESSION_POLICY` (evict/reject)
    /// Default: `evict`
    pub session_policy: SessionPolicy,

    /// How long a delivery may wait on a full outbound queue before the
    /// recipient is treated as stalled.
    /// Env: `DELIVERY_TIMEOUT_MS`
    pub delivery_timeout: Duration,

    /// Per-session outbound queue capacity.
    /// Env: `OUTBOUND_QUEUE`
    pub outbound_queue: usize,

    /// Sessions that send nothing for this long are closed.
    /// Env: `IDLE_TIMEOUT_SECS`
    pub idle_timeout: Duration,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Courier Relay"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Whether `REGISTER` is accepted.
    /// Env: `REGISTRATION_OPEN` (true/false)
    /// Default: `true`
    pub registration_open: bool,

    /// bcrypt work factor for new password hashes.
    /// Env: `BCRYPT_COST`
    pub bcrypt_cost: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], DEFAULT_RELAY_PORT).into(),
            http_addr: ([127, 0, 0, 1], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./data/courier.db"),
            blob_storage_path: PathBuf::from("./data/blobs"),
            max_blob_size: MAX_FILE_SIZE as usize,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            session_policy: SessionPolicy::Evict,
            delivery_timeout: Duration::from_millis(2000),
            outbound_queue: 256,
            idle_timeout: Duration::from_secs(300),
            instance_name: "Courier Relay".to_string(),
            admin_token: None,
            registration_open: true,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads from any source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&get, "LISTEN_ADDR", &mut config.listen_addr);
        parse_into(&get, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = get("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        parse_into(&get, "MAX_BLOB_SIZE", &mut config.max_blob_size);
        parse_into(&get, "MAX_FRAME_SIZE", &mut config.max_frame_size);
        parse_into(&get, "SESSION_POLICY", &mut config.session_policy);
        parse_into(&get, "OUTBOUND_QUEUE", &mut config.outbound_queue);
        parse_into(&get, "BCRYPT_COST", &mut config.bcrypt_cost);

        let mut delivery_ms = config.delivery_timeout.as_millis() as u64;
        parse_into(&get, "DELIVERY_TIMEOUT_MS", &mut delivery_ms);
        config.delivery_timeout = Duration::from_millis(delivery_ms);

        let mut idle_secs = config.idle_timeout.as_secs();
        parse_into(&get, "IDLE_TIMEOUT_SECS", &mut idle_secs);
        config.idle_timeout = Duration::from_secs(idle_secs);

        config.max_frame_size = config.max_frame_size.max(MIN_FRAME_SIZE);
        // A zero-capacity mpsc channel panics.
        config.outbound_queue = config.outbound_queue.max(1);

        if let Some(name) = get("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = get("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = get("REGISTRATION_OPEN") {
            config.registration_open = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<T>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = get(key) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "Invalid setting, using default"),
    }
}
