//! # courier-server
//!
//! Relay server for Courier.
//!
//! Clients hold one TCP connection speaking length-prefixed JSON frames.
//! The server keeps accounts, friendships and groups, routes messages to
//! online recipients and parks the rest in a per-user offline mailbox that
//! is handed over at the next login. A small HTTP API serves health and
//! status endpoints and stores uploaded files referenced by `SEND_FILE`.

pub mod api;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod groups;
pub mod identity;
pub mod locks;
pub mod mailbox;
pub mod offload;
pub mod presence;
pub mod rate_limit;
pub mod relationships;
pub mod router;
pub mod server;
pub mod session;
