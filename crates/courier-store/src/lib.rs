//! # courier-store
//!
//! Durable state for the Courier relay: accounts, the friend graph,
//! groups, the offline mailbox and conversation history.
//!
//! [`Database`] wraps a `rusqlite::Connection` with typed CRUD helpers.
//! The engine talks to storage only through the [`Persistence`] trait,
//! implemented by [`SqliteStore`] for production and [`MemoryStore`] for
//! tests.

pub mod database;
pub mod migrations;
pub mod models;
pub mod persistence;

mod error;
mod friends;
mod groups;
mod history;
mod mailbox;
mod memory;
mod sql;
mod users;

#[cfg(test)]
mod test_support;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use models::*;
pub use persistence::{Persistence, SqliteStore};
