//! Moves persistence calls off the async workers.
//!
//! SQLite writes block on disk, so per-message store traffic (mailbox and
//! history) goes through the blocking pool. Registry writes that must stay
//! inside a map entry lock remain synchronous.

use std::sync::Arc;

use courier_shared::RelayError;
use courier_store::{Persistence, StoreError};

pub async fn with_store<T, F>(store: &Arc<dyn Persistence>, op: F) -> Result<T, RelayError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Persistence) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| RelayError::Transient(format!("store task failed: {e}")))?
        .map_err(RelayError::from)
}
