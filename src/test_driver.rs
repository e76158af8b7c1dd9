//! Helpers for spinning up throwaway stores, in the spirit of an embedded
//! test driver: in-memory backend, mock clock, generous indexing timeout.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MockClock};
use crate::storage_error::StorageError;
use crate::store::DocumentStore;

pub const TEST_INDEXING_TIMEOUT: Duration = Duration::from_secs(15);

/// Ephemeral in-memory store with a mock clock starting at `start_time`.
pub async fn ephemeral_store(start_time: u64) -> Result<Arc<DocumentStore>, StorageError> {
    ephemeral_store_with_clock(Arc::new(MockClock::new(start_time))).await
}

pub async fn ephemeral_store_with_clock(
    clock: Arc<dyn Clock>,
) -> Result<Arc<DocumentStore>, StorageError> {
    DocumentStore::open_in_memory(clock).await
}

/// Wait for all registered indexes to catch up, with the test timeout.
pub async fn wait_for_indexing(store: &DocumentStore) -> Result<(), StorageError> {
    store.wait_for_indexing(TEST_INDEXING_TIMEOUT).await
}
