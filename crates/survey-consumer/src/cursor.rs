//! Cursor store
//!
//! Owns the single persisted resumption point. Reads go to the store; writes
//! only ever happen inside a caller-supplied event transaction. A cached copy
//! of the last committed value serves reconnects without a database round
//! trip.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use survey_core::prelude::*;
use tracing::{debug, info};

pub struct CursorStore {
    store: Arc<dyn IndexStore>,
    committed: AtomicI64,
}

impl CursorStore {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self {
            store,
            committed: AtomicI64::new(0),
        }
    }

    /// Read the committed cursor and refresh the cache.
    ///
    /// Fails with `CursorMissing` if the row was never provisioned; the row is
    /// never created here.
    pub async fn get(&self) -> Result<i64> {
        let time_us = self.store.load_cursor().await?;
        self.committed.store(time_us, Ordering::SeqCst);
        info!(cursor = time_us, "Loaded cursor");
        Ok(time_us)
    }

    /// Overwrite the cursor row inside `txn`. No ordering checks.
    pub async fn set(&self, txn: &mut dyn IndexTxn, time_us: i64) -> Result<()> {
        txn.set_cursor(time_us).await
    }

    /// Move the cursor to `max(stored, sequence)` inside `txn`.
    ///
    /// Returns the value the cursor will hold once `txn` commits.
    pub async fn advance(&self, txn: &mut dyn IndexTxn, sequence: i64) -> Result<i64> {
        let current = txn.cursor().await?;
        if sequence <= current {
            debug!(cursor = current, sequence, "Cursor already past event");
            return Ok(current);
        }
        self.set(txn, sequence).await?;
        Ok(sequence)
    }

    /// Record that a transaction holding `time_us` committed
    pub fn mark_committed(&self, time_us: i64) {
        self.committed.fetch_max(time_us, Ordering::SeqCst);
    }

    /// Last committed value; the resume point for the next connection
    pub fn last_committed(&self) -> i64 {
        self.committed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_get_reads_provisioned_row() {
        let cursor = CursorStore::new(Arc::new(MemoryStore::with_cursor(42)));
        assert_eq!(cursor.get().await.unwrap(), 42);
        assert_eq!(cursor.last_committed(), 42);
    }

    #[tokio::test]
    async fn test_get_fails_when_row_missing() {
        let cursor = CursorStore::new(Arc::new(MemoryStore::unprovisioned()));
        let err = cursor.get().await.unwrap_err();
        assert!(matches!(err, IndexerError::CursorMissing { id: 1 }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_advance_never_regresses() {
        let store = MemoryStore::with_cursor(100);
        let cursor = CursorStore::new(Arc::new(store.clone()));

        let mut txn = store.begin().await.unwrap();
        assert_eq!(cursor.advance(txn.as_mut(), 50).await.unwrap(), 100);
        assert_eq!(cursor.advance(txn.as_mut(), 150).await.unwrap(), 150);
        txn.commit().await.unwrap();
        cursor.mark_committed(150);

        assert_eq!(store.load_cursor().await.unwrap(), 150);
        cursor.mark_committed(120);
        assert_eq!(cursor.last_committed(), 150);
    }

    #[tokio::test]
    async fn test_set_fails_without_row() {
        let store = MemoryStore::unprovisioned();
        let cursor = CursorStore::new(Arc::new(store.clone()));
        let mut txn = store.begin().await.unwrap();
        assert!(matches!(
            cursor.set(txn.as_mut(), 10).await,
            Err(IndexerError::CursorMissing { .. })
        ));
    }
}
