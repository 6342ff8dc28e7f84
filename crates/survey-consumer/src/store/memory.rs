//! In-memory index store
//!
//! Each transaction works on a private copy of the state and swaps it in on
//! commit, so an uncommitted transaction leaves nothing behind. Faults can be
//! injected to exercise the transient-failure path.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use survey_core::prelude::*;
use survey_core::{Response, ResultsPublication, Survey};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Everything the store holds
#[derive(Debug, Clone, Default)]
pub struct IndexState {
    /// `None` models an unprovisioned cursor row
    pub cursor: Option<i64>,
    pub surveys: BTreeMap<Uuid, Survey>,
    pub responses: BTreeMap<Uuid, Response>,
    /// Keyed by survey id
    pub results: BTreeMap<Uuid, ResultsPublication>,
}

impl IndexState {
    pub fn survey_by_slug(&self, slug: &str) -> Option<&Survey> {
        self.surveys.values().find(|s| s.slug == slug)
    }

    pub fn survey_by_record_key(&self, record_key: &str) -> Option<&Survey> {
        self.surveys.values().find(|s| s.record_key == record_key)
    }

    pub fn responses_for(&self, survey_id: Uuid) -> Vec<&Response> {
        self.responses
            .values()
            .filter(|r| r.survey_id == survey_id)
            .collect()
    }
}

struct Shared {
    state: Mutex<IndexState>,
    failing_writes: AtomicU32,
    fail_commit: AtomicBool,
    unhealthy: AtomicBool,
}

impl Shared {
    fn check_write(&self) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(IndexerError::storage("injected write failure"));
        }
        Ok(())
    }
}

/// In-memory store (for testing)
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create a store with the cursor row provisioned at 0
    pub fn new() -> Self {
        Self::with_cursor(0)
    }

    /// Create a store with the cursor row provisioned at `time_us`
    pub fn with_cursor(time_us: i64) -> Self {
        Self::from_state(IndexState {
            cursor: Some(time_us),
            ..Default::default()
        })
    }

    /// Create a store whose cursor row was never provisioned
    pub fn unprovisioned() -> Self {
        Self::from_state(IndexState::default())
    }

    fn from_state(state: IndexState) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                failing_writes: AtomicU32::new(0),
                fail_commit: AtomicBool::new(false),
                unhealthy: AtomicBool::new(false),
            }),
        }
    }

    /// Copy of the committed state
    pub async fn snapshot(&self) -> IndexState {
        self.shared.state.lock().await.clone()
    }

    /// Make the next `count` write operations fail with a storage error
    pub fn fail_next_writes(&self, count: u32) {
        self.shared.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make every commit fail until cleared
    pub fn fail_commits(&self, fail: bool) {
        self.shared.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.shared.unhealthy.store(!healthy, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        if self.shared.unhealthy.load(Ordering::SeqCst) {
            return Err(IndexerError::storage("memory store marked unhealthy"));
        }
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "memory_store"
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn IndexTxn>> {
        let working = self.shared.state.lock().await.clone();
        Ok(Box::new(MemoryTxn {
            shared: Arc::clone(&self.shared),
            working,
        }))
    }

    async fn load_cursor(&self) -> Result<i64> {
        self.shared
            .state
            .lock()
            .await
            .cursor
            .ok_or(IndexerError::CursorMissing { id: 1 })
    }
}

/// Transaction over a private copy of the state
pub struct MemoryTxn {
    shared: Arc<Shared>,
    working: IndexState,
}

#[async_trait]
impl IndexTxn for MemoryTxn {
    async fn cursor(&mut self) -> Result<i64> {
        self.working
            .cursor
            .ok_or(IndexerError::CursorMissing { id: 1 })
    }

    async fn set_cursor(&mut self, time_us: i64) -> Result<()> {
        self.shared.check_write()?;
        match self.working.cursor.as_mut() {
            Some(cursor) => {
                *cursor = time_us;
                Ok(())
            }
            None => Err(IndexerError::CursorMissing { id: 1 }),
        }
    }

    async fn survey_by_record_key(&mut self, record_key: &str) -> Result<Option<Survey>> {
        Ok(self.working.survey_by_record_key(record_key).cloned())
    }

    async fn survey_by_uri(&mut self, uri: &str) -> Result<Option<Survey>> {
        Ok(self.working.surveys.values().find(|s| s.uri == uri).cloned())
    }

    async fn slug_exists(&mut self, slug: &str) -> Result<bool> {
        Ok(self.working.survey_by_slug(slug).is_some())
    }

    async fn insert_survey(&mut self, survey: &Survey) -> Result<()> {
        self.shared.check_write()?;
        if self.working.survey_by_slug(&survey.slug).is_some() {
            return Err(IndexerError::storage(format!(
                "duplicate slug {}",
                survey.slug
            )));
        }
        self.working.surveys.insert(survey.id, survey.clone());
        Ok(())
    }

    async fn update_survey(&mut self, survey: &Survey) -> Result<()> {
        self.shared.check_write()?;
        let stored = self
            .working
            .surveys
            .get_mut(&survey.id)
            .ok_or_else(|| IndexerError::storage(format!("survey {} not found", survey.id)))?;

        stored.title = survey.title.clone();
        stored.description = survey.description.clone();
        stored.definition = survey.definition.clone();
        stored.cid = survey.cid.clone();
        stored.updated_at = survey.updated_at;
        Ok(())
    }

    async fn delete_survey(&mut self, id: Uuid) -> Result<bool> {
        self.shared.check_write()?;
        let existed = self.working.surveys.remove(&id).is_some();
        self.working.responses.retain(|_, r| r.survey_id != id);
        self.working.results.remove(&id);
        Ok(existed)
    }

    async fn upsert_response(&mut self, response: &Response) -> Result<()> {
        self.shared.check_write()?;
        let existing = self
            .working
            .responses
            .values_mut()
            .find(|r| r.survey_id == response.survey_id && r.voter_did == response.voter_did);

        match existing {
            Some(stored) => {
                stored.record_uri = response.record_uri.clone();
                stored.record_cid = response.record_cid.clone();
                stored.survey_cid = response.survey_cid.clone();
                stored.answers = response.answers.clone();
                stored.updated_at = response.updated_at;
            }
            None => {
                self.working.responses.insert(response.id, response.clone());
            }
        }
        Ok(())
    }

    async fn delete_response(&mut self, voter_did: &str, record_uri: &str) -> Result<bool> {
        self.shared.check_write()?;
        let before = self.working.responses.len();
        self.working
            .responses
            .retain(|_, r| !(r.voter_did == voter_did && r.record_uri == record_uri));
        Ok(self.working.responses.len() < before)
    }

    async fn upsert_results(&mut self, results: &ResultsPublication) -> Result<()> {
        self.shared.check_write()?;
        self.working
            .results
            .insert(results.survey_id, results.clone());
        Ok(())
    }

    async fn delete_results(&mut self, record_uri: &str) -> Result<bool> {
        self.shared.check_write()?;
        let before = self.working.results.len();
        self.working.results.retain(|_, r| r.record_uri != record_uri);
        Ok(self.working.results.len() < before)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.shared.fail_commit.load(Ordering::SeqCst) {
            return Err(IndexerError::storage("injected commit failure"));
        }
        let MemoryTxn { shared, working } = *self;
        *shared.state.lock().await = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = MemoryStore::with_cursor(5);

        let mut txn = store.begin().await.unwrap();
        txn.set_cursor(10).await.unwrap();
        assert_eq!(txn.cursor().await.unwrap(), 10);
        txn.rollback().await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), 5);

        let mut txn = store.begin().await.unwrap();
        txn.set_cursor(10).await.unwrap();
        drop(txn);
        assert_eq!(store.load_cursor().await.unwrap(), 5);

        let mut txn = store.begin().await.unwrap();
        txn.set_cursor(10).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_unprovisioned_cursor() {
        let store = MemoryStore::unprovisioned();
        assert!(matches!(
            store.load_cursor().await,
            Err(IndexerError::CursorMissing { id: 1 })
        ));

        let mut txn = store.begin().await.unwrap();
        assert!(matches!(
            txn.set_cursor(1).await,
            Err(IndexerError::CursorMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_write_failure_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);

        let mut txn = store.begin().await.unwrap();
        let err = txn.set_cursor(3).await.unwrap_err();
        assert!(err.is_retryable());
        txn.set_cursor(3).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), 3);
    }
}
