//! Strategy traits for the survey indexer
//!
//! The consumer is written against these seams so storage and transport can be
//! swapped: Postgres and an in-memory store behind [`IndexStore`], a real
//! WebSocket and a scripted feed behind [`FeedConnector`].
//!
//! ```text
//! HealthCheck
//!     │
//!     └── IndexStore (opens transactions, reads the cursor)
//!             │
//!             └── IndexTxn (one per event; data writes + cursor write)
//!
//! FeedConnector (opens the firehose, yields raw frames)
//! ```

use crate::error::Result;
use crate::model::{Response, ResultsPublication, Survey};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use url::Url;
use uuid::Uuid;

/// Type alias for boxed async streams of raw frames
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check
    ///
    /// Returns Ok(()) if healthy, Err with details if not.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

// ============================================================================
// Storage Strategies
// ============================================================================

/// Relational store holding the index and the cursor row
#[async_trait]
pub trait IndexStore: HealthCheck {
    /// Open a transaction scoped to a single event
    async fn begin(&self) -> Result<Box<dyn IndexTxn>>;

    /// Read the committed cursor outside any event transaction
    ///
    /// Fails with `CursorMissing` if the singleton row was never provisioned.
    async fn load_cursor(&self) -> Result<i64>;
}

/// One open transaction.
///
/// Nothing is visible to other readers until [`IndexTxn::commit`]. Dropping a
/// transaction without committing discards every write made through it.
#[async_trait]
pub trait IndexTxn: Send {
    /// Cursor value as seen inside this transaction
    async fn cursor(&mut self) -> Result<i64>;

    /// Overwrite the cursor row; never inserts it
    async fn set_cursor(&mut self, time_us: i64) -> Result<()>;

    async fn survey_by_record_key(&mut self, record_key: &str) -> Result<Option<Survey>>;

    async fn survey_by_uri(&mut self, uri: &str) -> Result<Option<Survey>>;

    async fn slug_exists(&mut self, slug: &str) -> Result<bool>;

    async fn insert_survey(&mut self, survey: &Survey) -> Result<()>;

    /// Overwrite mutable fields of an existing survey, keyed by id.
    /// The slug is left untouched.
    async fn update_survey(&mut self, survey: &Survey) -> Result<()>;

    /// Remove a survey together with its responses and results marker.
    /// Returns whether a row existed.
    async fn delete_survey(&mut self, id: Uuid) -> Result<bool>;

    /// Insert or replace the response for `(survey_id, voter_did)`.
    ///
    /// On replace, the stored row keeps its id and `created_at`.
    async fn upsert_response(&mut self, response: &Response) -> Result<()>;

    async fn delete_response(&mut self, voter_did: &str, record_uri: &str) -> Result<bool>;

    /// Insert or replace the results marker for a survey
    async fn upsert_results(&mut self, results: &ResultsPublication) -> Result<()>;

    async fn delete_results(&mut self, record_uri: &str) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// Transport Strategies
// ============================================================================

/// Opens the upstream feed
///
/// Implementations:
/// - `WebSocketConnector`: the Jetstream WebSocket
/// - scripted connectors in tests
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Connect to the fully built subscribe URL.
    ///
    /// The returned stream yields one item per text frame and ends when the
    /// server closes the connection.
    async fn connect(&self, url: &Url) -> Result<FrameStream>;
}
