//! # Survey Consumer
//!
//! Indexes surveys, responses, and results markers from the Jetstream
//! firehose into Postgres.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = Arc::new(PgStore::connect(&config.database).await?);
//! let consumer = Consumer::new(&config, store, Arc::new(WebSocketConnector::new()));
//!
//! let cancel = CancellationToken::new();
//! consumer.run(cancel.child_token()).await?;
//! ```

pub mod admin_api;
pub mod backoff;
pub mod cursor;
pub mod processor;
pub mod store;
pub mod stream;
pub mod websocket;

pub use admin_api::{run_admin_server, AdminState};
pub use backoff::Backoff;
pub use cursor::CursorStore;
pub use processor::{IgnoreReason, Outcome, Processor};
pub use store::{MemoryStore, PgStore};
pub use stream::{subscribe_url, ConnectionState, StreamClient};
pub use websocket::WebSocketConnector;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use survey_core::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide counters, shared read-only with the admin endpoint
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub frames_received: AtomicU64,
    pub events_applied: AtomicU64,
    pub events_rejected: AtomicU64,
    pub frames_ignored: AtomicU64,
    pub transient_errors: AtomicU64,
    pub reconnects: AtomicU64,
    /// Last committed cursor
    pub cursor: AtomicI64,
    pub connected: AtomicBool,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub events_applied: u64,
    pub events_rejected: u64,
    pub frames_ignored: u64,
    pub transient_errors: u64,
    pub reconnects: u64,
    pub cursor: i64,
    pub connected: bool,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            cursor: self.cursor.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }
}

/// Supervisor: the unit bootstrap code starts and stops
pub struct Consumer {
    client: StreamClient,
    processor: Arc<Processor>,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    pub fn new(
        config: &IndexerConfig,
        store: Arc<dyn IndexStore>,
        connector: Arc<dyn FeedConnector>,
    ) -> Self {
        let stats = Arc::new(ConsumerStats::default());
        let processor = Arc::new(Processor::new(store, Arc::clone(&stats)));
        let client = StreamClient::new(
            config.jetstream.clone(),
            config.reconnect.clone(),
            connector,
            Arc::clone(&processor),
            Arc::clone(&stats),
        );

        Self {
            client,
            processor,
            stats,
        }
    }

    /// Run until `cancel` fires or a fatal error occurs.
    ///
    /// Fails before connecting if the cursor row is missing.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let cursor = self.processor.load_cursor().await?;
        info!(cursor, "Starting survey consumer");

        self.client.run(cancel).await?;

        let stats = self.stats.snapshot();
        info!(
            applied = stats.events_applied,
            rejected = stats.events_rejected,
            ignored = stats.frames_ignored,
            cursor = stats.cursor,
            "Survey consumer stopped"
        );
        Ok(())
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use survey_core::strategy::FrameStream;
    use url::Url;

    /// Serves the given frames once, then cancels the run on reconnect
    struct OnceConnector {
        frames: Vec<Vec<u8>>,
        calls: AtomicUsize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl FeedConnector for OnceConnector {
        async fn connect(&self, _url: &Url) -> Result<FrameStream> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                self.cancel.cancel();
                return Err(IndexerError::transport("done"));
            }
            let frames: Vec<Result<Bytes>> = self
                .frames
                .iter()
                .map(|f| Ok(Bytes::from(f.clone())))
                .collect();
            Ok(Box::pin(futures::stream::iter(frames)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_indexes_stream() {
        let cancel = CancellationToken::new();
        let survey = json!({
            "did": "did:plc:owner",
            "time_us": 100,
            "kind": "commit",
            "commit": {
                "operation": "create",
                "collection": "net.openmeet.survey",
                "rkey": "coffee1",
                "record": {
                    "name": "Coffee",
                    "questions": [{"id": "q1", "text": "Like coffee?", "type": "ns#single",
                                   "options": [{"id": "y", "text": "Yes"}]}]
                }
            }
        });
        let account = json!({"did": "did:plc:owner", "time_us": 101, "kind": "account"});
        let connector = Arc::new(OnceConnector {
            frames: vec![
                serde_json::to_vec(&survey).unwrap(),
                serde_json::to_vec(&account).unwrap(),
            ],
            calls: AtomicUsize::new(0),
            cancel: cancel.clone(),
        });

        let store = MemoryStore::new();
        let consumer = Consumer::new(
            &IndexerConfig::default(),
            Arc::new(store.clone()),
            connector,
        );
        consumer.run(cancel).await.unwrap();

        let state = store.snapshot().await;
        assert!(state.survey_by_slug("coffee").is_some());
        assert_eq!(state.cursor, Some(100));

        let stats = consumer.stats().snapshot();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.events_applied, 1);
        assert_eq!(stats.frames_ignored, 1);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(consumer.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_consumer_refuses_to_start_without_cursor_row() {
        let cancel = CancellationToken::new();
        let connector = Arc::new(OnceConnector {
            frames: vec![],
            calls: AtomicUsize::new(0),
            cancel: cancel.clone(),
        });
        let consumer = Consumer::new(
            &IndexerConfig::default(),
            Arc::new(MemoryStore::unprovisioned()),
            connector.clone(),
        );

        let err = consumer.run(cancel).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }
}
