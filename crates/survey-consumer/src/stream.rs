//! Stream client
//!
//! Owns the connection to the firehose:
//!
//! ```text
//! Disconnected ──► Connecting ──► Streaming
//!      ▲                │             │
//!      └────── error ───┴─────────────┘
//!
//! any state ── cancel ──► Stopped
//! ```
//!
//! Frames are handed to the processor one at a time; the next frame is not
//! read until the previous one has committed or failed. Every connection
//! resumes from the last committed cursor.

use crate::backoff::Backoff;
use crate::processor::Processor;
use crate::ConsumerStats;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use survey_core::metrics::ConnectionMetrics;
use survey_core::prelude::*;
use survey_core::strategy::FrameStream;
use survey_core::{JetstreamConfig, ReconnectConfig};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    /// Terminal; reached only through cancellation or a fatal error
    Stopped,
}

impl ConnectionState {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        }
    }
}

/// How a streaming session ended without error
enum SessionEnd {
    Cancelled,
    Closed,
}

/// Build the subscribe URL.
///
/// Each collection becomes its own `wantedCollections` parameter. `cursor` is
/// only sent when positive; without it the feed starts at the live edge.
pub fn subscribe_url(endpoint: &str, wanted_collections: &[String], cursor: i64) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| IndexerError::config(format!("invalid jetstream endpoint: {}", e)))?;

    {
        let mut query = url.query_pairs_mut();
        for collection in wanted_collections {
            query.append_pair("wantedCollections", collection);
        }
        if cursor > 0 {
            query.append_pair("cursor", &cursor.to_string());
        }
    }

    Ok(url)
}

/// Reconnecting firehose client
pub struct StreamClient {
    config: JetstreamConfig,
    reconnect: ReconnectConfig,
    connector: Arc<dyn FeedConnector>,
    processor: Arc<Processor>,
    stats: Arc<ConsumerStats>,
    metrics: ConnectionMetrics,
    state: watch::Sender<ConnectionState>,
}

impl StreamClient {
    pub fn new(
        config: JetstreamConfig,
        reconnect: ReconnectConfig,
        connector: Arc<dyn FeedConnector>,
        processor: Arc<Processor>,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            reconnect,
            connector,
            processor,
            stats,
            metrics: ConnectionMetrics::new("jetstream"),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = previous.as_label(), to = state.as_label(), "Connection state");
        }
        let connected = state == ConnectionState::Streaming;
        self.stats.connected.store(connected, Ordering::Relaxed);
        self.metrics.set_connected(connected);
    }

    /// Run until cancelled.
    ///
    /// Transient failures never escape; they lead to a reconnect. Only fatal
    /// errors (missing cursor row, bad configuration) are returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(&self.reconnect);

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let cursor = self.processor.cursor().last_committed();
            let url = match subscribe_url(
                &self.config.endpoint,
                &self.config.wanted_collections,
                cursor,
            ) {
                Ok(url) => url,
                Err(e) => break Err(e),
            };
            info!(url = %url, cursor, "Connecting to jetstream");

            let connect = self.connector.connect(&url);
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                connected = tokio::time::timeout(self.config.connect_timeout, connect) => connected,
            };

            let failure = match connected {
                Ok(Ok(stream)) => {
                    self.set_state(ConnectionState::Streaming);
                    info!(cursor, "Streaming");

                    let started = Instant::now();
                    let session = self.stream_frames(stream, &cancel).await;
                    if started.elapsed() >= self.reconnect.reset_after {
                        backoff.reset();
                    }

                    match session {
                        Ok(SessionEnd::Cancelled) => break Ok(()),
                        Ok(SessionEnd::Closed) => {
                            IndexerError::transport("server closed the stream")
                        }
                        Err(e) if e.is_fatal() => break Err(e),
                        Err(e) => e,
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => IndexerError::timeout(
                    "connect",
                    self.config.connect_timeout.as_millis() as u64,
                ),
            };

            self.set_state(ConnectionState::Disconnected);
            let delay = backoff.next_delay();
            warn!(
                error = %failure,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Disconnected from jetstream; backing off"
            );
            self.metrics.record_backoff(delay);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            self.metrics.record_reconnect();
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        };

        self.set_state(ConnectionState::Stopped);
        match &result {
            Ok(()) => info!(
                cursor = self.processor.cursor().last_committed(),
                "Stream client stopped"
            ),
            Err(e) => error!(error = %e, "Stream client stopped on fatal error"),
        }
        result
    }

    /// Read and process frames until the stream ends, fails, idles out, or
    /// the token is cancelled. A frame already being processed is finished
    /// before cancellation is observed.
    async fn stream_frames(
        &self,
        mut stream: FrameStream,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        let idle = self.config.idle_timeout;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            match next {
                Err(_) => return Err(IndexerError::timeout("read", idle.as_millis() as u64)),
                Ok(None) => return Ok(SessionEnd::Closed),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(bytes))) => {
                    self.processor.handle_frame(&bytes).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Tail {
        Close,
        Idle,
        CloseAfter(Duration),
    }

    enum Step {
        Refuse,
        Hang,
        Serve(Vec<Vec<u8>>, Tail),
        /// Cancel the run and refuse; used to end a script
        Finish,
    }

    struct ScriptedConnector {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(Instant, Url)>>,
        cancel: CancellationToken,
    }

    impl ScriptedConnector {
        fn new(steps: Vec<Step>, cancel: &CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
                cancel: cancel.clone(),
            })
        }

        fn calls(&self) -> Vec<(Instant, Url)> {
            self.calls.lock().unwrap().clone()
        }

        /// Seconds between consecutive connect attempts
        fn gaps(&self) -> Vec<u64> {
            self.calls()
                .windows(2)
                .map(|w| (w[1].0 - w[0].0).as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl FeedConnector for ScriptedConnector {
        async fn connect(&self, url: &Url) -> Result<FrameStream> {
            self.calls.lock().unwrap().push((Instant::now(), url.clone()));
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Finish);

            match step {
                Step::Refuse => Err(IndexerError::transport("connection refused")),
                Step::Hang => futures::future::pending().await,
                Step::Finish => {
                    self.cancel.cancel();
                    Err(IndexerError::transport("script finished"))
                }
                Step::Serve(frames, tail) => {
                    let head = futures::stream::iter(
                        frames.into_iter().map(|f| Ok(Bytes::from(f))),
                    );
                    let tail: FrameStream = match tail {
                        Tail::Close => Box::pin(futures::stream::empty()),
                        Tail::Idle => Box::pin(futures::stream::pending()),
                        Tail::CloseAfter(after) => Box::pin(
                            futures::stream::once(tokio::time::sleep(after))
                                .filter_map(|()| async { None::<Result<Bytes>> }),
                        ),
                    };
                    Ok(Box::pin(head.chain(tail)))
                }
            }
        }
    }

    fn survey_frame(seq: i64, rkey: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "did": "did:plc:owner",
            "time_us": seq,
            "kind": "commit",
            "commit": {
                "operation": "create",
                "collection": "net.openmeet.survey",
                "rkey": rkey,
                "record": {
                    "name": format!("Survey {}", rkey),
                    "questions": [{"id": "q1", "text": "Why?", "type": "text"}]
                }
            }
        }))
        .unwrap()
    }

    fn cursor_param(url: &Url) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == "cursor")
            .map(|(_, v)| v.into_owned())
    }

    struct Harness {
        store: MemoryStore,
        client: StreamClient,
    }

    async fn harness(
        store: MemoryStore,
        connector: Arc<ScriptedConnector>,
        config: JetstreamConfig,
    ) -> Harness {
        let stats = Arc::new(ConsumerStats::default());
        let processor = Arc::new(Processor::new(Arc::new(store.clone()), Arc::clone(&stats)));
        let _ = processor.load_cursor().await;
        let client = StreamClient::new(
            config,
            ReconnectConfig::default(),
            connector,
            processor,
            stats,
        );
        Harness { store, client }
    }

    #[test]
    fn test_subscribe_url_repeats_collections() {
        let wanted = JetstreamConfig::default().wanted_collections;

        let url = subscribe_url("wss://jetstream.example/subscribe", &wanted, 0).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("wantedCollections".into(), "net.openmeet.survey".into()),
                ("wantedCollections".into(), "net.openmeet.survey.response".into()),
                ("wantedCollections".into(), "net.openmeet.survey.results".into()),
            ]
        );
        assert!(cursor_param(&url).is_none());

        let url =
            subscribe_url("wss://jetstream.example/subscribe", &wanted, 1_725_911_162_329_308)
                .unwrap();
        assert_eq!(cursor_param(&url).as_deref(), Some("1725911162329308"));
    }

    #[test]
    fn test_subscribe_url_rejects_bad_endpoint() {
        let err = subscribe_url("not a url", &[], 0).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_on_repeated_failures() {
        let cancel = CancellationToken::new();
        let steps = (0..8).map(|_| Step::Refuse).collect();
        let connector = ScriptedConnector::new(steps, &cancel);
        let h = harness(MemoryStore::new(), connector.clone(), JetstreamConfig::default()).await;

        h.client.run(cancel).await.unwrap();

        assert_eq!(connector.gaps(), vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(h.client.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_streaming_resets_backoff() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(
            vec![
                Step::Refuse,
                Step::Refuse,
                Step::Serve(vec![], Tail::CloseAfter(Duration::from_secs(40))),
                Step::Refuse,
            ],
            &cancel,
        );
        let h = harness(MemoryStore::new(), connector.clone(), JetstreamConfig::default()).await;

        h.client.run(cancel).await.unwrap();

        // 1s, 2s, 40s of streaming then 1s again, then 2s
        assert_eq!(connector.gaps(), vec![1, 2, 41, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_session_does_not_reset_backoff() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(
            vec![
                Step::Refuse,
                Step::Serve(vec![], Tail::CloseAfter(Duration::from_secs(5))),
            ],
            &cancel,
        );
        let h = harness(MemoryStore::new(), connector.clone(), JetstreamConfig::default()).await;

        h.client.run(cancel).await.unwrap();

        assert_eq!(connector.gaps(), vec![1, 5 + 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_from_committed_cursor() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(
            vec![Step::Serve(
                vec![survey_frame(100, "a"), survey_frame(101, "b")],
                Tail::Close,
            )],
            &cancel,
        );
        let h = harness(MemoryStore::new(), connector.clone(), JetstreamConfig::default()).await;

        h.client.run(cancel).await.unwrap();

        let calls = connector.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(cursor_param(&calls[0].1), None);
        assert_eq!(cursor_param(&calls[1].1).as_deref(), Some("101"));
        assert_eq!(h.store.snapshot().await.surveys.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_uses_stored_cursor() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(vec![], &cancel);
        let h = harness(
            MemoryStore::with_cursor(5_000),
            connector.clone(),
            JetstreamConfig::default(),
        )
        .await;

        h.client.run(cancel).await.unwrap();

        assert_eq!(cursor_param(&connector.calls()[0].1).as_deref(), Some("5000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_replays_event() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(
            vec![
                Step::Serve(vec![survey_frame(100, "a")], Tail::Idle),
                Step::Serve(vec![survey_frame(100, "a")], Tail::Close),
            ],
            &cancel,
        );
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        let h = harness(store, connector.clone(), JetstreamConfig::default()).await;

        h.client.run(cancel).await.unwrap();

        let calls = connector.calls();
        assert_eq!(calls.len(), 3);
        // nothing committed on the first attempt, so no resume point yet
        assert_eq!(cursor_param(&calls[1].1), None);
        assert_eq!(cursor_param(&calls[2].1).as_deref(), Some("100"));

        let state = h.store.snapshot().await;
        assert_eq!(state.surveys.len(), 1);
        assert_eq!(state.cursor, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_times_out() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(
            vec![Step::Serve(vec![], Tail::Idle)],
            &cancel,
        );
        let config = JetstreamConfig {
            idle_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let h = harness(MemoryStore::new(), connector.clone(), config).await;

        h.client.run(cancel).await.unwrap();

        assert_eq!(connector.gaps(), vec![10 + 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(vec![Step::Hang], &cancel);
        let h = harness(MemoryStore::new(), connector.clone(), JetstreamConfig::default()).await;

        h.client.run(cancel).await.unwrap();

        assert_eq!(connector.gaps(), vec![10 + 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_streaming() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(
            vec![Step::Serve(vec![survey_frame(100, "a")], Tail::Idle)],
            &cancel,
        );
        let h = harness(MemoryStore::new(), connector.clone(), JetstreamConfig::default()).await;

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let started = Instant::now();
        h.client.run(cancel).await.unwrap();

        assert_eq!(started.elapsed().as_secs(), 5);
        assert_eq!(connector.calls().len(), 1);
        assert_eq!(h.client.state(), ConnectionState::Stopped);
        assert_eq!(h.store.snapshot().await.cursor, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(vec![], &cancel);
        let h = harness(MemoryStore::new(), connector.clone(), JetstreamConfig::default()).await;

        let started = Instant::now();
        h.client.run(cancel).await.unwrap();

        // the connector cancels on its first call; the backoff sleep must not run
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(connector.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_cursor_row_stops_client() {
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(
            vec![Step::Serve(vec![survey_frame(100, "a")], Tail::Idle)],
            &cancel,
        );
        let h = harness(
            MemoryStore::unprovisioned(),
            connector.clone(),
            JetstreamConfig::default(),
        )
        .await;

        let err = h.client.run(cancel).await.unwrap_err();
        assert!(matches!(err, IndexerError::CursorMissing { .. }));
        assert_eq!(h.client.state(), ConnectionState::Stopped);
        assert_eq!(connector.calls().len(), 1);
    }
}
