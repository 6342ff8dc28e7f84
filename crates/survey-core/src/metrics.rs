//! Metrics for the survey indexer
//!
//! Provides Prometheus-compatible metrics for observability.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Consumer metrics
    pub const CONSUMER_EVENTS_TOTAL: &str = "survey_consumer_events_total";
    pub const CONSUMER_ERRORS_TOTAL: &str = "survey_consumer_errors_total";
    pub const CONSUMER_IGNORED_TOTAL: &str = "survey_consumer_ignored_total";
    pub const CONSUMER_CURSOR: &str = "survey_consumer_cursor_time_us";
    pub const CONSUMER_APPLY_LATENCY: &str = "survey_consumer_apply_latency_seconds";

    // Connection metrics
    pub const CONNECTION_STATE: &str = "connection_state";
    pub const CONNECTION_RECONNECTS: &str = "connection_reconnects_total";
    pub const CONNECTION_BACKOFF: &str = "connection_backoff_seconds";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const COLLECTION: &str = "collection";
    pub const OPERATION: &str = "operation";
    pub const OUTCOME: &str = "outcome";
    pub const ERROR_TYPE: &str = "error_type";
    pub const REASON: &str = "reason";
    pub const CONNECTION: &str = "connection";
}

/// Consumer metrics
#[derive(Clone)]
pub struct ConsumerMetrics {
    component: String,
}

impl ConsumerMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record an event reaching a terminal outcome
    pub fn record_event(&self, collection: &str, operation: &str, outcome: &str) {
        counter!(
            names::CONSUMER_EVENTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::COLLECTION => collection.to_string(),
            labels::OPERATION => operation.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::CONSUMER_ERRORS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    /// Record a frame that was deliberately not applied
    pub fn record_ignored(&self, reason: &str) {
        counter!(
            names::CONSUMER_IGNORED_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    /// Update the committed cursor gauge
    pub fn set_cursor(&self, time_us: i64) {
        gauge!(
            names::CONSUMER_CURSOR,
            labels::COMPONENT => self.component.clone(),
        )
        .set(time_us as f64);
    }

    /// Record per-event transaction latency
    pub fn record_apply_latency(&self, duration: Duration) {
        histogram!(
            names::CONSUMER_APPLY_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Connection metrics
#[derive(Clone)]
pub struct ConnectionMetrics {
    connection_name: String,
}

impl ConnectionMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            connection_name: name.into(),
        }
    }

    /// Set connection state (1 = connected, 0 = disconnected)
    pub fn set_connected(&self, connected: bool) {
        gauge!(
            names::CONNECTION_STATE,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .set(if connected { 1.0 } else { 0.0 });
    }

    /// Record reconnection
    pub fn record_reconnect(&self) {
        counter!(
            names::CONNECTION_RECONNECTS,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .increment(1);
    }

    /// Record the wait chosen before the next attempt
    pub fn record_backoff(&self, delay: Duration) {
        histogram!(
            names::CONNECTION_BACKOFF,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .record(delay.as_secs_f64());
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
