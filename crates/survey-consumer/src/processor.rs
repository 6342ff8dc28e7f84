//! Message processor
//!
//! Turns one frame into one committed transaction. For every event that
//! reaches a terminal outcome the data change and the cursor advance commit
//! together:
//!
//! - applied: data writes + cursor advance
//! - rejected (decode, authorization, unresolved subject): cursor advance only
//! - stale (behind the stored cursor): nothing commits
//! - transient failure: nothing commits, the error is returned and the event
//!   is replayed after the next reconnect

use crate::cursor::CursorStore;
use crate::ConsumerStats;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use survey_core::metrics::{ConsumerMetrics, LatencyTimer};
use survey_core::prelude::*;
use survey_core::slug;
use survey_core::{
    ErrorContext, ErrorContextExt, ResponseRecord, Response, ResultsPublication, ResultsRecord,
    Survey, SurveyRecord,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a frame was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Identity/account frames; no cursor write
    NonCommit,
    /// Commit for a collection we do not index; cursor advances
    UnknownCollection,
    /// Not parseable at all; there is no sequence to advance to
    Unparseable,
    /// Sequence below the stored cursor; a newer state is already committed
    Stale,
}

impl IgnoreReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::NonCommit => "non_commit",
            Self::UnknownCollection => "unknown_collection",
            Self::Unparseable => "unparseable",
            Self::Stale => "stale",
        }
    }
}

/// Terminal result of handling one frame
#[derive(Debug)]
pub enum Outcome {
    /// Data change and cursor advance committed
    Applied,
    /// Permanently invalid; skipped with the cursor advanced past it
    Rejected(IndexerError),
    Ignored(IgnoreReason),
}

impl Outcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Rejected(_) => "rejected",
            Self::Ignored(_) => "ignored",
        }
    }
}

/// Applies decoded events to the index
pub struct Processor {
    store: Arc<dyn IndexStore>,
    cursor: CursorStore,
    stats: Arc<ConsumerStats>,
    metrics: ConsumerMetrics,
}

impl Processor {
    pub fn new(store: Arc<dyn IndexStore>, stats: Arc<ConsumerStats>) -> Self {
        Self {
            cursor: CursorStore::new(Arc::clone(&store)),
            store,
            stats,
            metrics: ConsumerMetrics::new("survey_consumer"),
        }
    }

    pub fn cursor(&self) -> &CursorStore {
        &self.cursor
    }

    /// Load the committed cursor; fatal if the row is missing
    pub async fn load_cursor(&self) -> Result<i64> {
        let time_us = self.cursor.get().await?;
        self.publish_cursor(time_us);
        Ok(time_us)
    }

    /// Handle one raw frame from the feed.
    ///
    /// `Err` means a transient failure: nothing was committed and the caller
    /// must reconnect from the last committed cursor.
    pub async fn handle_frame(&self, bytes: &[u8]) -> Result<Outcome> {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "Dropping unparseable frame");
                return Ok(self.ignored(IgnoreReason::Unparseable));
            }
        };

        match frame.classify() {
            Ok(Envelope::Commit(event)) => self.apply(&event).await,
            Ok(Envelope::NonCommit { sequence, kind }) => {
                debug!(sequence, kind = %kind, "Ignoring non-commit frame");
                Ok(self.ignored(IgnoreReason::NonCommit))
            }
            Ok(Envelope::UnknownCollection {
                sequence,
                collection,
            }) => {
                debug!(sequence, collection = %collection, "Ignoring unknown collection");
                self.advance_only(sequence).await?;
                Ok(self.ignored(IgnoreReason::UnknownCollection))
            }
            Err(rejected) => {
                let collection = rejected.collection.as_ref().map_or("unknown", Collection::as_label);
                let operation = rejected.operation.as_ref().map_or("unknown", Operation::as_str);
                warn!(
                    sequence = rejected.sequence,
                    collection,
                    operation,
                    rkey = rejected.record_key.as_deref().unwrap_or("-"),
                    error = %rejected.error,
                    "Skipping malformed commit"
                );
                self.advance_only(rejected.sequence).await?;
                let error = IndexerError::Decode(rejected.error);
                self.metrics.record_error(error.kind());
                self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
                let outcome = Outcome::Rejected(error);
                self.metrics
                    .record_event(collection, operation, outcome.as_label());
                Ok(outcome)
            }
        }
    }

    /// Apply one event and advance the cursor in the same transaction
    pub async fn apply(&self, event: &StreamEvent) -> Result<Outcome> {
        let metrics = self.metrics.clone();
        let _timer = LatencyTimer::start(move |d| metrics.record_apply_latency(d));

        let ctx = ErrorContext {
            component: "processor",
            operation: event.operation.to_string(),
            collection: Some(event.collection.nsid().to_string()),
            record_key: Some(event.record_key.clone()),
            sequence: Some(event.sequence),
        };

        let result: Result<Outcome> = match self.try_apply(event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_permanent() => {
                warn!(
                    collection = %event.collection,
                    rkey = %event.record_key,
                    repo = %event.repository,
                    sequence = event.sequence,
                    error = %e,
                    "Rejecting event"
                );
                self.metrics.record_error(e.kind());
                self.advance_only(event.sequence)
                    .await
                    .map(|()| Outcome::Rejected(e))
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
            self.stats.transient_errors.fetch_add(1, Ordering::Relaxed);
        }
        let outcome = result.with_context(ctx)?;

        match outcome {
            Outcome::Applied => self.stats.events_applied.fetch_add(1, Ordering::Relaxed),
            Outcome::Rejected(_) => self.stats.events_rejected.fetch_add(1, Ordering::Relaxed),
            Outcome::Ignored(_) => return Ok(outcome),
        };
        self.metrics.record_event(
            event.collection.as_label(),
            event.operation.as_str(),
            outcome.as_label(),
        );
        Ok(outcome)
    }

    /// Data writes plus cursor advance in one transaction. On any error the
    /// transaction is rolled back before returning.
    ///
    /// Events below the stored cursor are skipped without writing; an event
    /// at the cursor is applied again.
    async fn try_apply(&self, event: &StreamEvent) -> Result<Outcome> {
        let mut txn = self.store.begin().await?;

        let current = match txn.cursor().await {
            Ok(current) => current,
            Err(e) => {
                abandon(txn).await;
                return Err(e);
            }
        };
        if event.sequence < current {
            abandon(txn).await;
            debug!(
                cursor = current,
                sequence = event.sequence,
                uri = %event.uri(),
                "Skipping event behind cursor"
            );
            return Ok(self.ignored(IgnoreReason::Stale));
        }

        let written = match self.write_event(txn.as_mut(), event).await {
            Ok(()) => self.cursor.advance(txn.as_mut(), event.sequence).await,
            Err(e) => Err(e),
        };

        match written {
            Ok(time_us) => {
                txn.commit().await?;
                self.committed(time_us);
                Ok(Outcome::Applied)
            }
            Err(e) => {
                abandon(txn).await;
                Err(e)
            }
        }
    }

    /// Cursor-only transaction for frames that carry no applicable change
    async fn advance_only(&self, sequence: i64) -> Result<()> {
        let mut txn = self.store.begin().await?;
        match self.cursor.advance(txn.as_mut(), sequence).await {
            Ok(time_us) => {
                txn.commit().await?;
                self.committed(time_us);
                Ok(())
            }
            Err(e) => {
                abandon(txn).await;
                Err(e)
            }
        }
    }

    async fn write_event(&self, txn: &mut dyn IndexTxn, event: &StreamEvent) -> Result<()> {
        match decode_event(event)? {
            EventBody::SurveyCreate(record) | EventBody::SurveyUpdate(record) => {
                self.upsert_survey(txn, event, record).await
            }
            EventBody::SurveyDelete => self.delete_survey(txn, event).await,
            EventBody::ResponseCreate(record) | EventBody::ResponseUpdate(record) => {
                self.upsert_response(txn, event, record).await
            }
            EventBody::ResponseDelete => {
                let removed = txn
                    .delete_response(&event.repository, &event.uri())
                    .await?;
                debug!(uri = %event.uri(), removed, "Response delete");
                Ok(())
            }
            EventBody::ResultsCreate(record) | EventBody::ResultsUpdate(record) => {
                self.upsert_results(txn, event, record).await
            }
            EventBody::ResultsDelete => {
                let removed = txn.delete_results(&event.uri()).await?;
                debug!(uri = %event.uri(), removed, "Results delete");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Surveys
    // ========================================================================

    async fn upsert_survey(
        &self,
        txn: &mut dyn IndexTxn,
        event: &StreamEvent,
        record: SurveyRecord,
    ) -> Result<()> {
        let now = Utc::now();

        let Some(existing) = txn.survey_by_record_key(&event.record_key).await? else {
            let slug = unique_slug(txn, &record.title).await?;
            let survey = Survey {
                id: Uuid::now_v7(),
                slug,
                title: record.title,
                description: record.description,
                definition: record.definition,
                author_did: event.repository.clone(),
                record_key: event.record_key.clone(),
                uri: event.uri(),
                cid: event.cid.clone(),
                created_at: now,
                updated_at: now,
            };
            txn.insert_survey(&survey).await?;
            info!(
                slug = %survey.slug,
                uri = %survey.uri,
                sequence = event.sequence,
                "Indexed survey"
            );
            return Ok(());
        };

        ensure_owner(&existing, event)?;

        let unchanged = existing.title == record.title
            && existing.description == record.description
            && existing.definition == record.definition
            && existing.cid == event.cid;
        if unchanged {
            debug!(uri = %existing.uri, "Survey unchanged");
            return Ok(());
        }

        let updated = Survey {
            title: record.title,
            description: record.description,
            definition: record.definition,
            cid: event.cid.clone(),
            updated_at: now,
            ..existing
        };
        txn.update_survey(&updated).await?;
        info!(slug = %updated.slug, uri = %updated.uri, "Updated survey");
        Ok(())
    }

    async fn delete_survey(&self, txn: &mut dyn IndexTxn, event: &StreamEvent) -> Result<()> {
        match txn.survey_by_record_key(&event.record_key).await? {
            Some(existing) => {
                ensure_owner(&existing, event)?;
                txn.delete_survey(existing.id).await?;
                info!(slug = %existing.slug, uri = %existing.uri, "Deleted survey");
            }
            None => debug!(rkey = %event.record_key, "Survey already absent"),
        }
        Ok(())
    }

    // ========================================================================
    // Responses and results
    // ========================================================================

    async fn upsert_response(
        &self,
        txn: &mut dyn IndexTxn,
        event: &StreamEvent,
        record: ResponseRecord,
    ) -> Result<()> {
        let survey = resolve_subject(txn, &record.survey_uri).await?;
        let now = Utc::now();

        // voter comes from the envelope, never from the record body
        let response = Response {
            id: Uuid::now_v7(),
            survey_id: survey.id,
            voter_did: event.repository.clone(),
            record_uri: event.uri(),
            record_cid: event.cid.clone(),
            survey_cid: record.survey_cid,
            answers: record.answers,
            created_at: now,
            updated_at: now,
        };
        txn.upsert_response(&response).await?;
        debug!(survey = %survey.slug, voter = %response.voter_did, "Recorded response");
        Ok(())
    }

    async fn upsert_results(
        &self,
        txn: &mut dyn IndexTxn,
        event: &StreamEvent,
        record: ResultsRecord,
    ) -> Result<()> {
        let survey = resolve_subject(txn, &record.survey_uri).await?;
        ensure_owner(&survey, event)?;

        let results = ResultsPublication {
            survey_id: survey.id,
            record_uri: event.uri(),
            record_cid: event.cid.clone(),
            publisher_did: event.repository.clone(),
            published_at: Utc::now(),
        };
        txn.upsert_results(&results).await?;
        info!(survey = %survey.slug, "Results published");
        Ok(())
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    fn committed(&self, time_us: i64) {
        self.cursor.mark_committed(time_us);
        self.publish_cursor(self.cursor.last_committed());
    }

    fn publish_cursor(&self, time_us: i64) {
        self.stats.cursor.store(time_us, Ordering::Relaxed);
        self.metrics.set_cursor(time_us);
    }

    fn ignored(&self, reason: IgnoreReason) -> Outcome {
        self.metrics.record_ignored(reason.as_label());
        self.stats.frames_ignored.fetch_add(1, Ordering::Relaxed);
        Outcome::Ignored(reason)
    }
}

fn ensure_owner(survey: &Survey, event: &StreamEvent) -> Result<()> {
    if survey.author_did != event.repository {
        return Err(IndexerError::unauthorized(
            &event.repository,
            &survey.author_did,
            &survey.uri,
        ));
    }
    Ok(())
}

async fn resolve_subject(txn: &mut dyn IndexTxn, uri: &str) -> Result<Survey> {
    txn.survey_by_uri(uri)
        .await?
        .ok_or_else(|| IndexerError::SurveyNotFound {
            uri: uri.to_string(),
        })
}

/// First free slug among `base`, `base-2`, `base-3`, ... inside the transaction
async fn unique_slug(txn: &mut dyn IndexTxn, title: &str) -> Result<String> {
    let base = slug::slugify(title);
    let mut attempt = 1;
    loop {
        let candidate = slug::candidate(&base, attempt);
        if !txn.slug_exists(&candidate).await? {
            return Ok(candidate);
        }
        attempt += 1;
    }
}

async fn abandon(txn: Box<dyn IndexTxn>) {
    if let Err(e) = txn.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}
