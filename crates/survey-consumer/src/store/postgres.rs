//! Postgres index store
//!
//! Every event runs in one `sqlx` transaction. The schema is provisioned by the
//! external migration tool; `schema/schema.sql` documents what is expected,
//! including the pre-inserted cursor row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;
use survey_core::prelude::*;
use survey_core::{Answer, DatabaseConfig, Response, ResultsPublication, Survey, SurveyDefinition};
use tracing::info;
use uuid::Uuid;

/// Id of the singleton cursor row
pub const CURSOR_ROW_ID: i32 = 1;

const SURVEY_COLUMNS: &str = "id, slug, title, description, definition, author_did, record_key, \
                              uri, cid, created_at, updated_at";

/// Row shape for the `surveys` table
#[derive(Debug, Clone, FromRow)]
struct DbSurvey {
    id: Uuid,
    slug: String,
    title: String,
    description: Option<String>,
    definition: Json<SurveyDefinition>,
    author_did: String,
    record_key: String,
    uri: String,
    cid: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbSurvey> for Survey {
    fn from(row: DbSurvey) -> Self {
        Survey {
            id: row.id,
            slug: row.slug,
            title: row.title,
            description: row.description,
            definition: row.definition.0,
            author_did: row.author_did,
            record_key: row.record_key,
            uri: row.uri,
            cid: row.cid,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> IndexerError {
    move |e| IndexerError::storage_with_source(context, e)
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool. The URL is never logged since it may carry credentials.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| IndexerError::config(format!("invalid database url: {}", e)))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(storage("failed to connect to postgres"))?;

        info!(
            max_connections = config.max_connections,
            "Connected to postgres"
        );
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthCheck for PgStore {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(storage("health check query failed"))?;
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "postgres_store"
    }
}

#[async_trait]
impl IndexStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn IndexTxn>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(storage("failed to begin transaction"))?;
        Ok(Box::new(PgTxn { tx }))
    }

    async fn load_cursor(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT time_us FROM jetstream_cursor WHERE id = $1")
            .bind(CURSOR_ROW_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("failed to read cursor"))?
            .ok_or(IndexerError::CursorMissing { id: CURSOR_ROW_ID })
    }
}

/// One open Postgres transaction
pub struct PgTxn {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl IndexTxn for PgTxn {
    async fn cursor(&mut self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT time_us FROM jetstream_cursor WHERE id = $1")
            .bind(CURSOR_ROW_ID)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("failed to read cursor"))?
            .ok_or(IndexerError::CursorMissing { id: CURSOR_ROW_ID })
    }

    async fn set_cursor(&mut self, time_us: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jetstream_cursor SET time_us = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(time_us)
        .bind(CURSOR_ROW_ID)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("failed to write cursor"))?;

        if result.rows_affected() == 0 {
            return Err(IndexerError::CursorMissing { id: CURSOR_ROW_ID });
        }
        Ok(())
    }

    async fn survey_by_record_key(&mut self, record_key: &str) -> Result<Option<Survey>> {
        let query = format!("SELECT {} FROM surveys WHERE record_key = $1", SURVEY_COLUMNS);
        let row = sqlx::query_as::<_, DbSurvey>(&query)
            .bind(record_key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("failed to look up survey by record key"))?;
        Ok(row.map(Survey::from))
    }

    async fn survey_by_uri(&mut self, uri: &str) -> Result<Option<Survey>> {
        let query = format!("SELECT {} FROM surveys WHERE uri = $1", SURVEY_COLUMNS);
        let row = sqlx::query_as::<_, DbSurvey>(&query)
            .bind(uri)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("failed to look up survey by uri"))?;
        Ok(row.map(Survey::from))
    }

    async fn slug_exists(&mut self, slug: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM surveys WHERE slug = $1)")
            .bind(slug)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(storage("failed to check slug"))
    }

    async fn insert_survey(&mut self, survey: &Survey) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO surveys
                 (id, slug, title, description, definition, author_did, record_key, uri, cid,
                  created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(survey.id)
        .bind(&survey.slug)
        .bind(&survey.title)
        .bind(&survey.description)
        .bind(Json(&survey.definition))
        .bind(&survey.author_did)
        .bind(&survey.record_key)
        .bind(&survey.uri)
        .bind(&survey.cid)
        .bind(survey.created_at)
        .bind(survey.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("failed to insert survey"))?;
        Ok(())
    }

    async fn update_survey(&mut self, survey: &Survey) -> Result<()> {
        sqlx::query(
            r#"UPDATE surveys
                  SET title = $2, description = $3, definition = $4, cid = $5, updated_at = $6
                WHERE id = $1"#,
        )
        .bind(survey.id)
        .bind(&survey.title)
        .bind(&survey.description)
        .bind(Json(&survey.definition))
        .bind(&survey.cid)
        .bind(survey.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("failed to update survey"))?;
        Ok(())
    }

    async fn delete_survey(&mut self, id: Uuid) -> Result<bool> {
        sqlx::query("DELETE FROM survey_responses WHERE survey_id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(storage("failed to delete survey responses"))?;

        sqlx::query("DELETE FROM survey_results WHERE survey_id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(storage("failed to delete survey results"))?;

        let result = sqlx::query("DELETE FROM surveys WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(storage("failed to delete survey"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_response(&mut self, response: &Response) -> Result<()> {
        let answers: &BTreeMap<String, Answer> = &response.answers;
        sqlx::query(
            r#"INSERT INTO survey_responses
                 (id, survey_id, voter_did, record_uri, record_cid, survey_cid, answers, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (survey_id, voter_did) DO UPDATE
                  SET record_uri = EXCLUDED.record_uri,
                      record_cid = EXCLUDED.record_cid,
                      survey_cid = EXCLUDED.survey_cid,
                      answers = EXCLUDED.answers,
                      updated_at = EXCLUDED.updated_at"#,
        )
        .bind(response.id)
        .bind(response.survey_id)
        .bind(&response.voter_did)
        .bind(&response.record_uri)
        .bind(&response.record_cid)
        .bind(&response.survey_cid)
        .bind(Json(answers))
        .bind(response.created_at)
        .bind(response.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("failed to upsert response"))?;
        Ok(())
    }

    async fn delete_response(&mut self, voter_did: &str, record_uri: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM survey_responses WHERE voter_did = $1 AND record_uri = $2")
                .bind(voter_did)
                .bind(record_uri)
                .execute(&mut *self.tx)
                .await
                .map_err(storage("failed to delete response"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_results(&mut self, results: &ResultsPublication) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO survey_results
                 (survey_id, record_uri, record_cid, publisher_did, published_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (survey_id) DO UPDATE
                  SET record_uri = EXCLUDED.record_uri,
                      record_cid = EXCLUDED.record_cid,
                      publisher_did = EXCLUDED.publisher_did,
                      published_at = EXCLUDED.published_at"#,
        )
        .bind(results.survey_id)
        .bind(&results.record_uri)
        .bind(&results.record_cid)
        .bind(&results.publisher_did)
        .bind(results.published_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("failed to upsert results"))?;
        Ok(())
    }

    async fn delete_results(&mut self, record_uri: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM survey_results WHERE record_uri = $1")
            .bind(record_uri)
            .execute(&mut *self.tx)
            .await
            .map_err(storage("failed to delete results"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(storage("failed to commit transaction"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(storage("failed to roll back transaction"))
    }
}
