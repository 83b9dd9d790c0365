use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use interfaces::{
    Analysis, Article, ArticleDraft, ArticleFilter, FetchLog, FetchLogStatus, InsertOutcome, SourceConfig, SourceKind,
    SourceSettings, Store, StoreError, StoreResult, Summary,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        fetch_interval_hours INTEGER NOT NULL,
        last_fetched TIMESTAMPTZ,
        total_emails_processed BIGINT NOT NULL DEFAULT 0,
        settings JSONB NOT NULL,
        site_url TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "ALTER TABLE sources ADD COLUMN IF NOT EXISTS site_url TEXT",
    "CREATE UNIQUE INDEX IF NOT EXISTS sources_site_url_idx ON sources (site_url)",
    r#"
    CREATE TABLE IF NOT EXISTS fetch_logs (
        seq BIGSERIAL,
        id UUID PRIMARY KEY,
        source_id UUID NOT NULL REFERENCES sources (id) ON DELETE CASCADE,
        fetched_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        items_found INTEGER NOT NULL,
        articles_saved INTEGER NOT NULL,
        duplicates INTEGER NOT NULL,
        error_message TEXT,
        processing_ms BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS fetch_logs_source_idx ON fetch_logs (source_id, fetched_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        seq BIGSERIAL,
        id UUID PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        body TEXT NOT NULL,
        source_kind TEXT NOT NULL,
        source_id UUID,
        source_name TEXT NOT NULL,
        url TEXT UNIQUE,
        published_at TIMESTAMPTZ NOT NULL,
        language TEXT NOT NULL,
        category TEXT NOT NULL,
        tags TEXT[] NOT NULL DEFAULT '{}',
        fingerprint TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS articles_published_idx ON articles (published_at DESC, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS summaries (
        id UUID PRIMARY KEY,
        article_id UUID NOT NULL REFERENCES articles (id) ON DELETE CASCADE,
        language TEXT NOT NULL,
        summary TEXT NOT NULL,
        key_points TEXT[] NOT NULL DEFAULT '{}',
        llm_model TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (article_id, language)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analyses (
        id UUID PRIMARY KEY,
        article_id UUID NOT NULL UNIQUE REFERENCES articles (id) ON DELETE CASCADE,
        vocabulary JSONB NOT NULL,
        context TEXT NOT NULL,
        impact TEXT NOT NULL,
        title_candidates TEXT[] NOT NULL DEFAULT '{}',
        llm_model TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const ARTICLE_COLUMNS: &str = "id, title, description, body, source_kind, source_id, source_name, url, \
     published_at, language, category, tags, fingerprint, created_at";

const SOURCE_COLUMNS: &str =
    "id, name, enabled, fetch_interval_hours, last_fetched, total_emails_processed, settings, created_at, updated_at";

const SUMMARY_COLUMNS: &str = "id, article_id, language, summary, key_points, llm_model, created_at";

const FETCH_LOG_COLUMNS: &str =
    "id, source_id, fetched_at, status, items_found, articles_saved, duplicates, error_message, processing_ms";

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Source writes can only violate the site URL index.
fn source_write_error(e: sqlx::Error, source: &SourceConfig) -> StoreError {
    let unique_violation = e.as_database_error().is_some_and(|d| d.is_unique_violation());
    match source.site_url_key() {
        Some(url) if unique_violation => StoreError::DuplicateSource { url },
        _ => db(e),
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Postgres persistence. Uniqueness is enforced by table constraints and
/// `ON CONFLICT DO NOTHING`, so concurrent inserts of one article resolve
/// to a single row.
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_pool(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn setup_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    fn article_from_row(row: &PgRow) -> StoreResult<Article> {
        let id: Uuid = row.try_get("id").map_err(db)?;
        let kind: String = row.try_get("source_kind").map_err(db)?;
        let source_kind = SourceKind::from_str(&kind).map_err(|e| StoreError::Corrupt {
            id,
            reason: e.to_string(),
        })?;
        Ok(Article {
            id,
            title: row.try_get("title").map_err(db)?,
            description: row.try_get("description").map_err(db)?,
            body: row.try_get("body").map_err(db)?,
            source_kind,
            source_id: row.try_get("source_id").map_err(db)?,
            source_name: row.try_get("source_name").map_err(db)?,
            url: row.try_get("url").map_err(db)?,
            published_at: row.try_get("published_at").map_err(db)?,
            language: row.try_get("language").map_err(db)?,
            category: row.try_get("category").map_err(db)?,
            tags: row.try_get("tags").map_err(db)?,
            fingerprint: row.try_get("fingerprint").map_err(db)?,
            created_at: row.try_get("created_at").map_err(db)?,
        })
    }

    fn source_from_row(row: &PgRow) -> StoreResult<SourceConfig> {
        let id: Uuid = row.try_get("id").map_err(db)?;
        let Json(mut settings): Json<SourceSettings> = row.try_get("settings").map_err(db)?;
        let emails: i64 = row.try_get("total_emails_processed").map_err(db)?;
        if let SourceSettings::Mailbox(mailbox) = &mut settings {
            mailbox.total_emails_processed = emails.max(0) as u64;
        }
        let interval: i32 = row.try_get("fetch_interval_hours").map_err(db)?;
        Ok(SourceConfig {
            id,
            name: row.try_get("name").map_err(db)?,
            enabled: row.try_get("enabled").map_err(db)?,
            fetch_interval_hours: u32::try_from(interval).map_err(|e| StoreError::Corrupt {
                id,
                reason: format!("fetch_interval_hours: {e}"),
            })?,
            last_fetched: row.try_get("last_fetched").map_err(db)?,
            created_at: row.try_get("created_at").map_err(db)?,
            updated_at: row.try_get("updated_at").map_err(db)?,
            settings,
        })
    }

    fn summary_from_row(row: &PgRow) -> StoreResult<Summary> {
        Ok(Summary {
            id: row.try_get("id").map_err(db)?,
            article_id: row.try_get("article_id").map_err(db)?,
            language: row.try_get("language").map_err(db)?,
            summary: row.try_get("summary").map_err(db)?,
            key_points: row.try_get("key_points").map_err(db)?,
            llm_model: row.try_get("llm_model").map_err(db)?,
            created_at: row.try_get("created_at").map_err(db)?,
        })
    }

    fn fetch_log_from_row(row: &PgRow) -> StoreResult<FetchLog> {
        let id: Uuid = row.try_get("id").map_err(db)?;
        let status: String = row.try_get("status").map_err(db)?;
        let count = |column: &str| -> StoreResult<u32> {
            let value: i32 = row.try_get(column).map_err(db)?;
            Ok(value.max(0) as u32)
        };
        let processing_ms: i64 = row.try_get("processing_ms").map_err(db)?;
        Ok(FetchLog {
            id,
            source_id: row.try_get("source_id").map_err(db)?,
            fetched_at: row.try_get("fetched_at").map_err(db)?,
            status: FetchLogStatus::from_str(&status).map_err(|e| StoreError::Corrupt {
                id,
                reason: e.to_string(),
            })?,
            items_found: count("items_found")?,
            articles_saved: count("articles_saved")?,
            duplicates: count("duplicates")?,
            error_message: row.try_get("error_message").map_err(db)?,
            processing_ms: processing_ms.max(0) as u64,
        })
    }

    fn analysis_from_row(row: &PgRow) -> StoreResult<Analysis> {
        let Json(vocabulary): Json<BTreeMap<String, String>> = row.try_get("vocabulary").map_err(db)?;
        Ok(Analysis {
            id: row.try_get("id").map_err(db)?,
            article_id: row.try_get("article_id").map_err(db)?,
            vocabulary,
            context: row.try_get("context").map_err(db)?,
            impact: row.try_get("impact").map_err(db)?,
            title_candidates: row.try_get("title_candidates").map_err(db)?,
            llm_model: row.try_get("llm_model").map_err(db)?,
            created_at: row.try_get("created_at").map_err(db)?,
        })
    }

    async fn find_article(&self, column: &str, value: &str) -> StoreResult<Option<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE {column} = $1");
        let row = sqlx::query(&sql).bind(value).fetch_optional(&self.db).await.map_err(db)?;
        row.as_ref().map(Self::article_from_row).transpose()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_article(&self, draft: ArticleDraft) -> StoreResult<InsertOutcome<Article>> {
        let article = Article::from_draft(draft, Uuid::new_v4(), Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO articles (id, title, description, body, source_kind, source_id, source_name, url,
                                  published_at, language, category, tags, fingerprint, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(article.id)
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.body)
        .bind(article.source_kind.as_str())
        .bind(article.source_id)
        .bind(&article.source_name)
        .bind(&article.url)
        .bind(article.published_at)
        .bind(&article.language)
        .bind(&article.category)
        .bind(&article.tags)
        .bind(&article.fingerprint)
        .bind(article.created_at)
        .execute(&self.db)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            debug!("Article '{}' conflicts with a stored row", article.title);
            return Ok(InsertOutcome::Conflict);
        }
        Ok(InsertOutcome::Inserted(article))
    }

    async fn get_article(&self, id: Uuid) -> StoreResult<Option<Article>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await.map_err(db)?;
        row.as_ref().map(Self::article_from_row).transpose()
    }

    async fn find_article_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<Article>> {
        self.find_article("fingerprint", fingerprint).await
    }

    async fn find_article_by_url(&self, url: &str) -> StoreResult<Option<Article>> {
        self.find_article("url", url).await
    }

    async fn list_articles(&self, filter: &ArticleFilter) -> StoreResult<Vec<Article>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE TRUE"));
        if let Some(language) = &filter.language {
            query.push(" AND lower(language) = lower(").push_bind(language.clone()).push(")");
        }
        if let Some(kind) = filter.source_kind {
            query.push(" AND source_kind = ").push_bind(kind.as_str());
        }
        if let Some(source_id) = filter.source_id {
            query.push(" AND source_id = ").push_bind(source_id);
        }
        if let Some(category) = &filter.category {
            query.push(" AND lower(category) = lower(").push_bind(category.clone()).push(")");
        }
        if let Some(days) = filter.days {
            let since: DateTime<Utc> = Utc::now() - Duration::days(days.into());
            query.push(" AND published_at >= ").push_bind(since);
        }
        query
            .push(" ORDER BY published_at DESC, seq ASC LIMIT ")
            .push_bind(filter.effective_limit() as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = query.build().fetch_all(&self.db).await.map_err(db)?;
        rows.iter().map(Self::article_from_row).collect()
    }

    async fn count_articles(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.db)
            .await
            .map_err(db)?;
        Ok(count.max(0) as u64)
    }

    async fn create_source(&self, source: SourceConfig) -> StoreResult<SourceConfig> {
        let emails = source.mailbox().map_or(0, |m| m.total_emails_processed) as i64;
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, kind, enabled, fetch_interval_hours, last_fetched,
                                 total_emails_processed, settings, site_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(source.kind().as_str())
        .bind(source.enabled)
        .bind(source.fetch_interval_hours as i32)
        .bind(source.last_fetched)
        .bind(emails)
        .bind(Json(&source.settings))
        .bind(source.site_url_key())
        .bind(source.created_at)
        .bind(source.updated_at)
        .execute(&self.db)
        .await
        .map_err(|e| source_write_error(e, &source))?;

        info!("Created {} source '{}' ({})", source.kind(), source.name, source.id);
        Ok(source)
    }

    async fn get_source(&self, id: Uuid) -> StoreResult<Option<SourceConfig>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await.map_err(db)?;
        row.as_ref().map(Self::source_from_row).transpose()
    }

    async fn list_sources(&self, kind: Option<SourceKind>) -> StoreResult<Vec<SourceConfig>> {
        let rows = match kind {
            Some(kind) => {
                let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE kind = $1 ORDER BY created_at");
                sqlx::query(&sql).bind(kind.as_str()).fetch_all(&self.db).await
            }
            None => {
                let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY created_at");
                sqlx::query(&sql).fetch_all(&self.db).await
            }
        }
        .map_err(db)?;
        rows.iter().map(Self::source_from_row).collect()
    }

    async fn update_source(&self, source: &SourceConfig) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET name = $2, enabled = $3, fetch_interval_hours = $4, settings = $5, site_url = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(source.enabled)
        .bind(source.fetch_interval_hours as i32)
        .bind(Json(&source.settings))
        .bind(source.site_url_key())
        .bind(source.updated_at)
        .execute(&self.db)
        .await
        .map_err(|e| source_write_error(e, source))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound { id: source.id });
        }
        Ok(())
    }

    async fn delete_source(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_fetch(&self, id: Uuid, fetched_at: DateTime<Utc>, emails_ingested: u64) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sources
            SET last_fetched = GREATEST(last_fetched, $2),
                total_emails_processed = total_emails_processed + $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(fetched_at)
        .bind(emails_ingested as i64)
        .execute(&self.db)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound { id });
        }
        Ok(())
    }

    async fn append_fetch_log(&self, log: FetchLog) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO fetch_logs (id, source_id, fetched_at, status, items_found, articles_saved,
                                    duplicates, error_message, processing_ms)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9
            WHERE EXISTS (SELECT 1 FROM sources WHERE id = $2)
            "#,
        )
        .bind(log.id)
        .bind(log.source_id)
        .bind(log.fetched_at)
        .bind(log.status.as_str())
        .bind(to_i32(log.items_found))
        .bind(to_i32(log.articles_saved))
        .bind(to_i32(log.duplicates))
        .bind(&log.error_message)
        .bind(i64::try_from(log.processing_ms).unwrap_or(i64::MAX))
        .execute(&self.db)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound { id: log.source_id });
        }
        Ok(())
    }

    async fn list_fetch_logs(&self, source_id: Uuid, offset: usize, limit: usize) -> StoreResult<Vec<FetchLog>> {
        let sql = format!(
            "SELECT {FETCH_LOG_COLUMNS} FROM fetch_logs WHERE source_id = $1 \
             ORDER BY fetched_at DESC, seq DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(source_id)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.db)
            .await
            .map_err(db)?;
        rows.iter().map(Self::fetch_log_from_row).collect()
    }

    async fn latest_fetch_log(&self) -> StoreResult<Option<FetchLog>> {
        let sql = format!("SELECT {FETCH_LOG_COLUMNS} FROM fetch_logs ORDER BY fetched_at DESC, seq DESC LIMIT 1");
        let row = sqlx::query(&sql).fetch_optional(&self.db).await.map_err(db)?;
        row.as_ref().map(Self::fetch_log_from_row).transpose()
    }

    async fn get_summary(&self, article_id: Uuid, language: &str) -> StoreResult<Option<Summary>> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE article_id = $1 AND language = $2");
        let row = sqlx::query(&sql)
            .bind(article_id)
            .bind(language)
            .fetch_optional(&self.db)
            .await
            .map_err(db)?;
        row.as_ref().map(Self::summary_from_row).transpose()
    }

    async fn get_summary_by_id(&self, id: Uuid) -> StoreResult<Option<Summary>> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await.map_err(db)?;
        row.as_ref().map(Self::summary_from_row).transpose()
    }

    async fn list_summaries(&self, article_id: Uuid) -> StoreResult<Vec<Summary>> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE article_id = $1 ORDER BY created_at, id");
        let rows = sqlx::query(&sql).bind(article_id).fetch_all(&self.db).await.map_err(db)?;
        rows.iter().map(Self::summary_from_row).collect()
    }

    async fn create_summary(&self, summary: Summary) -> StoreResult<InsertOutcome<Summary>> {
        let result = sqlx::query(
            r#"
            INSERT INTO summaries (id, article_id, language, summary, key_points, llm_model, created_at)
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE EXISTS (SELECT 1 FROM articles WHERE id = $2)
            ON CONFLICT (article_id, language) DO NOTHING
            "#,
        )
        .bind(summary.id)
        .bind(summary.article_id)
        .bind(&summary.language)
        .bind(&summary.summary)
        .bind(&summary.key_points)
        .bind(&summary.llm_model)
        .bind(summary.created_at)
        .execute(&self.db)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            if self.get_article(summary.article_id).await?.is_none() {
                return Err(StoreError::ArticleNotFound { id: summary.article_id });
            }
            return Ok(InsertOutcome::Conflict);
        }
        Ok(InsertOutcome::Inserted(summary))
    }

    async fn get_analysis(&self, article_id: Uuid) -> StoreResult<Option<Analysis>> {
        let row = sqlx::query(
            "SELECT id, article_id, vocabulary, context, impact, title_candidates, llm_model, created_at \
             FROM analyses WHERE article_id = $1",
        )
        .bind(article_id)
        .fetch_optional(&self.db)
        .await
        .map_err(db)?;
        row.as_ref().map(Self::analysis_from_row).transpose()
    }

    async fn create_analysis(&self, analysis: Analysis) -> StoreResult<InsertOutcome<Analysis>> {
        let result = sqlx::query(
            r#"
            INSERT INTO analyses (id, article_id, vocabulary, context, impact, title_candidates, llm_model, created_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8
            WHERE EXISTS (SELECT 1 FROM articles WHERE id = $2)
            ON CONFLICT (article_id) DO NOTHING
            "#,
        )
        .bind(analysis.id)
        .bind(analysis.article_id)
        .bind(Json(&analysis.vocabulary))
        .bind(&analysis.context)
        .bind(&analysis.impact)
        .bind(&analysis.title_candidates)
        .bind(&analysis.llm_model)
        .bind(analysis.created_at)
        .execute(&self.db)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            if self.get_article(analysis.article_id).await?.is_none() {
                return Err(StoreError::ArticleNotFound { id: analysis.article_id });
            }
            return Ok(InsertOutcome::Conflict);
        }
        Ok(InsertOutcome::Inserted(analysis))
    }
}
