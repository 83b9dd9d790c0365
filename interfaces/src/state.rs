use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::defs::{
    Analysis, Article, ArticleDraft, ArticleFilter, FetchLog, SourceConfig, SourceKind, Summary,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("source not found: {id}")]
    SourceNotFound { id: Uuid },
    #[error("article not found: {id}")]
    ArticleNotFound { id: Uuid },
    #[error("a site source for {url} already exists")]
    DuplicateSource { url: String },
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of a create that is guarded by a uniqueness constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// A row with the same unique key already exists; nothing was written.
    Conflict,
}

impl<T> InsertOutcome<T> {
    pub fn inserted(self) -> Option<T> {
        match self {
            InsertOutcome::Inserted(value) => Some(value),
            InsertOutcome::Conflict => None,
        }
    }
}

/// Durable keyed persistence. Implementations enforce uniqueness of the
/// article fingerprint and URL, of the normalized site source URL, of
/// (article, language) for summaries and of the article for analyses; the
/// check and the write are one atomic step.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_article(&self, draft: ArticleDraft) -> StoreResult<InsertOutcome<Article>>;
    async fn get_article(&self, id: Uuid) -> StoreResult<Option<Article>>;
    async fn find_article_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<Article>>;
    async fn find_article_by_url(&self, url: &str) -> StoreResult<Option<Article>>;
    /// Newest publication first; ties in insertion order.
    async fn list_articles(&self, filter: &ArticleFilter) -> StoreResult<Vec<Article>>;
    async fn count_articles(&self) -> StoreResult<u64>;

    /// Fails with `DuplicateSource` when a site source with the same
    /// normalized URL exists.
    async fn create_source(&self, source: SourceConfig) -> StoreResult<SourceConfig>;
    async fn get_source(&self, id: Uuid) -> StoreResult<Option<SourceConfig>>;
    async fn list_sources(&self, kind: Option<SourceKind>) -> StoreResult<Vec<SourceConfig>>;
    /// Persists configuration fields only; fetch bookkeeping is left as stored.
    /// The site URL stays unique as on create.
    async fn update_source(&self, source: &SourceConfig) -> StoreResult<()>;
    async fn delete_source(&self, id: Uuid) -> StoreResult<bool>;
    /// Moves `last_fetched` forward (never backward) and adds `emails_ingested`
    /// to the mailbox counter.
    async fn record_fetch(
        &self,
        id: Uuid,
        fetched_at: DateTime<Utc>,
        emails_ingested: u64,
    ) -> StoreResult<()>;
    async fn append_fetch_log(&self, log: FetchLog) -> StoreResult<()>;
    /// Newest first. Logs of a deleted source go with it.
    async fn list_fetch_logs(&self, source_id: Uuid, offset: usize, limit: usize) -> StoreResult<Vec<FetchLog>>;
    async fn latest_fetch_log(&self) -> StoreResult<Option<FetchLog>>;

    async fn get_summary(&self, article_id: Uuid, language: &str) -> StoreResult<Option<Summary>>;
    async fn get_summary_by_id(&self, id: Uuid) -> StoreResult<Option<Summary>>;
    /// Oldest first.
    async fn list_summaries(&self, article_id: Uuid) -> StoreResult<Vec<Summary>>;
    async fn create_summary(&self, summary: Summary) -> StoreResult<InsertOutcome<Summary>>;
    async fn get_analysis(&self, article_id: Uuid) -> StoreResult<Option<Analysis>>;
    async fn create_analysis(&self, analysis: Analysis) -> StoreResult<InsertOutcome<Analysis>>;
}
