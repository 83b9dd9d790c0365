use chrono::{DateTime, Utc};
use interfaces::{AdapterError, FetchLogStatus, SourceKind, StoreError, ValidationError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Minimum spacing between two requests to the same host.
    pub host_interval_ms: u64,
    pub max_page_size_mb: usize,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "InsightFuse-Aggregator/1.0".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_delay_ms: 1000,
            host_interval_ms: 1000,
            max_page_size_mb: 10,
            max_redirects: 5,
        }
    }
}

/// Body of a completed HTTP GET.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
    pub response_time_ms: u64,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchStatus {
    Fetched {
        found: usize,
        inserted: usize,
        duplicates: usize,
        failed: usize,
    },
    Failed {
        error: String,
        auth: bool,
    },
    AlreadyRunning,
    NotDue,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: Uuid,
    pub source_name: String,
    pub kind: SourceKind,
    pub status: FetchStatus,
    pub processing_ms: u64,
}

impl SourceOutcome {
    pub fn inserted(&self) -> usize {
        match self.status {
            FetchStatus::Fetched { inserted, .. } => inserted,
            _ => 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, FetchStatus::Failed { .. })
    }
}

/// Per-source results of one batch; a failure is reported against its own
/// source only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<SourceOutcome>,
}

impl BatchReport {
    pub fn total_inserted(&self) -> usize {
        self.outcomes.iter().map(SourceOutcome::inserted).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    pub fn outcome_for(&self, source_id: Uuid) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.source_id == source_id)
    }
}

/// Ingestion overview across all sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionStatus {
    pub last_fetch: Option<DateTime<Utc>>,
    /// `None` until any source has been fetched.
    pub last_status: Option<FetchLogStatus>,
    pub total_articles: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregatorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Fetch from {source_name} failed: {message}")]
    SourceFetch { source_name: String, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("LLM generation failed: {0}")]
    LlmGeneration(String),

    #[error("Could not parse LLM response: {0}")]
    AnalysisParse(String),

    #[error("Analysis already exists for article {article_id}")]
    AlreadyExists { article_id: Uuid },

    #[error("Article not found: {id}")]
    ArticleNotFound { id: Uuid },

    #[error("Source not found: {id}")]
    SourceNotFound { id: Uuid },

    #[error("Summary not found: {id}")]
    SummaryNotFound { id: Uuid },

    #[error("No analysis for article {article_id}")]
    AnalysisNotFound { article_id: Uuid },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Page size exceeds limit: {size_mb}MB")]
    PageTooLarge { size_mb: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("General error: {0}")]
    General(String),
}

impl AggregatorError {
    pub fn from_adapter(source_name: &str, error: AdapterError) -> Self {
        match error {
            AdapterError::Auth(message) => AggregatorError::Auth(message),
            AdapterError::Fetch(message) | AdapterError::Config(message) => {
                AggregatorError::SourceFetch {
                    source_name: source_name.to_string(),
                    message,
                }
            }
        }
    }
}

impl From<StoreError> for AggregatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ArticleNotFound { id } => AggregatorError::ArticleNotFound { id },
            StoreError::SourceNotFound { id } => AggregatorError::SourceNotFound { id },
            StoreError::DuplicateSource { url } => AggregatorError::Validation(ValidationError::Invalid {
                field: "url",
                reason: format!("{url} is already registered"),
            }),
            other => AggregatorError::Store(other),
        }
    }
}

impl From<reqwest::Error> for AggregatorError {
    fn from(e: reqwest::Error) -> Self {
        AggregatorError::Http(e.to_string())
    }
}

impl From<sqlx::Error> for AggregatorError {
    fn from(e: sqlx::Error) -> Self {
        AggregatorError::Store(StoreError::Database(e.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
