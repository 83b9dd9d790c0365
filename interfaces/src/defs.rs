use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MIN_FETCH_INTERVAL_HOURS: u32 = 1;
pub const MAX_FETCH_INTERVAL_HOURS: u32 = 168;
pub const DEFAULT_FETCH_INTERVAL_HOURS: u32 = 24;
pub const MAX_EMAILS_PER_FETCH: u32 = 100;
pub const MAX_DAYS_BACK: u32 = 30;
pub const MAX_SITE_URL_LEN: usize = 1000;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub(crate) fn check_range(
    field: &'static str,
    value: u32,
    min: u32,
    max: u32,
) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            min: min.into(),
            max: max.into(),
            value: value.into(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Site,
    Mailbox,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Api, SourceKind::Site, SourceKind::Mailbox];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Api => "api",
            SourceKind::Site => "site",
            SourceKind::Mailbox => "mailbox",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(SourceKind::Api),
            "site" => Ok(SourceKind::Site),
            "mailbox" => Ok(SourceKind::Mailbox),
            other => Err(ValidationError::Invalid {
                field: "source_kind",
                reason: format!("unknown source kind '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteType {
    Substack,
    Newsletter,
    Blog,
    #[default]
    Generic,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteType::Substack => "substack",
            SiteType::Newsletter => "newsletter",
            SiteType::Blog => "blog",
            SiteType::Generic => "generic",
        }
    }
}

impl fmt::Display for SiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "substack" => Ok(SiteType::Substack),
            "newsletter" => Ok(SiteType::Newsletter),
            "blog" => Ok(SiteType::Blog),
            "generic" => Ok(SiteType::Generic),
            other => Err(ValidationError::Invalid {
                field: "site_type",
                reason: format!("expected substack, newsletter, blog or generic, got '{other}'"),
            }),
        }
    }
}

/// An item as an adapter returned it, before cleanup or hashing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub title: String,
    pub description: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub source_name: String,
    pub language: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

/// What the normalizer knows about the source an item came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceContext {
    pub kind: SourceKind,
    pub source_id: Option<Uuid>,
    pub source_name: String,
    pub language: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

impl SourceContext {
    pub fn for_source(source: &SourceConfig, fetched_at: DateTime<Utc>) -> Self {
        let (language, category, tags) = match &source.settings {
            SourceSettings::Api(api) => (api.language.clone(), api.category.clone(), Vec::new()),
            SourceSettings::Site(site) => (
                Some(site.language.clone()),
                Some(site.category.clone()),
                site.tags.clone(),
            ),
            SourceSettings::Mailbox(mailbox) => (
                Some(mailbox.language.clone()),
                Some(mailbox.category.clone()),
                mailbox.tags.clone(),
            ),
        };
        Self {
            kind: source.kind(),
            source_id: Some(source.id),
            source_name: source.name.clone(),
            language,
            category,
            tags,
            fetched_at,
        }
    }
}

/// A normalized article that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleDraft {
    pub title: String,
    pub description: String,
    pub body: String,
    pub source_kind: SourceKind,
    pub source_id: Option<Uuid>,
    pub source_name: String,
    pub url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub language: String,
    pub category: String,
    pub tags: Vec<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub body: String,
    pub source_kind: SourceKind,
    pub source_id: Option<Uuid>,
    pub source_name: String,
    pub url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub language: String,
    pub category: String,
    pub tags: Vec<String>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl Article {
    pub fn from_draft(draft: ArticleDraft, id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: draft.title,
            description: draft.description,
            body: draft.body,
            source_kind: draft.source_kind,
            source_id: draft.source_id,
            source_name: draft.source_name,
            url: draft.url,
            published_at: draft.published_at,
            language: draft.language,
            category: draft.category,
            tags: draft.tags,
            fingerprint: draft.fingerprint,
            created_at,
        }
    }
}

pub const DEFAULT_ARTICLE_LIMIT: usize = 20;
pub const MAX_ARTICLE_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleFilter {
    pub language: Option<String>,
    pub source_kind: Option<SourceKind>,
    pub source_id: Option<Uuid>,
    pub category: Option<String>,
    /// Only articles published within the last N days.
    pub days: Option<u32>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ArticleFilter {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(days) = self.days {
            check_range("days", days, 1, MAX_DAYS_BACK)?;
        }
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_ARTICLE_LIMIT {
                return Err(ValidationError::OutOfRange {
                    field: "limit",
                    min: 1,
                    max: MAX_ARTICLE_LIMIT as i64,
                    value: limit as i64,
                });
            }
        }
        Ok(())
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_ARTICLE_LIMIT)
    }

    /// Predicate part of the filter; paging is applied by the store.
    pub fn matches(&self, article: &Article, now: DateTime<Utc>) -> bool {
        if let Some(language) = &self.language {
            if !article.language.eq_ignore_ascii_case(language) {
                return false;
            }
        }
        if let Some(kind) = self.source_kind {
            if article.source_kind != kind {
                return false;
            }
        }
        if let Some(source_id) = self.source_id {
            if article.source_id != Some(source_id) {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if !article.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        if let Some(days) = self.days {
            if article.published_at < now - Duration::days(days.into()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSourceSettings {
    /// Upstream source identifiers, joined into one query.
    pub sources: Vec<String>,
    pub query: Option<String>,
    pub language: Option<String>,
    pub category: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSourceSettings {
    pub url: String,
    pub site_type: SiteType,
    pub language: String,
    pub category: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxSourceSettings {
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub subject_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub category: String,
    pub language: String,
    pub tags: Vec<String>,
    pub max_emails_per_fetch: u32,
    pub days_back: u32,
    pub total_emails_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceSettings {
    Api(ApiSourceSettings),
    Site(SiteSourceSettings),
    Mailbox(MailboxSourceSettings),
}

impl SourceSettings {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceSettings::Api(_) => SourceKind::Api,
            SourceSettings::Site(_) => SourceKind::Site,
            SourceSettings::Mailbox(_) => SourceKind::Mailbox,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub fetch_interval_hours: u32,
    pub last_fetched: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settings: SourceSettings,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, settings: SourceSettings) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            fetch_interval_hours: DEFAULT_FETCH_INTERVAL_HOURS,
            last_fetched: None,
            created_at: now,
            updated_at: now,
            settings,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.settings.kind()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_fetched {
            None => true,
            Some(last) => now - last >= Duration::hours(self.fetch_interval_hours.into()),
        }
    }

    pub fn site(&self) -> Option<&SiteSourceSettings> {
        match &self.settings {
            SourceSettings::Site(site) => Some(site),
            _ => None,
        }
    }

    /// Normalized site URL; two site sources may not share one.
    pub fn site_url_key(&self) -> Option<String> {
        self.site().map(|site| crate::text::normalize_url(&site.url))
    }

    pub fn mailbox(&self) -> Option<&MailboxSourceSettings> {
        match &self.settings {
            SourceSettings::Mailbox(mailbox) => Some(mailbox),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty { field: "name" });
        }
        check_range(
            "fetch_interval_hours",
            self.fetch_interval_hours,
            MIN_FETCH_INTERVAL_HOURS,
            MAX_FETCH_INTERVAL_HOURS,
        )?;
        match &self.settings {
            SourceSettings::Api(api) => {
                check_range("page_size", api.page_size, 1, MAX_PAGE_SIZE)?;
                if api.sources.is_empty() && api.query.as_deref().is_none_or(|q| q.trim().is_empty()) {
                    return Err(ValidationError::Empty { field: "sources or query" });
                }
            }
            SourceSettings::Site(site) => validate_site_url(&site.url)?,
            SourceSettings::Mailbox(mailbox) => {
                check_range(
                    "max_emails_per_fetch",
                    mailbox.max_emails_per_fetch,
                    1,
                    MAX_EMAILS_PER_FETCH,
                )?;
                check_range("days_back", mailbox.days_back, 1, MAX_DAYS_BACK)?;
                if let Some(email) = &mailbox.sender_email {
                    if !email.trim().is_empty() && !email.contains('@') {
                        return Err(ValidationError::Invalid {
                            field: "sender_email",
                            reason: format!("'{email}' is not an email address"),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn validate_site_url(raw: &str) -> Result<(), ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::Empty { field: "url" });
    }
    if raw.len() > MAX_SITE_URL_LEN {
        return Err(ValidationError::Invalid {
            field: "url",
            reason: format!("longer than {MAX_SITE_URL_LEN} characters"),
        });
    }
    let parsed = url::Url::parse(raw).map_err(|e| ValidationError::Invalid {
        field: "url",
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::Invalid {
            field: "url",
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchLogStatus {
    Success,
    /// The adapter answered but some items could not be stored.
    Partial,
    Failed,
}

impl FetchLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchLogStatus::Success => "success",
            FetchLogStatus::Partial => "partial",
            FetchLogStatus::Failed => "failed",
        }
    }
}

impl FromStr for FetchLogStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(FetchLogStatus::Success),
            "partial" => Ok(FetchLogStatus::Partial),
            "failed" => Ok(FetchLogStatus::Failed),
            other => Err(ValidationError::Invalid {
                field: "status",
                reason: format!("unknown fetch status '{other}'"),
            }),
        }
    }
}

/// One fetch attempt of one source, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchLog {
    pub id: Uuid,
    pub source_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchLogStatus,
    pub items_found: u32,
    pub articles_saved: u32,
    pub duplicates: u32,
    pub error_message: Option<String>,
    pub processing_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: Uuid,
    pub article_id: Uuid,
    pub language: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub llm_model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: Uuid,
    pub article_id: Uuid,
    pub vocabulary: BTreeMap<String, String>,
    pub context: String,
    pub impact: String,
    pub title_candidates: Vec<String>,
    pub llm_model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// Credentials are missing, expired or rejected. Never retried.
    #[error("credentials missing or rejected: {0}")]
    Auth(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("source misconfigured: {0}")]
    Config(String),
}

/// One adapter per source kind; the scheduler dispatches on `SourceConfig::kind`.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// One finite pass over the source. Not restartable mid-sequence.
    async fn list_raw_items(&self, source: &SourceConfig) -> Result<Vec<RawItem>, AdapterError>;
}
