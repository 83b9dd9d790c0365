use std::sync::Arc;
use std::time::Duration;

use email_ingestion::{ConnectionReport, EmailIngester};
use interfaces::{
    validate_site_url, Analysis, ApiSourceSettings, Article, ArticleFilter, FetchLog, MailboxSourceUpdate, MemoryStore,
    NewMailboxSource, NewSiteSource, SiteSourceUpdate, SiteType, SourceAdapter, SourceConfig, SourceKind, SourceSettings,
    Store, Summary, ValidationError,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisOrchestrator, AnalysisSettings};
use crate::config::{AppConfig, NewsApiConfig};
use crate::fetcher::Fetcher;
use crate::jobs::{Job, JobId, JobQueue, JobStatus};
use crate::llm_adapter::{build_llm, LlmAdapter};
use crate::normalizer::normalize_url;
use crate::scheduler::FetchScheduler;
use crate::sources::{NewsApiAdapter, SiteAdapter, SiteAnalyzer, SiteSuggestion, SourceAdapters};
use crate::store::PgStore;
use crate::types::{AggregatorError, IngestionStatus, Result, SourceOutcome};

pub const NEWS_API_SOURCE_NAME: &str = "News API";
pub const DEFAULT_FETCH_LOG_LIMIT: usize = 50;
const MAX_FETCH_LOG_LIMIT: usize = 100;

/// Everything the facade is assembled from. Tests swap in scripted
/// adapters, a fake mailbox and a counting LLM.
pub struct Components {
    pub store: Arc<dyn Store>,
    pub api: Arc<dyn SourceAdapter>,
    pub site: Arc<dyn SourceAdapter>,
    pub mailbox: Arc<EmailIngester>,
    pub llm: Arc<dyn LlmAdapter>,
    pub site_analyzer: SiteAnalyzer,
    pub analysis: AnalysisSettings,
    pub news_api: NewsApiConfig,
    pub fetch_workers: usize,
}

/// The operations exposed to a request layer.
pub struct NewsAggregator {
    store: Arc<dyn Store>,
    scheduler: Arc<FetchScheduler>,
    analysis: Arc<AnalysisOrchestrator>,
    jobs: JobQueue,
    mailbox: Arc<EmailIngester>,
    site_analyzer: SiteAnalyzer,
    news_api: NewsApiConfig,
}

impl NewsAggregator {
    /// Must be called inside a Tokio runtime; the job consumer is spawned here.
    pub fn new(components: Components) -> Self {
        let Components {
            store,
            api,
            site,
            mailbox,
            llm,
            site_analyzer,
            analysis,
            news_api,
            fetch_workers,
        } = components;

        let adapters = SourceAdapters::new(api, site, mailbox.clone());
        let scheduler = Arc::new(FetchScheduler::new(store.clone(), adapters).with_workers(fetch_workers));
        let analysis = Arc::new(AnalysisOrchestrator::new(store.clone(), llm, analysis));
        let jobs = JobQueue::start(scheduler.clone(), analysis.clone());

        Self {
            store,
            scheduler,
            analysis,
            jobs,
            mailbox,
            site_analyzer,
            news_api,
        }
    }

    /// Wires the production adapters from configuration. Postgres is used
    /// when `DATABASE_URL` is set, the in-memory store otherwise.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.database_url {
            Some(url) => {
                let store = PgStore::connect(url).await?;
                store.setup_schema().await?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL is not set; articles are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        let fetcher = Arc::new(Fetcher::new(config.fetch_config())?);
        let api = Arc::new(NewsApiAdapter::new(
            fetcher.clone(),
            config.news_api.api_key.clone(),
            config.news_api.base_url.clone(),
        ));
        let site = Arc::new(SiteAdapter::new(fetcher.clone()));

        let aggregator = Self::new(Components {
            store,
            api,
            site,
            mailbox: Arc::new(EmailIngester::with_config(config.mailbox.connector_config())),
            llm: build_llm(&config.llm),
            site_analyzer: SiteAnalyzer::new(fetcher),
            analysis: AnalysisSettings::from_config(&config.llm, &config.reader_language),
            news_api: config.news_api.clone(),
            fetch_workers: config.fetch_workers,
        });
        aggregator.ensure_api_source().await?;
        Ok(aggregator)
    }

    pub fn scheduler(&self) -> Arc<FetchScheduler> {
        self.scheduler.clone()
    }

    pub fn spawn_scheduler(&self, every: Duration) -> JoinHandle<()> {
        self.scheduler.clone().spawn_ticker(every)
    }

    /// Creates the single API source from configuration if none exists yet.
    pub async fn ensure_api_source(&self) -> Result<SourceConfig> {
        if let Some(existing) = self.store.list_sources(Some(SourceKind::Api)).await?.into_iter().next() {
            return Ok(existing);
        }
        let source = SourceConfig::new(
            NEWS_API_SOURCE_NAME,
            SourceSettings::Api(ApiSourceSettings {
                sources: self.news_api.sources.clone(),
                query: None,
                language: None,
                category: None,
                page_size: self.news_api.fetch_limit,
            }),
        );
        source.validate()?;
        info!("Registering default API source '{}'", source.name);
        Ok(self.store.create_source(source).await?)
    }

    // Articles

    pub async fn list_articles(&self, filter: &ArticleFilter) -> Result<Vec<Article>> {
        filter.validate()?;
        Ok(self.store.list_articles(filter).await?)
    }

    pub async fn get_article(&self, id: Uuid) -> Result<Article> {
        self.store
            .get_article(id)
            .await?
            .ok_or(AggregatorError::ArticleNotFound { id })
    }

    // Analysis

    pub async fn generate_summary(&self, article_id: Uuid, language: &str) -> Result<Summary> {
        self.analysis.generate_summary(article_id, language).await
    }

    pub async fn generate_analysis(&self, article_id: Uuid) -> Result<Analysis> {
        self.analysis.generate_analysis(article_id).await
    }

    pub async fn get_analysis(&self, article_id: Uuid) -> Result<Analysis> {
        self.get_article(article_id).await?;
        self.store
            .get_analysis(article_id)
            .await?
            .ok_or(AggregatorError::AnalysisNotFound { article_id })
    }

    pub async fn get_summary(&self, id: Uuid) -> Result<Summary> {
        self.store
            .get_summary_by_id(id)
            .await?
            .ok_or(AggregatorError::SummaryNotFound { id })
    }

    /// Every language generated so far for the article, oldest first.
    pub async fn list_summaries(&self, article_id: Uuid) -> Result<Vec<Summary>> {
        self.get_article(article_id).await?;
        Ok(self.store.list_summaries(article_id).await?)
    }

    /// Queues analysis generation. Unknown articles and existing analyses
    /// are rejected before anything is queued.
    pub async fn start_analysis(&self, article_id: Uuid) -> Result<JobId> {
        self.get_article(article_id).await?;
        if self.store.get_analysis(article_id).await?.is_some() {
            return Err(AggregatorError::AlreadyExists { article_id });
        }
        self.jobs.submit(Job::GenerateAnalysis { article_id }).await
    }

    // Fetching

    /// Starts background ingestion of every due API and site source.
    pub async fn trigger_fetch(&self) -> Result<JobId> {
        self.jobs
            .submit(Job::RunDue {
                kinds: vec![SourceKind::Api, SourceKind::Site],
            })
            .await
    }

    pub async fn start_fetch_all(&self, kind: SourceKind) -> Result<JobId> {
        self.jobs.submit(Job::FetchAll { kind }).await
    }

    pub async fn start_fetch_one(&self, source_id: Uuid) -> Result<JobId> {
        self.get_source(source_id).await?;
        self.jobs.submit(Job::FetchOne { source_id }).await
    }

    pub async fn fetch_status(&self) -> Result<IngestionStatus> {
        let latest = self.store.latest_fetch_log().await?;
        Ok(IngestionStatus {
            last_fetch: latest.as_ref().map(|log| log.fetched_at),
            last_status: latest.map(|log| log.status),
            total_articles: self.store.count_articles().await?,
        })
    }

    /// Fetch attempts of one source, newest first.
    pub async fn fetch_logs(&self, source_id: Uuid, offset: usize, limit: usize) -> Result<Vec<FetchLog>> {
        if limit == 0 || limit > MAX_FETCH_LOG_LIMIT {
            return Err(ValidationError::OutOfRange {
                field: "limit",
                min: 1,
                max: MAX_FETCH_LOG_LIMIT as i64,
                value: limit as i64,
            }
            .into());
        }
        self.get_source(source_id).await?;
        Ok(self.store.list_fetch_logs(source_id, offset, limit).await?)
    }

    pub async fn job_status(&self, id: JobId) -> Option<JobStatus> {
        self.jobs.status(id).await
    }

    pub async fn wait_for_job(&self, id: JobId, limit: Duration) -> Result<JobStatus> {
        self.jobs.wait(id, limit).await
    }

    // Mailbox sources

    pub async fn create_mailbox_source(&self, request: NewMailboxSource) -> Result<SourceConfig> {
        let source = request.into_config()?;
        info!("Creating mailbox source '{}'", source.name);
        Ok(self.store.create_source(source).await?)
    }

    pub async fn update_mailbox_source(&self, id: Uuid, update: MailboxSourceUpdate) -> Result<SourceConfig> {
        let current = self.source_of_kind(id, SourceKind::Mailbox).await?;
        let updated = update.apply(&current)?;
        self.store.update_source(&updated).await?;
        self.get_source(id).await
    }

    pub async fn get_mailbox_source(&self, id: Uuid) -> Result<SourceConfig> {
        self.source_of_kind(id, SourceKind::Mailbox).await
    }

    pub async fn list_mailbox_sources(&self) -> Result<Vec<SourceConfig>> {
        Ok(self.store.list_sources(Some(SourceKind::Mailbox)).await?)
    }

    /// Fetches one mailbox source now, regardless of its interval.
    pub async fn fetch_mailbox_source(&self, id: Uuid) -> Result<SourceOutcome> {
        self.source_of_kind(id, SourceKind::Mailbox).await?;
        self.scheduler.fetch_one(id).await
    }

    pub async fn fetch_all_mailboxes(&self) -> Result<JobId> {
        self.start_fetch_all(SourceKind::Mailbox).await
    }

    pub async fn test_mailbox_connection(&self) -> Result<ConnectionReport> {
        self.mailbox
            .test_connection()
            .await
            .map_err(|e| AggregatorError::from_adapter("mailbox", e))
    }

    // Site sources

    pub async fn create_site_source(&self, request: NewSiteSource) -> Result<SourceConfig> {
        let source = request.into_config()?;
        if let Some(site) = source.site() {
            self.ensure_unique_site_url(&site.url, None).await?;
        }
        info!("Creating site source '{}'", source.name);
        Ok(self.store.create_source(source).await?)
    }

    pub async fn update_site_source(&self, id: Uuid, update: SiteSourceUpdate) -> Result<SourceConfig> {
        let current = self.source_of_kind(id, SourceKind::Site).await?;
        let updated = update.apply(&current)?;
        if let Some(site) = updated.site() {
            self.ensure_unique_site_url(&site.url, Some(id)).await?;
        }
        self.store.update_source(&updated).await?;
        self.get_source(id).await
    }

    pub async fn get_site_source(&self, id: Uuid) -> Result<SourceConfig> {
        self.source_of_kind(id, SourceKind::Site).await
    }

    pub async fn list_site_sources(&self) -> Result<Vec<SourceConfig>> {
        Ok(self.store.list_sources(Some(SourceKind::Site)).await?)
    }

    /// Best-effort autofill for a new site source. Only a malformed URL is
    /// an error; fetch problems yield domain-based defaults.
    pub async fn analyze_url(&self, url: &str) -> Result<SiteSuggestion> {
        validate_site_url(url.trim())?;
        Ok(self.site_analyzer.analyze(url.trim()).await)
    }

    pub async fn fetch_all_sites(&self) -> Result<JobId> {
        self.start_fetch_all(SourceKind::Site).await
    }

    /// Seeds the starter site list, skipping URLs that are already registered.
    pub async fn initialize_defaults(&self) -> Result<Vec<SourceConfig>> {
        let mut created = Vec::new();
        for request in default_sites() {
            if self.find_site_by_url(&request.url, None).await?.is_some() {
                continue;
            }
            created.push(self.create_site_source(request).await?);
        }
        info!("Initialized {} default site sources", created.len());
        Ok(created)
    }

    // Shared

    pub async fn delete_source(&self, id: Uuid) -> Result<()> {
        if !self.store.delete_source(id).await? {
            return Err(AggregatorError::SourceNotFound { id });
        }
        info!("Deleted source {}", id);
        Ok(())
    }

    pub async fn get_source(&self, id: Uuid) -> Result<SourceConfig> {
        self.store
            .get_source(id)
            .await?
            .ok_or(AggregatorError::SourceNotFound { id })
    }

    async fn source_of_kind(&self, id: Uuid, kind: SourceKind) -> Result<SourceConfig> {
        let source = self.get_source(id).await?;
        if source.kind() != kind {
            return Err(ValidationError::Invalid {
                field: "source",
                reason: format!("{} is a {} source, not {}", id, source.kind(), kind),
            }
            .into());
        }
        Ok(source)
    }

    async fn find_site_by_url(&self, url: &str, except: Option<Uuid>) -> Result<Option<SourceConfig>> {
        let wanted = normalize_url(url);
        Ok(self
            .store
            .list_sources(Some(SourceKind::Site))
            .await?
            .into_iter()
            .filter(|s| Some(s.id) != except)
            .find(|s| s.site().is_some_and(|site| normalize_url(&site.url) == wanted)))
    }

    async fn ensure_unique_site_url(&self, url: &str, except: Option<Uuid>) -> Result<()> {
        if let Some(existing) = self.find_site_by_url(url, except).await? {
            return Err(ValidationError::Invalid {
                field: "url",
                reason: format!("already registered as '{}'", existing.name),
            }
            .into());
        }
        Ok(())
    }
}

fn default_site(
    name: &str,
    url: &str,
    site_type: SiteType,
    language: &str,
    category: &str,
    tags: &[&str],
    fetch_interval_hours: u32,
) -> NewSiteSource {
    let mut site = NewSiteSource::new(name, url);
    site.site_type = site_type;
    site.language = language.to_string();
    site.category = category.to_string();
    site.tags = tags.iter().map(|t| t.to_string()).collect();
    site.fetch_interval_hours = fetch_interval_hours;
    site
}

pub fn default_sites() -> Vec<NewSiteSource> {
    vec![
        default_site(
            "Weekly Kaggle News",
            "https://weeklykagglenews.substack.com/",
            SiteType::Substack,
            "en",
            "data-science",
            &["kaggle", "machine-learning", "competitions"],
            168,
        ),
        default_site(
            "The Batch (DeepLearning.AI)",
            "https://www.deeplearning.ai/the-batch/",
            SiteType::Newsletter,
            "en",
            "ai",
            &["deep-learning", "ai", "newsletter"],
            24,
        ),
        default_site(
            "TLDR Newsletter",
            "https://tldr.tech/",
            SiteType::Newsletter,
            "en",
            "technology",
            &["tech", "startup", "newsletter"],
            24,
        ),
        default_site(
            "Qosmo Insights",
            "https://qosmo.jp/",
            SiteType::Blog,
            "ja",
            "creative-ai",
            &["creative", "ai", "art"],
            24,
        ),
    ]
}
