pub mod aggregator;
pub mod analysis;
pub mod config;
pub mod dedup;
pub mod fetcher;
pub mod jobs;
pub mod llm_adapter;
pub mod normalizer;
pub mod parser;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod types;

pub use aggregator::{default_sites, Components, NewsAggregator, DEFAULT_FETCH_LOG_LIMIT};
pub use analysis::{AnalysisOrchestrator, AnalysisSettings};
pub use config::{AppConfig, LlmConfig, NewsApiConfig};
pub use dedup::Deduplicator;
pub use fetcher::Fetcher;
pub use jobs::{Job, JobId, JobOutput, JobQueue, JobRetention, JobStatus};
pub use llm_adapter::{build_llm, CompletionOptions, LlmAdapter, LlmError};
pub use parser::FeedParser;
pub use scheduler::{FetchScheduler, SourceState};
pub use sources::{NewsApiAdapter, SiteAdapter, SiteAnalyzer, SiteSuggestion, SourceAdapters};
pub use store::PgStore;
pub use types::*;
