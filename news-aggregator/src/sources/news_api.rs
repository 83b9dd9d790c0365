use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use interfaces::{AdapterError, RawItem, SourceAdapter, SourceConfig, SourceKind, SourceSettings};
use serde::Deserialize;
use tracing::{info, warn};

use crate::fetcher::Fetcher;

pub const DEFAULT_NEWS_API_BASE: &str = "https://newsapi.org/v2";
const REMOVED_MARKER: &str = "[Removed]";

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    status: String,
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsApiArticle {
    source: Option<NewsApiSourceRef>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    published_at: Option<DateTime<Utc>>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewsApiSourceRef {
    name: Option<String>,
}

/// API variant: one bounded `/everything` query per fetch.
pub struct NewsApiAdapter {
    fetcher: Arc<Fetcher>,
    api_key: Option<String>,
    base_url: String,
}

impl NewsApiAdapter {
    pub fn new(fetcher: Arc<Fetcher>, api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for NewsApiAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn list_raw_items(&self, source: &SourceConfig) -> Result<Vec<RawItem>, AdapterError> {
        let SourceSettings::Api(settings) = &source.settings else {
            return Err(AdapterError::Config(format!("{} is not an API source", source.id)));
        };
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AdapterError::Auth("news API key is not configured".to_string()))?;

        let mut params: Vec<(&str, String)> = vec![
            ("pageSize", settings.page_size.to_string()),
            ("sortBy", "publishedAt".to_string()),
            ("apiKey", api_key.clone()),
        ];
        if !settings.sources.is_empty() {
            params.push(("sources", settings.sources.join(",")));
        }
        if let Some(query) = settings.query.as_ref().filter(|q| !q.trim().is_empty()) {
            params.push(("q", query.clone()));
        }
        if let Some(language) = &settings.language {
            params.push(("language", language.clone()));
        }

        let endpoint = format!("{}/everything", self.base_url);
        let page = self
            .fetcher
            .get_with_query(&endpoint, &params)
            .await
            .map_err(|e| AdapterError::Fetch(e.to_string()))?;

        let response: Option<NewsApiResponse> = serde_json::from_str(&page.body).ok();
        if page.status == 401 || response.as_ref().is_some_and(is_key_rejection) {
            return Err(AdapterError::Auth(format!(
                "news API rejected the key: {}",
                response.and_then(|r| r.message).unwrap_or_else(|| format!("HTTP {}", page.status))
            )));
        }
        if !page.is_success() {
            let detail = response.and_then(|r| r.message).unwrap_or_default();
            return Err(AdapterError::Fetch(format!("HTTP {} {}", page.status, detail).trim().to_string()));
        }
        let response = response
            .ok_or_else(|| AdapterError::Fetch("news API returned a malformed body".to_string()))?;
        if response.status != "ok" {
            return Err(AdapterError::Fetch(response.message.unwrap_or(response.status)));
        }

        let total = response.articles.len();
        let items: Vec<RawItem> = response
            .articles
            .into_iter()
            .filter_map(|article| {
                let title = article.title.filter(|t| t.trim() != REMOVED_MARKER && !t.trim().is_empty())?;
                Some(RawItem {
                    title,
                    description: article.description,
                    body: article.content,
                    url: article.url,
                    published_at: article.published_at,
                    source_name: article
                        .source
                        .and_then(|s| s.name)
                        .unwrap_or_else(|| source.name.clone()),
                    language: settings.language.clone(),
                    category: None,
                    tags: Vec::new(),
                })
            })
            .collect();

        if items.len() < total {
            warn!("Dropped {} removed articles from news API response", total - items.len());
        }
        info!("News API returned {} articles for '{}'", items.len(), source.name);
        Ok(items)
    }
}

fn is_key_rejection(response: &NewsApiResponse) -> bool {
    matches!(
        response.code.as_deref(),
        Some("apiKeyInvalid" | "apiKeyMissing" | "apiKeyDisabled" | "apiKeyExhausted")
    )
}
