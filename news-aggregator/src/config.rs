use std::fmt;
use std::str::FromStr;

use email_ingestion::EmailIngesterConfig;
use interfaces::MAX_PAGE_SIZE;
use tracing::warn;

use crate::llm_adapter::{DEFAULT_ANTHROPIC_BASE, DEFAULT_OPENAI_BASE};
use crate::sources::news_api::DEFAULT_NEWS_API_BASE;
use crate::types::{AggregatorError, FetchConfig, Result};

const DEFAULT_NEWS_SOURCES: &str = "techcrunch,ars-technica,the-verge,hacker-news";

#[derive(Clone)]
pub struct LlmConfig {
    pub model: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("model", &self.model)
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "***"))
            .field("anthropic_api_key", &self.anthropic_api_key.as_ref().map(|_| "***"))
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("max_attempts", &self.max_attempts)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4-turbo-preview".to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE.to_string(),
            anthropic_base_url: DEFAULT_ANTHROPIC_BASE.to_string(),
            max_tokens: 2000,
            temperature: 0.7,
            max_attempts: 3,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewsApiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub sources: Vec<String>,
    pub fetch_limit: u32,
}

impl Default for NewsApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_NEWS_API_BASE.to_string(),
            sources: split_list(DEFAULT_NEWS_SOURCES),
            fetch_limit: 50,
        }
    }
}

#[derive(Clone, Default)]
pub struct MailboxSettings {
    pub uri: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for MailboxSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxSettings")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl MailboxSettings {
    /// `None` when the mailbox is not configured or the URI is unusable;
    /// the mailbox adapter then reports an auth failure on use.
    pub fn connector_config(&self) -> Option<EmailIngesterConfig> {
        let uri = self.uri.as_deref()?;
        let password = self.password.as_deref()?;
        match EmailIngesterConfig::from_uri_and_credentials(uri, self.username.as_deref(), password) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring mailbox configuration: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub llm: LlmConfig,
    pub news_api: NewsApiConfig,
    pub mailbox: MailboxSettings,
    pub reader_language: String,
    pub fetch_workers: usize,
    pub scheduler_tick_minutes: u64,
    pub http_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            llm: LlmConfig::default(),
            news_api: NewsApiConfig::default(),
            mailbox: MailboxSettings::default(),
            reader_language: "ja".to_string(),
            fetch_workers: 4,
            scheduler_tick_minutes: 30,
            http_timeout_secs: 30,
        }
    }
}

impl AppConfig {
    /// Reads `.env` when present, then the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Could not load .env: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset and blank values
    /// fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let llm = LlmConfig {
            model: get("LLM_MODEL").unwrap_or(defaults.llm.model),
            openai_api_key: get("OPENAI_API_KEY"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.llm.openai_base_url),
            anthropic_base_url: get("ANTHROPIC_BASE_URL").unwrap_or(defaults.llm.anthropic_base_url),
            max_tokens: parse_or(&get, "MAX_TOKENS", defaults.llm.max_tokens)?,
            temperature: parse_or(&get, "TEMPERATURE", defaults.llm.temperature)?,
            max_attempts: parse_or(&get, "LLM_MAX_ATTEMPTS", defaults.llm.max_attempts)?.max(1),
            timeout_secs: parse_or(&get, "LLM_TIMEOUT_SECS", defaults.llm.timeout_secs)?,
        };

        let news_api = NewsApiConfig {
            api_key: get("NEWS_API_KEY"),
            base_url: get("NEWS_API_BASE_URL").unwrap_or(defaults.news_api.base_url),
            sources: get("NEWS_SOURCES").map(|s| split_list(&s)).unwrap_or(defaults.news_api.sources),
            fetch_limit: parse_or(&get, "NEWS_FETCH_LIMIT", defaults.news_api.fetch_limit)?.clamp(1, MAX_PAGE_SIZE),
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            llm,
            news_api,
            mailbox: MailboxSettings {
                uri: get("MAILBOX_URI"),
                username: get("MAILBOX_USERNAME"),
                password: get("MAILBOX_PASSWORD"),
            },
            reader_language: get("READER_LANGUAGE").unwrap_or(defaults.reader_language),
            fetch_workers: parse_or(&get, "FETCH_WORKERS", defaults.fetch_workers)?.max(1),
            scheduler_tick_minutes: parse_or(&get, "SCHEDULER_TICK_MINUTES", defaults.scheduler_tick_minutes)?
                .max(1),
            http_timeout_secs: parse_or(&get, "HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
        })
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout_seconds: self.http_timeout_secs,
            ..FetchConfig::default()
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| AggregatorError::Config(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.llm.model, "gpt-4-turbo-preview");
        assert_eq!(config.llm.max_attempts, 3);
        assert_eq!(config.reader_language, "ja");
        assert_eq!(config.news_api.fetch_limit, 50);
        assert_eq!(config.news_api.sources.len(), 4);
        assert!(config.database_url.is_none());
        assert!(config.mailbox.connector_config().is_none());
    }

    #[test]
    fn overrides_and_bounds() {
        let config = config_from(&[
            ("LLM_MODEL", "claude-3-opus"),
            ("NEWS_FETCH_LIMIT", "500"),
            ("NEWS_SOURCES", " bbc-news , ,reuters"),
            ("FETCH_WORKERS", "0"),
        ])
        .unwrap();
        assert_eq!(config.llm.model, "claude-3-opus");
        assert_eq!(config.news_api.fetch_limit, 100);
        assert_eq!(config.news_api.sources, vec!["bbc-news", "reuters"]);
        assert_eq!(config.fetch_workers, 1);
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let err = config_from(&[("MAX_TOKENS", "lots")]).unwrap_err();
        assert!(matches!(err, AggregatorError::Config(_)));
    }
}
