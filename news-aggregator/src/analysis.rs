//! Summary and analysis generation: prompt construction, bounded retry
//! around the LLM call, response parsing and create-if-absent persistence.
//!
//! Concurrent requests for the same key share one in-flight generation.
//! The registries are locked only to look up or insert a future, never
//! while it runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use interfaces::text::{self, truncate_chars};
use interfaces::{Analysis, Article, InsertOutcome, Store, Summary, ValidationError};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::llm_adapter::{CompletionOptions, LlmAdapter, LlmError};
use crate::types::{AggregatorError, Result};

const MAX_PROMPT_CONTENT_CHARS: usize = 3000;

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
    /// Language of vocabulary explanations, context and impact.
    pub reader_language: String,
    pub completion: CompletionOptions,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(60),
            reader_language: "ja".to_string(),
            completion: CompletionOptions::default(),
        }
    }
}

impl AnalysisSettings {
    pub fn from_config(llm: &LlmConfig, reader_language: &str) -> Self {
        Self {
            max_attempts: llm.max_attempts.max(1),
            call_timeout: Duration::from_secs(llm.timeout_secs),
            reader_language: reader_language.to_string(),
            completion: CompletionOptions {
                max_tokens: llm.max_tokens,
                temperature: llm.temperature,
                ..CompletionOptions::default()
            },
            ..Self::default()
        }
    }
}

type InFlight<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Generator {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmAdapter>,
    settings: AnalysisSettings,
}

pub struct AnalysisOrchestrator {
    generator: Arc<Generator>,
    summaries: Mutex<HashMap<(Uuid, String), InFlight<Summary>>>,
    analyses: Mutex<HashMap<Uuid, InFlight<Analysis>>>,
}

impl AnalysisOrchestrator {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmAdapter>, settings: AnalysisSettings) -> Self {
        Self {
            generator: Arc::new(Generator { store, llm, settings }),
            summaries: Mutex::new(HashMap::new()),
            analyses: Mutex::new(HashMap::new()),
        }
    }

    pub fn model_name(&self) -> &str {
        self.generator.llm.model_name()
    }

    /// Returns the stored summary for `(article_id, language)` or generates
    /// one. The LLM is called at most once per key across concurrent callers.
    pub async fn generate_summary(&self, article_id: Uuid, language: &str) -> Result<Summary> {
        let language = text::language_tag(language).ok_or(ValidationError::Empty { field: "language" })?;
        if let Some(existing) = self.generator.store.get_summary(article_id, &language).await? {
            debug!("Summary for {} ({}) already stored", article_id, language);
            return Ok(existing);
        }

        let key = (article_id, language.clone());
        let flight = {
            let mut in_flight = self.summaries.lock().await;
            in_flight
                .entry(key.clone())
                .or_insert_with(|| self.generator.clone().summary(article_id, language).boxed().shared())
                .clone()
        };
        let result = flight.clone().await;
        let mut in_flight = self.summaries.lock().await;
        if in_flight.get(&key).is_some_and(|current| current.ptr_eq(&flight)) {
            in_flight.remove(&key);
        }
        result
    }

    /// One-time enrichment: fails with `AlreadyExists` once an analysis is
    /// stored for the article.
    pub async fn generate_analysis(&self, article_id: Uuid) -> Result<Analysis> {
        if self.generator.store.get_analysis(article_id).await?.is_some() {
            return Err(AggregatorError::AlreadyExists { article_id });
        }

        let flight = {
            let mut in_flight = self.analyses.lock().await;
            in_flight
                .entry(article_id)
                .or_insert_with(|| self.generator.clone().analysis(article_id).boxed().shared())
                .clone()
        };
        let result = flight.clone().await;
        let mut in_flight = self.analyses.lock().await;
        if in_flight.get(&article_id).is_some_and(|current| current.ptr_eq(&flight)) {
            in_flight.remove(&article_id);
        }
        result
    }
}

impl Generator {
    async fn summary(self: Arc<Self>, article_id: Uuid, language: String) -> Result<Summary> {
        if let Some(existing) = self.store.get_summary(article_id, &language).await? {
            return Ok(existing);
        }
        let article = self
            .store
            .get_article(article_id)
            .await?
            .ok_or(AggregatorError::ArticleNotFound { id: article_id })?;

        let raw = self.complete_with_retry(&summary_prompt(&article, &language)).await?;
        let parsed = parse_summary(&raw)?;

        let summary = Summary {
            id: Uuid::new_v4(),
            article_id,
            language: language.clone(),
            summary: parsed.summary,
            key_points: parsed.key_points,
            llm_model: self.llm.model_name().to_string(),
            created_at: Utc::now(),
        };
        match self.store.create_summary(summary).await? {
            InsertOutcome::Inserted(summary) => {
                info!("Stored {} summary for article {}", language, article_id);
                Ok(summary)
            }
            InsertOutcome::Conflict => self
                .store
                .get_summary(article_id, &language)
                .await?
                .ok_or_else(|| AggregatorError::General(format!("summary for {article_id} vanished after conflict"))),
        }
    }

    async fn analysis(self: Arc<Self>, article_id: Uuid) -> Result<Analysis> {
        if self.store.get_analysis(article_id).await?.is_some() {
            return Err(AggregatorError::AlreadyExists { article_id });
        }
        let article = self
            .store
            .get_article(article_id)
            .await?
            .ok_or(AggregatorError::ArticleNotFound { id: article_id })?;

        let prompt = analysis_prompt(&article, &self.settings.reader_language);
        let raw = self.complete_with_retry(&prompt).await?;
        let parsed = parse_analysis(&raw)?;

        let analysis = Analysis {
            id: Uuid::new_v4(),
            article_id,
            vocabulary: parsed.vocabulary,
            context: parsed.context,
            impact: parsed.impact,
            title_candidates: parsed.title_candidates,
            llm_model: self.llm.model_name().to_string(),
            created_at: Utc::now(),
        };
        match self.store.create_analysis(analysis).await? {
            InsertOutcome::Inserted(analysis) => {
                info!("Stored analysis for article {}", article_id);
                Ok(analysis)
            }
            InsertOutcome::Conflict => Err(AggregatorError::AlreadyExists { article_id }),
        }
    }

    /// Transient failures and timeouts are retried with exponential backoff
    /// up to `max_attempts` calls; auth and permanent failures return at once.
    async fn complete_with_retry(&self, prompt: &str) -> Result<String> {
        let settings = &self.settings;
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(settings.initial_backoff)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 1;
        loop {
            debug!("LLM attempt {}/{} with {}", attempt, settings.max_attempts, self.llm.model_name());
            let outcome = match timeout(settings.call_timeout, self.llm.complete(prompt, &settings.completion)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(LlmError::Transient(format!(
                    "no response within {}s",
                    settings.call_timeout.as_secs()
                ))),
            };

            match outcome {
                Ok(text) => return Ok(text),
                Err(LlmError::Auth(message)) => return Err(AggregatorError::Auth(message)),
                Err(LlmError::Permanent(message)) => return Err(AggregatorError::LlmGeneration(message)),
                Err(LlmError::Transient(message)) if attempt >= settings.max_attempts => {
                    return Err(AggregatorError::LlmGeneration(format!(
                        "giving up after {attempt} attempts: {message}"
                    )));
                }
                Err(LlmError::Transient(message)) => {
                    let delay = backoff.next_backoff().unwrap_or(settings.initial_backoff);
                    warn!("LLM attempt {} failed ({}), retrying in {:?}", attempt, message, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "ja" => "Japanese",
        "zh" => "Chinese",
        "ko" => "Korean",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        other => other,
    }
}

fn prompt_content(article: &Article) -> &str {
    let content = if article.body.trim().is_empty() { &article.description } else { &article.body };
    truncate_chars(content, MAX_PROMPT_CONTENT_CHARS)
}

pub fn summary_prompt(article: &Article, language: &str) -> String {
    format!(
        "Please summarize the following article in {language}.\n\n\
         Title: {title}\n\
         Article: {content}\n\n\
         Provide:\n\
         1. A concise summary (2-3 sentences)\n\
         2. 3-5 key points\n\n\
         Respond with JSON only:\n\
         {{\"summary\": \"...\", \"key_points\": [\"point1\", \"point2\"]}}",
        language = language_name(language),
        title = article.title,
        content = prompt_content(article),
    )
}

pub fn analysis_prompt(article: &Article, reader_language: &str) -> String {
    let reader = language_name(reader_language);
    format!(
        "Analyze the following article titled \"{title}\":\n\n\
         {content}\n\n\
         Provide the following analysis as JSON:\n\
         1. vocabulary: 5-10 difficult English terms (TOEIC 800+ level) with explanations in {reader}\n\
         2. context: the background of this news in {reader} (200-300 characters)\n\
         3. impact: the likely future impact in {reader} (around 500 characters)\n\
         4. blog_titles: 3 catchy titles for blog or social posts in {reader}\n\n\
         Respond with JSON only:\n\
         {{\"vocabulary\": {{\"term\": \"explanation\"}}, \"context\": \"...\", \"impact\": \"...\", \
         \"blog_titles\": [\"title1\", \"title2\", \"title3\"]}}",
        title = article.title,
        content = prompt_content(article),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSummary {
    pub summary: String,
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAnalysis {
    pub vocabulary: BTreeMap<String, String>,
    pub context: String,
    pub impact: String,
    pub title_candidates: Vec<String>,
}

/// Accepts a bare JSON object or one wrapped in code fences or prose.
fn extract_object(raw: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = raw.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn string_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
    .filter(|s| !s.is_empty())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(string_value).collect(),
        Some(single) => string_value(single).into_iter().collect(),
        None => Vec::new(),
    }
}

pub fn parse_summary(raw: &str) -> Result<ParsedSummary> {
    let object = extract_object(raw)
        .ok_or_else(|| AggregatorError::AnalysisParse("summary response is not a JSON object".to_string()))?;
    let summary = object
        .get("summary")
        .and_then(string_value)
        .ok_or_else(|| AggregatorError::AnalysisParse("summary response has no summary text".to_string()))?;
    Ok(ParsedSummary {
        summary,
        key_points: string_list(object.get("key_points")),
    })
}

/// Missing sections are left empty; only a response with no JSON object at
/// all is an error.
pub fn parse_analysis(raw: &str) -> Result<ParsedAnalysis> {
    let object = extract_object(raw)
        .ok_or_else(|| AggregatorError::AnalysisParse("analysis response is not a JSON object".to_string()))?;

    let vocabulary = match object.get("vocabulary") {
        Some(Value::Object(terms)) => terms
            .iter()
            .filter_map(|(term, explanation)| Some((term.trim().to_string(), string_value(explanation)?)))
            .filter(|(term, _)| !term.is_empty())
            .collect(),
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(|entry| {
                let term = ["term", "word"].iter().find_map(|k| entry.get(*k).and_then(string_value))?;
                let explanation = ["explanation", "meaning", "definition"]
                    .iter()
                    .find_map(|k| entry.get(*k).and_then(string_value))
                    .unwrap_or_default();
                Some((term, explanation))
            })
            .collect(),
        _ => BTreeMap::new(),
    };

    let title_candidates = ["blog_titles", "title_candidates", "titles"]
        .iter()
        .find_map(|key| object.get(*key))
        .map(|v| string_list(Some(v)))
        .unwrap_or_default();

    Ok(ParsedAnalysis {
        vocabulary,
        context: object.get("context").and_then(string_value).unwrap_or_default(),
        impact: object.get("impact").and_then(string_value).unwrap_or_default(),
        title_candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_inside_code_fence() {
        let raw = "Here you go:\n```json\n{\"summary\": \"Chips got faster.\", \"key_points\": [\"a\", \"b\"]}\n```";
        let parsed = parse_summary(raw).unwrap();
        assert_eq!(parsed.summary, "Chips got faster.");
        assert_eq!(parsed.key_points, vec!["a", "b"]);
    }

    #[test]
    fn summary_without_text_is_a_parse_error() {
        assert!(matches!(parse_summary("{\"key_points\": []}"), Err(AggregatorError::AnalysisParse(_))));
        assert!(matches!(parse_summary("no json here"), Err(AggregatorError::AnalysisParse(_))));
    }

    #[test]
    fn analysis_tolerates_missing_sections_and_list_vocabulary() {
        let raw = r#"{"vocabulary": [{"word": "latency", "meaning": "遅延"}], "titles": ["One"]}"#;
        let parsed = parse_analysis(raw).unwrap();
        assert_eq!(parsed.vocabulary.get("latency").map(String::as_str), Some("遅延"));
        assert_eq!(parsed.context, "");
        assert_eq!(parsed.impact, "");
        assert_eq!(parsed.title_candidates, vec!["One"]);
    }

    #[test]
    fn analysis_requires_an_object() {
        assert!(matches!(parse_analysis("[1, 2]"), Err(AggregatorError::AnalysisParse(_))));
    }
}
