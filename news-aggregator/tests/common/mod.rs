#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use email_ingestion::{ConnectionReport, EmailIngester, MailMessage, MailQuery, MailboxConnector};
use interfaces::{
    AdapterError, ApiSourceSettings, MemoryStore, RawItem, SourceAdapter, SourceConfig, SourceKind, SourceSettings, Store,
};
use news_aggregator::{
    AnalysisSettings, CompletionOptions, Components, LlmAdapter, LlmError, NewsAggregator, NewsApiConfig,
    SiteAnalyzer, Fetcher, FetchConfig,
};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub fn raw_item(title: &str, url: &str) -> RawItem {
    RawItem {
        title: title.to_string(),
        description: Some(format!("About {title}")),
        body: Some(format!("{title}. A longer body about machine learning and models.")),
        url: Some(url.to_string()),
        published_at: Some(Utc::now()),
        source_name: String::new(),
        language: None,
        category: None,
        tags: Vec::new(),
    }
}

/// Adapter returning a fixed item list. Sources named in `failing` get a
/// fetch error; `delay` holds each call open, `slow` only for named sources.
pub struct ScriptedAdapter {
    kind: SourceKind,
    items: Mutex<Vec<RawItem>>,
    failing: Mutex<HashSet<String>>,
    fail_with: Option<AdapterError>,
    delay: Option<Duration>,
    slow: Mutex<HashMap<String, Duration>>,
    calls: AtomicUsize,
    calls_by_source: Mutex<HashMap<String, usize>>,
}

impl ScriptedAdapter {
    pub fn new(kind: SourceKind, items: Vec<RawItem>) -> Self {
        Self {
            kind,
            items: Mutex::new(items),
            failing: Mutex::new(HashSet::new()),
            fail_with: None,
            delay: None,
            slow: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            calls_by_source: Mutex::new(HashMap::new()),
        }
    }

    pub fn empty(kind: SourceKind) -> Self {
        Self::new(kind, Vec::new())
    }

    pub fn failing_with(kind: SourceKind, error: AdapterError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::empty(kind)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_source(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn delay_source(&self, name: &str, delay: Duration) {
        self.slow.lock().unwrap().insert(name.to_string(), delay);
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.calls_by_source.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn set_items(&self, items: Vec<RawItem>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn list_raw_items(&self, source: &SourceConfig) -> Result<Vec<RawItem>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.calls_by_source.lock().unwrap().entry(source.name.clone()).or_default() += 1;
        let slow = self.slow.lock().unwrap().get(&source.name).copied();
        if let Some(delay) = self.delay.or(slow) {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        if self.failing.lock().unwrap().contains(&source.name) {
            return Err(AdapterError::Fetch(format!("{} is unreachable", source.name)));
        }
        Ok(self.items.lock().unwrap().clone())
    }
}

/// Plays back queued responses, then repeats `fallback`.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Result<String, LlmError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn always(response: Result<String, LlmError>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: response,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn sequence(responses: Vec<Result<String, LlmError>>, fallback: Result<String, LlmError>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::always(fallback)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmAdapter for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub const SUMMARY_JSON: &str = r#"{"summary": "要約です。", "key_points": ["one", "two"]}"#;
pub const ANALYSIS_JSON: &str = r#"Here you go:
{"vocabulary": {"transformer": "a neural network architecture"},
 "context": "Part of a wider trend.",
 "impact": "Cheaper inference.",
 "title_candidates": ["A", "B", "C"]}"#;

/// Mailbox returning its messages for every search.
#[derive(Default)]
pub struct FakeMailbox {
    pub messages: Vec<MailMessage>,
    pub fail_with: Option<AdapterError>,
}

#[async_trait]
impl MailboxConnector for FakeMailbox {
    async fn search(&self, _query: &MailQuery) -> Result<Vec<MailMessage>, AdapterError> {
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(self.messages.clone()),
        }
    }

    async fn test_connection(&self) -> Result<ConnectionReport, AdapterError> {
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(ConnectionReport {
                username: "reader".into(),
                mailbox: "INBOX".into(),
                messages: self.messages.len() as u32,
            }),
        }
    }
}

pub fn mail(id: &str, subject: &str, body: &str, date: DateTime<Utc>) -> MailMessage {
    MailMessage {
        uid: None,
        message_id: Some(format!("{id}@letters.example")),
        subject: subject.to_string(),
        from_address: "digest@letters.example".to_string(),
        from_name: "Digest".to_string(),
        date: Some(date),
        text_body: Some(body.to_string()),
        html_body: None,
    }
}

pub fn api_source(name: &str) -> SourceConfig {
    SourceConfig::new(
        name,
        SourceSettings::Api(ApiSourceSettings {
            sources: vec!["techcrunch".into()],
            query: None,
            language: None,
            category: None,
            page_size: 20,
        }),
    )
}

pub fn fast_settings() -> AnalysisSettings {
    AnalysisSettings {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        call_timeout: Duration::from_secs(5),
        reader_language: "ja".to_string(),
        ..AnalysisSettings::default()
    }
}

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub api: Arc<ScriptedAdapter>,
    pub site: Arc<ScriptedAdapter>,
    pub llm: Arc<ScriptedLlm>,
    pub aggregator: NewsAggregator,
}

pub fn harness(api: ScriptedAdapter, site: ScriptedAdapter, mailbox: FakeMailbox, llm: ScriptedLlm) -> Harness {
    init_tracing();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let api = Arc::new(api);
    let site = Arc::new(site);
    let llm = Arc::new(llm);
    let fetcher = Arc::new(Fetcher::new(FetchConfig::default()).expect("http client"));
    let aggregator = NewsAggregator::new(Components {
        store: store.clone(),
        api: api.clone(),
        site: site.clone(),
        mailbox: Arc::new(EmailIngester::new(Arc::new(mailbox))),
        llm: llm.clone(),
        site_analyzer: SiteAnalyzer::new(fetcher),
        analysis: fast_settings(),
        news_api: NewsApiConfig::default(),
        fetch_workers: 4,
    });
    Harness {
        store,
        api,
        site,
        llm,
        aggregator,
    }
}

pub fn default_harness() -> Harness {
    harness(
        ScriptedAdapter::empty(SourceKind::Api),
        ScriptedAdapter::empty(SourceKind::Site),
        FakeMailbox::default(),
        ScriptedLlm::always(Ok(SUMMARY_JSON.to_string())),
    )
}
