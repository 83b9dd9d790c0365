use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use interfaces::text::{self, NEWSLETTER_CATEGORIES};
use interfaces::{AdapterError, MailboxSourceSettings, RawItem, SourceAdapter, SourceConfig, SourceKind};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::query::{MailQuery, MessageView};

const MAX_BODY_CHARS: usize = 5000;
const DESCRIPTION_CHARS: usize = 500;
const MAX_TAGS: usize = 10;

#[derive(Clone)]
pub struct EmailIngesterConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    pub use_tls: bool,
    pub starttls: bool,
    pub accept_invalid_certs: bool,
    pub accept_invalid_hostnames: bool,
    pub timeout: Duration,
}

impl fmt::Debug for EmailIngesterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailIngesterConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mailbox", &self.mailbox)
            .field("use_tls", &self.use_tls)
            .field("starttls", &self.starttls)
            .finish()
    }
}

impl EmailIngesterConfig {
    /// Parse connection settings from a URI plus credentials.
    /// Expected URI format: email://username@server:port/mailbox?tls=true
    ///
    /// `tls=false` connects in plain text unless `starttls=true` is also set.
    /// A username in the URI wins over the one passed in.
    pub fn from_uri_and_credentials(
        uri: &str,
        username: Option<&str>,
        password: &str,
    ) -> anyhow::Result<Self> {
        let parsed_uri = Url::parse(uri)
            .map_err(|e| anyhow::anyhow!("Invalid email URI '{}': {}", uri, e))?;

        if parsed_uri.scheme() != "email" {
            return Err(anyhow::anyhow!(
                "URI must use 'email://' scheme, got: {}",
                parsed_uri.scheme()
            ));
        }

        let server = parsed_uri
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("No server specified in URI: {}", uri))?
            .to_string();

        let username = match parsed_uri.username() {
            "" => username
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("No username in URI or credentials"))?,
            user => user.to_string(),
        };

        let mailbox = match parsed_uri.path().trim_start_matches('/') {
            "" => "INBOX".to_string(),
            path => path.to_string(),
        };

        let flag = |key: &str, default: bool| {
            parsed_uri
                .query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, value)| value.parse().unwrap_or(default))
                .unwrap_or(default)
        };
        let use_tls = flag("tls", true);
        let default_port = if use_tls { 993 } else { 143 };

        Ok(Self {
            server,
            port: parsed_uri.port().unwrap_or(default_port),
            username,
            password: password.to_string(),
            mailbox,
            use_tls,
            starttls: flag("starttls", false),
            // Only meant for local test servers.
            accept_invalid_certs: flag("accept_invalid_certs", false),
            accept_invalid_hostnames: flag("accept_invalid_hostnames", false),
            timeout: Duration::from_secs(60),
        })
    }
}

/// A parsed message, reduced to the fields ingestion uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailMessage {
    pub uid: Option<u32>,
    pub message_id: Option<String>,
    pub subject: String,
    pub from_address: String,
    pub from_name: String,
    pub date: Option<DateTime<Utc>>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
}

impl MailMessage {
    pub fn parse(raw: &[u8], uid: Option<u32>) -> Option<Self> {
        let parsed = mail_parser::MessageParser::default().parse(raw)?;

        let sender = parsed.from().and_then(|addrs| addrs.first());
        let from_address = sender
            .and_then(|addr| addr.address.as_ref())
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let from_name = sender
            .and_then(|addr| addr.name.as_ref())
            .map(|name| name.to_string())
            .unwrap_or_default();

        Some(Self {
            uid,
            message_id: parsed.message_id().map(str::to_string),
            subject: parsed.subject().unwrap_or_default().to_string(),
            from_address,
            from_name,
            date: parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
            text_body: parsed.body_text(0).map(|b| b.into_owned()),
            html_body: parsed.body_html(0).map(|b| b.into_owned()),
        })
    }

    /// Plain text part when present, otherwise the HTML part stripped.
    pub fn body(&self) -> String {
        match (&self.text_body, &self.html_body) {
            (Some(text_part), _) if !text_part.trim().is_empty() => text::plain_text(text_part),
            (_, Some(html)) => text::html_to_text(html),
            _ => String::new(),
        }
    }

    pub fn view<'a>(&'a self, body: &'a str) -> MessageView<'a> {
        MessageView {
            from_address: &self.from_address,
            from_name: &self.from_name,
            subject: &self.subject,
            body,
            date: self.date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub username: String,
    pub mailbox: String,
    pub messages: u32,
}

/// Transport to a mailbox. The IMAP implementation is the production one.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn search(&self, query: &MailQuery) -> Result<Vec<MailMessage>, AdapterError>;
    async fn test_connection(&self) -> Result<ConnectionReport, AdapterError>;
}

pub struct ImapConnector {
    config: Option<EmailIngesterConfig>,
}

impl ImapConnector {
    pub fn new(config: Option<EmailIngesterConfig>) -> Self {
        Self { config }
    }

    fn config(&self) -> Result<EmailIngesterConfig, AdapterError> {
        self.config
            .clone()
            .ok_or_else(|| AdapterError::Auth("mailbox credentials are not configured".to_string()))
    }

    async fn run_blocking<T, F>(&self, work: F) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(EmailIngesterConfig) -> Result<T, AdapterError> + Send + 'static,
    {
        let config = self.config()?;
        let timeout = config.timeout;
        let task = tokio::task::spawn_blocking(move || work(config));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AdapterError::Fetch(format!("IMAP task failed: {join_error}"))),
            Err(_) => Err(AdapterError::Fetch(format!("IMAP session timed out after {timeout:?}"))),
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn search(&self, query: &MailQuery) -> Result<Vec<MailMessage>, AdapterError> {
        let criteria = query.to_imap_search();
        // Over-fetch so the local post-filter can still fill the cap.
        let candidates = query.limit.saturating_mul(2);
        self.run_blocking(move |config| {
            if config.use_tls || config.starttls {
                let session = login(connect_tls(&config)?, &config)?;
                search_session(session, &config, &criteria, candidates)
            } else {
                let session = login(connect_plain(&config)?, &config)?;
                search_session(session, &config, &criteria, candidates)
            }
        })
        .await
    }

    async fn test_connection(&self) -> Result<ConnectionReport, AdapterError> {
        self.run_blocking(|config| {
            if config.use_tls || config.starttls {
                inspect_session(login(connect_tls(&config)?, &config)?, &config)
            } else {
                inspect_session(login(connect_plain(&config)?, &config)?, &config)
            }
        })
        .await
    }
}

fn fetch_error(context: &str) -> impl Fn(imap::Error) -> AdapterError + '_ {
    move |e| AdapterError::Fetch(format!("{context}: {e}"))
}

fn connect_tls(
    config: &EmailIngesterConfig,
) -> Result<imap::Client<native_tls::TlsStream<TcpStream>>, AdapterError> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .danger_accept_invalid_hostnames(config.accept_invalid_hostnames)
        .build()
        .map_err(|e| AdapterError::Config(format!("TLS setup failed: {e}")))?;

    let address = (config.server.as_str(), config.port);
    let client = if config.starttls {
        imap::connect_starttls(address, &config.server, &tls)
    } else {
        imap::connect(address, &config.server, &tls)
    };
    client.map_err(fetch_error("connect"))
}

fn connect_plain(config: &EmailIngesterConfig) -> Result<imap::Client<TcpStream>, AdapterError> {
    let stream = TcpStream::connect((config.server.as_str(), config.port))
        .map_err(|e| AdapterError::Fetch(format!("connect: {e}")))?;
    let mut client = imap::Client::new(stream);
    client.read_greeting().map_err(fetch_error("greeting"))?;
    Ok(client)
}

fn login<T: Read + Write>(
    client: imap::Client<T>,
    config: &EmailIngesterConfig,
) -> Result<imap::Session<T>, AdapterError> {
    client
        .login(&config.username, &config.password)
        .map_err(|(e, _)| AdapterError::Auth(format!("login rejected for {}: {e}", config.username)))
}

fn search_session<T: Read + Write>(
    mut session: imap::Session<T>,
    config: &EmailIngesterConfig,
    criteria: &str,
    candidates: usize,
) -> Result<Vec<MailMessage>, AdapterError> {
    session.select(&config.mailbox).map_err(fetch_error("select"))?;

    let mut uids: Vec<u32> = session
        .uid_search(criteria)
        .map_err(fetch_error("search"))?
        .into_iter()
        .collect();
    // Highest UID is the most recent delivery.
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids.truncate(candidates);
    debug!("IMAP search '{}' matched {} candidates", criteria, uids.len());

    let mut messages = Vec::with_capacity(uids.len());
    if !uids.is_empty() {
        let sequence_set = uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        let fetches = session
            .uid_fetch(&sequence_set, "RFC822")
            .map_err(fetch_error("fetch"))?;
        for fetch in fetches.iter() {
            match fetch.body().and_then(|body| MailMessage::parse(body, fetch.uid)) {
                Some(message) => messages.push(message),
                None => warn!("Skipping unparsable message uid={:?}", fetch.uid),
            }
        }
    }

    if let Err(e) = session.logout() {
        debug!("IMAP logout failed: {}", e);
    }
    Ok(messages)
}

fn inspect_session<T: Read + Write>(
    mut session: imap::Session<T>,
    config: &EmailIngesterConfig,
) -> Result<ConnectionReport, AdapterError> {
    let mailbox = session.select(&config.mailbox).map_err(fetch_error("select"))?;
    if let Err(e) = session.logout() {
        debug!("IMAP logout failed: {}", e);
    }
    Ok(ConnectionReport {
        username: config.username.clone(),
        mailbox: config.mailbox.clone(),
        messages: mailbox.exists,
    })
}

/// Mailbox variant of the source adapter.
pub struct EmailIngester {
    connector: Arc<dyn MailboxConnector>,
}

impl EmailIngester {
    pub fn new(connector: Arc<dyn MailboxConnector>) -> Self {
        Self { connector }
    }

    pub fn with_config(config: Option<EmailIngesterConfig>) -> Self {
        Self::new(Arc::new(ImapConnector::new(config)))
    }

    pub async fn test_connection(&self) -> Result<ConnectionReport, AdapterError> {
        self.connector.test_connection().await
    }
}

#[async_trait]
impl SourceAdapter for EmailIngester {
    fn kind(&self) -> SourceKind {
        SourceKind::Mailbox
    }

    async fn list_raw_items(&self, source: &SourceConfig) -> Result<Vec<RawItem>, AdapterError> {
        let settings = source
            .mailbox()
            .ok_or_else(|| AdapterError::Config(format!("{} is not a mailbox source", source.id)))?;
        let query = MailQuery::from_settings(settings, Utc::now());
        info!("Searching mailbox for '{}': {}", source.name, query);

        let mut messages = self.connector.search(&query).await?;
        messages.sort_by(|a, b| b.date.cmp(&a.date));

        let mut items = Vec::new();
        for message in &messages {
            let body = message.body();
            if !query.matches(&message.view(&body)) {
                debug!("Filtered out '{}' from {}", message.subject, message.from_address);
                continue;
            }
            items.push(message_to_raw_item(message, body, settings, &source.name));
            if items.len() == query.limit {
                break;
            }
        }

        info!(
            "Mailbox '{}': {} messages found, {} matched",
            source.name,
            messages.len(),
            items.len()
        );
        Ok(items)
    }
}

pub fn message_to_raw_item(
    message: &MailMessage,
    body: String,
    settings: &MailboxSourceSettings,
    source_name: &str,
) -> RawItem {
    let body = text::truncate_chars(&body, MAX_BODY_CHARS).to_string();
    let haystack = format!("{} {}", message.subject, body);

    // A generic "newsletter" label is refined from the content.
    let category = if settings.category == "newsletter" {
        text::first_matching_category(&haystack, NEWSLETTER_CATEGORIES).map(str::to_string)
    } else {
        None
    };

    let detected = text::tech_tags(&haystack);
    let tags = text::merge_tags(
        settings.tags
            .iter()
            .map(String::as_str)
            .chain(detected.iter().map(String::as_str))
            .chain(["newsletter", "email"]),
        MAX_TAGS,
    );

    let title = match message.subject.trim() {
        "" => "(No Subject)".to_string(),
        subject => subject.to_string(),
    };

    RawItem {
        title,
        description: Some(text::excerpt(&body, DESCRIPTION_CHARS)),
        url: message
            .message_id
            .as_ref()
            .map(|id| format!("mid:{}", id.trim_matches(['<', '>']))),
        published_at: message.date,
        source_name: source_name.to_string(),
        language: None,
        category,
        tags,
        body: Some(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uri_with_defaults() {
        let config = EmailIngesterConfig::from_uri_and_credentials(
            "email://reader@imap.example.com/INBOX",
            None,
            "secret",
        )
        .unwrap();
        assert_eq!(config.server, "imap.example.com");
        assert_eq!(config.port, 993);
        assert_eq!(config.username, "reader");
        assert_eq!(config.mailbox, "INBOX");
        assert!(config.use_tls);
        assert!(!config.accept_invalid_certs);
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn plain_uri_uses_imap_port() {
        let config = EmailIngesterConfig::from_uri_and_credentials(
            "email://localhost/Newsletters?tls=false",
            Some("test"),
            "pw",
        )
        .unwrap();
        assert_eq!(config.port, 143);
        assert_eq!(config.username, "test");
        assert_eq!(config.mailbox, "Newsletters");
        assert!(!config.use_tls);
        assert!(!config.starttls);
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(EmailIngesterConfig::from_uri_and_credentials("imap://h/INBOX", Some("u"), "p").is_err());
    }

    #[test]
    fn parses_rfc822() {
        let raw = b"From: AI News <news@x.com>\r\n\
Subject: AI Weekly Update\r\n\
Message-ID: <abc123@x.com>\r\n\
Date: Mon, 12 Oct 2026 09:00:00 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
Large language models keep improving.\r\n";
        let message = MailMessage::parse(raw, Some(7)).unwrap();
        assert_eq!(message.subject, "AI Weekly Update");
        assert_eq!(message.from_address, "news@x.com");
        assert_eq!(message.from_name, "AI News");
        assert_eq!(message.message_id.as_deref(), Some("abc123@x.com"));
        assert!(message.date.is_some());
        assert_eq!(message.body(), "Large language models keep improving.");
    }

    #[tokio::test]
    async fn missing_credentials_are_an_auth_error() {
        let connector = ImapConnector::new(None);
        assert!(matches!(
            connector.test_connection().await,
            Err(AdapterError::Auth(_))
        ));
    }
}
