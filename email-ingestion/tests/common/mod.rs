#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use email_ingestion::{ConnectionReport, MailMessage, MailQuery, MailboxConnector};
use interfaces::{AdapterError, NewMailboxSource, SourceConfig};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Test configuration constants
pub const GREENMAIL_IMAP_URI: &str = "email://test@localhost:3143/INBOX?tls=false";
pub const GREENMAIL_IMAPS_URI: &str =
    "email://test@localhost:3993/INBOX?tls=true&accept_invalid_certs=true&accept_invalid_hostnames=true";

/// In-memory mailbox: returns every stored message regardless of the
/// server-side criteria, so the adapter's own filtering is what's tested.
#[derive(Default)]
pub struct FakeMailbox {
    pub messages: Vec<MailMessage>,
    pub fail_with: Option<AdapterError>,
    pub searches: AtomicUsize,
    pub last_criteria: Mutex<Option<String>>,
}

impl FakeMailbox {
    pub fn with_messages(messages: Vec<MailMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn failing(error: AdapterError) -> Self {
        Self {
            fail_with: Some(error),
            ..Default::default()
        }
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxConnector for FakeMailbox {
    async fn search(&self, query: &MailQuery) -> Result<Vec<MailMessage>, AdapterError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        *self.last_criteria.lock().unwrap() = Some(query.to_imap_search());
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

pub fn message(id: &str, from: &str, subject: &str, body: &str, date: DateTime<Utc>) -> MailMessage {
    MailMessage {
        uid: None,
        message_id: Some(format!("{id}@x.com")),
        subject: subject.to_string(),
        from_address: from.to_string(),
        from_name: String::new(),
        date: Some(date),
        text_body: Some(body.to_string()),
        html_body: None,
    }
}

pub fn ai_weekly_source() -> SourceConfig {
    let mut new = NewMailboxSource::new("AI Weekly");
    new.sender_email = Some("news@x.com".into());
    new.subject_keywords = vec!["AI".into(), "Weekly".into()];
    new.exclude_keywords = vec!["unsubscribe".into()];
    new.into_config().expect("valid mailbox source")
}
