//! Mailbox search expressions built from a mailbox source's filters.
//!
//! The same filter is rendered to an IMAP SEARCH string for the server and
//! evaluated locally against fetched messages, since servers disagree on
//! SEARCH semantics (substring vs. word matching, header folding).

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use interfaces::MailboxSourceSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailQuery {
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    /// Any one of these must appear in the subject.
    pub subject_any: Vec<String>,
    /// None of these may appear in the subject or body.
    pub exclude_any: Vec<String>,
    pub since: NaiveDate,
    pub limit: usize,
}

/// The parts of a message the query looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageView<'a> {
    pub from_address: &'a str,
    pub from_name: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub date: Option<DateTime<Utc>>,
}

impl MailQuery {
    pub fn from_settings(settings: &MailboxSourceSettings, now: DateTime<Utc>) -> Self {
        Self {
            sender_email: settings.sender_email.clone(),
            sender_name: settings.sender_name.clone(),
            subject_any: settings.subject_keywords.clone(),
            exclude_any: settings.exclude_keywords.clone(),
            since: (now - Duration::days(settings.days_back.into())).date_naive(),
            limit: settings.max_emails_per_fetch as usize,
        }
    }

    /// IMAP SEARCH criteria (RFC 3501 section 6.4.4).
    pub fn to_imap_search(&self) -> String {
        let mut terms = Vec::new();
        if let Some(email) = &self.sender_email {
            terms.push(format!("FROM {}", quote(email)));
        }
        if let Some(name) = &self.sender_name {
            terms.push(format!("FROM {}", quote(name)));
        }
        if let Some(any) = or_chain("SUBJECT", &self.subject_any) {
            terms.push(any);
        }
        for keyword in &self.exclude_any {
            terms.push(format!("NOT TEXT {}", quote(keyword)));
        }
        terms.push(format!("SINCE {}", self.since.format("%d-%b-%Y")));
        terms.join(" ")
    }

    pub fn matches(&self, message: &MessageView<'_>) -> bool {
        let from_address = message.from_address.to_lowercase();
        let from_name = message.from_name.to_lowercase();
        let subject = message.subject.to_lowercase();

        if let Some(email) = &self.sender_email {
            if !from_address.contains(&email.to_lowercase()) {
                return false;
            }
        }
        if let Some(name) = &self.sender_name {
            let name = name.to_lowercase();
            if !from_name.contains(&name) && !from_address.contains(&name) {
                return false;
            }
        }
        if !self.subject_any.is_empty()
            && !self
                .subject_any
                .iter()
                .any(|kw| subject.contains(&kw.to_lowercase()))
        {
            return false;
        }
        if !self.exclude_any.is_empty() {
            let body = message.body.to_lowercase();
            if self.exclude_any.iter().any(|kw| {
                let kw = kw.to_lowercase();
                subject.contains(&kw) || body.contains(&kw)
            }) {
                return false;
            }
        }
        match message.date {
            Some(date) => date.date_naive() >= self.since,
            None => true,
        }
    }
}

impl fmt::Display for MailQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_imap_search())
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `OR` is binary and prefix in IMAP, so n alternatives nest n-1 times.
fn or_chain(key: &str, values: &[String]) -> Option<String> {
    let (last, rest) = values.split_last()?;
    let mut expr = format!("{key} {}", quote(last));
    for value in rest.iter().rev() {
        expr = format!("OR {key} {} {expr}", quote(value));
    }
    Some(expr)
}
