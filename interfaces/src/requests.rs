//! Create/update payloads for site and mailbox sources.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::defs::{
    DEFAULT_FETCH_INTERVAL_HOURS, MailboxSourceSettings, SiteSourceSettings, SiteType, SourceConfig,
    SourceSettings, ValidationError,
};

fn default_true() -> bool {
    true
}

fn default_interval() -> u32 {
    DEFAULT_FETCH_INTERVAL_HOURS
}

fn default_language() -> String {
    "en".to_string()
}

fn default_site_category() -> String {
    "technology".to_string()
}

fn default_mailbox_category() -> String {
    "newsletter".to_string()
}

fn default_max_emails() -> u32 {
    10
}

fn default_days_back() -> u32 {
    7
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn clean_optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSiteSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub site_type: SiteType,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_site_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub fetch_interval_hours: u32,
}

impl NewSiteSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            site_type: SiteType::default(),
            language: default_language(),
            category: default_site_category(),
            tags: Vec::new(),
            enabled: true,
            fetch_interval_hours: DEFAULT_FETCH_INTERVAL_HOURS,
        }
    }

    pub fn into_config(self) -> Result<SourceConfig, ValidationError> {
        let mut config = SourceConfig::new(
            self.name.trim(),
            SourceSettings::Site(SiteSourceSettings {
                url: self.url.trim().to_string(),
                site_type: self.site_type,
                language: self.language,
                category: self.category,
                tags: clean_list(self.tags),
            }),
        );
        config.enabled = self.enabled;
        config.fetch_interval_hours = self.fetch_interval_hours;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteSourceUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub site_type: Option<SiteType>,
    pub language: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub fetch_interval_hours: Option<u32>,
}

impl SiteSourceUpdate {
    /// Applies the patch to a copy and validates it before returning.
    pub fn apply(self, source: &SourceConfig) -> Result<SourceConfig, ValidationError> {
        let mut updated = source.clone();
        let SourceSettings::Site(site) = &mut updated.settings else {
            return Err(ValidationError::Invalid {
                field: "source",
                reason: format!("{} is not a site source", source.id),
            });
        };
        if let Some(url) = self.url {
            site.url = url.trim().to_string();
        }
        if let Some(site_type) = self.site_type {
            site.site_type = site_type;
        }
        if let Some(language) = self.language {
            site.language = language;
        }
        if let Some(category) = self.category {
            site.category = category;
        }
        if let Some(tags) = self.tags {
            site.tags = clean_list(tags);
        }
        apply_base(&mut updated, self.name, self.enabled, self.fetch_interval_hours);
        updated.validate()?;
        Ok(updated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMailboxSource {
    pub name: String,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub subject_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default = "default_mailbox_category")]
    pub category: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_max_emails")]
    pub max_emails_per_fetch: u32,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval")]
    pub fetch_interval_hours: u32,
}

impl NewMailboxSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sender_email: None,
            sender_name: None,
            subject_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            category: default_mailbox_category(),
            language: default_language(),
            tags: Vec::new(),
            max_emails_per_fetch: default_max_emails(),
            days_back: default_days_back(),
            enabled: true,
            fetch_interval_hours: DEFAULT_FETCH_INTERVAL_HOURS,
        }
    }

    pub fn into_config(self) -> Result<SourceConfig, ValidationError> {
        let mut config = SourceConfig::new(
            self.name.trim(),
            SourceSettings::Mailbox(MailboxSourceSettings {
                sender_email: clean_optional(self.sender_email),
                sender_name: clean_optional(self.sender_name),
                subject_keywords: clean_list(self.subject_keywords),
                exclude_keywords: clean_list(self.exclude_keywords),
                category: self.category,
                language: self.language,
                tags: clean_list(self.tags),
                max_emails_per_fetch: self.max_emails_per_fetch,
                days_back: self.days_back,
                total_emails_processed: 0,
            }),
        );
        config.enabled = self.enabled;
        config.fetch_interval_hours = self.fetch_interval_hours;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailboxSourceUpdate {
    pub name: Option<String>,
    /// `Some(None)` clears the sender filter.
    pub sender_email: Option<Option<String>>,
    pub sender_name: Option<Option<String>>,
    pub subject_keywords: Option<Vec<String>>,
    pub exclude_keywords: Option<Vec<String>>,
    pub category: Option<String>,
    pub language: Option<String>,
    pub tags: Option<Vec<String>>,
    pub max_emails_per_fetch: Option<u32>,
    pub days_back: Option<u32>,
    pub enabled: Option<bool>,
    pub fetch_interval_hours: Option<u32>,
}

impl MailboxSourceUpdate {
    pub fn apply(self, source: &SourceConfig) -> Result<SourceConfig, ValidationError> {
        let mut updated = source.clone();
        let SourceSettings::Mailbox(mailbox) = &mut updated.settings else {
            return Err(ValidationError::Invalid {
                field: "source",
                reason: format!("{} is not a mailbox source", source.id),
            });
        };
        if let Some(sender_email) = self.sender_email {
            mailbox.sender_email = clean_optional(sender_email);
        }
        if let Some(sender_name) = self.sender_name {
            mailbox.sender_name = clean_optional(sender_name);
        }
        if let Some(keywords) = self.subject_keywords {
            mailbox.subject_keywords = clean_list(keywords);
        }
        if let Some(keywords) = self.exclude_keywords {
            mailbox.exclude_keywords = clean_list(keywords);
        }
        if let Some(category) = self.category {
            mailbox.category = category;
        }
        if let Some(language) = self.language {
            mailbox.language = language;
        }
        if let Some(tags) = self.tags {
            mailbox.tags = clean_list(tags);
        }
        if let Some(max) = self.max_emails_per_fetch {
            mailbox.max_emails_per_fetch = max;
        }
        if let Some(days) = self.days_back {
            mailbox.days_back = days;
        }
        apply_base(&mut updated, self.name, self.enabled, self.fetch_interval_hours);
        updated.validate()?;
        Ok(updated)
    }
}

fn apply_base(
    source: &mut SourceConfig,
    name: Option<String>,
    enabled: Option<bool>,
    fetch_interval_hours: Option<u32>,
) {
    if let Some(name) = name {
        source.name = name.trim().to_string();
    }
    if let Some(enabled) = enabled {
        source.enabled = enabled;
    }
    if let Some(hours) = fetch_interval_hours {
        source.fetch_interval_hours = hours;
    }
    source.updated_at = Utc::now();
}
