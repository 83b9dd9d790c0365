use crate::types::{AggregatorError, Result};
use chrono::Utc;
use feed_rs::parser;
use interfaces::RawItem;
use std::collections::HashSet;
use tracing::{debug, info};

/// RSS/Atom parsing into raw items. Entries repeated inside one document
/// (same GUID or link) are collapsed.
pub struct FeedParser;

impl FeedParser {
    pub fn parse_feed(content: &str, source_name: &str) -> Result<Vec<RawItem>> {
        debug!("Parsing feed content ({} bytes)", content.len());

        let feed = parser::parse(content.as_bytes())
            .map_err(|e| AggregatorError::Parse(format!("Failed to parse feed: {}", e)))?;

        let feed_title = feed.title.map(|t| t.content);
        let feed_language = feed.language.clone();
        let name = feed_title.as_deref().unwrap_or(source_name).to_string();

        let mut seen_guids = HashSet::new();
        let mut seen_urls = HashSet::new();
        let mut items = Vec::new();

        for entry in feed.entries {
            if !entry.id.is_empty() && !seen_guids.insert(entry.id.clone()) {
                debug!("Skipping duplicate entry with GUID: {}", entry.id);
                continue;
            }
            let url = entry.links.first().map(|l| l.href.clone());
            if let Some(url) = &url {
                if !seen_urls.insert(url.clone()) {
                    debug!("Skipping duplicate entry with URL: {}", url);
                    continue;
                }
            }

            let description = entry.summary.map(|s| s.content);
            let body = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| description.clone());

            items.push(RawItem {
                title: entry.title.map(|t| t.content).unwrap_or_default(),
                description,
                body,
                url,
                published_at: entry
                    .published
                    .or(entry.updated)
                    .map(|dt| dt.with_timezone(&Utc)),
                source_name: name.clone(),
                language: feed_language.clone(),
                category: None,
                tags: entry.categories.into_iter().map(|c| c.term).collect(),
            });
        }

        info!("Parsed feed '{}' with {} entries", name, items.len());
        Ok(items)
    }

    pub fn is_valid_feed_content(content: &str) -> bool {
        let head: String = content.chars().take(2048).collect::<String>().to_lowercase();
        let has_feed_root = head.contains("<rss")
            || head.contains("<feed")
            || head.contains("<rdf:rdf")
            || head.contains("xmlns=\"http://www.w3.org/2005/atom\"");
        let is_html = head.contains("<html") || head.contains("<!doctype html");
        has_feed_root && !is_html
    }
}
