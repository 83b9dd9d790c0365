use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use interfaces::text::collapse_whitespace;
use interfaces::{AdapterError, RawItem, SiteType, SourceAdapter, SourceConfig, SourceKind};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::fetcher::Fetcher;
use crate::parser::FeedParser;

pub const MAX_ARTICLES_PER_SITE: usize = 5;
pub const MAX_FEED_ITEMS: usize = 20;

const ALWAYS_HIDDEN: &[&str] = &["script", "style", "noscript", "template"];
const PAGE_CHROME: &[&str] = &["script", "style", "noscript", "template", "nav", "header", "footer", "aside", "form"];

const BLOG_LINK_SELECTOR: &str = "article a[href], .post a[href], .entry a[href], h2 a[href], h3 a[href]";
const NEWSLETTER_CONTENT: &[&str] = &["main", ".email-content", ".newsletter-content", "[role=main]", "article", ".content"];
const SUBSTACK_CONTENT: &[&str] = &["div.available-content", "div.body.markup", "article"];
const BLOG_CONTENT: &[&str] = &["article", ".post-content", ".entry-content", "main", ".content"];
const DATE_TEXT: &[&str] = &[".published-date", ".post-date", ".date"];

/// Site variant: landing page or feed, dispatched on `site_type`.
pub struct SiteAdapter {
    fetcher: Arc<Fetcher>,
    max_articles: usize,
}

impl SiteAdapter {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            max_articles: MAX_ARTICLES_PER_SITE,
        }
    }

    pub fn with_max_articles(mut self, max_articles: usize) -> Self {
        self.max_articles = max_articles;
        self
    }

    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
        let page = self
            .fetcher
            .get(url)
            .await
            .map_err(|e| AdapterError::Fetch(format!("{url}: {e}")))?;
        if !page.is_success() {
            return Err(AdapterError::Fetch(format!("{url}: HTTP {}", page.status)));
        }
        Ok(page.body)
    }

    /// Follows article links one by one; a failing article is skipped.
    async fn scrape_linked(&self, links: Vec<String>, layout: SiteType, source_name: &str) -> Vec<RawItem> {
        let mut items = Vec::new();
        for link in links {
            match self.fetch_page(&link).await {
                Ok(html) => match parse_article_page(&html, &link, layout, source_name) {
                    Some(item) => items.push(item),
                    None => debug!("No article content at {}", link),
                },
                Err(e) => warn!("Skipping article {}: {}", link, e),
            }
        }
        items
    }
}

#[async_trait]
impl SourceAdapter for SiteAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Site
    }

    async fn list_raw_items(&self, source: &SourceConfig) -> Result<Vec<RawItem>, AdapterError> {
        let settings = source
            .site()
            .ok_or_else(|| AdapterError::Config(format!("{} is not a site source", source.id)))?;
        let base = Url::parse(&settings.url).map_err(|e| AdapterError::Config(format!("{}: {e}", settings.url)))?;

        if let Some(feed_url) = mailchimp_feed_url(&base) {
            info!("Reading Mailchimp archive '{}' through {}", source.name, feed_url);
            let feed = self.fetch_page(&feed_url).await?;
            return parse_feed_items(&feed, &source.name);
        }

        let landing = self.fetch_page(&settings.url).await?;
        if FeedParser::is_valid_feed_content(&landing) {
            return parse_feed_items(&landing, &source.name);
        }

        let items = match settings.site_type {
            SiteType::Substack => {
                let links = substack_links(&landing, &base, self.max_articles);
                self.scrape_linked(links, SiteType::Substack, &source.name).await
            }
            SiteType::Blog => {
                let links = blog_links(&landing, &base, self.max_articles);
                self.scrape_linked(links, SiteType::Blog, &source.name).await
            }
            layout @ (SiteType::Newsletter | SiteType::Generic) => {
                parse_article_page(&landing, &settings.url, layout, &source.name)
                    .into_iter()
                    .collect()
            }
        };

        info!("Site '{}' ({}) yielded {} items", source.name, settings.site_type, items.len());
        Ok(items)
    }
}

fn parse_feed_items(content: &str, source_name: &str) -> Result<Vec<RawItem>, AdapterError> {
    let mut items = FeedParser::parse_feed(content, source_name)
        .map_err(|e| AdapterError::Fetch(e.to_string()))?;
    items.truncate(MAX_FEED_ITEMS);
    Ok(items)
}

/// Mailchimp campaign archives publish an RSS feed keyed by the same
/// `u`/`id` parameters as the archive page.
pub fn mailchimp_feed_url(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    if !(host.ends_with("campaign-archive.com") || host.ends_with("list-manage.com")) {
        return None;
    }
    let param = |key: &str| url.query_pairs().find(|(k, _)| k == key).map(|(_, v)| v.into_owned());
    let (u, id) = (param("u")?, param("id")?);
    let mut feed = Url::parse(&format!("{}://{}/feed", url.scheme(), host)).ok()?;
    feed.query_pairs_mut().append_pair("u", &u).append_pair("id", &id);
    Some(feed.to_string())
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// Text under `element`, skipping subtrees rooted at any tag in `hidden`.
fn element_text(element: ElementRef<'_>, hidden: &[&str]) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let is_hidden = node
            .ancestors()
            .take_while(|a| a.id() != element.id())
            .chain(std::iter::once(*element))
            .any(|a| a.value().as_element().is_some_and(|e| hidden.contains(&e.name())));
        if !is_hidden {
            out.push_str(text);
            out.push(' ');
        }
    }
    collapse_whitespace(&out)
}

fn first_text(doc: &Html, selectors: &[&str], hidden: &[&str]) -> Option<String> {
    selectors.iter().filter_map(|css| selector(css)).find_map(|sel| {
        doc.select(&sel)
            .map(|el| element_text(el, hidden))
            .find(|text| !text.is_empty())
    })
}

fn meta_content(doc: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    doc.select(&sel)
        .filter_map(|el| el.value().attr("content"))
        .map(collapse_whitespace)
        .find(|c| !c.is_empty())
}

fn collect_links(html: &str, base: &Url, css: &str, keep: impl Fn(&Url) -> bool, limit: usize) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Some(sel) = selector(css) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for href in doc.select(&sel).filter_map(|a| a.value().attr("href")) {
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        if !matches!(resolved.scheme(), "http" | "https") || resolved.host_str() != base.host_str() {
            continue;
        }
        if resolved.path() == base.path() || !keep(&resolved) {
            continue;
        }
        if seen.insert(resolved.to_string()) {
            links.push(resolved.to_string());
            if links.len() == limit {
                break;
            }
        }
    }
    links
}

/// Substack post links: same host, path under `/p/`.
pub fn substack_links(html: &str, base: &Url, limit: usize) -> Vec<String> {
    collect_links(html, base, "a[href]", |url| url.path().starts_with("/p/"), limit)
}

pub fn blog_links(html: &str, base: &Url, limit: usize) -> Vec<String> {
    collect_links(html, base, BLOG_LINK_SELECTOR, |_| true, limit)
}

/// Extracts one article from a page laid out as `layout`. `None` when the
/// page has no readable content.
pub fn parse_article_page(html: &str, url: &str, layout: SiteType, source_name: &str) -> Option<RawItem> {
    let doc = Html::parse_document(html);

    let title_selectors: &[&str] = match layout {
        SiteType::Substack => &["h1.post-title", "h1"],
        _ => &["h1"],
    };
    let title = first_text(&doc, title_selectors, ALWAYS_HIDDEN)
        .or_else(|| meta_content(&doc, "meta[property='og:title']"))
        .or_else(|| first_text(&doc, &["title"], &[]))
        .unwrap_or_default();

    let body = match layout {
        SiteType::Substack => first_text(&doc, SUBSTACK_CONTENT, ALWAYS_HIDDEN),
        SiteType::Blog => first_text(&doc, BLOG_CONTENT, ALWAYS_HIDDEN),
        SiteType::Newsletter => first_text(&doc, NEWSLETTER_CONTENT, ALWAYS_HIDDEN),
        SiteType::Generic => None,
    }
    .or_else(|| first_text(&doc, &["body"], PAGE_CHROME))?;

    let description = meta_content(&doc, "meta[name='description']")
        .or_else(|| meta_content(&doc, "meta[property='og:description']"));

    let tags = selector("meta[property='article:tag']")
        .map(|sel| {
            doc.select(&sel)
                .filter_map(|el| el.value().attr("content"))
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Some(RawItem {
        title,
        description,
        body: Some(body),
        url: Some(url.to_string()),
        published_at: extract_published(&doc),
        source_name: source_name.to_string(),
        language: None,
        category: None,
        tags,
    })
}

pub fn extract_published(doc: &Html) -> Option<DateTime<Utc>> {
    let from_time = selector("time[datetime]").and_then(|sel| {
        doc.select(&sel)
            .filter_map(|el| el.value().attr("datetime"))
            .find_map(parse_date)
    });
    from_time
        .or_else(|| meta_content(doc, "meta[property='article:published_time']").as_deref().and_then(parse_date))
        .or_else(|| {
            DATE_TEXT.iter().filter_map(|css| selector(css)).find_map(|sel| {
                doc.select(&sel)
                    .map(|el| element_text(el, ALWAYS_HIDDEN))
                    .find_map(|text| parse_date(&text))
            })
        })
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d", "%B %d, %Y", "%b %d, %Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
