use std::sync::Arc;

use interfaces::text::{self, SITE_CATEGORIES};
use interfaces::{NewSiteSource, SiteType};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::fetcher::Fetcher;
use crate::normalizer::detect_language;

const SUPPORTED_LANGUAGES: [&str; 3] = ["en", "ja", "zh"];
const NEWSLETTER_MARKERS: [&str; 6] = ["newsletter", "subscribe", "unsubscribe", "email", "weekly", "monthly"];
const TITLE_SEPARATORS: [&str; 4] = [" - ", " | ", " – ", " — "];
const MAX_NAME_CHARS: usize = 50;
const MAX_TAGS: usize = 10;
const DEFAULT_CATEGORY: &str = "technology";

/// Metadata guessed from a landing page, used to prefill a new site source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSuggestion {
    pub name: String,
    pub site_type: SiteType,
    pub language: String,
    pub category: String,
    pub tags: Vec<String>,
    pub description: Option<String>,
}

impl SiteSuggestion {
    /// Defaults derived from the URL alone.
    pub fn fallback(url: &str) -> Self {
        let name = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(name_from_domain))
            .unwrap_or_else(|| "Unknown Site".to_string());
        Self {
            name,
            site_type: SiteType::Generic,
            language: "en".to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            tags: Vec::new(),
            description: None,
        }
    }

    pub fn into_new_source(self, url: impl Into<String>) -> NewSiteSource {
        let mut source = NewSiteSource::new(self.name, url);
        source.site_type = self.site_type;
        source.language = self.language;
        source.category = self.category;
        source.tags = self.tags;
        source
    }
}

pub struct SiteAnalyzer {
    fetcher: Arc<Fetcher>,
}

impl SiteAnalyzer {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }

    /// Never fails and makes a single request: any fetch problem degrades to
    /// [`SiteSuggestion::fallback`].
    pub async fn analyze(&self, url: &str) -> SiteSuggestion {
        let Ok(parsed) = Url::parse(url) else {
            return SiteSuggestion::fallback(url);
        };
        match self.fetcher.get_once(url).await {
            Ok(page) if page.is_success() => {
                let suggestion = analyze_html(&parsed, &page.body);
                info!("Analyzed {} as '{}' ({})", url, suggestion.name, suggestion.site_type);
                suggestion
            }
            Ok(page) => {
                warn!("Site analysis of {} got HTTP {}", url, page.status);
                SiteSuggestion::fallback(url)
            }
            Err(e) => {
                warn!("Site analysis of {} failed: {}", url, e);
                SiteSuggestion::fallback(url)
            }
        }
    }
}

pub fn analyze_html(url: &Url, html: &str) -> SiteSuggestion {
    let doc = Html::parse_document(html);
    let page_text = text::html_to_text(html);
    let lower = page_text.to_lowercase();

    let site_type = detect_site_type(url, &doc, &lower);

    let category = text::best_scoring_category(&page_text, SITE_CATEGORIES)
        .map(str::to_string)
        .or_else(|| meta(&doc, "meta[name='category']").map(|c| c.to_lowercase()))
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

    let keywords: Vec<String> = meta(&doc, "meta[name='keywords']")
        .map(|k| k.split(',').take(MAX_TAGS).map(str::to_string).collect())
        .unwrap_or_default();
    let article_tags = attr_values(&doc, "meta[property='article:tag']", "content");
    let tags = text::merge_tags(
        keywords
            .into_iter()
            .chain(article_tags)
            .chain(std::iter::once(site_type.to_string()))
            .chain(text::tech_tags(&page_text)),
        MAX_TAGS,
    );

    SiteSuggestion {
        name: site_name(&doc, url),
        site_type,
        language: detect_page_language(&doc),
        category,
        tags,
        description: description(&doc),
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn attr_values(doc: &Html, css: &str, attr: &str) -> Vec<String> {
    let Some(sel) = selector(css) else {
        return Vec::new();
    };
    doc.select(&sel)
        .filter_map(|el| el.value().attr(attr))
        .map(text::collapse_whitespace)
        .filter(|v| !v.is_empty())
        .collect()
}

fn meta(doc: &Html, css: &str) -> Option<String> {
    attr_values(doc, css, "content").into_iter().next()
}

fn first_text(doc: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    doc.select(&sel)
        .map(|el| text::collapse_whitespace(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

fn is_mailchimp(url: &Url) -> bool {
    url.host_str().is_some_and(|h| {
        h.ends_with("campaign-archive.com") || h.ends_with("list-manage.com") || h.ends_with("mailchi.mp")
    })
}

fn site_name(doc: &Html, url: &Url) -> String {
    if let Some(name) = meta(doc, "meta[property='og:site_name']") {
        return name;
    }
    if let Some(title) = first_text(doc, "title") {
        if let Some(sep) = TITLE_SEPARATORS.iter().find(|sep| title.contains(**sep)) {
            if let Some(last) = title.rsplit(sep).next().map(str::trim).filter(|s| !s.is_empty()) {
                return last.to_string();
            }
        }
        if title.chars().count() <= MAX_NAME_CHARS {
            return title;
        }
    }
    if let Some(h1) = first_text(doc, "h1").filter(|h| h.chars().count() <= MAX_NAME_CHARS) {
        return h1;
    }
    url.host_str()
        .map(name_from_domain)
        .unwrap_or_else(|| "Unknown Site".to_string())
}

/// "www.deep-learning.ai" -> "Deep Learning".
fn name_from_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    let main = match labels.len() {
        0 => host,
        1 => labels[0],
        n => labels[n - 2],
    };
    main.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn detect_site_type(url: &Url, doc: &Html, lower_text: &str) -> SiteType {
    let host = url.host_str().unwrap_or_default();
    let full = url.as_str().to_lowercase();
    if host.ends_with("substack.com") {
        return SiteType::Substack;
    }
    if is_mailchimp(url) {
        return SiteType::Newsletter;
    }
    if host.ends_with("medium.com") || full.contains("blog") {
        return SiteType::Blog;
    }

    let markers = NEWSLETTER_MARKERS.iter().filter(|m| lower_text.contains(**m)).count();
    if markers >= 3 {
        return SiteType::Newsletter;
    }

    let has_posts = ["article", "[class*=post]", "[class*=article]", "[class*=entry]"]
        .iter()
        .filter_map(|css| selector(css))
        .any(|sel| doc.select(&sel).next().is_some());
    let has_rss = selector("link[type='application/rss+xml']").is_some_and(|sel| doc.select(&sel).next().is_some());
    if has_posts || has_rss {
        SiteType::Blog
    } else {
        SiteType::Generic
    }
}

fn detect_page_language(doc: &Html) -> String {
    let supported = |raw: &str| text::language_tag(raw).filter(|l| SUPPORTED_LANGUAGES.contains(&l.as_str()));
    let declared = attr_values(doc, "html[lang]", "lang")
        .first()
        .and_then(|l| supported(l.as_str()))
        .or_else(|| meta(doc, "meta[http-equiv='content-language']").and_then(|l| supported(l.as_str())));
    if let Some(lang) = declared {
        return lang;
    }

    let mut sample = first_text(doc, "title").unwrap_or_default();
    if let Some(sel) = selector("p") {
        for p in doc.select(&sel).take(5) {
            sample.push(' ');
            sample.push_str(&p.text().collect::<String>());
        }
    }
    match detect_language(&sample) {
        lang @ ("ja" | "zh") => lang.to_string(),
        _ => "en".to_string(),
    }
}

fn description(doc: &Html) -> Option<String> {
    meta(doc, "meta[property='og:description']")
        .or_else(|| meta(doc, "meta[name='description']"))
        .or_else(|| {
            first_text(doc, "p").filter(|p| {
                let len = p.chars().count();
                len > 50 && len < 500
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_names() {
        assert_eq!(name_from_domain("www.deep-learning.ai"), "Deep Learning");
        assert_eq!(name_from_domain("tldr.tech"), "Tldr");
        assert_eq!(name_from_domain("localhost"), "Localhost");
    }

    #[test]
    fn fallback_uses_domain() {
        let s = SiteSuggestion::fallback("https://qosmo.jp/");
        assert_eq!(s.name, "Qosmo");
        assert_eq!(s.site_type, SiteType::Generic);
        assert_eq!(s.language, "en");
        assert_eq!(s.category, "technology");
    }

    #[test]
    fn substack_host_wins() {
        let url = Url::parse("https://weeklykagglenews.substack.com/").unwrap();
        let s = analyze_html(&url, "<html><head><title>Weekly Kaggle News</title></head><body></body></html>");
        assert_eq!(s.site_type, SiteType::Substack);
        assert_eq!(s.name, "Weekly Kaggle News");
    }
}
