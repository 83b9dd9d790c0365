//! RawItem -> ArticleDraft. Pure: no I/O, no clock; the fetch time comes in
//! through the source context.

use interfaces::text::{self, NEWSLETTER_CATEGORIES};
use interfaces::{ArticleDraft, RawItem, SourceContext};
use sha2::{Digest, Sha256};

pub use interfaces::text::normalize_url;

const DESCRIPTION_CHARS: usize = 300;
const TITLE_FALLBACK_WORDS: usize = 12;
const MAX_TAGS: usize = 20;
const DEFAULT_CATEGORY: &str = "general";

pub fn normalize(raw: &RawItem, ctx: &SourceContext) -> ArticleDraft {
    let body = raw.body.as_deref().map(text::plain_text).unwrap_or_default();
    let description = raw
        .description
        .as_deref()
        .map(text::plain_text)
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| if body.is_empty() { String::new() } else { text::excerpt(&body, DESCRIPTION_CHARS) });

    let title = match text::plain_text(&raw.title) {
        t if !t.is_empty() => t,
        _ if !body.is_empty() => body
            .split_whitespace()
            .take(TITLE_FALLBACK_WORDS)
            .collect::<Vec<_>>()
            .join(" "),
        _ => "Untitled".to_string(),
    };

    let url = raw.url.as_deref().map(normalize_url).filter(|u| !u.is_empty());
    let fingerprint = fingerprint(&title, url.as_deref(), &body);

    let language = ctx
        .language
        .as_deref()
        .or(raw.language.as_deref())
        .and_then(text::language_tag)
        .unwrap_or_else(|| detect_language(&format!("{title} {body}")).to_string());

    let category = raw
        .category
        .as_deref()
        .or(ctx.category.as_deref())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .or_else(|| {
            text::first_matching_category(&format!("{title} {description}"), NEWSLETTER_CATEGORIES)
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

    let tags = text::merge_tags(ctx.tags.iter().chain(raw.tags.iter()), MAX_TAGS);

    let source_name = match raw.source_name.trim() {
        "" => ctx.source_name.clone(),
        name => name.to_string(),
    };

    ArticleDraft {
        title,
        description,
        body,
        source_kind: ctx.kind,
        source_id: ctx.source_id,
        source_name,
        url,
        published_at: raw.published_at.unwrap_or(ctx.fetched_at),
        language,
        category,
        tags,
        fingerprint,
    }
}

/// SHA-256 over the case-folded title and the URL, or the body when the
/// item has no URL.
pub fn fingerprint(title: &str, url: Option<&str>, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text::collapse_whitespace(title).to_lowercase().as_bytes());
    hasher.update(b"\n");
    match url {
        Some(url) => hasher.update(normalize_url(url).as_bytes()),
        None => hasher.update(text::collapse_whitespace(body).as_bytes()),
    }
    format!("{:x}", hasher.finalize())
}

/// Script-based guess: kana means Japanese, Han alone Chinese, Hangul Korean.
pub fn detect_language(sample: &str) -> &'static str {
    let mut han = false;
    let mut hangul = false;
    for c in sample.chars() {
        match c {
            '\u{3040}'..='\u{30FF}' => return "ja",
            '\u{4E00}'..='\u{9FFF}' => han = true,
            '\u{AC00}'..='\u{D7AF}' => hangul = true,
            _ => {}
        }
    }
    if han {
        "zh"
    } else if hangul {
        "ko"
    } else {
        "en"
    }
}
