//! Pure text helpers shared by the adapters and the normalizer.

use scraper::Html;
use url::Url;

const SKIPPED_ELEMENTS: [&str; 5] = ["script", "style", "noscript", "template", "head"];

pub const TECH_KEYWORDS: &[&str] = &[
    "ai",
    "machine learning",
    "deep learning",
    "data science",
    "programming",
    "software",
    "technology",
    "startup",
    "innovation",
    "blockchain",
    "cloud",
    "security",
    "api",
    "iot",
    "robotics",
];

/// First match wins.
pub const NEWSLETTER_CATEGORIES: &[(&str, &[&str])] = &[
    ("ai", &["artificial intelligence", "machine learning", "deep learning", "ai", "ml", "gpt", "llm"]),
    ("tech", &["technology", "startup", "programming", "software", "developer"]),
    ("data", &["data science", "analytics", "big data", "kaggle"]),
    ("business", &["business", "finance", "market", "economy", "investment"]),
    ("science", &["science", "research", "study", "discovery"]),
];

/// Highest keyword count wins; ties go to the earlier entry.
pub const SITE_CATEGORIES: &[(&str, &[&str])] = &[
    ("ai", &[
        "artificial intelligence", "machine learning", "deep learning", "neural network", "ai",
        "ml", "chatgpt", "gpt", "llm", "人工知能", "機械学習", "深層学習",
    ]),
    ("data-science", &[
        "data science", "kaggle", "data analysis", "statistics", "analytics",
        "データサイエンス", "データ分析", "統計",
    ]),
    ("technology", &[
        "technology", "tech", "software", "hardware", "computer", "programming",
        "テクノロジー", "技術", "ソフトウェア", "プログラミング",
    ]),
    ("startup", &[
        "startup", "entrepreneur", "venture", "funding", "investment",
        "スタートアップ", "起業", "ベンチャー",
    ]),
    ("business", &[
        "business", "management", "marketing", "finance", "economy",
        "ビジネス", "経営", "マーケティング", "経済",
    ]),
    ("science", &[
        "science", "research", "study", "discovery", "experiment", "科学", "研究", "実験", "発見",
    ]),
    ("creative-ai", &[
        "creative", "art", "design", "music", "generative",
        "クリエイティブ", "アート", "デザイン", "音楽", "生成",
    ]),
];

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn looks_like_html(text: &str) -> bool {
    let mut rest = text;
    while let Some(start) = rest.find('<') {
        let after = &rest[start + 1..];
        let opens_tag = after
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '/' || c == '!');
        if opens_tag && after.contains('>') {
            return true;
        }
        rest = after;
    }
    false
}

/// Text content of an HTML fragment or document with script and style
/// bodies dropped and whitespace collapsed. Entities are decoded.
pub fn html_to_text(html: &str) -> String {
    let document = if html.trim_start().to_ascii_lowercase().starts_with("<!doctype")
        || html.contains("<html")
    {
        Html::parse_document(html)
    } else {
        Html::parse_fragment(html)
    };

    let mut out = String::with_capacity(html.len() / 2);
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let skipped = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|e| SKIPPED_ELEMENTS.contains(&e.name()))
        });
        if !skipped {
            out.push_str(text);
            out.push(' ');
        }
    }
    collapse_whitespace(&out)
}

/// Strips markup only when the input looks like HTML.
pub fn plain_text(text: &str) -> String {
    if looks_like_html(text) {
        html_to_text(text)
    } else {
        collapse_whitespace(text)
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// `truncate_chars` plus a trailing ellipsis when anything was cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let cut = truncate_chars(text, max_chars);
    if cut.len() < text.len() {
        format!("{}...", cut.trim_end())
    } else {
        cut.to_string()
    }
}

/// Case-insensitive keyword test. Single ASCII words must match on word
/// boundaries so that "ai" does not match "said".
pub fn contains_keyword(haystack_lower: &str, keyword: &str) -> bool {
    let keyword = keyword.to_lowercase();
    let whole_word = keyword.chars().all(|c| c.is_ascii_alphanumeric());
    if !whole_word {
        return haystack_lower.contains(&keyword);
    }
    haystack_lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == keyword)
}

pub fn tech_tags(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TECH_KEYWORDS
        .iter()
        .filter(|kw| contains_keyword(&lower, kw))
        .map(|kw| kw.replace(' ', "-"))
        .collect()
}

pub fn first_matching_category(text: &str, table: &[(&'static str, &[&str])]) -> Option<&'static str> {
    let lower = text.to_lowercase();
    table
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| contains_keyword(&lower, kw)))
        .map(|(category, _)| *category)
}

pub fn best_scoring_category(text: &str, table: &[(&'static str, &[&str])]) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let mut best: Option<(&'static str, usize)> = None;
    for (category, keywords) in table {
        let score = keywords.iter().filter(|kw| contains_keyword(&lower, kw)).count();
        if score > 0 && best.is_none_or(|(_, top)| score > top) {
            best = Some((category, score));
        }
    }
    best.map(|(category, _)| category)
}

/// "en-US" -> "en". Empty input yields `None`.
pub fn language_tag(raw: &str) -> Option<String> {
    let primary = raw
        .trim()
        .split(['-', '_', ','])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if primary.is_empty() { None } else { Some(primary) }
}

/// Drops the fragment and a trailing slash; unparsable input is only trimmed.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    parsed.set_fragment(None);
    let mut normalized = parsed.to_string();
    if normalized.ends_with('/') && parsed.path() != "/" {
        normalized.pop();
    }
    normalized
}

/// Order-preserving, case-folded union capped at `limit`.
pub fn merge_tags<I, S>(groups: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut merged: Vec<String> = Vec::new();
    for tag in groups {
        let tag = collapse_whitespace(tag.as_ref()).to_lowercase();
        if !tag.is_empty() && !merged.contains(&tag) {
            merged.push(tag);
        }
        if merged.len() == limit {
            break;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_and_scripts() {
        let html = "<div><p>Hello&nbsp;<b>world</b></p><script>var x = 1;</script>\n\n<p>again</p></div>";
        assert_eq!(html_to_text(html), "Hello world again");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(plain_text("  a   b\n c "), "a b c");
        assert_eq!(plain_text("1 < 2 and 3 > 2"), "1 < 2 and 3 > 2");
    }

    #[test]
    fn excerpt_is_char_safe() {
        assert_eq!(excerpt("日本語のテキスト", 3), "日本語...");
        assert_eq!(excerpt("short", 10), "short");
    }

    #[test]
    fn short_keywords_need_word_boundaries() {
        assert!(!contains_keyword("he said hello", "ai"));
        assert!(contains_keyword("new ai models", "ai"));
        assert!(contains_keyword("advances in machine learning", "machine learning"));
    }

    #[test]
    fn categories() {
        assert_eq!(first_matching_category("A new LLM release", NEWSLETTER_CATEGORIES), Some("ai"));
        assert_eq!(first_matching_category("weather report", NEWSLETTER_CATEGORIES), None);
        assert_eq!(
            best_scoring_category("kaggle statistics and analytics for ai", SITE_CATEGORIES),
            Some("data-science")
        );
    }

    #[test]
    fn tags_are_merged_in_order() {
        let tags = merge_tags(["AI", "ai", " Data  Science ", "", "ml"], 10);
        assert_eq!(tags, vec!["ai", "data science", "ml"]);
        assert_eq!(merge_tags(["a", "b", "c"], 2), vec!["a", "b"]);
    }

    #[test]
    fn url_normalization() {
        assert_eq!(normalize_url(" https://Example.com/a/#top "), "https://example.com/a");
        assert_eq!(normalize_url("https://example.com/"), "https://example.com/");
        assert_eq!(normalize_url("https://tldr.tech"), normalize_url("https://tldr.tech/"));
        assert_eq!(normalize_url("mid:abc@x.com"), "mid:abc@x.com");
    }

    #[test]
    fn language_tags() {
        assert_eq!(language_tag("en-US").as_deref(), Some("en"));
        assert_eq!(language_tag(" JA ").as_deref(), Some("ja"));
        assert_eq!(language_tag(""), None);
    }
}
