mod common;

use std::sync::Arc;

use common::{api_source, init_tracing};
use interfaces::{AdapterError, NewSiteSource, SiteType, SourceAdapter};
use news_aggregator::sources::site::{parse_article_page, substack_links};
use news_aggregator::sources::site_analyzer::analyze_html;
use news_aggregator::{AggregatorError, FetchConfig, Fetcher, NewsApiAdapter, SiteAdapter, SiteAnalyzer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SUBSTACK_POST: &str = r#"<!DOCTYPE html>
<html lang="en"><head>
  <title>Kaggle grandmasters | Weekly Kaggle News</title>
  <meta name="description" content="This week's competitions.">
  <meta property="article:tag" content="Kaggle">
  <meta property="article:tag" content="Tabular">
</head><body>
  <nav>Home Archive About</nav>
  <h1 class="post-title">Kaggle grandmasters share tips</h1>
  <time datetime="2026-10-12T09:00:00Z">Oct 12</time>
  <div class="available-content">
    <p>Gradient boosting still wins tabular competitions.</p>
    <script>trackPageView()</script>
  </div>
  <footer>Subscribe now</footer>
</body></html>"#;

const SUBSTACK_HOME: &str = r#"<html><body>
  <a href="/p/first-post">First</a>
  <a href="/p/first-post#comments">First comments</a>
  <a href="https://weekly.substack.com/p/second-post">Second</a>
  <a href="https://other.substack.com/p/elsewhere">Elsewhere</a>
  <a href="/archive">Archive</a>
  <a href="/p/third-post">Third</a>
</body></html>"#;

fn test_fetcher() -> Arc<Fetcher> {
    Arc::new(
        Fetcher::new(FetchConfig {
            max_retries: 1,
            retry_delay_ms: 1,
            host_interval_ms: 0,
            timeout_seconds: 5,
            ..FetchConfig::default()
        })
        .unwrap(),
    )
}

#[test]
fn substack_post_is_parsed_without_chrome() {
    let item = parse_article_page(
        SUBSTACK_POST,
        "https://weekly.substack.com/p/first-post",
        SiteType::Substack,
        "Weekly Kaggle News",
    )
    .unwrap();

    assert_eq!(item.title, "Kaggle grandmasters share tips");
    let body = item.body.unwrap();
    assert!(body.contains("Gradient boosting"));
    assert!(!body.contains("trackPageView"));
    assert!(!body.contains("Subscribe now"));
    assert_eq!(item.description.as_deref(), Some("This week's competitions."));
    assert_eq!(item.tags, vec!["kaggle", "tabular"]);
    assert_eq!(item.published_at.unwrap().to_rfc3339(), "2026-10-12T09:00:00+00:00");
}

#[test]
fn generic_pages_fall_back_to_the_body() {
    let html = r#"<html><head><title>Plain page</title></head><body>
        <header>Site header</header>
        <p>Only paragraph.</p>
        <footer>Copyright</footer>
    </body></html>"#;
    let item = parse_article_page(html, "https://plain.example/", SiteType::Generic, "Plain").unwrap();
    assert_eq!(item.title, "Plain page");
    assert_eq!(item.body.as_deref(), Some("Only paragraph."));
    assert!(item.published_at.is_none());
}

#[test]
fn substack_links_stay_on_host_and_are_deduplicated() {
    let base = Url::parse("https://weekly.substack.com/").unwrap();
    let links = substack_links(SUBSTACK_HOME, &base, 5);
    assert_eq!(
        links,
        vec![
            "https://weekly.substack.com/p/first-post",
            "https://weekly.substack.com/p/second-post",
            "https://weekly.substack.com/p/third-post",
        ]
    );
    assert_eq!(substack_links(SUBSTACK_HOME, &base, 2).len(), 2);
}

#[test]
fn analyzer_reads_page_metadata() {
    let html = r#"<html lang="ja"><head>
        <meta property="og:site_name" content="Qosmo">
        <meta name="description" content="AI and creativity.">
        <link rel="alternate" type="application/rss+xml" href="/feed">
    </head><body><article class="post">生成AIと音楽</article></body></html>"#;
    let suggestion = analyze_html(&Url::parse("https://qosmo.jp/").unwrap(), html);
    assert_eq!(suggestion.name, "Qosmo");
    assert_eq!(suggestion.site_type, SiteType::Blog);
    assert_eq!(suggestion.language, "ja");
    assert_eq!(suggestion.description.as_deref(), Some("AI and creativity."));
    assert!(suggestion.tags.iter().any(|t| t == "blog"));

    let source = suggestion.into_new_source("https://qosmo.jp/").into_config().unwrap();
    assert_eq!(source.name, "Qosmo");
    assert_eq!(source.site().unwrap().language, "ja");

    let substack = analyze_html(&Url::parse("https://weekly.substack.com/").unwrap(), "<html></html>");
    assert_eq!(substack.site_type, SiteType::Substack);
}

#[tokio::test]
async fn substack_site_follows_post_links_and_skips_broken_ones() {
    init_tracing();
    let server = MockServer::start().await;
    let home = format!(
        r#"<html><body><a href="{0}/p/good">Good</a><a href="{0}/p/broken">Broken</a></body></html>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(home))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/good"))
        .respond_with(ResponseTemplate::new(200).set_body_string(SUBSTACK_POST))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/broken"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut request = NewSiteSource::new("Local substack", format!("{}/", server.uri()));
    request.site_type = SiteType::Substack;
    let source = request.into_config().unwrap();

    let items = SiteAdapter::new(test_fetcher())
        .with_max_articles(3)
        .list_raw_items(&source)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Kaggle grandmasters share tips");
    assert_eq!(items[0].url.as_deref(), Some(format!("{}/p/good", server.uri()).as_str()));
}

#[tokio::test]
async fn site_serving_a_feed_is_read_as_a_feed() {
    init_tracing();
    let server = MockServer::start().await;
    let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Lab notes</title>
  <item><title>Notes 1</title><link>https://lab.example/1</link><guid>1</guid></item>
  <item><title>Notes 2</title><link>https://lab.example/2</link><guid>2</guid></item>
</channel></rss>"#;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss))
        .mount(&server)
        .await;

    let source = NewSiteSource::new("Lab", format!("{}/", server.uri())).into_config().unwrap();
    let items = SiteAdapter::new(test_fetcher()).list_raw_items(&source).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].source_name, "Lab notes");
}

#[tokio::test]
async fn unreachable_landing_page_fails_the_source() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let source = NewSiteSource::new("Closed", format!("{}/", server.uri())).into_config().unwrap();
    let err = SiteAdapter::new(test_fetcher()).list_raw_items(&source).await.unwrap_err();
    assert!(matches!(err, AdapterError::Fetch(message) if message.contains("403")));
}

#[tokio::test]
async fn analyzer_degrades_to_domain_defaults() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    // Transient statuses would be retried by a plain `get`.
    let fetcher = Fetcher::new(FetchConfig {
        retry_delay_ms: 1,
        host_interval_ms: 0,
        timeout_seconds: 5,
        ..FetchConfig::default()
    })
    .unwrap();
    assert!(fetcher.config().max_retries > 0);
    let analyzer = SiteAnalyzer::new(Arc::new(fetcher));
    let suggestion = analyzer.analyze(&format!("{}/", server.uri())).await;
    assert_eq!(suggestion.site_type, SiteType::Generic);
    assert_eq!(suggestion.language, "en");
    assert_eq!(suggestion.category, "technology");
}

#[tokio::test]
async fn news_api_maps_articles_and_drops_removed_ones() {
    init_tracing();
    let server = MockServer::start().await;
    let body = serde_json::json!({
        "status": "ok",
        "totalResults": 2,
        "articles": [
            {
                "source": {"id": "techcrunch", "name": "TechCrunch"},
                "title": "Chips get faster",
                "description": "New silicon.",
                "url": "https://techcrunch.example/chips",
                "publishedAt": "2026-10-12T09:00:00Z",
                "content": "The new chips are faster."
            },
            {"source": {"name": null}, "title": "[Removed]", "url": "https://removed.example/"}
        ]
    });
    Mock::given(method("GET"))
        .and(path("/everything"))
        .and(query_param("apiKey", "secret"))
        .and(query_param("sources", "techcrunch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = NewsApiAdapter::new(test_fetcher(), Some("secret".into()), server.uri());
    let items = adapter.list_raw_items(&api_source("Wire")).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Chips get faster");
    assert_eq!(items[0].source_name, "TechCrunch");
    assert_eq!(items[0].body.as_deref(), Some("The new chips are faster."));
}

#[tokio::test]
async fn news_api_key_problems_are_auth_failures() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/everything"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "status": "error",
            "code": "apiKeyInvalid",
            "message": "Your API key is invalid."
        })))
        .mount(&server)
        .await;

    let rejected = NewsApiAdapter::new(test_fetcher(), Some("wrong".into()), server.uri());
    assert!(matches!(
        rejected.list_raw_items(&api_source("Wire")).await.unwrap_err(),
        AdapterError::Auth(_)
    ));

    let missing = NewsApiAdapter::new(test_fetcher(), None, server.uri());
    assert!(matches!(
        missing.list_raw_items(&api_source("Wire")).await.unwrap_err(),
        AdapterError::Auth(_)
    ));
}

/// Serves one chunked response of `chunks` 64 KiB chunks with no
/// Content-Length header.
async fn serve_chunked(chunks: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 4096];
        let _ = socket.read(&mut request).await;
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nTransfer-Encoding: chunked\r\n\r\n";
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        let chunk = vec![b'a'; 64 * 1024];
        for _ in 0..chunks {
            let frame = format!("{:x}\r\n", chunk.len());
            if socket.write_all(frame.as_bytes()).await.is_err()
                || socket.write_all(&chunk).await.is_err()
                || socket.write_all(b"\r\n").await.is_err()
            {
                return;
            }
        }
        let _ = socket.write_all(b"0\r\n\r\n").await;
    });
    format!("http://{addr}/")
}

fn one_mb_fetcher() -> Fetcher {
    Fetcher::new(FetchConfig {
        max_retries: 0,
        host_interval_ms: 0,
        timeout_seconds: 5,
        max_page_size_mb: 1,
        ..FetchConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn unannounced_oversized_bodies_are_cut_off() {
    init_tracing();
    let url = serve_chunked(20).await;

    let err = one_mb_fetcher().get(&url).await.unwrap_err();
    assert!(matches!(err, AggregatorError::PageTooLarge { size_mb: 2 }), "got {err:?}");
}

#[tokio::test]
async fn chunked_bodies_under_the_cap_are_read_whole() {
    init_tracing();
    let url = serve_chunked(4).await;

    let page = one_mb_fetcher().get(&url).await.unwrap();
    assert_eq!(page.status, 200);
    assert_eq!(page.body.len(), 4 * 64 * 1024);
}
