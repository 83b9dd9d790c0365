use crate::types::{AggregatorError, FetchConfig, FetchedPage, Result};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Shared HTTP client with per-host spacing and retry on transient
/// statuses. Any final status is returned to the caller to classify.
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<RwLock<HashMap<String, Instant>>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| AggregatorError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub async fn get(&self, url: &str) -> Result<FetchedPage> {
        self.send_with_retry(url, self.config.max_retries, || self.client.get(url)).await
    }

    /// One request, no retry on transient failures.
    pub async fn get_once(&self, url: &str) -> Result<FetchedPage> {
        self.send_with_retry(url, 0, || self.client.get(url)).await
    }

    pub async fn get_with_query(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedPage> {
        self.send_with_retry(url, self.config.max_retries, || self.client.get(url).query(query)).await
    }

    async fn send_with_retry<F>(&self, url: &str, max_retries: u32, build: F) -> Result<FetchedPage>
    where
        F: Fn() -> RequestBuilder,
    {
        let start_time = Instant::now();
        self.apply_rate_limit(url).await?;

        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: delay,
            initial_interval: delay,
            max_interval: delay * 32,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_error = None;

        for attempt in 0..=max_retries {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if is_transient_status(status) && attempt < max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!("Attempt {} for {} got HTTP {}, retrying in {:?}", attempt + 1, url, status, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }

                    let final_url = response.url().to_string();
                    let body = self.read_capped(response).await?;
                    info!("Fetched {} (HTTP {}, {} bytes)", url, status.as_u16(), body.len());
                    return Ok(FetchedPage {
                        url: url.to_string(),
                        final_url,
                        status: status.as_u16(),
                        body,
                        response_time_ms: start_time.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect() || e.is_request();
                    last_error = Some(AggregatorError::from(e));

                    if retryable && attempt < max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    break;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AggregatorError::Http(format!("no response from {url}"))))
    }

    /// Reads the body up to `max_page_size_mb`, whether or not the server
    /// announced a length.
    async fn read_capped(&self, mut response: Response) -> Result<String> {
        let limit = self.config.max_page_size_mb.saturating_mul(BYTES_PER_MB);
        if let Some(content_length) = response.content_length() {
            let announced = usize::try_from(content_length).unwrap_or(usize::MAX);
            if announced > limit {
                return Err(AggregatorError::PageTooLarge {
                    size_mb: announced.div_ceil(BYTES_PER_MB),
                });
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(AggregatorError::PageTooLarge {
                    size_mb: (body.len() + chunk.len()).div_ceil(BYTES_PER_MB),
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn apply_rate_limit(&self, url: &str) -> Result<()> {
        let parsed_url = Url::parse(url)?;
        let host = parsed_url.host_str().unwrap_or("").to_string();
        let min_interval = Duration::from_millis(self.config.host_interval_ms);

        let wait_time = {
            let mut rate_limiter = self.rate_limiter.write().await;
            let now = Instant::now();
            // Reserve the next slot before sleeping so the lock is not held
            // across the wait.
            let slot = match rate_limiter.get(&host) {
                Some(last) if *last + min_interval > now => *last + min_interval,
                _ => now,
            };
            rate_limiter.insert(host.clone(), slot);
            slot.saturating_duration_since(now)
        };

        if !wait_time.is_zero() {
            debug!("Rate limiting {}: waiting {:?}", host, wait_time);
            tokio::time::sleep(wait_time).await;
        }
        Ok(())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
