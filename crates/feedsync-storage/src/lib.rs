//! Rate-limited HTTP client for the offers feed API.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use feedsync_core::{Account, RateValue};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "feedsync-storage";

pub const DEFAULT_RATE_LIMIT: u32 = 5;
pub const DEFAULT_FEED_PATH: &str = "/feed";
pub const FEED_FORMAT: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub feed_path: String,
    pub rate_limit: RateLimitConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            feed_path: DEFAULT_FEED_PATH.to_string(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Issues at most `max_requests` permits within any rolling `window`.
///
/// Waiters queue on a fair mutex and keep it while sleeping, so permits go out in
/// arrival order.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_requests = config.max_requests.max(1) as usize;
        Self {
            max_requests,
            window: config.window,
            issued: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn acquire(&self) {
        let mut issued = self.issued.lock().await;
        loop {
            let now = Instant::now();
            while let Some(oldest) = issued.front() {
                if now.duration_since(*oldest) >= self.window {
                    issued.pop_front();
                } else {
                    break;
                }
            }

            if issued.len() < self.max_requests {
                issued.push_back(now);
                return;
            }

            if let Some(oldest) = issued.front().copied() {
                tokio::time::sleep_until(oldest + self.window).await;
            }
        }
    }
}

/// `{ total_rows, current_rows, current_page, total_pages, limit }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSummary {
    pub total_rows: u32,
    pub current_rows: u64,
    pub current_page: u32,
    pub total_pages: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedPage {
    pub summary: FeedSummary,
    #[serde(deserialize_with = "nullable")]
    pub products: Vec<FeedProduct>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedProduct {
    #[serde(deserialize_with = "nullable")]
    pub attributes: ProductAttributes,
    #[serde(deserialize_with = "nullable")]
    pub capping: ProductCapping,
    #[serde(deserialize_with = "nullable")]
    pub mobile_attributes: MobileAttributes,
    #[serde(deserialize_with = "nullable")]
    pub targeting: ProductTargeting,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductAttributes {
    #[serde(deserialize_with = "nullable")]
    pub id: String,
    #[serde(deserialize_with = "nullable")]
    pub business_model: String,
    #[serde(deserialize_with = "nullable")]
    pub currency: String,
    #[serde(deserialize_with = "nullable")]
    pub description: String,
    #[serde(deserialize_with = "nullable")]
    pub domain: String,
    #[serde(deserialize_with = "nullable")]
    pub package_name: String,
    #[serde(deserialize_with = "nullable")]
    pub preview_url: String,
    pub rate: Option<RateValue>,
    #[serde(deserialize_with = "nullable")]
    pub status: String,
    #[serde(deserialize_with = "nullable")]
    pub thumbnail: String,
    #[serde(deserialize_with = "nullable")]
    pub title: String,
    #[serde(deserialize_with = "nullable")]
    pub tracking_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductCapping {
    #[serde(deserialize_with = "nullable")]
    pub cap_amount: String,
    #[serde(deserialize_with = "nullable")]
    pub cap_current_amount: String,
    #[serde(deserialize_with = "nullable")]
    pub cap_enable: String,
    #[serde(deserialize_with = "nullable")]
    pub cap_frequency: String,
    #[serde(deserialize_with = "nullable")]
    pub capping_field: String,
    #[serde(deserialize_with = "nullable")]
    pub capping_timeframe: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MobileAttributes {
    #[serde(rename = "MinOs_version", deserialize_with = "nullable")]
    pub min_os_version: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub allowed_devices: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub app_price: String,
    #[serde(deserialize_with = "nullable")]
    pub app_rating: String,
    #[serde(deserialize_with = "nullable")]
    pub content_rating: String,
    #[serde(deserialize_with = "nullable")]
    pub developer: String,
    #[serde(deserialize_with = "nullable")]
    pub developer_website: String,
    #[serde(deserialize_with = "nullable")]
    pub mobile_support: String,
    #[serde(deserialize_with = "nullable")]
    pub promo_video: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductTargeting {
    #[serde(deserialize_with = "nullable")]
    pub black_list_sources: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub categories: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub cities: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub countries: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub languages: Vec<String>,
}

// The feed sends `null` where it means "empty".
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: i64,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed feed body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid feed parameters: {0}")]
    InvalidParams(&'static str),
}

impl FetchError {
    /// The feed answered but signalled a business error.
    pub fn is_api(&self) -> bool {
        matches!(self, FetchError::Api { .. })
    }

    /// Anything that kept a well-formed answer from reaching us.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FetchError::Request(_) | FetchError::HttpStatus { .. } | FetchError::Decode { .. }
        )
    }
}

/// Inspect the error envelope first, then decode the typed page.
pub fn decode_feed_body(url: &str, body: &[u8]) -> Result<FeedPage, FetchError> {
    let envelope: ErrorEnvelope =
        serde_json::from_slice(body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })?;
    if envelope.error != 0 {
        return Err(FetchError::Api {
            code: envelope.error,
            message: envelope.error_message.unwrap_or_default(),
        });
    }

    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

pub fn validate_page_request(account: &Account, page: u32, limit: u32) -> Result<(), FetchError> {
    if page == 0 || limit == 0 {
        return Err(FetchError::InvalidParams("limit and page must be greater than zero"));
    }
    if account.hash.trim().is_empty() || account.feed_id <= 0 {
        return Err(FetchError::InvalidParams("account hash and feed id are required"));
    }
    Ok(())
}

/// Anything that can serve one page of an account's feed.
#[async_trait]
pub trait FeedPageSource: Send + Sync {
    async fn fetch_page(
        &self,
        account: &Account,
        page: u32,
        limit: u32,
    ) -> Result<FeedPage, FetchError>;
}

#[derive(Debug)]
pub struct FeedClient {
    client: reqwest::Client,
    limiter: Arc<SlidingWindowLimiter>,
    feed_path: String,
}

impl FeedClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limiter: Arc::new(SlidingWindowLimiter::new(config.rate_limit)),
            feed_path: config.feed_path,
        })
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub fn feed_url(&self, account: &Account) -> String {
        format!(
            "{}/{}",
            account.url.trim_end_matches('/'),
            self.feed_path.trim_start_matches('/')
        )
    }

    async fn request_page(
        &self,
        account: &Account,
        page: u32,
        limit: u32,
    ) -> Result<FeedPage, FetchError> {
        let url = self.feed_url(account);
        let feed_id = account.feed_id.to_string();
        let limit = limit.to_string();
        let page = page.to_string();

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("hash", account.hash.as_str()),
                ("feed_id", feed_id.as_str()),
                ("format", FEED_FORMAT),
                ("limit", limit.as_str()),
                ("page", page.as_str()),
            ])
            .send()
            .await
            .inspect_err(|err| warn!(error = %err, "feed request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "feed answered with non-success status");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.bytes().await?;
        decode_feed_body(&url, &body).inspect_err(|err| match err {
            FetchError::Api { code, message } => {
                warn!(code, message = message.as_str(), "feed returned api error")
            }
            other => warn!(error = %other, body_len = body.len(), "feed body rejected"),
        })
    }
}

#[async_trait]
impl FeedPageSource for FeedClient {
    async fn fetch_page(
        &self,
        account: &Account,
        page: u32,
        limit: u32,
    ) -> Result<FeedPage, FetchError> {
        validate_page_request(account, page, limit)?;
        self.limiter.acquire().await;

        let span = info_span!("feed_fetch", account_id = account.id, page, limit);
        async {
            debug!("requesting feed page");
            self.request_page(account, page, limit).await
        }
        .instrument(span)
        .await
    }
}
