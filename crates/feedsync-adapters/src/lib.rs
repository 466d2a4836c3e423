//! Feed product normalization and the paginated offer reader.

use std::collections::VecDeque;
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feedsync_core::{normalize_rate, Account, Offer, MAX_OFFER_ID};
use feedsync_storage::{FeedPageSource, FeedProduct, FetchError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "feedsync-adapters";

/// Hard ceiling on the page size requested from the feed.
pub const OFFERS_MAX_LIMIT: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum MalformedRecordError {
    #[error("offer id {raw:?} is not an unsigned integer")]
    InvalidId {
        raw: String,
        #[source]
        source: ParseIntError,
    },
    #[error("offer id {0} exceeds the largest storable id")]
    IdOutOfRange(u64),
}

/// Map one feed product onto an active [`Offer`] with a fresh content hash.
pub fn normalize_product(
    product: &FeedProduct,
    account_id: i32,
    now: DateTime<Utc>,
) -> Result<Offer, MalformedRecordError> {
    let attrs = &product.attributes;
    let id = attrs
        .id
        .trim()
        .parse::<u64>()
        .map_err(|source| MalformedRecordError::InvalidId {
            raw: attrs.id.clone(),
            source,
        })?;
    if id > MAX_OFFER_ID {
        return Err(MalformedRecordError::IdOutOfRange(id));
    }

    let mut offer = Offer::new(id, account_id, now);
    offer.package_name = attrs.package_name.clone();
    offer.title = attrs.title.clone();
    offer.description = attrs.description.clone();
    offer.domain = attrs.domain.clone();
    offer.preview_url = attrs.preview_url.clone();
    offer.tracking_url = attrs.tracking_url.clone();
    offer.business_model = attrs.business_model.clone();
    offer.rate = normalize_rate(attrs.rate.as_ref());
    offer.currency = attrs.currency.clone();
    offer.thumbnail = attrs.thumbnail.clone();

    let targeting = &product.targeting;
    offer.countries = targeting.countries.clone();
    offer.cities = targeting.cities.clone();
    offer.categories = targeting.categories.clone();
    offer.languages = targeting.languages.clone();
    offer.black_list_sources = targeting.black_list_sources.clone();

    let mobile = &product.mobile_attributes;
    offer.mobile_support = mobile.mobile_support.clone();
    offer.allowed_devices = mobile.allowed_devices.clone();
    offer.min_os_version = mobile.min_os_version.clone();
    offer.app_price = mobile.app_price.clone();
    offer.app_rating = mobile.app_rating.clone();
    offer.content_rating = mobile.content_rating.clone();
    offer.developer = mobile.developer.clone();
    offer.developer_website = mobile.developer_website.clone();
    offer.promo_video = mobile.promo_video.clone();

    let capping = &product.capping;
    offer.cap_enable = capping.cap_enable.clone();
    offer.cap_amount = capping.cap_amount.clone();
    offer.cap_current_amount = capping.cap_current_amount.clone();
    offer.cap_frequency = capping.cap_frequency.clone();
    offer.capping_field = capping.capping_field.clone();
    offer.capping_timeframe = capping.capping_timeframe.clone();

    offer.refresh_hash();
    Ok(offer)
}

/// Why an [`OfferStream`] stopped yielding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    Cancelled,
    RetriesExhausted { page: u32, last_error: String },
    Rejected { page: u32, error: String },
    PaginationStalled { page: u32 },
}

impl FinishReason {
    pub fn is_complete(&self) -> bool {
        matches!(self, FinishReason::Completed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStats {
    pub pages_fetched: u32,
    pub attempts: u32,
    pub failed_attempts: u32,
    pub yielded: u64,
    pub skipped: u64,
}

#[derive(Clone)]
pub struct OfferReader {
    source: Arc<dyn FeedPageSource>,
    retry: RetryPolicy,
}

impl OfferReader {
    pub fn new(source: Arc<dyn FeedPageSource>) -> Self {
        Self {
            source,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Lazily stream every offer of `account`, starting at `start_page`.
    ///
    /// `limit` is clamped to [`OFFERS_MAX_LIMIT`]. The stream is single-use.
    pub fn read_offers(
        &self,
        account: Account,
        start_page: u32,
        limit: u32,
        cancel: CancellationToken,
    ) -> OfferStream {
        OfferStream {
            source: self.source.clone(),
            retry: self.retry,
            account,
            limit: limit.min(OFFERS_MAX_LIMIT),
            next_page: Some(start_page),
            end_reason: FinishReason::Completed,
            cancel,
            buffer: VecDeque::new(),
            finish: None,
            stats: ReadStats::default(),
        }
    }
}

pub struct OfferStream {
    source: Arc<dyn FeedPageSource>,
    retry: RetryPolicy,
    account: Account,
    limit: u32,
    next_page: Option<u32>,
    // Reported once the buffer drains and no page is left.
    end_reason: FinishReason,
    cancel: CancellationToken,
    buffer: VecDeque<FeedProduct>,
    finish: Option<FinishReason>,
    stats: ReadStats,
}

impl OfferStream {
    pub fn account_id(&self) -> i32 {
        self.account.id
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// `None` while the stream can still yield.
    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish.as_ref()
    }

    pub async fn next(&mut self) -> Option<Offer> {
        loop {
            if self.finish.is_some() {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.finish_with(FinishReason::Cancelled);
                return None;
            }

            if let Some(product) = self.buffer.pop_front() {
                match normalize_product(&product, self.account.id, Utc::now()) {
                    Ok(offer) => {
                        self.stats.yielded += 1;
                        return Some(offer);
                    }
                    Err(err) => {
                        self.stats.skipped += 1;
                        warn!(account_id = self.account.id, error = %err, "skipping feed offer with unusable id");
                        continue;
                    }
                }
            }

            match self.next_page.take() {
                Some(page) => self.fetch_with_retry(page).await,
                None => {
                    let reason = std::mem::replace(&mut self.end_reason, FinishReason::Completed);
                    self.finish_with(reason);
                }
            }
        }
    }

    async fn fetch_with_retry(&mut self, page: u32) {
        let mut failures = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                self.finish_with(FinishReason::Cancelled);
                return;
            }

            self.stats.attempts += 1;
            match self.source.fetch_page(&self.account, page, self.limit).await {
                Ok(feed_page) => {
                    self.stats.pages_fetched += 1;
                    let summary = &feed_page.summary;
                    debug!(
                        account_id = self.account.id,
                        page,
                        current_page = summary.current_page,
                        total_pages = summary.total_pages,
                        products = feed_page.products.len(),
                        "feed page received"
                    );
                    if summary.current_page < summary.total_pages {
                        let next = summary.current_page + 1;
                        if next > page {
                            self.next_page = Some(next);
                        } else {
                            warn!(
                                account_id = self.account.id,
                                page,
                                current_page = summary.current_page,
                                "feed pagination does not advance; stopping"
                            );
                            self.end_reason = FinishReason::PaginationStalled { page };
                        }
                    }
                    self.buffer.extend(feed_page.products);
                    return;
                }
                Err(err @ FetchError::InvalidParams(_)) => {
                    warn!(account_id = self.account.id, page, error = %err, "feed request rejected");
                    self.finish_with(FinishReason::Rejected {
                        page,
                        error: err.to_string(),
                    });
                    return;
                }
                Err(err) => {
                    failures += 1;
                    self.stats.failed_attempts += 1;
                    warn!(
                        account_id = self.account.id,
                        page,
                        attempt = failures,
                        api_error = err.is_api(),
                        error = %err,
                        "feed page fetch failed"
                    );
                    if failures >= self.retry.max_attempts {
                        self.finish_with(FinishReason::RetriesExhausted {
                            page,
                            last_error: err.to_string(),
                        });
                        return;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.finish_with(FinishReason::Cancelled);
                            return;
                        }
                        _ = tokio::time::sleep(self.retry.delay) => {}
                    }
                }
            }
        }
    }

    fn finish_with(&mut self, reason: FinishReason) {
        self.buffer.clear();
        self.next_page = None;
        self.finish = Some(reason);
    }
}
