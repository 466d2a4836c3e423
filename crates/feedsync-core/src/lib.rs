//! Core domain model for feedsync: accounts, offers and their content hash.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "feedsync-core";

/// Bumped whenever the hashed field list changes so old and new digests never collide.
pub const HASH_SCHEMA_VERSION: u32 = 1;

/// Largest offer id the store can hold (`offer_id BIGINT`).
pub const MAX_OFFER_ID: u64 = i64::MAX as u64;

pub const OFFER_STATUS_ACTIVE: bool = true;
pub const OFFER_STATUS_STOPPED: bool = false;

/// Feed account as configured by the operator. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "account_id")]
    pub id: i32,
    #[serde(rename = "account_name")]
    pub name: String,
    /// API credential hash sent as the `hash` query parameter.
    pub hash: String,
    pub feed_id: i64,
    /// Base URL of the feed API, without the feed path.
    pub url: String,
}

/// Identity of an offer in the store and in the hash cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OfferKey {
    pub offer_id: u64,
    pub account_id: i32,
}

impl OfferKey {
    pub fn new(offer_id: u64, account_id: i32) -> Self {
        Self {
            offer_id,
            account_id,
        }
    }
}

impl fmt::Display for OfferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offer:{}:account:{}", self.offer_id, self.account_id)
    }
}

/// The upstream `rate` field arrives either as a JSON number or as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateValue {
    Number(f64),
    Text(String),
}

impl RateValue {
    /// Canonical textual form stored on [`Offer::rate`].
    pub fn normalize(&self) -> String {
        match self {
            RateValue::Number(n) => n.to_string(),
            RateValue::Text(s) => s.trim().to_string(),
        }
    }
}

/// Normalize an optional rate; a missing or null rate becomes the empty string.
pub fn normalize_rate(rate: Option<&RateValue>) -> String {
    rate.map(RateValue::normalize).unwrap_or_default()
}

/// A feed offer as persisted. `(id, account_id)` is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: u64,
    pub account_id: i32,
    pub package_name: String,
    pub title: String,
    pub description: String,
    pub domain: String,
    pub preview_url: String,
    pub tracking_url: String,
    pub business_model: String,
    pub rate: String,
    pub currency: String,
    pub thumbnail: String,
    pub countries: Vec<String>,
    pub cities: Vec<String>,
    pub categories: Vec<String>,
    pub languages: Vec<String>,
    pub black_list_sources: Vec<String>,
    pub mobile_support: String,
    pub allowed_devices: Vec<String>,
    pub min_os_version: Vec<String>,
    pub app_price: String,
    pub app_rating: String,
    pub content_rating: String,
    pub developer: String,
    pub developer_website: String,
    pub promo_video: String,
    pub cap_enable: String,
    pub cap_amount: String,
    pub cap_current_amount: String,
    pub cap_frequency: String,
    pub capping_field: String,
    pub capping_timeframe: String,
    pub is_active: bool,
    pub status_changed_at: DateTime<Utc>,
    pub hash: String,
}

/// One value fed into the content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashValue<'a> {
    Text(&'a str),
    List(&'a [String]),
    Flag(bool),
}

impl Offer {
    /// Blank active offer with the given identity. Callers fill attributes and then call
    /// [`Offer::refresh_hash`].
    pub fn new(id: u64, account_id: i32, status_changed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            account_id,
            package_name: String::new(),
            title: String::new(),
            description: String::new(),
            domain: String::new(),
            preview_url: String::new(),
            tracking_url: String::new(),
            business_model: String::new(),
            rate: String::new(),
            currency: String::new(),
            thumbnail: String::new(),
            countries: Vec::new(),
            cities: Vec::new(),
            categories: Vec::new(),
            languages: Vec::new(),
            black_list_sources: Vec::new(),
            mobile_support: String::new(),
            allowed_devices: Vec::new(),
            min_os_version: Vec::new(),
            app_price: String::new(),
            app_rating: String::new(),
            content_rating: String::new(),
            developer: String::new(),
            developer_website: String::new(),
            promo_video: String::new(),
            cap_enable: String::new(),
            cap_amount: String::new(),
            cap_current_amount: String::new(),
            cap_frequency: String::new(),
            capping_field: String::new(),
            capping_timeframe: String::new(),
            is_active: OFFER_STATUS_ACTIVE,
            status_changed_at,
            hash: String::new(),
        }
    }

    pub fn key(&self) -> OfferKey {
        OfferKey::new(self.id, self.account_id)
    }

    /// Ordered field list consumed by [`Offer::content_hash`].
    ///
    /// Adding a field here changes every digest, so bump [`HASH_SCHEMA_VERSION`] with it.
    /// `status_changed_at` and `hash` are never part of the list.
    pub fn hash_fields(&self) -> [(&'static str, HashValue<'_>); 31] {
        use HashValue::{Flag, List, Text};
        [
            ("package_name", Text(&self.package_name)),
            ("title", Text(&self.title)),
            ("description", Text(&self.description)),
            ("domain", Text(&self.domain)),
            ("preview_url", Text(&self.preview_url)),
            ("tracking_url", Text(&self.tracking_url)),
            ("business_model", Text(&self.business_model)),
            ("rate", Text(&self.rate)),
            ("currency", Text(&self.currency)),
            ("thumbnail", Text(&self.thumbnail)),
            ("countries", List(&self.countries)),
            ("cities", List(&self.cities)),
            ("categories", List(&self.categories)),
            ("languages", List(&self.languages)),
            ("black_list_sources", List(&self.black_list_sources)),
            ("mobile_support", Text(&self.mobile_support)),
            ("allowed_devices", List(&self.allowed_devices)),
            ("min_os_version", List(&self.min_os_version)),
            ("app_price", Text(&self.app_price)),
            ("app_rating", Text(&self.app_rating)),
            ("content_rating", Text(&self.content_rating)),
            ("developer", Text(&self.developer)),
            ("developer_website", Text(&self.developer_website)),
            ("promo_video", Text(&self.promo_video)),
            ("cap_enable", Text(&self.cap_enable)),
            ("cap_amount", Text(&self.cap_amount)),
            ("cap_current_amount", Text(&self.cap_current_amount)),
            ("cap_frequency", Text(&self.cap_frequency)),
            ("capping_field", Text(&self.capping_field)),
            ("capping_timeframe", Text(&self.capping_timeframe)),
            ("is_active", Flag(self.is_active)),
        ]
    }

    /// Hex SHA-256 over the identity and every hashed field.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(HASH_SCHEMA_VERSION.to_be_bytes());
        hasher.update(self.id.to_be_bytes());
        hasher.update(self.account_id.to_be_bytes());
        for (name, value) in self.hash_fields() {
            update_len_prefixed(&mut hasher, name.as_bytes());
            match value {
                HashValue::Text(text) => {
                    hasher.update([b't']);
                    update_len_prefixed(&mut hasher, text.as_bytes());
                }
                HashValue::List(items) => {
                    hasher.update([b'l']);
                    hasher.update((items.len() as u64).to_be_bytes());
                    for item in items {
                        update_len_prefixed(&mut hasher, item.as_bytes());
                    }
                }
                HashValue::Flag(flag) => {
                    hasher.update([b'f', u8::from(flag)]);
                }
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Recompute and store the content hash. Call after any attribute change.
    pub fn refresh_hash(&mut self) -> &str {
        self.hash = self.content_hash();
        &self.hash
    }

    pub fn has_current_hash(&self) -> bool {
        self.hash == self.content_hash()
    }

    /// Transition to stopped, stamping the change time and recomputing the hash.
    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.is_active = OFFER_STATUS_STOPPED;
        self.status_changed_at = now;
        self.refresh_hash();
    }
}

fn update_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
