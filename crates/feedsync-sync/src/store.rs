//! Offer persistence: the store contract plus Postgres and in-memory backends.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use feedsync_core::{Account, Offer, OfferKey};
use serde::Serialize;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("offer id {0} does not fit the offer_id column")]
    OfferIdOutOfRange(u64),
    #[error("stored offer id {0} is negative")]
    NegativeOfferId(i64),
    #[error("{0} not found")]
    NotFound(OfferKey),
    #[error("{0}")]
    Backend(String),
}

/// Persistence collaborator of the ingestion pipeline.
///
/// Every call is an independent unit of work; nothing spans a whole account fetch.
#[async_trait]
pub trait OfferStore: Send + Sync {
    /// Insert new offers. Rows that already exist are overwritten, so replaying a batch is safe.
    async fn insert_batch(&self, offers: &[Offer]) -> Result<u64, StoreError>;

    /// Update one offer by `(offer_id, account_id)`.
    async fn update(&self, offer: &Offer) -> Result<(), StoreError>;

    /// Active offers of `account_id` whose id is not in `exclude`. An empty `exclude`
    /// selects every active offer of the account.
    async fn select_active(
        &self,
        account_id: i32,
        exclude: &HashSet<u64>,
    ) -> Result<Vec<Offer>, StoreError>;

    /// `(identity, hash)` for every stored offer.
    async fn load_hashes(&self) -> Result<Vec<(OfferKey, String)>, StoreError>;

    /// Insert accounts into the reference table, leaving existing rows alone.
    async fn upsert_accounts(&self, accounts: &[Account]) -> Result<u64, StoreError>;
}

// Order matters: `bind_attributes` binds in exactly this order.
const ATTRIBUTE_COLUMNS: [&str; 33] = [
    "package_name",
    "title",
    "description",
    "domain",
    "preview_url",
    "tracking_url",
    "business_model",
    "rate",
    "currency",
    "thumbnail",
    "countries",
    "cities",
    "categories",
    "languages",
    "black_list_sources",
    "mobile_support",
    "allowed_devices",
    "min_os_version",
    "app_price",
    "app_rating",
    "content_rating",
    "developer",
    "developer_website",
    "promo_video",
    "cap_enable",
    "cap_amount",
    "cap_current_amount",
    "cap_frequency",
    "capping_field",
    "capping_timeframe",
    "is_active",
    "status_changed_at",
    "hash",
];

const KEY_COLUMNS: [&str; 2] = ["offer_id", "account_id"];

fn bind_attributes<'q>(
    query: Query<'q, Postgres, PgArguments>,
    offer: &'q Offer,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(&offer.package_name)
        .bind(&offer.title)
        .bind(&offer.description)
        .bind(&offer.domain)
        .bind(&offer.preview_url)
        .bind(&offer.tracking_url)
        .bind(&offer.business_model)
        .bind(&offer.rate)
        .bind(&offer.currency)
        .bind(&offer.thumbnail)
        .bind(&offer.countries)
        .bind(&offer.cities)
        .bind(&offer.categories)
        .bind(&offer.languages)
        .bind(&offer.black_list_sources)
        .bind(&offer.mobile_support)
        .bind(&offer.allowed_devices)
        .bind(&offer.min_os_version)
        .bind(&offer.app_price)
        .bind(&offer.app_rating)
        .bind(&offer.content_rating)
        .bind(&offer.developer)
        .bind(&offer.developer_website)
        .bind(&offer.promo_video)
        .bind(&offer.cap_enable)
        .bind(&offer.cap_amount)
        .bind(&offer.cap_current_amount)
        .bind(&offer.cap_frequency)
        .bind(&offer.capping_field)
        .bind(&offer.capping_timeframe)
        .bind(offer.is_active)
        .bind(offer.status_changed_at)
        .bind(&offer.hash)
}

fn offer_id_to_db(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::OfferIdOutOfRange(id))
}

/// Pair each offer with its column id, dropping rows the column cannot hold.
fn storable_rows(offers: &[Offer]) -> Vec<(i64, &Offer)> {
    offers
        .iter()
        .filter_map(|offer| match offer_id_to_db(offer.id) {
            Ok(id) => Some((id, offer)),
            Err(err) => {
                warn!(account_id = offer.account_id, error = %err, "offer not inserted");
                None
            }
        })
        .collect()
}

fn offer_id_from_db(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::NegativeOfferId(id))
}

fn select_columns() -> String {
    KEY_COLUMNS
        .iter()
        .chain(ATTRIBUTE_COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_sql(rows: usize) -> String {
    let width = KEY_COLUMNS.len() + ATTRIBUTE_COLUMNS.len();
    let values = (0..rows)
        .map(|row| {
            let params = (1..=width)
                .map(|col| format!("${}", row * width + col))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({params})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    let updates = ATTRIBUTE_COLUMNS
        .iter()
        .map(|col| format!("{col} = EXCLUDED.{col}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO feedsync.offer ({}) VALUES {values} \
         ON CONFLICT (offer_id, account_id) DO UPDATE SET {updates}",
        select_columns()
    )
}

fn update_sql() -> String {
    let assignments = ATTRIBUTE_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = ${}", i + KEY_COLUMNS.len() + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE feedsync.offer SET {assignments} WHERE offer_id = $1 AND account_id = $2")
}

fn offer_from_row(row: &PgRow) -> Result<Offer, StoreError> {
    Ok(Offer {
        id: offer_id_from_db(row.try_get("offer_id")?)?,
        account_id: row.try_get("account_id")?,
        package_name: row.try_get("package_name")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        domain: row.try_get("domain")?,
        preview_url: row.try_get("preview_url")?,
        tracking_url: row.try_get("tracking_url")?,
        business_model: row.try_get("business_model")?,
        rate: row.try_get("rate")?,
        currency: row.try_get("currency")?,
        thumbnail: row.try_get("thumbnail")?,
        countries: row.try_get("countries")?,
        cities: row.try_get("cities")?,
        categories: row.try_get("categories")?,
        languages: row.try_get("languages")?,
        black_list_sources: row.try_get("black_list_sources")?,
        mobile_support: row.try_get("mobile_support")?,
        allowed_devices: row.try_get("allowed_devices")?,
        min_os_version: row.try_get("min_os_version")?,
        app_price: row.try_get("app_price")?,
        app_rating: row.try_get("app_rating")?,
        content_rating: row.try_get("content_rating")?,
        developer: row.try_get("developer")?,
        developer_website: row.try_get("developer_website")?,
        promo_video: row.try_get("promo_video")?,
        cap_enable: row.try_get("cap_enable")?,
        cap_amount: row.try_get("cap_amount")?,
        cap_current_amount: row.try_get("cap_current_amount")?,
        cap_frequency: row.try_get("cap_frequency")?,
        capping_field: row.try_get("capping_field")?,
        capping_timeframe: row.try_get("capping_timeframe")?,
        is_active: row.try_get("is_active")?,
        status_changed_at: row.try_get("status_changed_at")?,
        hash: row.try_get("hash")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgOfferStore {
    pool: PgPool,
}

impl PgOfferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl OfferStore for PgOfferStore {
    async fn insert_batch(&self, offers: &[Offer]) -> Result<u64, StoreError> {
        if offers.is_empty() {
            return Ok(0);
        }
        let rows = storable_rows(offers);
        if rows.is_empty() {
            return Ok(0);
        }

        let sql = insert_sql(rows.len());
        let mut query = sqlx::query(&sql);
        for (id, offer) in rows {
            query = bind_attributes(query.bind(id).bind(offer.account_id), offer);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn update(&self, offer: &Offer) -> Result<(), StoreError> {
        let id = offer_id_to_db(offer.id)?;
        let sql = update_sql();
        let query = bind_attributes(sqlx::query(&sql).bind(id).bind(offer.account_id), offer);
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(offer.key()));
        }
        Ok(())
    }

    async fn select_active(
        &self,
        account_id: i32,
        exclude: &HashSet<u64>,
    ) -> Result<Vec<Offer>, StoreError> {
        let base = format!(
            "SELECT {} FROM feedsync.offer WHERE is_active = TRUE AND account_id = $1",
            select_columns()
        );
        // Ids beyond BIGINT cannot be stored, so they never need excluding.
        let excluded: Vec<i64> = exclude
            .iter()
            .filter_map(|id| i64::try_from(*id).ok())
            .collect();
        let rows = if excluded.is_empty() {
            sqlx::query(&base)
                .bind(account_id)
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!("{base} AND NOT (offer_id = ANY($2))");
            sqlx::query(&sql)
                .bind(account_id)
                .bind(excluded)
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter().map(offer_from_row).collect()
    }

    async fn load_hashes(&self) -> Result<Vec<(OfferKey, String)>, StoreError> {
        let rows = sqlx::query("SELECT offer_id, account_id, hash FROM feedsync.offer")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let key = OfferKey::new(
                    offer_id_from_db(row.try_get("offer_id")?)?,
                    row.try_get("account_id")?,
                );
                Ok((key, row.try_get("hash")?))
            })
            .collect()
    }

    async fn upsert_accounts(&self, accounts: &[Account]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for account in accounts {
            let result = sqlx::query(
                "INSERT INTO feedsync.account (account_id, name) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(account.id)
            .bind(&account.name)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteCounts {
    pub insert_batches: u64,
    pub inserted_rows: u64,
    pub updates: u64,
}

impl WriteCounts {
    pub fn total_writes(&self) -> u64 {
        self.insert_batches + self.updates
    }
}

/// Process-local store with the same semantics as [`PgOfferStore`].
#[derive(Debug, Default)]
pub struct MemoryOfferStore {
    offers: RwLock<BTreeMap<OfferKey, Offer>>,
    accounts: RwLock<BTreeMap<i32, Account>>,
    insert_batches: AtomicU64,
    inserted_rows: AtomicU64,
    updates: AtomicU64,
}

impl MemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows without counting them as writes.
    pub async fn seed(&self, offers: impl IntoIterator<Item = Offer>) {
        let mut map = self.offers.write().await;
        for offer in offers {
            map.insert(offer.key(), offer);
        }
    }

    pub async fn get(&self, key: OfferKey) -> Option<Offer> {
        self.offers.read().await.get(&key).cloned()
    }

    pub async fn offers(&self) -> Vec<Offer> {
        self.offers.read().await.values().cloned().collect()
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.accounts.read().await.values().cloned().collect()
    }

    pub fn write_counts(&self) -> WriteCounts {
        WriteCounts {
            insert_batches: self.insert_batches.load(Ordering::SeqCst),
            inserted_rows: self.inserted_rows.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl OfferStore for MemoryOfferStore {
    async fn insert_batch(&self, offers: &[Offer]) -> Result<u64, StoreError> {
        if offers.is_empty() {
            return Ok(0);
        }
        let rows = storable_rows(offers);
        if rows.is_empty() {
            return Ok(0);
        }
        let mut map = self.offers.write().await;
        for (_, offer) in &rows {
            map.insert(offer.key(), (*offer).clone());
        }
        self.insert_batches.fetch_add(1, Ordering::SeqCst);
        self.inserted_rows
            .fetch_add(rows.len() as u64, Ordering::SeqCst);
        Ok(rows.len() as u64)
    }

    async fn update(&self, offer: &Offer) -> Result<(), StoreError> {
        let mut map = self.offers.write().await;
        let Some(slot) = map.get_mut(&offer.key()) else {
            return Err(StoreError::NotFound(offer.key()));
        };
        *slot = offer.clone();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn select_active(
        &self,
        account_id: i32,
        exclude: &HashSet<u64>,
    ) -> Result<Vec<Offer>, StoreError> {
        Ok(self
            .offers
            .read()
            .await
            .values()
            .filter(|o| o.account_id == account_id && o.is_active && !exclude.contains(&o.id))
            .cloned()
            .collect())
    }

    async fn load_hashes(&self) -> Result<Vec<(OfferKey, String)>, StoreError> {
        Ok(self
            .offers
            .read()
            .await
            .iter()
            .map(|(key, offer)| (*key, offer.hash.clone()))
            .collect())
    }

    async fn upsert_accounts(&self, accounts: &[Account]) -> Result<u64, StoreError> {
        let mut map = self.accounts.write().await;
        let mut inserted = 0;
        for account in accounts {
            let name_taken = map.values().any(|existing| existing.name == account.name);
            if map.contains_key(&account.id) || name_taken {
                continue;
            }
            map.insert(account.id, account.clone());
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn offer(id: u64, account_id: i32, active: bool) -> Offer {
        let mut offer = Offer::new(id, account_id, Utc::now());
        offer.is_active = active;
        offer.refresh_hash();
        offer
    }

    #[test]
    fn insert_sql_numbers_placeholders_per_row() {
        let sql = insert_sql(2);
        assert!(sql.contains("($1, $2, "));
        assert!(sql.contains("$35)"));
        assert!(sql.contains("($36, $37, "));
        assert!(sql.ends_with("hash = EXCLUDED.hash"));
        assert!(!sql.contains("offer_id = EXCLUDED"));
    }

    #[test]
    fn update_sql_keys_on_primary_key() {
        let sql = update_sql();
        assert!(sql.starts_with("UPDATE feedsync.offer SET package_name = $3,"));
        assert!(sql.contains("hash = $35 WHERE offer_id = $1 AND account_id = $2"));
    }

    #[test]
    fn offer_ids_beyond_bigint_are_rejected() {
        assert!(matches!(
            offer_id_to_db(u64::MAX),
            Err(StoreError::OfferIdOutOfRange(_))
        ));
        assert_eq!(offer_id_to_db(42).unwrap(), 42);
        assert!(matches!(offer_id_from_db(-1), Err(StoreError::NegativeOfferId(-1))));
    }

    #[tokio::test]
    async fn unstorable_id_does_not_sink_its_batch() {
        let store = MemoryOfferStore::new();
        let batch = [offer(1, 1, true), offer(u64::MAX, 1, true), offer(2, 1, true)];
        let ids: Vec<i64> = storable_rows(&batch).iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);

        assert_eq!(store.insert_batch(&batch).await.unwrap(), 2);
        let stored: Vec<u64> = store.offers().await.iter().map(|o| o.id).collect();
        assert_eq!(stored, vec![1, 2]);
        assert_eq!(store.write_counts().inserted_rows, 2);

        let remaining = store
            .select_active(1, &HashSet::from([1, u64::MAX]))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);
    }

    #[tokio::test]
    async fn memory_select_active_filters_account_status_and_exclusions() {
        let store = MemoryOfferStore::new();
        store
            .seed([
                offer(1, 1, true),
                offer(2, 1, true),
                offer(3, 1, false),
                offer(4, 2, true),
            ])
            .await;

        let all: Vec<u64> = store
            .select_active(1, &HashSet::new())
            .await
            .unwrap()
            .iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(all, vec![1, 2]);

        let excluded: Vec<u64> = store
            .select_active(1, &HashSet::from([1]))
            .await
            .unwrap()
            .iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(excluded, vec![2]);
    }

    #[tokio::test]
    async fn memory_update_requires_existing_row() {
        let store = MemoryOfferStore::new();
        let err = store.update(&offer(9, 1, true)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(key) if key == OfferKey::new(9, 1)));
        assert_eq!(store.write_counts().updates, 0);
    }

    #[tokio::test]
    async fn memory_account_upsert_ignores_conflicts() {
        let store = MemoryOfferStore::new();
        let account = |id: i32, name: &str| Account {
            id,
            name: name.into(),
            hash: String::new(),
            feed_id: 1,
            url: String::new(),
        };
        assert_eq!(
            store
                .upsert_accounts(&[account(1, "standard"), account(2, "premium")])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .upsert_accounts(&[account(1, "renamed"), account(3, "standard")])
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.accounts().await.len(), 2);
    }
}
