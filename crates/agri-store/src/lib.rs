//! Reconciliation store: newer-wins upserts and the read-only query surface.
//!
//! Backends implement the primitive [`Store`] operations; the insert/update/skip
//! decision lives in [`upsert`] and is shared by every backend.

mod memory;
mod sqlite;

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use agri_core::{
    MarketFilter, MarketObservation, MarketSnapshot, MarketStats, ObservationKey, Scheme,
    SchemeFilter, SchemeStats, StatsOptions, Stored, KNOWN_STATES,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "agri-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("duplicate key {0}")]
    Duplicate(String),
    #[error("no stored record for key {0}")]
    Missing(String),
    #[error("corrupt stored value in {column}: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("unsupported store url `{0}`")]
    UnsupportedUrl(String),
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the failure concerns a single record (skip it) rather than the store itself (abort).
    pub fn is_record_level(&self) -> bool {
        match self {
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Database(_)
                    | sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::Encode(_)
            ),
            StoreError::Duplicate(_) | StoreError::Missing(_) | StoreError::Corrupt { .. } => true,
            StoreError::UnsupportedUrl(_) | StoreError::Io(_) => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence primitives over schemes and market observations.
#[async_trait]
pub trait Store: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn scheme_last_updated(&self, scheme_id: &str) -> StoreResult<Option<DateTime<Utc>>>;
    async fn insert_scheme(&self, scheme: &Scheme, now: DateTime<Utc>) -> StoreResult<()>;
    async fn update_scheme(&self, scheme: &Scheme, now: DateTime<Utc>) -> StoreResult<()>;

    async fn observation_last_updated(
        &self,
        key: &ObservationKey,
    ) -> StoreResult<Option<DateTime<Utc>>>;
    async fn insert_observation(&self, obs: &MarketObservation, now: DateTime<Utc>) -> StoreResult<()>;
    async fn update_observation(&self, obs: &MarketObservation, now: DateTime<Utc>) -> StoreResult<()>;

    /// Schemes matching every set filter, newest `lastUpdated` first.
    async fn list_schemes(&self, filter: &SchemeFilter) -> StoreResult<Vec<Stored<Scheme>>>;
    async fn get_scheme(&self, scheme_id: &str) -> StoreResult<Option<Stored<Scheme>>>;
    async fn scheme_stats(&self, opts: StatsOptions, now: DateTime<Utc>) -> StoreResult<SchemeStats>;

    async fn list_market(&self, filter: &MarketFilter) -> StoreResult<MarketSnapshot>;
    async fn market_stats(&self, opts: StatsOptions, now: DateTime<Utc>) -> StoreResult<MarketStats>;

    /// Distinct non-empty states recorded on schemes and market prices.
    async fn stored_states(&self) -> StoreResult<Vec<String>>;

    async fn close(&self);
}

/// Stored states merged with [`KNOWN_STATES`], sorted and deduplicated.
pub async fn available_states(store: &dyn Store) -> StoreResult<Vec<String>> {
    let mut states = store.stored_states().await?.into_iter().collect::<BTreeSet<_>>();
    states.extend(KNOWN_STATES.iter().map(|s| s.to_string()));
    Ok(states.into_iter().collect())
}

/// An entity that can be reconciled against a [`Store`] by key and `lastUpdated`.
#[async_trait]
pub trait Reconcile: Send + Sync {
    fn describe(&self) -> String;
    fn last_updated(&self) -> DateTime<Utc>;

    async fn stored_last_updated(&self, store: &dyn Store) -> StoreResult<Option<DateTime<Utc>>>;
    async fn insert_into(&self, store: &dyn Store, now: DateTime<Utc>) -> StoreResult<()>;
    async fn update_in(&self, store: &dyn Store, now: DateTime<Utc>) -> StoreResult<()>;
}

#[async_trait]
impl Reconcile for Scheme {
    fn describe(&self) -> String {
        self.scheme_id.clone()
    }

    fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    async fn stored_last_updated(&self, store: &dyn Store) -> StoreResult<Option<DateTime<Utc>>> {
        store.scheme_last_updated(&self.scheme_id).await
    }

    async fn insert_into(&self, store: &dyn Store, now: DateTime<Utc>) -> StoreResult<()> {
        store.insert_scheme(self, now).await
    }

    async fn update_in(&self, store: &dyn Store, now: DateTime<Utc>) -> StoreResult<()> {
        store.update_scheme(self, now).await
    }
}

#[async_trait]
impl Reconcile for MarketObservation {
    fn describe(&self) -> String {
        let key = self.key();
        format!("{}@{}/{}", key.commodity, key.market_name, key.observation_date)
    }

    fn last_updated(&self) -> DateTime<Utc> {
        MarketObservation::last_updated(self)
    }

    async fn stored_last_updated(&self, store: &dyn Store) -> StoreResult<Option<DateTime<Utc>>> {
        store.observation_last_updated(&self.key()).await
    }

    async fn insert_into(&self, store: &dyn Store, now: DateTime<Utc>) -> StoreResult<()> {
        store.insert_observation(self, now).await
    }

    async fn update_in(&self, store: &dyn Store, now: DateTime<Utc>) -> StoreResult<()> {
        store.update_observation(self, now).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl UpsertCounts {
    pub fn processed(&self) -> u64 {
        self.inserted + self.updated + self.unchanged + self.failed
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

impl fmt::Display for UpsertCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} new, {} updated, {} unchanged, {} failed",
            self.inserted, self.updated, self.unchanged, self.failed
        )
    }
}

/// Applies the newer-wins rule to one record.
pub async fn upsert_one<R: Reconcile + ?Sized>(
    store: &dyn Store,
    record: &R,
    now: DateTime<Utc>,
) -> StoreResult<UpsertOutcome> {
    match record.stored_last_updated(store).await? {
        None => {
            record.insert_into(store, now).await?;
            Ok(UpsertOutcome::Inserted)
        }
        Some(stored) if record.last_updated() > stored => {
            record.update_in(store, now).await?;
            Ok(UpsertOutcome::Updated)
        }
        Some(_) => Ok(UpsertOutcome::Unchanged),
    }
}

/// Upserts a batch. Record-level failures are logged and counted; store-level
/// failures abort the batch (records already written stay written).
pub async fn upsert<R: Reconcile>(
    store: &dyn Store,
    records: &[R],
    now: DateTime<Utc>,
) -> StoreResult<UpsertCounts> {
    let mut counts = UpsertCounts::default();
    for record in records {
        match upsert_one(store, record, now).await {
            Ok(outcome) => {
                debug!(key = %record.describe(), ?outcome, "reconciled record");
                counts.record(outcome);
            }
            Err(err) if err.is_record_level() => {
                warn!(key = %record.describe(), error = %err, "skipping record after store failure");
                counts.failed += 1;
            }
            Err(err) => return Err(err),
        }
    }
    info!(
        backend = store.backend(),
        counts = %counts,
        "store operations completed"
    );
    Ok(counts)
}

/// Where a cycle or query should open its store.
#[derive(Clone)]
pub enum StoreConnector {
    Sqlite(String),
    /// `sqlite::memory:` lives only as long as its pool, so every open shares one.
    SqliteMemory {
        url: String,
        handle: Arc<OnceCell<SqliteStore>>,
    },
    Memory(MemoryStore),
}

impl StoreConnector {
    /// Accepts `sqlite:` URLs and `memory://`. A bare path is treated as a SQLite file.
    pub fn from_url(url: &str) -> StoreResult<Self> {
        let url = url.trim();
        if url.starts_with("memory:") {
            Ok(StoreConnector::Memory(MemoryStore::new()))
        } else if url.starts_with("sqlite:") && url.contains(":memory:") {
            Ok(StoreConnector::SqliteMemory {
                url: url.to_string(),
                handle: Arc::new(OnceCell::new()),
            })
        } else if url.starts_with("sqlite:") {
            Ok(StoreConnector::Sqlite(url.to_string()))
        } else if url.is_empty() || url.contains("://") {
            Err(StoreError::UnsupportedUrl(url.to_string()))
        } else {
            Ok(StoreConnector::Sqlite(format!("sqlite://{url}")))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StoreConnector::Sqlite(url) | StoreConnector::SqliteMemory { url, .. } => url.clone(),
            StoreConnector::Memory(_) => "memory://".to_string(),
        }
    }

    /// Opens a fresh handle. Callers close it when their unit of work ends.
    pub async fn open(&self) -> StoreResult<Box<dyn Store>> {
        match self {
            StoreConnector::Sqlite(url) => {
                if let Some(parent) = sqlite_file_parent(url) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Ok(Box::new(SqliteStore::connect(url).await?))
            }
            StoreConnector::SqliteMemory { url, handle } => {
                let store = handle.get_or_try_init(|| SqliteStore::connect(url)).await?;
                Ok(Box::new(store.clone().kept_open()))
            }
            StoreConnector::Memory(store) => Ok(Box::new(store.clone())),
        }
    }
}

fn sqlite_file_parent(url: &str) -> Option<&Path> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Path::new(path).parent().filter(|p| !p.as_os_str().is_empty())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn connector_parses_urls() {
        assert!(matches!(
            StoreConnector::from_url("memory://").unwrap(),
            StoreConnector::Memory(_)
        ));
        match StoreConnector::from_url("data/agriai.db").unwrap() {
            StoreConnector::Sqlite(url) => assert_eq!(url, "sqlite://data/agriai.db"),
            _ => panic!("expected sqlite"),
        }
        assert!(matches!(
            StoreConnector::from_url("sqlite::memory:").unwrap(),
            StoreConnector::SqliteMemory { .. }
        ));
        assert!(matches!(
            StoreConnector::from_url("postgres://localhost/agri"),
            Err(StoreError::UnsupportedUrl(_))
        ));
    }

    #[tokio::test]
    async fn in_memory_sqlite_outlives_each_handle() {
        let connector = StoreConnector::from_url("sqlite::memory:").unwrap();

        let writer = connector.open().await.unwrap();
        let counts = upsert(writer.as_ref(), &[scheme("PM-KISAN", "M", "Central", at(1, 0))], at(1, 1))
            .await
            .unwrap();
        assert_eq!(counts.inserted, 1);
        writer.close().await;

        let reader = connector.clone().open().await.unwrap();
        assert!(reader.get_scheme("PM-KISAN").await.unwrap().is_some());
        assert_eq!(reader.list_schemes(&SchemeFilter::default()).await.unwrap().len(), 1);
        reader.close().await;
    }

    #[test]
    fn sqlite_parent_dir_is_extracted() {
        assert_eq!(
            sqlite_file_parent("sqlite://data/agriai.db?mode=rwc"),
            Some(Path::new("data"))
        );
        assert_eq!(sqlite_file_parent("sqlite://agriai.db"), None);
        assert_eq!(sqlite_file_parent("sqlite::memory:"), None);
    }

    #[test]
    fn record_level_errors_are_distinguished() {
        assert!(StoreError::Duplicate("x".into()).is_record_level());
        assert!(!StoreError::Database(sqlx::Error::PoolClosed).is_record_level());
        assert!(StoreError::Database(sqlx::Error::RowNotFound).is_record_level());
    }

    #[tokio::test]
    async fn available_states_merge_known_list() {
        let store = MemoryStore::new();
        let mut s = scheme("X", "M", "State", at(1, 0));
        s.state = "Atlantis".into();
        upsert(&store, &[s], at(1, 1)).await.unwrap();

        let states = available_states(&store).await.unwrap();
        assert!(states.contains(&"Atlantis".to_string()));
        assert!(states.contains(&"Kerala".to_string()));
        let mut sorted = states.clone();
        sorted.sort();
        assert_eq!(states, sorted);
        assert_eq!(states.len(), KNOWN_STATES.len() + 1);
    }
}
