//! Cycle orchestration: configuration, source wiring and the fetch-normalize-upsert cycle.

mod scheduler;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use agri_adapters::{
    normalize_market, normalize_schemes, AdapterError, ApiSource, BulkFileSource, BulkLocation,
    EndpointSpec, FallbackChain, FetchContext, NormalizeContext, Normalized, SourceAdapter,
};
use agri_core::{CycleResult, CycleStatus, Dataset};
use agri_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, ResponseArchive};
use agri_store::{upsert, Reconcile, StoreConnector, StoreError, UpsertCounts};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use scheduler::{ScheduleMode, Scheduler};

pub const CRATE_NAME: &str = "agri-sync";

const DEFAULT_SCHEME_ENDPOINTS: &[&str] = &[
    "https://api.data.gov.in/resource/9ef84268-d588-465a-a308-a864a43d0070",
    "https://api.data.gov.in/resource/agriculture-schemes",
    "https://api.data.gov.in/resource/farmer-schemes",
];

const DEFAULT_MARKET_ENDPOINTS: &[&str] =
    &["https://api.data.gov.in/resource/9ef84268-d588-465a-a308-a864a43d0070"];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_key: String,
    pub http_timeout_secs: u64,
    pub http_retries: usize,
    pub page_limit: usize,
    pub archive_dir: Option<PathBuf>,
    pub scheme_fallback: Option<String>,
    pub market_fallback: Option<String>,
    pub user_agent: String,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or blank values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite://agriai.db".to_string()),
            api_key: get("AGRI_API_KEY").unwrap_or_default(),
            http_timeout_secs: parse_or(get("AGRI_HTTP_TIMEOUT_SECS"), 30),
            http_retries: parse_or(get("AGRI_HTTP_RETRIES"), 1),
            page_limit: parse_or(get("AGRI_PAGE_LIMIT"), 1000),
            archive_dir: get("AGRI_ARCHIVE_DIR").map(PathBuf::from),
            scheme_fallback: get("AGRI_SCHEME_FALLBACK"),
            market_fallback: get("AGRI_MARKET_FALLBACK"),
            user_agent: get("AGRI_USER_AGENT")
                .unwrap_or_else(|| format!("agri-sync/{}", env!("CARGO_PKG_VERSION"))),
            web_port: parse_or(get("AGRI_WEB_PORT"), 8000),
            workspace_root: get("AGRI_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..BackoffPolicy::default()
            },
        }
    }

    fn env_fallback(&self, dataset: Dataset) -> Option<&str> {
        match dataset {
            Dataset::Schemes => self.scheme_fallback.as_deref(),
            Dataset::Market => self.market_fallback.as_deref(),
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Endpoint registry per dataset, optionally overridden by `sources.yaml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SourceRegistry {
    #[serde(default)]
    pub schemes: DatasetSources,
    #[serde(default)]
    pub market: DatasetSources,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DatasetSources {
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        let endpoints = |urls: &[&str]| -> Vec<EndpointSpec> {
            urls.iter().map(|u| EndpointSpec::new(*u)).collect()
        };
        Self {
            schemes: DatasetSources {
                endpoints: endpoints(DEFAULT_SCHEME_ENDPOINTS),
                ..Default::default()
            },
            market: DatasetSources {
                endpoints: endpoints(DEFAULT_MARKET_ENDPOINTS),
                ..Default::default()
            },
        }
    }

    /// Reads `<root>/sources.yaml` when present, layering it over [`SourceRegistry::builtin`].
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::builtin()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let overrides: SourceRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "loaded source registry overrides");
        Ok(Self::builtin().overlay(overrides))
    }

    fn overlay(mut self, other: SourceRegistry) -> Self {
        self.schemes = self.schemes.overlay(other.schemes);
        self.market = self.market.overlay(other.market);
        self
    }

    pub fn for_dataset(&self, dataset: Dataset) -> &DatasetSources {
        match dataset {
            Dataset::Schemes => &self.schemes,
            Dataset::Market => &self.market,
        }
    }
}

impl DatasetSources {
    fn overlay(self, other: DatasetSources) -> Self {
        Self {
            endpoints: if other.endpoints.is_empty() {
                self.endpoints
            } else {
                other.endpoints
            },
            api_key: other.api_key.or(self.api_key),
            fallback: other.fallback.or(self.fallback),
        }
    }
}

fn resolve_bulk_location(raw: &str, workspace_root: &Path) -> BulkLocation {
    match BulkLocation::parse(raw) {
        BulkLocation::File(path) if path.is_relative() => BulkLocation::File(workspace_root.join(path)),
        other => other,
    }
}

/// API endpoints first, then the bulk fallback when one is configured (env wins over YAML).
pub fn build_source(
    config: &SyncConfig,
    registry: &SourceRegistry,
    dataset: Dataset,
    http: &HttpFetcher,
) -> Box<dyn SourceAdapter> {
    let sources = registry.for_dataset(dataset);
    let api_key = sources.api_key.clone().unwrap_or_else(|| config.api_key.clone());
    if api_key.is_empty() {
        warn!(%dataset, "no api key configured; upstream will likely reject requests");
    }

    let mut api = ApiSource::new(
        format!("{dataset}-api"),
        sources.endpoints.clone(),
        api_key,
        config.page_limit,
        http.clone(),
    );
    if let Some(dir) = &config.archive_dir {
        api = api.with_archive(ResponseArchive::new(dir.clone()));
    }

    let fallback = config.env_fallback(dataset).or(sources.fallback.as_deref());
    match fallback {
        Some(raw) => {
            let bulk = BulkFileSource::new(
                format!("{dataset}-bulk"),
                resolve_bulk_location(raw, &config.workspace_root),
                http.clone(),
            );
            Box::new(FallbackChain::new(
                format!("{dataset}-sources"),
                vec![Box::new(api), Box::new(bulk)],
            ))
        }
        None => Box::new(api),
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no source configured for dataset {0}")]
    Unconfigured(Dataset),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An `error` outcome. The recorded result is kept so callers can still report it.
#[derive(Debug, Error)]
#[error("{dataset} cycle {cycle_id} errored: {source}", dataset = .result.dataset, cycle_id = .result.cycle_id)]
pub struct CycleError {
    pub result: CycleResult,
    #[source]
    pub source: PipelineError,
}

enum Outcome {
    NoData,
    NoValidRecords {
        source: String,
        dropped: usize,
    },
    Stored {
        source: String,
        counts: UpsertCounts,
        dropped: usize,
    },
}

/// Runs one cycle per call; holds a source per dataset and a connector for the store.
///
/// At most one cycle runs at a time, whichever trigger (scheduler, HTTP, CLI) started it.
pub struct CycleRunner {
    sources: BTreeMap<Dataset, Box<dyn SourceAdapter>>,
    store: StoreConnector,
    cycle_lock: Mutex<()>,
}

/// Exclusive right to run cycles on a [`CycleRunner`]; released on drop.
pub struct CyclePermit<'a> {
    runner: &'a CycleRunner,
    _held: MutexGuard<'a, ()>,
}

impl CyclePermit<'_> {
    pub async fn run_cycle(&self, dataset: Dataset) -> Result<CycleResult, CycleError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id, %dataset);
        self.runner.run_recorded(cycle_id, dataset).instrument(span).await
    }

    /// Runs each dataset in order, logging errors and collecting every recorded result.
    pub async fn run_datasets(&self, datasets: &[Dataset]) -> Vec<CycleResult> {
        let mut results = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            match self.run_cycle(*dataset).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    error!(error = %err, "cycle reported an error");
                    results.push(err.result);
                }
            }
        }
        results
    }
}

impl CycleRunner {
    pub fn new(store: StoreConnector) -> Self {
        Self {
            sources: BTreeMap::new(),
            store,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn with_source(mut self, dataset: Dataset, source: Box<dyn SourceAdapter>) -> Self {
        self.sources.insert(dataset, source);
        self
    }

    /// Wires every dataset from configuration, loading `sources.yaml` if present.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.workspace_root).await?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let store = StoreConnector::from_url(&config.database_url)
            .with_context(|| format!("invalid DATABASE_URL {}", config.database_url))?;

        let mut runner = Self::new(store);
        for dataset in Dataset::ALL {
            runner = runner.with_source(dataset, build_source(config, &registry, dataset, &http));
        }
        Ok(runner)
    }

    pub fn store(&self) -> &StoreConnector {
        &self.store
    }

    /// Waits for any running cycle to finish first.
    pub async fn acquire(&self) -> CyclePermit<'_> {
        CyclePermit {
            runner: self,
            _held: self.cycle_lock.lock().await,
        }
    }

    /// `None` while another cycle is running.
    pub fn try_acquire(&self) -> Option<CyclePermit<'_>> {
        let held = self.cycle_lock.try_lock().ok()?;
        Some(CyclePermit {
            runner: self,
            _held: held,
        })
    }

    pub fn is_running(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    pub async fn run_cycle(&self, dataset: Dataset) -> Result<CycleResult, CycleError> {
        self.acquire().await.run_cycle(dataset).await
    }

    async fn run_recorded(&self, cycle_id: Uuid, dataset: Dataset) -> Result<CycleResult, CycleError> {
        let started_at = Utc::now();
        info!("cycle started");
        let outcome = self.execute(dataset, started_at).await;
        let finished_at = Utc::now();
        let mut result = CycleResult::zeroed(cycle_id, dataset, CycleStatus::Failed, started_at, finished_at);

        match outcome {
            Ok(Outcome::NoData) => {
                warn!("no data from any configured source");
                Ok(result)
            }
            Ok(Outcome::NoValidRecords { source, dropped }) => {
                warn!(%source, dropped, "no valid records after normalization");
                result.dropped_count = dropped as u64;
                result.source = Some(source);
                Ok(result)
            }
            Ok(Outcome::Stored {
                source,
                counts,
                dropped,
            }) => {
                result.status = CycleStatus::Success;
                result.inserted_count = counts.inserted;
                result.updated_count = counts.updated;
                result.unchanged_count = counts.unchanged;
                result.failed_count = counts.failed;
                result.dropped_count = dropped as u64;
                result.total_processed = counts.processed();
                result.source = Some(source);
                info!(
                    inserted = counts.inserted,
                    updated = counts.updated,
                    unchanged = counts.unchanged,
                    failed = counts.failed,
                    dropped,
                    elapsed_seconds = result.elapsed_seconds,
                    "cycle completed"
                );
                Ok(result)
            }
            Err(err) => {
                result.status = CycleStatus::Error;
                result.error = Some(err.to_string());
                error!(error = %err, elapsed_seconds = result.elapsed_seconds, "cycle errored");
                Err(CycleError { result, source: err })
            }
        }
    }

    async fn execute(&self, dataset: Dataset, fetched_at: DateTime<Utc>) -> Result<Outcome, PipelineError> {
        let source = self
            .sources
            .get(&dataset)
            .ok_or(PipelineError::Unconfigured(dataset))?;
        let ctx = FetchContext { dataset, fetched_at };
        let Some(batch) = source.fetch(&ctx).await? else {
            return Ok(Outcome::NoData);
        };

        let nctx = NormalizeContext { fetched_at };
        match dataset {
            Dataset::Schemes => self.persist(batch.source, normalize_schemes(&batch.records, &nctx)).await,
            Dataset::Market => self.persist(batch.source, normalize_market(&batch.records, &nctx)).await,
        }
    }

    async fn persist<R: Reconcile>(
        &self,
        source: String,
        normalized: Normalized<R>,
    ) -> Result<Outcome, PipelineError> {
        let dropped = normalized.dropped;
        if normalized.records.is_empty() {
            return Ok(Outcome::NoValidRecords { source, dropped });
        }

        let store = self.store.open().await?;
        let counts = upsert(store.as_ref(), &normalized.records, Utc::now()).await;
        store.close().await;
        Ok(Outcome::Stored {
            source,
            counts: counts?,
            dropped,
        })
    }
}

/// Runs the datasets back to back under one permit.
pub async fn run_datasets(runner: &CycleRunner, datasets: &[Dataset]) -> Vec<CycleResult> {
    runner.acquire().await.run_datasets(datasets).await
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use agri_adapters::{RawBatch, RawRecord};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;

    /// Replays queued batches, one per fetch; `None` stands for NoData.
    pub struct ScriptedSource {
        batches: Mutex<VecDeque<Option<Vec<RawRecord>>>>,
    }

    impl ScriptedSource {
        pub fn new(batches: Vec<Option<Vec<RawRecord>>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self, _ctx: &FetchContext) -> Result<Option<RawBatch>, AdapterError> {
            let next = self.batches.lock().await.pop_front().flatten();
            Ok(next.map(|records| RawBatch {
                source: "scripted".to_string(),
                records,
            }))
        }
    }

    /// Sleeps inside every fetch and records the most fetches seen in flight at once.
    pub struct SlowSource {
        in_flight: AtomicUsize,
        peak: Arc<AtomicUsize>,
    }

    impl SlowSource {
        pub fn new() -> (Self, Arc<AtomicUsize>) {
            let peak = Arc::new(AtomicUsize::new(0));
            let source = Self {
                in_flight: AtomicUsize::new(0),
                peak: peak.clone(),
            };
            (source, peak)
        }
    }

    #[async_trait]
    impl SourceAdapter for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, _ctx: &FetchContext) -> Result<Option<RawBatch>, AdapterError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(RawBatch {
                source: "slow".to_string(),
                records: vec![scheme_record("PM Kisan", "2026-03-01")],
            }))
        }
    }

    pub fn scheme_record(name: &str, last_updated: &str) -> RawRecord {
        match json!({
            "scheme_name": name,
            "ministry": "Ministry of Agriculture",
            "last_updated": last_updated,
        }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use agri_store::MemoryStore;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::test_support::*;
    use super::*;

    fn memory_runner(source: ScriptedSource) -> (CycleRunner, MemoryStore) {
        let store = MemoryStore::new();
        let runner = CycleRunner::new(StoreConnector::Memory(store.clone()))
            .with_source(Dataset::Schemes, Box::new(source));
        (runner, store)
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = SyncConfig::from_lookup(|_| None);
        assert_eq!(defaults.database_url, "sqlite://agriai.db");
        assert_eq!(defaults.http_timeout_secs, 30);
        assert_eq!(defaults.page_limit, 1000);
        assert_eq!(defaults.http_retries, 1);
        assert_eq!(defaults.web_port, 8000);
        assert!(defaults.archive_dir.is_none());

        let env = HashMap::from([
            ("DATABASE_URL", "memory://"),
            ("AGRI_HTTP_TIMEOUT_SECS", "5"),
            ("AGRI_PAGE_LIMIT", "not-a-number"),
            ("AGRI_SCHEME_FALLBACK", "  "),
            ("AGRI_MARKET_FALLBACK", "data/market.json"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.database_url, "memory://");
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.page_limit, 1000);
        assert!(config.scheme_fallback.is_none());
        assert_eq!(config.market_fallback.as_deref(), Some("data/market.json"));
        assert_eq!(config.http_client_config().timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn registry_overlays_yaml_on_builtin_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let missing = SourceRegistry::load(dir.path()).await.unwrap();
        assert_eq!(missing, SourceRegistry::builtin());
        assert_eq!(missing.schemes.endpoints.len(), 3);

        std::fs::write(
            dir.path().join("sources.yaml"),
            "market:\n  api_key: market-key\n  fallback: bulk/market.json\n  endpoints:\n    - url: http://localhost:9/market\n      params:\n        filters[state]: Punjab\n",
        )
        .unwrap();
        let registry = SourceRegistry::load(dir.path()).await.unwrap();
        assert_eq!(registry.schemes, SourceRegistry::builtin().schemes);
        assert_eq!(registry.market.endpoints.len(), 1);
        assert_eq!(
            registry.market.endpoints[0].params.get("filters[state]").map(String::as_str),
            Some("Punjab")
        );
        assert_eq!(registry.market.api_key.as_deref(), Some("market-key"));
    }

    #[tokio::test]
    async fn malformed_registry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sources.yaml"), "schemes: [not, a, map]").unwrap();
        assert!(SourceRegistry::load(dir.path()).await.is_err());
    }

    #[test]
    fn relative_bulk_paths_resolve_against_workspace_root() {
        let root = Path::new("/srv/agri");
        assert_eq!(
            resolve_bulk_location("bulk/schemes.json", root),
            BulkLocation::File(root.join("bulk/schemes.json"))
        );
        assert_eq!(
            resolve_bulk_location("https://example.org/s.json", root),
            BulkLocation::Url("https://example.org/s.json".into())
        );
    }

    #[tokio::test]
    async fn newer_record_updates_on_second_cycle() {
        let first = vec![
            scheme_record("PM Kisan", "2026-03-01"),
            scheme_record("PMFBY", "2026-03-01"),
            scheme_record("Soil Health Card", "2026-03-01"),
        ];
        let second = vec![
            scheme_record("PM Kisan", "2026-03-01"),
            scheme_record("PMFBY", "2026-03-01"),
            scheme_record("Soil Health Card", "2026-03-02 09:30:00"),
        ];
        let (runner, store) = memory_runner(ScriptedSource::new(vec![Some(first), Some(second)]));

        let r1 = runner.run_cycle(Dataset::Schemes).await.unwrap();
        assert_eq!(r1.status, CycleStatus::Success);
        assert_eq!((r1.inserted_count, r1.updated_count), (3, 0));
        assert_eq!(r1.total_processed, 3);

        let r2 = runner.run_cycle(Dataset::Schemes).await.unwrap();
        assert_eq!((r2.inserted_count, r2.updated_count), (0, 1));
        assert_eq!(r2.unchanged_count, 2);
        assert_ne!(r1.cycle_id, r2.cycle_id);
        assert!(r2.elapsed_seconds >= 0.0);

        use agri_store::Store;
        let stored = store.get_scheme("soil-health-card").await.unwrap().unwrap();
        assert_eq!(stored.record.last_updated.to_rfc3339(), "2026-03-02T09:30:00+00:00");
    }

    #[tokio::test]
    async fn no_data_is_a_failed_cycle() {
        let (runner, _) = memory_runner(ScriptedSource::new(vec![None]));
        let result = runner.run_cycle(Dataset::Schemes).await.unwrap();
        assert_eq!(result.status, CycleStatus::Failed);
        assert_eq!(result.inserted_count + result.updated_count, 0);
        assert!(result.source.is_none());
    }

    #[tokio::test]
    async fn zero_valid_records_is_a_failed_cycle() {
        let nameless = match json!({"description": "no id or name"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let (runner, _) = memory_runner(ScriptedSource::new(vec![Some(vec![nameless])]));
        let result = runner.run_cycle(Dataset::Schemes).await.unwrap();
        assert_eq!(result.status, CycleStatus::Failed);
        assert_eq!(result.dropped_count, 1);
        assert_eq!(result.total_processed, 0);
    }

    #[tokio::test]
    async fn unconfigured_dataset_is_an_error_with_a_result() {
        let (runner, _) = memory_runner(ScriptedSource::new(vec![]));
        let err = runner.run_cycle(Dataset::Market).await.unwrap_err();
        assert_eq!(err.result.status, CycleStatus::Error);
        assert_eq!(err.result.dataset, Dataset::Market);
        assert!(err.result.error.as_deref().unwrap_or_default().contains("market"));
    }

    #[tokio::test]
    async fn unopenable_store_is_an_error_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let url = format!("sqlite://{}", blocker.join("sub").join("agri.db").display());

        let runner = CycleRunner::new(StoreConnector::from_url(&url).unwrap()).with_source(
            Dataset::Schemes,
            Box::new(ScriptedSource::new(vec![Some(vec![scheme_record("X", "2026-03-01")])])),
        );
        let err = runner.run_cycle(Dataset::Schemes).await.unwrap_err();
        assert_eq!(err.result.status, CycleStatus::Error);
        assert_eq!(err.result.inserted_count, 0);
        assert!(matches!(err.source, PipelineError::Store(_)));
    }

    #[tokio::test]
    async fn configured_runner_fetches_from_local_upstream() {
        let app = Router::new().route(
            "/market",
            get(|| async {
                Json(json!({
                    "records": [
                        {"commodity": "Wheat", "market": "Delhi Mandi", "state": "Delhi",
                         "modal_price": "2,500", "arrival_date": "01/03/2026"},
                        {"commodity": "Onion", "market": "Lasalgaon", "modal_price": "0"}
                    ]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sources.yaml"),
            format!("market:\n  endpoints:\n    - url: http://{addr}/market\n"),
        )
        .unwrap();
        let db = dir.path().join("agri.db");
        let env = HashMap::from([
            ("DATABASE_URL", format!("sqlite://{}", db.display())),
            ("AGRI_WORKSPACE_ROOT", dir.path().display().to_string()),
            ("AGRI_HTTP_RETRIES", "0".to_string()),
            ("AGRI_ARCHIVE_DIR", dir.path().join("archive").display().to_string()),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).cloned());

        let runner = CycleRunner::from_config(&config).await.unwrap();
        let result = runner.run_cycle(Dataset::Market).await.unwrap();
        assert_eq!(result.status, CycleStatus::Success);
        assert_eq!(result.inserted_count, 1);
        assert_eq!(result.dropped_count, 1);
        assert_eq!(result.source.as_deref(), Some(format!("http://{addr}/market").as_str()));
        assert!(dir.path().join("archive").exists());

        let again = runner.run_cycle(Dataset::Market).await.unwrap();
        assert_eq!((again.inserted_count, again.updated_count, again.unchanged_count), (0, 0, 1));
    }

    #[tokio::test]
    async fn bulk_fallback_supplies_data_when_api_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("schemes.json"),
            r#"[{"scheme_name": "PM Kisan", "region": "Central"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("sources.yaml"),
            "schemes:\n  endpoints:\n    - url: http://127.0.0.1:9/unreachable\n",
        )
        .unwrap();
        let env = HashMap::from([
            ("DATABASE_URL", "memory://".to_string()),
            ("AGRI_WORKSPACE_ROOT", dir.path().display().to_string()),
            ("AGRI_HTTP_RETRIES", "0".to_string()),
            ("AGRI_HTTP_TIMEOUT_SECS", "2".to_string()),
            ("AGRI_SCHEME_FALLBACK", "schemes.json".to_string()),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).cloned());

        let runner = CycleRunner::from_config(&config).await.unwrap();
        let result = runner.run_cycle(Dataset::Schemes).await.unwrap();
        assert_eq!(result.status, CycleStatus::Success);
        assert_eq!(result.inserted_count, 1);
        assert!(result.source.unwrap().ends_with("schemes.json"));
    }

    #[tokio::test]
    async fn run_datasets_collects_error_results() {
        let (runner, _) = memory_runner(ScriptedSource::new(vec![Some(vec![scheme_record(
            "PM Kisan",
            "2026-03-01",
        )])]));
        let results = run_datasets(&runner, &Dataset::ALL).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, CycleStatus::Success);
        assert_eq!(results[1].status, CycleStatus::Error);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn concurrent_cycles_run_one_at_a_time() {
        let (source, peak) = SlowSource::new();
        let runner = CycleRunner::new(StoreConnector::Memory(MemoryStore::new()))
            .with_source(Dataset::Schemes, Box::new(source));

        let (first, second) = tokio::join!(
            runner.run_cycle(Dataset::Schemes),
            runner.run_cycle(Dataset::Schemes)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(first.inserted_count + second.inserted_count, 1);
        assert_eq!(first.failed_count + second.failed_count, 0);
        assert_eq!(first.unchanged_count + second.unchanged_count, 1);
    }

    #[tokio::test]
    async fn in_memory_sqlite_keeps_cycle_writes_for_queries() {
        let store = StoreConnector::from_url("sqlite::memory:").unwrap();
        let runner = CycleRunner::new(store).with_source(
            Dataset::Schemes,
            Box::new(ScriptedSource::new(vec![
                Some(vec![scheme_record("PM Kisan", "2026-03-01")]),
                Some(vec![scheme_record("PM Kisan", "2026-03-01")]),
            ])),
        );

        let first = runner.run_cycle(Dataset::Schemes).await.unwrap();
        assert_eq!(first.inserted_count, 1);

        let reader = runner.store().open().await.unwrap();
        let rows = reader.list_schemes(&Default::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        reader.close().await;

        let second = runner.run_cycle(Dataset::Schemes).await.unwrap();
        assert_eq!((second.inserted_count, second.unchanged_count), (0, 1));
    }

    #[tokio::test]
    async fn permit_excludes_other_triggers() {
        let (runner, _) = memory_runner(ScriptedSource::new(vec![]));
        let permit = runner.try_acquire().expect("idle runner");
        assert!(runner.is_running());
        assert!(runner.try_acquire().is_none());
        drop(permit);
        assert!(!runner.is_running());
        assert!(runner.try_acquire().is_some());
    }
}
