//! Upstream source adapters (endpoint failover, bulk-file fallback) and the record normalizer.

pub mod normalize;

use std::collections::BTreeMap;
use std::path::PathBuf;

use agri_core::Dataset;
use agri_storage::{HttpFetcher, ResponseArchive};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub use normalize::{normalize_market, normalize_schemes, NormalizeContext, Normalized};

pub const CRATE_NAME: &str = "agri-adapters";

/// Loosely-typed upstream record. Never leaves this crate un-normalized.
pub type RawRecord = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    /// Which source produced the batch (endpoint URL or bulk location).
    pub source: String,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub dataset: Dataset,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed response body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response envelope has neither a `records` nor a `data` array")]
    MissingEnvelope,
}

/// One upstream data source. `Ok(None)` means the source had no data (`NoData`).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, ctx: &FetchContext) -> Result<Option<RawBatch>, AdapterError>;
}

/// Extracts the record batch from an `{ "records": [...] }` or `{ "data": [...] }` envelope.
///
/// The first non-empty array wins. A bare top-level array is accepted too, which is
/// how bulk exports are usually shaped. Non-object array items are skipped.
pub fn parse_envelope(body: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let items = match &value {
        JsonValue::Array(items) => items,
        JsonValue::Object(obj) => ["records", "data"]
            .iter()
            .filter_map(|key| obj.get(*key).and_then(JsonValue::as_array))
            .find(|items| !items.is_empty())
            .or_else(|| {
                ["records", "data"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(JsonValue::as_array))
            })
            .ok_or(AdapterError::MissingEnvelope)?,
        _ => return Err(AdapterError::MissingEnvelope),
    };
    Ok(items
        .iter()
        .filter_map(|item| item.as_object().cloned())
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl EndpointSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: BTreeMap::new(),
        }
    }
}

/// Tries each configured endpoint in order and returns the first non-empty batch.
///
/// Transport failures, non-200 statuses and malformed bodies are logged and the
/// next endpoint is tried; none of them reach the caller.
pub struct ApiSource {
    name: String,
    endpoints: Vec<EndpointSpec>,
    api_key: String,
    page_limit: usize,
    http: HttpFetcher,
    archive: Option<ResponseArchive>,
}

impl ApiSource {
    pub fn new(
        name: impl Into<String>,
        endpoints: Vec<EndpointSpec>,
        api_key: impl Into<String>,
        page_limit: usize,
        http: HttpFetcher,
    ) -> Self {
        Self {
            name: name.into(),
            endpoints,
            api_key: api_key.into(),
            page_limit,
            http,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn endpoints(&self) -> &[EndpointSpec] {
        &self.endpoints
    }

    fn query_for(&self, endpoint: &EndpointSpec) -> Vec<(String, String)> {
        let mut query = vec![
            ("api-key".to_string(), self.api_key.clone()),
            ("format".to_string(), "json".to_string()),
            ("limit".to_string(), self.page_limit.to_string()),
            ("offset".to_string(), "0".to_string()),
        ];
        query.extend(
            endpoint
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        query
    }

    async fn try_endpoint(&self, endpoint: &EndpointSpec, ctx: &FetchContext) -> Option<RawBatch> {
        info!(url = %endpoint.url, "trying upstream endpoint");
        let resp = match self.http.fetch(&endpoint.url, &self.query_for(endpoint)).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(url = %endpoint.url, error = %err, "upstream endpoint failed");
                return None;
            }
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.store(ctx.fetched_at, ctx.dataset, &resp.body).await {
                warn!(url = %endpoint.url, error = %err, "failed to archive upstream response");
            }
        }

        match parse_envelope(&resp.body) {
            Ok(records) if !records.is_empty() => {
                info!(url = %endpoint.url, count = records.len(), "fetched upstream records");
                Some(RawBatch {
                    source: endpoint.url.clone(),
                    records,
                })
            }
            Ok(_) => {
                warn!(url = %endpoint.url, "upstream returned no records");
                None
            }
            Err(err) => {
                warn!(url = %endpoint.url, error = %err, "could not parse upstream response");
                None
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for ApiSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Option<RawBatch>, AdapterError> {
        for endpoint in &self.endpoints {
            if let Some(batch) = self.try_endpoint(endpoint, ctx).await {
                return Ok(Some(batch));
            }
        }
        warn!(source = %self.name, endpoints = self.endpoints.len(), "all upstream endpoints exhausted");
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkLocation {
    File(PathBuf),
    Url(String),
}

impl BulkLocation {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            BulkLocation::Url(raw.to_string())
        } else {
            BulkLocation::File(PathBuf::from(raw))
        }
    }

    fn describe(&self) -> String {
        match self {
            BulkLocation::File(path) => path.display().to_string(),
            BulkLocation::Url(url) => url.clone(),
        }
    }
}

/// Secondary source: a bulk JSON export on disk or behind a plain URL.
pub struct BulkFileSource {
    name: String,
    location: BulkLocation,
    http: HttpFetcher,
}

impl BulkFileSource {
    pub fn new(name: impl Into<String>, location: BulkLocation, http: HttpFetcher) -> Self {
        Self {
            name: name.into(),
            location,
            http,
        }
    }

    async fn read_body(&self) -> Option<Vec<u8>> {
        match &self.location {
            BulkLocation::File(path) => match tokio::fs::read(path).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "bulk fallback file unreadable");
                    None
                }
            },
            BulkLocation::Url(url) => match self.http.fetch(url, &[]).await {
                Ok(resp) => Some(resp.body),
                Err(err) => {
                    warn!(url = %url, error = %err, "bulk fallback download failed");
                    None
                }
            },
        }
    }
}

#[async_trait]
impl SourceAdapter for BulkFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _ctx: &FetchContext) -> Result<Option<RawBatch>, AdapterError> {
        let Some(body) = self.read_body().await else {
            return Ok(None);
        };
        let records = match parse_envelope(&body) {
            Ok(records) => records,
            Err(err) => {
                warn!(location = %self.location.describe(), error = %err, "bulk fallback unparseable");
                return Ok(None);
            }
        };
        if records.is_empty() {
            return Ok(None);
        }
        info!(location = %self.location.describe(), count = records.len(), "loaded bulk fallback records");
        Ok(Some(RawBatch {
            source: self.location.describe(),
            records,
        }))
    }
}

/// Consults each source in order until one yields data.
pub struct FallbackChain {
    name: String,
    sources: Vec<Box<dyn SourceAdapter>>,
}

impl FallbackChain {
    pub fn new(name: impl Into<String>, sources: Vec<Box<dyn SourceAdapter>>) -> Self {
        Self {
            name: name.into(),
            sources,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl SourceAdapter for FallbackChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Option<RawBatch>, AdapterError> {
        for (idx, source) in self.sources.iter().enumerate() {
            if idx > 0 {
                info!(source = source.name(), "falling back to secondary source");
            }
            if let Some(batch) = source.fetch(ctx).await? {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }
}
