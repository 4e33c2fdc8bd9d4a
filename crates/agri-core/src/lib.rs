//! Canonical entities, query filters and cycle result types shared across the workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agri-core";

pub const DEFAULT_REGION: &str = "Central";
pub const DEFAULT_UNIT: &str = "Quintal";

/// States and union territories always offered by the `states` query.
pub const KNOWN_STATES: &[&str] = &[
    "Andhra Pradesh",
    "Arunachal Pradesh",
    "Assam",
    "Bihar",
    "Chhattisgarh",
    "Delhi",
    "Goa",
    "Gujarat",
    "Haryana",
    "Himachal Pradesh",
    "Jammu and Kashmir",
    "Jharkhand",
    "Karnataka",
    "Kerala",
    "Ladakh",
    "Madhya Pradesh",
    "Maharashtra",
    "Manipur",
    "Meghalaya",
    "Mizoram",
    "Nagaland",
    "Odisha",
    "Punjab",
    "Rajasthan",
    "Sikkim",
    "Tamil Nadu",
    "Telangana",
    "Tripura",
    "Uttar Pradesh",
    "Uttarakhand",
    "West Bengal",
];

/// Which upstream dataset a cycle ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Schemes,
    Market,
}

impl Dataset {
    pub const ALL: [Dataset; 2] = [Dataset::Schemes, Dataset::Market];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Schemes => "schemes",
            Dataset::Market => "market",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "schemes" | "scheme" => Ok(Dataset::Schemes),
            "market" | "markets" => Ok(Dataset::Market),
            other => Err(format!("unknown dataset `{other}` (expected `schemes` or `market`)")),
        }
    }
}

/// Deterministic scheme identity derived from its name: lower-cased, whitespace runs become `-`.
pub fn derive_scheme_id(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical government scheme record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheme {
    pub scheme_id: String,
    pub scheme_name: String,
    pub description: String,
    pub ministry: String,
    pub eligibility: String,
    pub region: String,
    pub state: String,
    pub start_date: Option<NaiveDate>,
    pub last_updated: DateTime<Utc>,
}

/// A persisted record with its store-managed timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stored<T> {
    #[serde(flatten)]
    pub record: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Coarse demand/supply classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    pub fn demand_for_price(price: f64) -> Self {
        if price > 2000.0 {
            Level::High
        } else if price > 1000.0 {
            Level::Medium
        } else {
            Level::Low
        }
    }

    pub fn supply_for_price(price: f64) -> Self {
        if price < 1500.0 {
            Level::High
        } else if price < 2500.0 {
            Level::Medium
        } else {
            Level::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Low => "Low",
            Level::Medium => "Medium",
            Level::High => "High",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(Level::Low),
            "Medium" => Ok(Level::Medium),
            "High" => Ok(Level::High),
            other => Err(format!("unknown level `{other}`")),
        }
    }
}

/// Identity shared by the three facts derived from one market record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationKey {
    pub commodity: String,
    pub market_name: String,
    pub observation_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFact {
    pub commodity: String,
    pub market_name: String,
    pub state: String,
    pub district: String,
    pub price: f64,
    pub unit: String,
    pub observation_date: NaiveDate,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendFact {
    pub commodity: String,
    pub market_name: String,
    pub price_today: f64,
    pub price_yesterday: Option<f64>,
    pub price_change: Option<f64>,
    pub change_percentage: Option<f64>,
    pub observation_date: NaiveDate,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandFact {
    pub commodity: String,
    pub market_name: String,
    pub demand_level: Level,
    pub supply_level: Level,
    pub arrival_quantity: Option<f64>,
    pub unit: String,
    pub observation_date: NaiveDate,
    pub last_updated: DateTime<Utc>,
}

/// Inputs for [`MarketObservation::derive`], already resolved from an upstream record.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketReading {
    pub commodity: String,
    pub market_name: String,
    pub state: String,
    pub district: String,
    pub price: f64,
    pub price_yesterday: Option<f64>,
    pub arrival_quantity: Option<f64>,
    pub unit: String,
    pub observation_date: NaiveDate,
    pub last_updated: DateTime<Utc>,
}

/// Price, trend and demand facts derived together from one upstream market record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketObservation {
    pub price: PriceFact,
    pub trend: TrendFact,
    pub demand: DemandFact,
}

impl MarketObservation {
    /// Builds all three facts from one reading so they always share a key and timestamp.
    ///
    /// Returns `None` when the reading cannot yield a price fact: empty commodity or
    /// market, or a price that is not strictly positive.
    pub fn derive(reading: MarketReading) -> Option<Self> {
        if reading.commodity.is_empty()
            || reading.market_name.is_empty()
            || !reading.price.is_finite()
            || reading.price <= 0.0
        {
            return None;
        }

        let (price_change, change_percentage) = match reading.price_yesterday {
            Some(yesterday) if yesterday > 0.0 => {
                let change = reading.price - yesterday;
                (Some(change), Some(change / yesterday * 100.0))
            }
            _ => (None, None),
        };

        Some(Self {
            trend: TrendFact {
                commodity: reading.commodity.clone(),
                market_name: reading.market_name.clone(),
                price_today: reading.price,
                price_yesterday: reading.price_yesterday,
                price_change,
                change_percentage,
                observation_date: reading.observation_date,
                last_updated: reading.last_updated,
            },
            demand: DemandFact {
                commodity: reading.commodity.clone(),
                market_name: reading.market_name.clone(),
                demand_level: Level::demand_for_price(reading.price),
                supply_level: Level::supply_for_price(reading.price),
                arrival_quantity: reading.arrival_quantity,
                unit: reading.unit.clone(),
                observation_date: reading.observation_date,
                last_updated: reading.last_updated,
            },
            price: PriceFact {
                commodity: reading.commodity,
                market_name: reading.market_name,
                state: reading.state,
                district: reading.district,
                price: reading.price,
                unit: reading.unit,
                observation_date: reading.observation_date,
                last_updated: reading.last_updated,
            },
        })
    }

    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            commodity: self.price.commodity.clone(),
            market_name: self.price.market_name.clone(),
            observation_date: self.price.observation_date,
        }
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.price.last_updated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeFilter {
    pub region: Option<String>,
    pub ministry: Option<String>,
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFilter {
    pub commodity: Option<String>,
    pub market: Option<String>,
    pub state: Option<String>,
    pub limit: Option<usize>,
}

impl MarketFilter {
    pub const DEFAULT_PRICE_LIMIT: usize = 100;
    pub const DEFAULT_FACT_LIMIT: usize = 50;

    pub fn price_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_PRICE_LIMIT)
    }

    pub fn fact_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_FACT_LIMIT)
    }
}

/// Case-insensitive substring match used by every string filter.
pub fn matches_filter(value: &str, needle: Option<&str>) -> bool {
    match needle.map(str::trim) {
        None | Some("") => true,
        Some(needle) => value.to_lowercase().contains(&needle.to_lowercase()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub prices: Vec<Stored<PriceFact>>,
    pub trends: Vec<Stored<TrendFact>>,
    pub demand: Vec<Stored<DemandFact>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsOptions {
    pub top_n: usize,
    pub recent_window: Duration,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            top_n: 10,
            recent_window: Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeStats {
    pub total_schemes: u64,
    pub region_stats: BTreeMap<String, u64>,
    pub ministry_stats: Vec<NamedCount>,
    pub recent_schemes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStats {
    pub total_prices: u64,
    pub total_trends: u64,
    pub total_demand: u64,
    pub commodity_stats: Vec<NamedCount>,
    pub recent_observations: u64,
}

/// Sorts `(name, count)` pairs by count desc then name, keeping the first `top_n`.
pub fn top_counts(counts: impl IntoIterator<Item = (String, u64)>, top_n: usize) -> Vec<NamedCount> {
    let mut rows = counts
        .into_iter()
        .map(|(name, count)| NamedCount { name, count })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    rows.truncate(top_n);
    rows
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Success,
    Failed,
    Error,
}

/// Structured summary of one fetch-normalize-upsert cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResult {
    pub cycle_id: Uuid,
    pub dataset: Dataset,
    pub status: CycleStatus,
    pub inserted_count: u64,
    pub updated_count: u64,
    pub unchanged_count: u64,
    pub failed_count: u64,
    pub dropped_count: u64,
    pub total_processed: u64,
    pub elapsed_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleResult {
    /// A result with every count zeroed, as reported for `failed` and `error` outcomes.
    pub fn zeroed(
        cycle_id: Uuid,
        dataset: Dataset,
        status: CycleStatus,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cycle_id,
            dataset,
            status,
            inserted_count: 0,
            updated_count: 0,
            unchanged_count: 0,
            failed_count: 0,
            dropped_count: 0,
            total_processed: 0,
            elapsed_seconds: elapsed_seconds(started_at, finished_at),
            started_at,
            finished_at,
            source: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CycleStatus::Success
    }
}

pub fn elapsed_seconds(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> f64 {
    (finished_at - started_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
