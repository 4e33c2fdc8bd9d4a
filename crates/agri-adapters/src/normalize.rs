//! Maps loosely-typed upstream records onto the canonical entities.
//!
//! Field lookup is table-driven: each target field has an ordered list of
//! accepted source keys in [`aliases`], resolved first-match. Everything here is
//! pure; unparseable dates are logged and left unset, invalid records are
//! dropped and counted.

use agri_core::{
    derive_scheme_id, MarketObservation, MarketReading, Scheme, DEFAULT_REGION, DEFAULT_UNIT,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::RawRecord;

/// Ordered candidate keys for one canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldAliases(pub &'static [&'static str]);

impl FieldAliases {
    pub fn keys(&self) -> &'static [&'static str] {
        self.0
    }

    /// First candidate holding a usable value, rendered as a trimmed string.
    pub fn text(&self, record: &RawRecord) -> Option<String> {
        self.0.iter().find_map(|key| record.get(*key).and_then(scalar_text))
    }

    /// First candidate that parses as a finite number.
    pub fn number(&self, record: &RawRecord) -> Option<f64> {
        self.0
            .iter()
            .filter_map(|key| record.get(*key))
            .find_map(scalar_number)
    }

    /// First candidate that parses as a strictly positive number.
    pub fn positive_number(&self, record: &RawRecord) -> Option<f64> {
        self.0
            .iter()
            .filter_map(|key| record.get(*key))
            .filter_map(scalar_number)
            .find(|n| *n > 0.0)
    }
}

pub mod aliases {
    use super::FieldAliases;

    pub const SCHEME_ID: FieldAliases = FieldAliases(&["scheme_id", "schemeId", "id"]);
    pub const SCHEME_NAME: FieldAliases =
        FieldAliases(&["scheme_name", "schemeName", "name", "title"]);
    pub const DESCRIPTION: FieldAliases =
        FieldAliases(&["description", "scheme_description", "details"]);
    pub const MINISTRY: FieldAliases = FieldAliases(&[
        "implementing_ministry",
        "ministry",
        "ministry_name",
        "department",
    ]);
    pub const ELIGIBILITY: FieldAliases = FieldAliases(&["eligibility_criteria", "eligibility"]);
    pub const REGION: FieldAliases = FieldAliases(&["region", "scheme_type", "level"]);
    pub const STATE: FieldAliases = FieldAliases(&["state", "state_name"]);
    pub const START_DATE: FieldAliases = FieldAliases(&["start_date", "launch_date"]);
    pub const LAST_UPDATED: FieldAliases =
        FieldAliases(&["last_updated", "updated_date", "updated_at"]);

    pub const COMMODITY: FieldAliases = FieldAliases(&["commodity", "commodity_name"]);
    pub const MARKET: FieldAliases = FieldAliases(&["market", "market_name", "mandi"]);
    pub const DISTRICT: FieldAliases = FieldAliases(&["district", "district_name"]);
    pub const PRICE: FieldAliases = FieldAliases(&[
        "price",
        "modal_price",
        "min_price",
        "max_price",
        "arrival_price",
    ]);
    pub const PRICE_YESTERDAY: FieldAliases =
        FieldAliases(&["price_yesterday", "previous_price", "prev_price"]);
    pub const ARRIVAL_QUANTITY: FieldAliases =
        FieldAliases(&["arrival_quantity", "arrivals", "arrivals_in_qtl"]);
    pub const UNIT: FieldAliases = FieldAliases(&["unit"]);
    pub const OBSERVATION_DATE: FieldAliases =
        FieldAliases(&["date", "arrival_date", "observation_date"]);
}

pub const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];
pub const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

const ABSENT_MARKERS: &[&str] = &["null", "NA"];

fn scalar_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => return None,
    };
    if text.is_empty() || ABSENT_MARKERS.contains(&text.as_str()) {
        None
    } else {
        Some(text)
    }
}

fn scalar_number(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Tries each of [`DATE_FORMATS`] in order.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// RFC 3339 first, then naive datetimes (taken as UTC), then plain dates at midnight.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_date(raw).map(|d| d.and_time(NaiveTime::MIN)))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeContext {
    /// When the batch was fetched; stands in for missing scheme timestamps and market dates.
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub records: Vec<T>,
    pub dropped: usize,
}

impl<T> Normalized<T> {
    pub fn total_input(&self) -> usize {
        self.records.len() + self.dropped
    }
}

fn optional_date(record: &RawRecord, field: &str, candidates: FieldAliases) -> Option<NaiveDate> {
    let raw = candidates.text(record)?;
    let parsed = parse_date(&raw);
    if parsed.is_none() {
        warn!(field, value = %raw, "could not parse date");
    }
    parsed
}

fn optional_timestamp(
    record: &RawRecord,
    field: &str,
    candidates: FieldAliases,
) -> Option<DateTime<Utc>> {
    let raw = candidates.text(record)?;
    let parsed = parse_timestamp(&raw);
    if parsed.is_none() {
        warn!(field, value = %raw, "could not parse timestamp");
    }
    parsed
}

pub fn normalize_scheme(record: &RawRecord, ctx: &NormalizeContext) -> Option<Scheme> {
    let scheme_name = aliases::SCHEME_NAME.text(record)?;
    let scheme_id = aliases::SCHEME_ID
        .text(record)
        .unwrap_or_else(|| derive_scheme_id(&scheme_name));
    if scheme_id.is_empty() {
        return None;
    }

    Some(Scheme {
        scheme_id,
        scheme_name,
        description: aliases::DESCRIPTION.text(record).unwrap_or_default(),
        ministry: aliases::MINISTRY.text(record).unwrap_or_default(),
        eligibility: aliases::ELIGIBILITY.text(record).unwrap_or_default(),
        region: aliases::REGION
            .text(record)
            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        state: aliases::STATE.text(record).unwrap_or_default(),
        start_date: optional_date(record, "start_date", aliases::START_DATE),
        last_updated: optional_timestamp(record, "last_updated", aliases::LAST_UPDATED)
            .unwrap_or(ctx.fetched_at),
    })
}

/// Normalizes a scheme batch. Records without a usable name are dropped.
pub fn normalize_schemes(raw: &[RawRecord], ctx: &NormalizeContext) -> Normalized<Scheme> {
    let mut records = Vec::with_capacity(raw.len());
    let mut dropped = 0usize;
    for record in raw {
        match normalize_scheme(record, ctx) {
            Some(scheme) => records.push(scheme),
            None => {
                dropped += 1;
                debug!(keys = ?record.keys().collect::<Vec<_>>(), "dropping scheme record without identity");
            }
        }
    }
    info!(valid = records.len(), dropped, "normalized scheme records");
    Normalized { records, dropped }
}

pub fn normalize_observation(record: &RawRecord, ctx: &NormalizeContext) -> Option<MarketObservation> {
    let commodity = aliases::COMMODITY.text(record)?;
    let state = aliases::STATE.text(record).unwrap_or_default();
    let market_name = aliases::MARKET.text(record).unwrap_or_else(|| {
        if state.is_empty() {
            "Local Market".to_string()
        } else {
            format!("{state} Mandi")
        }
    });
    let price = aliases::PRICE.positive_number(record)?;

    let observation_date = optional_date(record, "date", aliases::OBSERVATION_DATE)
        .unwrap_or_else(|| ctx.fetched_at.date_naive());
    let last_updated = optional_timestamp(record, "last_updated", aliases::LAST_UPDATED)
        .unwrap_or_else(|| observation_date.and_time(NaiveTime::MIN).and_utc());

    MarketObservation::derive(MarketReading {
        commodity,
        market_name,
        state,
        district: aliases::DISTRICT.text(record).unwrap_or_default(),
        price,
        price_yesterday: aliases::PRICE_YESTERDAY.number(record),
        arrival_quantity: aliases::ARRIVAL_QUANTITY.number(record),
        unit: aliases::UNIT
            .text(record)
            .unwrap_or_else(|| DEFAULT_UNIT.to_string()),
        observation_date,
        last_updated,
    })
}

/// Normalizes a market batch. Records without a commodity or a positive price are dropped.
pub fn normalize_market(raw: &[RawRecord], ctx: &NormalizeContext) -> Normalized<MarketObservation> {
    let mut records = Vec::with_capacity(raw.len());
    let mut dropped = 0usize;
    for record in raw {
        match normalize_observation(record, ctx) {
            Some(obs) => records.push(obs),
            None => {
                dropped += 1;
                debug!(keys = ?record.keys().collect::<Vec<_>>(), "dropping market record without commodity or price");
            }
        }
    }
    info!(valid = records.len(), dropped, "normalized market records");
    Normalized { records, dropped }
}
