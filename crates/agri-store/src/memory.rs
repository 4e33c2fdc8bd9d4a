use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use agri_core::{
    matches_filter, top_counts, MarketFilter, MarketObservation, MarketSnapshot, MarketStats,
    ObservationKey, Scheme, SchemeFilter, SchemeStats, StatsOptions, Stored,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{Store, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    schemes: HashMap<String, Stored<Scheme>>,
    observations: BTreeMap<ObservationKey, Stored<MarketObservation>>,
}

/// In-process store. Clones share the same tables, so data outlives any single handle.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first<T>(rows: &mut [T], last_updated: impl Fn(&T) -> DateTime<Utc>) {
    rows.sort_by_key(|row| std::cmp::Reverse(last_updated(row)));
}

fn observation_matches(obs: &MarketObservation, filter: &MarketFilter) -> bool {
    matches_filter(&obs.price.commodity, filter.commodity.as_deref())
        && matches_filter(&obs.price.market_name, filter.market.as_deref())
        && matches_filter(&obs.price.state, filter.state.as_deref())
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn scheme_last_updated(&self, scheme_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        Ok(tables.schemes.get(scheme_id).map(|s| s.record.last_updated))
    }

    async fn insert_scheme(&self, scheme: &Scheme, now: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.schemes.contains_key(&scheme.scheme_id) {
            return Err(StoreError::Duplicate(scheme.scheme_id.clone()));
        }
        tables.schemes.insert(
            scheme.scheme_id.clone(),
            Stored {
                record: scheme.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn update_scheme(&self, scheme: &Scheme, now: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let row = tables
            .schemes
            .get_mut(&scheme.scheme_id)
            .ok_or_else(|| StoreError::Missing(scheme.scheme_id.clone()))?;
        row.record = scheme.clone();
        row.updated_at = now;
        Ok(())
    }

    async fn observation_last_updated(
        &self,
        key: &ObservationKey,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        Ok(tables.observations.get(key).map(|o| o.record.last_updated()))
    }

    async fn insert_observation(&self, obs: &MarketObservation, now: DateTime<Utc>) -> StoreResult<()> {
        let key = obs.key();
        let mut tables = self.tables.write().await;
        if tables.observations.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "{}@{}/{}",
                key.commodity, key.market_name, key.observation_date
            )));
        }
        tables.observations.insert(
            key,
            Stored {
                record: obs.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn update_observation(&self, obs: &MarketObservation, now: DateTime<Utc>) -> StoreResult<()> {
        let key = obs.key();
        let mut tables = self.tables.write().await;
        let row = tables.observations.get_mut(&key).ok_or_else(|| {
            StoreError::Missing(format!(
                "{}@{}/{}",
                key.commodity, key.market_name, key.observation_date
            ))
        })?;
        row.record = obs.clone();
        row.updated_at = now;
        Ok(())
    }

    async fn list_schemes(&self, filter: &SchemeFilter) -> StoreResult<Vec<Stored<Scheme>>> {
        let tables = self.tables.read().await;
        let mut rows = tables
            .schemes
            .values()
            .filter(|s| matches_filter(&s.record.region, filter.region.as_deref()))
            .filter(|s| matches_filter(&s.record.ministry, filter.ministry.as_deref()))
            .filter(|s| {
                let state = filter.state.as_deref();
                matches_filter(&s.record.state, state)
                    || matches_filter(&s.record.ministry, state)
                    || matches_filter(&s.record.scheme_name, state)
            })
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.record.scheme_id.cmp(&b.record.scheme_id));
        newest_first(&mut rows, |s| s.record.last_updated);
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn get_scheme(&self, scheme_id: &str) -> StoreResult<Option<Stored<Scheme>>> {
        Ok(self.tables.read().await.schemes.get(scheme_id).cloned())
    }

    async fn scheme_stats(&self, opts: StatsOptions, now: DateTime<Utc>) -> StoreResult<SchemeStats> {
        let tables = self.tables.read().await;
        let cutoff = now - opts.recent_window;
        let mut region_stats = BTreeMap::new();
        let mut ministries = HashMap::<String, u64>::new();
        let mut recent_schemes = 0;
        for scheme in tables.schemes.values().map(|s| &s.record) {
            *region_stats.entry(scheme.region.clone()).or_insert(0) += 1;
            if !scheme.ministry.is_empty() {
                *ministries.entry(scheme.ministry.clone()).or_insert(0) += 1;
            }
            if scheme.last_updated >= cutoff {
                recent_schemes += 1;
            }
        }
        Ok(SchemeStats {
            total_schemes: tables.schemes.len() as u64,
            region_stats,
            ministry_stats: top_counts(ministries, opts.top_n),
            recent_schemes,
        })
    }

    async fn list_market(&self, filter: &MarketFilter) -> StoreResult<MarketSnapshot> {
        let tables = self.tables.read().await;
        let mut matching = tables
            .observations
            .values()
            .filter(|o| observation_matches(&o.record, filter))
            .collect::<Vec<_>>();
        newest_first(&mut matching, |o| o.record.last_updated());

        let stamp = |o: &Stored<MarketObservation>| (o.created_at, o.updated_at);
        let prices = matching
            .iter()
            .take(filter.price_limit())
            .map(|o| {
                let (created_at, updated_at) = stamp(o);
                Stored { record: o.record.price.clone(), created_at, updated_at }
            })
            .collect();
        let trends = matching
            .iter()
            .take(filter.fact_limit())
            .map(|o| {
                let (created_at, updated_at) = stamp(o);
                Stored { record: o.record.trend.clone(), created_at, updated_at }
            })
            .collect();
        let demand = matching
            .iter()
            .take(filter.fact_limit())
            .map(|o| {
                let (created_at, updated_at) = stamp(o);
                Stored { record: o.record.demand.clone(), created_at, updated_at }
            })
            .collect();

        Ok(MarketSnapshot { prices, trends, demand })
    }

    async fn market_stats(&self, opts: StatsOptions, now: DateTime<Utc>) -> StoreResult<MarketStats> {
        let tables = self.tables.read().await;
        let cutoff = now - opts.recent_window;
        let mut commodities = HashMap::<String, u64>::new();
        let mut recent_observations = 0;
        for obs in tables.observations.values().map(|o| &o.record) {
            *commodities.entry(obs.price.commodity.clone()).or_insert(0) += 1;
            if obs.last_updated() >= cutoff {
                recent_observations += 1;
            }
        }
        let total = tables.observations.len() as u64;
        Ok(MarketStats {
            total_prices: total,
            total_trends: total,
            total_demand: total,
            commodity_stats: top_counts(commodities, opts.top_n),
            recent_observations,
        })
    }

    async fn stored_states(&self) -> StoreResult<Vec<String>> {
        let tables = self.tables.read().await;
        let states = tables
            .schemes
            .values()
            .map(|s| s.record.state.as_str())
            .chain(tables.observations.values().map(|o| o.record.price.state.as_str()))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        Ok(states.into_iter().collect())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::upsert;

    #[tokio::test]
    async fn memory_reconciles_schemes() {
        exercise_reconciliation(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn memory_reconciles_market_observations() {
        exercise_market(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn clones_share_tables() {
        let store = MemoryStore::new();
        let handle = store.clone();
        upsert(&handle, &[scheme("PM-KISAN", "M", "Central", at(1, 0))], at(1, 1))
            .await
            .unwrap();
        handle.close().await;
        assert!(store.get_scheme("PM-KISAN").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_record_error() {
        let store = MemoryStore::new();
        let s = scheme("X", "M", "Central", at(1, 0));
        store.insert_scheme(&s, at(1, 1)).await.unwrap();
        let err = store.insert_scheme(&s, at(1, 2)).await.unwrap_err();
        assert!(err.is_record_level());
    }
}
