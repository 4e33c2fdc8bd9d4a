//! SQLite-backed [`Store`] (single WAL-mode file, or an in-process `sqlite::memory:` database).

use std::path::Path;
use std::str::FromStr;

use agri_core::{
    top_counts, DemandFact, Level, MarketFilter, MarketObservation, MarketSnapshot, MarketStats,
    ObservationKey, PriceFact, Scheme, SchemeFilter, SchemeStats, StatsOptions, Stored, TrendFact,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::{Store, StoreError, StoreResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schemes (
    scheme_id TEXT PRIMARY KEY,
    scheme_name TEXT NOT NULL CHECK (length(scheme_name) > 0),
    description TEXT NOT NULL,
    ministry TEXT NOT NULL,
    eligibility TEXT NOT NULL,
    region TEXT NOT NULL,
    state TEXT NOT NULL,
    start_date TEXT,
    last_updated TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS schemes_last_updated_idx ON schemes(last_updated);

CREATE TABLE IF NOT EXISTS market_prices (
    commodity TEXT NOT NULL,
    market_name TEXT NOT NULL,
    observation_date TEXT NOT NULL,
    state TEXT NOT NULL,
    district TEXT NOT NULL,
    price REAL NOT NULL CHECK (price > 0),
    unit TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (commodity, market_name, observation_date)
);

CREATE TABLE IF NOT EXISTS market_trends (
    commodity TEXT NOT NULL,
    market_name TEXT NOT NULL,
    observation_date TEXT NOT NULL,
    price_today REAL NOT NULL,
    price_yesterday REAL,
    price_change REAL,
    change_percentage REAL,
    last_updated TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (commodity, market_name, observation_date)
);

CREATE TABLE IF NOT EXISTS market_demand (
    commodity TEXT NOT NULL,
    market_name TEXT NOT NULL,
    observation_date TEXT NOT NULL,
    demand_level TEXT NOT NULL,
    supply_level TEXT NOT NULL,
    arrival_quantity REAL,
    unit TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (commodity, market_name, observation_date)
);
"#;

const SCHEME_COLUMNS: &str = "scheme_id, scheme_name, description, ministry, eligibility, region, \
     state, start_date, last_updated, created_at, updated_at";

/// Matches a market row against the state of its sibling price row.
const STATE_VIA_PRICE: &str = "(?3 IS NULL OR EXISTS (
        SELECT 1 FROM market_prices p
        WHERE p.commodity = f.commodity
          AND p.market_name = f.market_name
          AND p.observation_date = f.observation_date
          AND LOWER(p.state) LIKE ?3 ESCAPE '\\'))";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    keep_open: bool,
}

impl SqliteStore {
    /// Opens (or creates) a database file, creating parent directories as needed.
    pub async fn open_path(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    pub async fn connect(url: &str) -> StoreResult<Self> {
        let in_memory = url.contains(":memory:");
        let mut opts = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `:memory:` is a separate database, so keep exactly one alive.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_opts.connect_with(opts).await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        debug!(url, "sqlite store ready");
        Ok(Self {
            pool,
            keep_open: false,
        })
    }

    /// A handle whose `close` leaves the pool running for other holders.
    pub fn kept_open(mut self) -> Self {
        self.keep_open = true;
        self
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `%needle%` with LIKE metacharacters escaped, or `None` for an unset filter.
fn like_pattern(needle: Option<&str>) -> Option<String> {
    let needle = needle.map(str::trim).filter(|n| !n.is_empty())?;
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    Some(escaped)
}

fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

fn parse_ts(row: &SqliteRow, column: &'static str) -> StoreResult<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt { column, value: raw })
}

fn parse_day(raw: String, column: &'static str) -> StoreResult<NaiveDate> {
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| StoreError::Corrupt { column, value: raw })
}

fn parse_level(row: &SqliteRow, column: &'static str) -> StoreResult<Level> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| StoreError::Corrupt { column, value: raw })
}

fn stored<T>(row: &SqliteRow, record: T) -> StoreResult<Stored<T>> {
    Ok(Stored {
        record,
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
    })
}

fn row_to_scheme(row: &SqliteRow) -> StoreResult<Stored<Scheme>> {
    let start_date = row
        .try_get::<Option<String>, _>("start_date")?
        .map(|raw| parse_day(raw, "start_date"))
        .transpose()?;
    let scheme = Scheme {
        scheme_id: row.try_get("scheme_id")?,
        scheme_name: row.try_get("scheme_name")?,
        description: row.try_get("description")?,
        ministry: row.try_get("ministry")?,
        eligibility: row.try_get("eligibility")?,
        region: row.try_get("region")?,
        state: row.try_get("state")?,
        start_date,
        last_updated: parse_ts(row, "last_updated")?,
    };
    stored(row, scheme)
}

fn row_to_price(row: &SqliteRow) -> StoreResult<Stored<PriceFact>> {
    let fact = PriceFact {
        commodity: row.try_get("commodity")?,
        market_name: row.try_get("market_name")?,
        state: row.try_get("state")?,
        district: row.try_get("district")?,
        price: row.try_get("price")?,
        unit: row.try_get("unit")?,
        observation_date: parse_day(row.try_get("observation_date")?, "observation_date")?,
        last_updated: parse_ts(row, "last_updated")?,
    };
    stored(row, fact)
}

fn row_to_trend(row: &SqliteRow) -> StoreResult<Stored<TrendFact>> {
    let fact = TrendFact {
        commodity: row.try_get("commodity")?,
        market_name: row.try_get("market_name")?,
        price_today: row.try_get("price_today")?,
        price_yesterday: row.try_get("price_yesterday")?,
        price_change: row.try_get("price_change")?,
        change_percentage: row.try_get("change_percentage")?,
        observation_date: parse_day(row.try_get("observation_date")?, "observation_date")?,
        last_updated: parse_ts(row, "last_updated")?,
    };
    stored(row, fact)
}

fn row_to_demand(row: &SqliteRow) -> StoreResult<Stored<DemandFact>> {
    let fact = DemandFact {
        commodity: row.try_get("commodity")?,
        market_name: row.try_get("market_name")?,
        demand_level: parse_level(row, "demand_level")?,
        supply_level: parse_level(row, "supply_level")?,
        arrival_quantity: row.try_get("arrival_quantity")?,
        unit: row.try_get("unit")?,
        observation_date: parse_day(row.try_get("observation_date")?, "observation_date")?,
        last_updated: parse_ts(row, "last_updated")?,
    };
    stored(row, fact)
}

async fn count(pool: &SqlitePool, sql: &str) -> StoreResult<u64> {
    let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
    Ok(n.max(0) as u64)
}

async fn grouped(pool: &SqlitePool, sql: &str) -> StoreResult<Vec<(String, u64)>> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    rows.iter()
        .map(|r| {
            let name: String = r.try_get(0)?;
            let n: i64 = r.try_get(1)?;
            Ok((name, n.max(0) as u64))
        })
        .collect()
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn scheme_last_updated(&self, scheme_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_updated FROM schemes WHERE scheme_id = ?1")
            .bind(scheme_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_ts(&r, "last_updated")).transpose()
    }

    async fn insert_scheme(&self, scheme: &Scheme, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO schemes (scheme_id, scheme_name, description, ministry, eligibility,
                region, state, start_date, last_updated, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        )
        .bind(&scheme.scheme_id)
        .bind(&scheme.scheme_name)
        .bind(&scheme.description)
        .bind(&scheme.ministry)
        .bind(&scheme.eligibility)
        .bind(&scheme.region)
        .bind(&scheme.state)
        .bind(scheme.start_date.map(day))
        .bind(ts(scheme.last_updated))
        .bind(ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_scheme(&self, scheme: &Scheme, now: DateTime<Utc>) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE schemes SET scheme_name = ?2, description = ?3, ministry = ?4,
                eligibility = ?5, region = ?6, state = ?7, start_date = ?8,
                last_updated = ?9, updated_at = ?10
             WHERE scheme_id = ?1",
        )
        .bind(&scheme.scheme_id)
        .bind(&scheme.scheme_name)
        .bind(&scheme.description)
        .bind(&scheme.ministry)
        .bind(&scheme.eligibility)
        .bind(&scheme.region)
        .bind(&scheme.state)
        .bind(scheme.start_date.map(day))
        .bind(ts(scheme.last_updated))
        .bind(ts(now))
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::Missing(scheme.scheme_id.clone()));
        }
        Ok(())
    }

    async fn observation_last_updated(
        &self,
        key: &ObservationKey,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_updated FROM market_prices
             WHERE commodity = ?1 AND market_name = ?2 AND observation_date = ?3",
        )
        .bind(&key.commodity)
        .bind(&key.market_name)
        .bind(day(key.observation_date))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_ts(&r, "last_updated")).transpose()
    }

    async fn insert_observation(&self, obs: &MarketObservation, now: DateTime<Utc>) -> StoreResult<()> {
        let (p, t, d) = (&obs.price, &obs.trend, &obs.demand);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO market_prices (commodity, market_name, observation_date, state, district,
                price, unit, last_updated, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        )
        .bind(&p.commodity)
        .bind(&p.market_name)
        .bind(day(p.observation_date))
        .bind(&p.state)
        .bind(&p.district)
        .bind(p.price)
        .bind(&p.unit)
        .bind(ts(p.last_updated))
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO market_trends (commodity, market_name, observation_date, price_today,
                price_yesterday, price_change, change_percentage, last_updated, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        )
        .bind(&t.commodity)
        .bind(&t.market_name)
        .bind(day(t.observation_date))
        .bind(t.price_today)
        .bind(t.price_yesterday)
        .bind(t.price_change)
        .bind(t.change_percentage)
        .bind(ts(t.last_updated))
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO market_demand (commodity, market_name, observation_date, demand_level,
                supply_level, arrival_quantity, unit, last_updated, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        )
        .bind(&d.commodity)
        .bind(&d.market_name)
        .bind(day(d.observation_date))
        .bind(d.demand_level.as_str())
        .bind(d.supply_level.as_str())
        .bind(d.arrival_quantity)
        .bind(&d.unit)
        .bind(ts(d.last_updated))
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_observation(&self, obs: &MarketObservation, now: DateTime<Utc>) -> StoreResult<()> {
        let (p, t, d) = (&obs.price, &obs.trend, &obs.demand);
        let date = day(p.observation_date);
        let mut tx = self.pool.begin().await?;

        let done = sqlx::query(
            "UPDATE market_prices SET state = ?4, district = ?5, price = ?6, unit = ?7,
                last_updated = ?8, updated_at = ?9
             WHERE commodity = ?1 AND market_name = ?2 AND observation_date = ?3",
        )
        .bind(&p.commodity)
        .bind(&p.market_name)
        .bind(&date)
        .bind(&p.state)
        .bind(&p.district)
        .bind(p.price)
        .bind(&p.unit)
        .bind(ts(p.last_updated))
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::Missing(format!(
                "{}@{}/{}",
                p.commodity, p.market_name, date
            )));
        }

        sqlx::query(
            "UPDATE market_trends SET price_today = ?4, price_yesterday = ?5, price_change = ?6,
                change_percentage = ?7, last_updated = ?8, updated_at = ?9
             WHERE commodity = ?1 AND market_name = ?2 AND observation_date = ?3",
        )
        .bind(&t.commodity)
        .bind(&t.market_name)
        .bind(&date)
        .bind(t.price_today)
        .bind(t.price_yesterday)
        .bind(t.price_change)
        .bind(t.change_percentage)
        .bind(ts(t.last_updated))
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE market_demand SET demand_level = ?4, supply_level = ?5, arrival_quantity = ?6,
                unit = ?7, last_updated = ?8, updated_at = ?9
             WHERE commodity = ?1 AND market_name = ?2 AND observation_date = ?3",
        )
        .bind(&d.commodity)
        .bind(&d.market_name)
        .bind(&date)
        .bind(d.demand_level.as_str())
        .bind(d.supply_level.as_str())
        .bind(d.arrival_quantity)
        .bind(&d.unit)
        .bind(ts(d.last_updated))
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_schemes(&self, filter: &SchemeFilter) -> StoreResult<Vec<Stored<Scheme>>> {
        let sql = format!(
            "SELECT {SCHEME_COLUMNS} FROM schemes
             WHERE (?1 IS NULL OR LOWER(region) LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR LOWER(ministry) LIKE ?2 ESCAPE '\\')
               AND (?3 IS NULL
                    OR LOWER(state) LIKE ?3 ESCAPE '\\'
                    OR LOWER(ministry) LIKE ?3 ESCAPE '\\'
                    OR LOWER(scheme_name) LIKE ?3 ESCAPE '\\')
             ORDER BY last_updated DESC, scheme_id
             LIMIT ?4"
        );
        let rows = sqlx::query(&sql)
            .bind(like_pattern(filter.region.as_deref()))
            .bind(like_pattern(filter.ministry.as_deref()))
            .bind(like_pattern(filter.state.as_deref()))
            .bind(sql_limit(filter.limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_scheme).collect()
    }

    async fn get_scheme(&self, scheme_id: &str) -> StoreResult<Option<Stored<Scheme>>> {
        let sql = format!("SELECT {SCHEME_COLUMNS} FROM schemes WHERE scheme_id = ?1");
        let row = sqlx::query(&sql)
            .bind(scheme_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_scheme).transpose()
    }

    async fn scheme_stats(&self, opts: StatsOptions, now: DateTime<Utc>) -> StoreResult<SchemeStats> {
        let total_schemes = count(&self.pool, "SELECT COUNT(*) FROM schemes").await?;
        let region_stats = grouped(
            &self.pool,
            "SELECT region, COUNT(*) FROM schemes GROUP BY region",
        )
        .await?
        .into_iter()
        .collect();
        let ministries = grouped(
            &self.pool,
            "SELECT ministry, COUNT(*) FROM schemes WHERE ministry <> '' GROUP BY ministry",
        )
        .await?;
        let recent: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schemes WHERE last_updated >= ?1")
            .bind(ts(now - opts.recent_window))
            .fetch_one(&self.pool)
            .await?;

        Ok(SchemeStats {
            total_schemes,
            region_stats,
            ministry_stats: top_counts(ministries, opts.top_n),
            recent_schemes: recent.max(0) as u64,
        })
    }

    async fn list_market(&self, filter: &MarketFilter) -> StoreResult<MarketSnapshot> {
        let commodity = like_pattern(filter.commodity.as_deref());
        let market = like_pattern(filter.market.as_deref());
        let state = like_pattern(filter.state.as_deref());

        let prices = sqlx::query(
            "SELECT * FROM market_prices f
             WHERE (?1 IS NULL OR LOWER(commodity) LIKE ?1 ESCAPE '\\')
               AND (?2 IS NULL OR LOWER(market_name) LIKE ?2 ESCAPE '\\')
               AND (?3 IS NULL OR LOWER(state) LIKE ?3 ESCAPE '\\')
             ORDER BY last_updated DESC, commodity, market_name
             LIMIT ?4",
        )
        .bind(&commodity)
        .bind(&market)
        .bind(&state)
        .bind(filter.price_limit() as i64)
        .fetch_all(&self.pool)
        .await?;

        let fact_sql = |table: &str| {
            format!(
                "SELECT * FROM {table} f
                 WHERE (?1 IS NULL OR LOWER(commodity) LIKE ?1 ESCAPE '\\')
                   AND (?2 IS NULL OR LOWER(market_name) LIKE ?2 ESCAPE '\\')
                   AND {STATE_VIA_PRICE}
                 ORDER BY last_updated DESC, commodity, market_name
                 LIMIT ?4"
            )
        };

        let trends_sql = fact_sql("market_trends");
        let trends = sqlx::query(&trends_sql)
            .bind(&commodity)
            .bind(&market)
            .bind(&state)
            .bind(filter.fact_limit() as i64)
            .fetch_all(&self.pool)
            .await?;

        let demand_sql = fact_sql("market_demand");
        let demand = sqlx::query(&demand_sql)
            .bind(&commodity)
            .bind(&market)
            .bind(&state)
            .bind(filter.fact_limit() as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(MarketSnapshot {
            prices: prices.iter().map(row_to_price).collect::<StoreResult<_>>()?,
            trends: trends.iter().map(row_to_trend).collect::<StoreResult<_>>()?,
            demand: demand.iter().map(row_to_demand).collect::<StoreResult<_>>()?,
        })
    }

    async fn market_stats(&self, opts: StatsOptions, now: DateTime<Utc>) -> StoreResult<MarketStats> {
        let commodities = grouped(
            &self.pool,
            "SELECT commodity, COUNT(*) FROM market_prices GROUP BY commodity",
        )
        .await?;
        let recent: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM market_prices WHERE last_updated >= ?1")
                .bind(ts(now - opts.recent_window))
                .fetch_one(&self.pool)
                .await?;

        Ok(MarketStats {
            total_prices: count(&self.pool, "SELECT COUNT(*) FROM market_prices").await?,
            total_trends: count(&self.pool, "SELECT COUNT(*) FROM market_trends").await?,
            total_demand: count(&self.pool, "SELECT COUNT(*) FROM market_demand").await?,
            commodity_stats: top_counts(commodities, opts.top_n),
            recent_observations: recent.max(0) as u64,
        })
    }

    async fn stored_states(&self) -> StoreResult<Vec<String>> {
        let states = sqlx::query_scalar(
            "SELECT state FROM schemes WHERE state <> ''
             UNION
             SELECT state FROM market_prices WHERE state <> ''
             ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    async fn close(&self) {
        if !self.keep_open {
            self.pool.close().await;
        }
    }
}
