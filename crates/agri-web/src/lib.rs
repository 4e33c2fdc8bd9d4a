//! JSON HTTP API over the query surface, plus on-demand fetch cycles.

use std::net::SocketAddr;
use std::sync::Arc;

use agri_core::{Dataset, MarketFilter, SchemeFilter, StatsOptions};
use agri_store::{available_states, Store, StoreResult};
use agri_sync::{CycleRunner, SyncConfig};
use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "agri-web";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<CycleRunner>,
}

impl AppState {
    pub fn new(runner: Arc<CycleRunner>) -> Self {
        Self { runner }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/schemes", get(list_schemes_handler))
        .route("/api/schemes/stats", get(scheme_stats_handler))
        .route("/api/schemes/states", get(states_handler))
        .route("/api/schemes/fetch", post(fetch_schemes_handler))
        .route("/api/schemes/{id}", get(get_scheme_handler))
        .route("/api/market", get(list_market_handler))
        .route("/api/market/stats", get(market_stats_handler))
        .route("/api/market/fetch", post(fetch_market_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig, port: Option<u16>) -> anyhow::Result<()> {
    let runner = CycleRunner::from_config(config).await?;
    let port = port.unwrap_or(config.web_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, store = %runner.store().describe(), "serving api");
    axum::serve(listener, app(AppState::new(Arc::new(runner))))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving api")?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&SyncConfig::from_env(), None).await
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn json_or_error<T: Serialize>(result: StoreResult<T>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => {
            error!(error = %err, "store query failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn open_store(state: &AppState) -> Result<Box<dyn Store>, Response> {
    state.runner.store().open().await.map_err(|err| {
        error!(error = %err, "could not open store");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    })
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_schemes_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<SchemeFilter>,
) -> Response {
    let store = match open_store(&state).await {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let result = store.list_schemes(&filter).await;
    store.close().await;
    json_or_error(result)
}

async fn get_scheme_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let store = match open_store(&state).await {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let result = store.get_scheme(&id).await;
    store.close().await;
    match result {
        Ok(Some(scheme)) => Json(scheme).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Scheme not found"),
        Err(err) => json_or_error::<()>(Err(err)),
    }
}

async fn scheme_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = match open_store(&state).await {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let result = store.scheme_stats(StatsOptions::default(), Utc::now()).await;
    store.close().await;
    json_or_error(result)
}

async fn states_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = match open_store(&state).await {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let result = available_states(store.as_ref()).await;
    store.close().await;
    json_or_error(result)
}

async fn list_market_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<MarketFilter>,
) -> Response {
    let store = match open_store(&state).await {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let result = store.list_market(&filter).await;
    store.close().await;
    json_or_error(result)
}

async fn market_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = match open_store(&state).await {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    let result = store.market_stats(StatsOptions::default(), Utc::now()).await;
    store.close().await;
    json_or_error(result)
}

async fn run_fetch(state: &AppState, dataset: Dataset) -> Response {
    let Some(permit) = state.runner.try_acquire() else {
        info!(%dataset, "fetch rejected; a cycle is already running");
        return error_response(StatusCode::CONFLICT, "cycle already running");
    };
    match permit.run_cycle(dataset).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err.result)).into_response(),
    }
}

async fn fetch_schemes_handler(State(state): State<Arc<AppState>>) -> Response {
    run_fetch(&state, Dataset::Schemes).await
}

async fn fetch_market_handler(State(state): State<Arc<AppState>>) -> Response {
    run_fetch(&state, Dataset::Market).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use agri_adapters::{AdapterError, FetchContext, RawBatch, SourceAdapter};
    use agri_core::KNOWN_STATES;
    use agri_store::{MemoryStore, StoreConnector};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct FixedSource(Value);

    #[async_trait]
    impl SourceAdapter for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self, _ctx: &FetchContext) -> Result<Option<RawBatch>, AdapterError> {
            let records = self
                .0
                .as_array()
                .map(|items| items.iter().filter_map(|v| v.as_object().cloned()).collect())
                .unwrap_or_default();
            Ok(Some(RawBatch {
                source: "fixed".into(),
                records,
            }))
        }
    }

    fn test_app() -> Router {
        let runner = CycleRunner::new(StoreConnector::Memory(MemoryStore::new()))
            .with_source(
                Dataset::Schemes,
                Box::new(FixedSource(json!([
                    {"scheme_name": "PM Kisan", "ministry": "Ministry of Agriculture",
                     "region": "Central", "last_updated": "2026-03-01"},
                    {"scheme_name": "Raitha Bandhu", "ministry": "Karnataka Agriculture Department",
                     "region": "State", "state": "Karnataka", "last_updated": "2026-03-02"}
                ]))),
            )
            .with_source(
                Dataset::Market,
                Box::new(FixedSource(json!([
                    {"commodity": "Wheat", "market": "Delhi Mandi", "state": "Delhi",
                     "price": "2500", "date": "2026-03-01"}
                ]))),
            );
        app(AppState::new(Arc::new(runner)))
    }

    async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = call(&test_app(), Method::GET, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn fetch_then_query_schemes() {
        let app = test_app();
        let (status, result) = call(&app, Method::POST, "/api/schemes/fetch").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["status"], "success");
        assert_eq!(result["insertedCount"], 2);

        let (_, list) = call(&app, Method::GET, "/api/schemes").await;
        assert_eq!(list.as_array().unwrap().len(), 2);
        assert_eq!(list[0]["schemeId"], "raitha-bandhu");
        assert!(list[0]["createdAt"].is_string());

        let (_, filtered) = call(&app, Method::GET, "/api/schemes?region=central&limit=5").await;
        assert_eq!(filtered.as_array().unwrap().len(), 1);
        assert_eq!(filtered[0]["schemeName"], "PM Kisan");

        let (status, one) = call(&app, Method::GET, "/api/schemes/pm-kisan").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(one["ministry"], "Ministry of Agriculture");

        let (_, stats) = call(&app, Method::GET, "/api/schemes/stats").await;
        assert_eq!(stats["totalSchemes"], 2);
        assert_eq!(stats["regionStats"]["State"], 1);

        let (_, states) = call(&app, Method::GET, "/api/schemes/states").await;
        assert_eq!(states.as_array().unwrap().len(), KNOWN_STATES.len());
    }

    #[tokio::test]
    async fn missing_scheme_is_404_json() {
        let (status, body) = call(&test_app(), Method::GET, "/api/schemes/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Scheme not found");
    }

    #[tokio::test]
    async fn market_fetch_and_snapshot() {
        let app = test_app();
        let (status, result) = call(&app, Method::POST, "/api/market/fetch").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["dataset"], "market");

        let (_, snapshot) = call(&app, Method::GET, "/api/market?commodity=wheat").await;
        assert_eq!(snapshot["prices"][0]["marketName"], "Delhi Mandi");
        assert_eq!(snapshot["demand"][0]["demandLevel"], "High");
        assert_eq!(snapshot["trends"][0]["priceToday"], 2500.0);

        let (_, none) = call(&app, Method::GET, "/api/market?state=kerala").await;
        assert!(none["prices"].as_array().unwrap().is_empty());
        assert!(none["trends"].as_array().unwrap().is_empty());

        let (_, stats) = call(&app, Method::GET, "/api/market/stats").await;
        assert_eq!(stats["totalPrices"], 1);
        assert_eq!(stats["commodityStats"][0]["name"], "Wheat");
    }

    struct SlowSource;

    #[async_trait]
    impl SourceAdapter for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, ctx: &FetchContext) -> Result<Option<RawBatch>, AdapterError> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            FixedSource(json!([{"scheme_name": "PM Kisan", "last_updated": "2026-03-01"}]))
                .fetch(ctx)
                .await
        }
    }

    #[tokio::test]
    async fn overlapping_fetch_is_rejected_with_409() {
        let runner = CycleRunner::new(StoreConnector::Memory(MemoryStore::new()))
            .with_source(Dataset::Schemes, Box::new(SlowSource));
        let app = app(AppState::new(Arc::new(runner)));

        let (first, second) = tokio::join!(
            call(&app, Method::POST, "/api/schemes/fetch"),
            call(&app, Method::POST, "/api/schemes/fetch")
        );
        let (ran, rejected) = if first.0 == StatusCode::OK {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(ran.0, StatusCode::OK);
        assert_eq!(ran.1["insertedCount"], 1);
        assert_eq!(rejected.0, StatusCode::CONFLICT);
        assert_eq!(rejected.1["error"], "cycle already running");

        let (status, _) = call(&app, Method::POST, "/api/schemes/fetch").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn cycle_error_is_500_with_result() {
        let runner = CycleRunner::new(StoreConnector::Memory(MemoryStore::new()));
        let app = app(AppState::new(Arc::new(runner)));
        let (status, body) = call(&app, Method::POST, "/api/schemes/fetch").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(body["error"].is_string());
    }
}
