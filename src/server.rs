//! HTTP API over the cached shop directory.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/shops/nearest?lat=&lon=&radius=` | Shops within a radius, nearest first |
//! | `GET`  | `/shops/search?q=[&lat=&lon=]` | Keyword search, optionally ordered by distance |
//! | `GET`  | `/shops/query?q=` | Advanced boolean query |
//! | `GET`  | `/shops/{id}` | One shop |
//! | `GET`  | `/districts` | Distinct districts |
//! | `GET`  | `/suggest?key=` | Keyword suggestions |
//! | `POST` | `/fill-info` | Run the geocode backfill and wait for it |
//! | `POST` | `/admin/sessions/{chat_id}` | Start an add-shop wizard |
//! | `POST` | `/admin/sessions/{chat_id}/answer` | Answer the current wizard step |
//! | `DELETE` | `/admin/sessions/{chat_id}` | Abandon a wizard |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid request: unknown radius unit" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `unavailable` (503), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use shopfinder_core::models::Shop;
use shopfinder_core::store::ShopStore;
use shopfinder_core::StoreError;

use crate::backend::open_backend;
use crate::cache::CachedStore;
use crate::config::Config;
use crate::enrich::{EnrichError, Enricher, RunReport};
use crate::geocode::create_geocoder;
use crate::session::{AdminSession, Input, Reply, SessionError, SessionStore};

/// Default radius for `/shops/nearest` when none is given.
pub const DEFAULT_RADIUS: &str = "500m";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub shops: Arc<CachedStore>,
    pub sessions: Arc<SessionStore>,
    pub enricher: Arc<Enricher>,
}

impl AppState {
    /// Open the configured backend and wire the cache, sessions and
    /// enrichment pipeline around it.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let backend = open_backend(config).await?;
        let geocoder = create_geocoder(&config.geocoder)?;
        let shops = Arc::new(CachedStore::from_config(Arc::clone(&backend), &config.cache));
        let enricher = Enricher::new(backend, geocoder, &config.enrich).with_cache(Arc::clone(&shops));
        Ok(Self {
            shops,
            sessions: Arc::new(SessionStore::from_config(&config.cache)),
            enricher: Arc::new(enricher),
        })
    }
}

/// Starts the HTTP server on `[server].bind` and runs until SIGINT or
/// SIGTERM.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    serve(&config.server.bind, state).await
}

/// Serve `state` on `bind` until a shutdown signal arrives.
pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    serve_with_shutdown(bind, state, shutdown_signal()).await
}

/// Serve `state` on `bind` until `shutdown` resolves, then drain in-flight
/// requests and close the backend. The backend is closed on every exit
/// path, including a failed bind.
pub async fn serve_with_shutdown<F>(bind: &str, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let shops = Arc::clone(&state.shops);
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            shops.close().await;
            return Err(e.into());
        }
    };
    info!(bind = %bind, "shopfinder server listening");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    shops.close().await;
    info!("backend closed, server stopped");
    served?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/shops/nearest", get(handle_nearest))
        .route("/shops/search", get(handle_search))
        .route("/shops/query", get(handle_query))
        .route("/shops/{id}", get(handle_get))
        .route("/districts", get(handle_districts))
        .route("/suggest", get(handle_suggest))
        .route("/fill-info", post(handle_fill_info))
        .route(
            "/admin/sessions/{chat_id}",
            post(handle_session_start).delete(handle_session_end),
        )
        .route("/admin/sessions/{chat_id}/answer", post(handle_session_answer))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

/// Body message for backend and server failures. The detail is logged,
/// never sent to the client.
pub const RETRY_MESSAGE: &str = "backend unavailable, please retry later";

fn internal(detail: impl std::fmt::Display) -> AppError {
    warn!(error = %detail, "request failed");
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", RETRY_MESSAGE)
}

fn unavailable(detail: impl std::fmt::Display) -> AppError {
    warn!(error = %detail, "backend unavailable");
    AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", RETRY_MESSAGE)
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => not_found(err.to_string()),
            StoreError::Validation(_) => bad_request(err.to_string()),
            StoreError::Connection(_) => unavailable(err),
            StoreError::Query(_) | StoreError::Other(_) => internal(err),
        }
    }
}

impl From<EnrichError> for AppError {
    fn from(err: EnrichError) -> Self {
        match err {
            EnrichError::AlreadyRunning => {
                AppError::new(StatusCode::CONFLICT, "conflict", err.to_string())
            }
            other => internal(other),
        }
    }
}

/// Wizard errors are client errors; a failed insert keeps its store status.
fn classify_session_error(err: anyhow::Error) -> AppError {
    if let Some(e) = err.downcast_ref::<SessionError>() {
        return match e {
            SessionError::NoSession(_) => not_found(e.to_string()),
            _ => bad_request(e.to_string()),
        };
    }
    match err.downcast::<StoreError>() {
        Ok(store) => store.into(),
        Err(other) => internal(other),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ shop reads ============

#[derive(Serialize)]
struct ShopList {
    shops: Vec<Shop>,
}

#[derive(Deserialize)]
struct NearestParams {
    lat: f64,
    lon: f64,
    radius: Option<String>,
}

async fn handle_nearest(
    State(state): State<AppState>,
    Query(params): Query<NearestParams>,
) -> Result<Json<ShopList>, AppError> {
    let radius = params.radius.as_deref().unwrap_or(DEFAULT_RADIUS);
    let shops = state.shops.nearest_shops(params.lat, params.lon, radius).await?;
    Ok(Json(ShopList { shops }))
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    lat: Option<f64>,
    lon: Option<f64>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<ShopList>, AppError> {
    let shops = match (params.lat, params.lon) {
        (Some(lat), Some(lon)) => state.shops.keyword_near(&params.q, lat, lon).await?,
        (None, None) => state.shops.shops_with_keyword(&params.q).await?,
        _ => return Err(bad_request("lat and lon must be given together")),
    };
    Ok(Json(ShopList { shops }))
}

#[derive(Deserialize)]
struct QueryParams {
    q: String,
}

async fn handle_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Json<ShopList>, AppError> {
    let shops = state.shops.adv_query(&params.q).await?;
    Ok(Json(ShopList { shops }))
}

async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Shop>, AppError> {
    Ok(Json(state.shops.shop_by_id(id).await?))
}

#[derive(Serialize)]
struct DistrictList {
    districts: Vec<String>,
}

async fn handle_districts(State(state): State<AppState>) -> Result<Json<DistrictList>, AppError> {
    let districts = state.shops.districts().await?;
    Ok(Json(DistrictList { districts }))
}

#[derive(Deserialize)]
struct SuggestParams {
    key: String,
}

#[derive(Serialize)]
struct SuggestionList {
    suggestions: Vec<String>,
}

async fn handle_suggest(
    State(state): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> Result<Json<SuggestionList>, AppError> {
    let suggestions = state.shops.suggest_keyword(&params.key).await?;
    Ok(Json(SuggestionList { suggestions }))
}

// ============ POST /fill-info ============

#[derive(Serialize)]
struct FillInfoResponse {
    report: RunReport,
    errors: Vec<String>,
}

async fn handle_fill_info(State(state): State<AppState>) -> Result<Json<FillInfoResponse>, AppError> {
    let run = state.enricher.start()?;
    let (report, errors) = run.finish().await.map_err(internal)?;
    Ok(Json(FillInfoResponse {
        report,
        errors: errors.iter().map(ToString::to_string).collect(),
    }))
}

// ============ admin wizard ============

#[derive(Serialize)]
struct SessionResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<AdminSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shop_id: Option<i64>,
}

impl SessionResponse {
    fn ask(session: AdminSession) -> Self {
        Self {
            status: "ask",
            prompt: Some(session.step.prompt()),
            session: Some(session),
            shop_id: None,
        }
    }
}

async fn handle_session_start(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
) -> Json<SessionResponse> {
    Json(SessionResponse::ask(state.sessions.start(chat_id)))
}

async fn handle_session_answer(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Json(input): Json<Input>,
) -> Result<Json<SessionResponse>, AppError> {
    let reply = state
        .sessions
        .answer(chat_id, input, state.shops.as_ref())
        .await
        .map_err(classify_session_error)?;

    let response = match reply {
        Reply::Ask(session) => SessionResponse::ask(session),
        Reply::Saved(id) => SessionResponse {
            status: "saved",
            session: None,
            prompt: None,
            shop_id: Some(id),
        },
        Reply::Cancelled => SessionResponse {
            status: "cancelled",
            session: None,
            prompt: None,
            shop_id: None,
        },
    };
    Ok(Json(response))
}

async fn handle_session_end(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
) -> StatusCode {
    state.sessions.end(chat_id);
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_statuses() {
        let cases = [
            (StoreError::NotFound(3), StatusCode::NOT_FOUND),
            (StoreError::validation("bad radius"), StatusCode::BAD_REQUEST),
            (StoreError::Connection("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (StoreError::query("syntax"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn backend_failures_hide_the_detail() {
        let cases = [
            StoreError::Connection("pool timed out at 10.0.0.7:5432".into()),
            StoreError::query("no such column: geog"),
            StoreError::Other(anyhow::anyhow!("index lock poisoned")),
        ];
        for err in cases {
            let app = AppError::from(err);
            assert_eq!(app.message, RETRY_MESSAGE);
        }
        assert_eq!(
            AppError::from(StoreError::validation("bad radius")).message,
            "invalid request: bad radius"
        );
    }

    #[test]
    fn session_errors_are_client_errors() {
        let missing = classify_session_error(SessionError::NoSession(4).into());
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        let empty = classify_session_error(SessionError::Empty("name").into());
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);
        let store = classify_session_error(StoreError::Connection("down".into()).into());
        assert_eq!(store.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn concurrent_fill_info_is_a_conflict() {
        assert_eq!(AppError::from(EnrichError::AlreadyRunning).status, StatusCode::CONFLICT);
    }
}
