use crate::config::{ApiConfig, RetentionConfig};
use crate::error::StoreError;
use crate::event::StoredEvent;
use crate::export::{write_export, ExportFormat};
use crate::statistics::{ClassStatistics, PurgeConfirmation, PurgeReport, StatisticsEngine};
use crate::store::CollectionStats;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Largest `limit` accepted by list and export endpoints.
const MAX_LIMIT: usize = 10_000;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: StatisticsEngine,
    pub retention: RetentionConfig,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: StoreError) -> ApiError {
    let (status, code) = match &e {
        StoreError::PurgeConfirmationRequired { .. } => {
            (StatusCode::PRECONDITION_REQUIRED, "CONFIRMATION_REQUIRED")
        }
        StoreError::InvalidQuery(_) => (StatusCode::BAD_REQUEST, "INVALID_QUERY"),
        StoreError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
        StoreError::QueryFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "QUERY_ERROR"),
        StoreError::WriteRejected(_) | StoreError::IndexCreationFailed(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
        }
    };
    if status.is_server_error() {
        error!(error = %e, "Request failed");
    } else {
        warn!(error = %e, "Request refused");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
            code: "INVALID_QUERY".to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default = "default_hours")]
    pub hours: u32,
    pub source_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SourceQuery {
    pub source_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default = "default_export_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub confirm: bool,
}

fn default_limit() -> usize {
    10
}

fn default_hours() -> u32 {
    1
}

fn default_export_limit() -> usize {
    100
}

/// Events in a trailing window
#[derive(Debug, Serialize)]
pub struct WindowResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub event_count: usize,
    pub class_totals: Vec<ClassTotal>,
    pub events: Vec<StoredEvent>,
}

#[derive(Debug, Serialize)]
pub struct ClassTotal {
    pub class_name: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct RangeResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub class_totals: Vec<ClassTotal>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/events", get(events_in_window).delete(purge_events))
        .route("/api/v1/events/recent", get(recent_events))
        .route("/api/v1/events/frame/:frame_number", get(events_for_frame))
        .route("/api/v1/stats/classes", get(class_statistics))
        .route("/api/v1/stats/range", get(range_totals))
        .route("/api/v1/collection", get(collection_info))
        .route("/api/v1/export", get(export_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "vigil-storage"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.collection_info().await {
        Ok(info) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected",
                "documents": info.total_documents
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn recent_events(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    let events = state
        .engine
        .recent_events(params.limit.min(MAX_LIMIT))
        .await
        .map_err(api_error)?;
    Ok(Json(events))
}

#[instrument(skip(state))]
async fn events_in_window(
    State(state): State<AppState>,
    Query(params): Query<WindowQuery>,
) -> Result<Json<WindowResponse>, ApiError> {
    let report = state
        .engine
        .events_in_last(params.hours, params.source_id.as_deref())
        .await
        .map_err(api_error)?;

    let class_totals = report
        .ranked_totals()
        .into_iter()
        .map(|(class_name, count)| ClassTotal {
            class_name: class_name.to_string(),
            count,
        })
        .collect();

    Ok(Json(WindowResponse {
        start: report.start,
        end: report.end,
        event_count: report.events.len(),
        class_totals,
        events: report.events,
    }))
}

#[instrument(skip(state))]
async fn events_for_frame(
    State(state): State<AppState>,
    Path(frame_number): Path<u64>,
    Query(params): Query<SourceQuery>,
) -> Result<Json<Vec<StoredEvent>>, ApiError> {
    let events = state
        .engine
        .events_for_frame(frame_number, params.source_id.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(events))
}

#[instrument(skip(state))]
async fn class_statistics(
    State(state): State<AppState>,
    Query(params): Query<SourceQuery>,
) -> Result<Json<Vec<ClassStatistics>>, ApiError> {
    let stats = state
        .engine
        .aggregate_by_class(params.source_id.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(stats))
}

#[instrument(skip(state))]
async fn range_totals(
    State(state): State<AppState>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<RangeResponse>, ApiError> {
    let totals = state
        .engine
        .aggregate_by_time_range(params.start, params.end)
        .await
        .map_err(api_error)?;

    Ok(Json(RangeResponse {
        start: params.start,
        end: params.end,
        class_totals: totals
            .into_iter()
            .map(|(class_name, count)| ClassTotal { class_name, count })
            .collect(),
    }))
}

async fn collection_info(State(state): State<AppState>) -> Result<Json<CollectionStats>, ApiError> {
    let info = state.engine.collection_info().await.map_err(api_error)?;
    Ok(Json(info))
}

#[instrument(skip(state))]
async fn export_events(
    State(state): State<AppState>,
    Query(params): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let events = state
        .engine
        .recent_events(params.limit.min(MAX_LIMIT))
        .await
        .map_err(api_error)?;

    let mut body = Vec::new();
    write_export(&events, params.format, &mut body).map_err(|e| {
        error!(error = %e, "Failed to render export");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "EXPORT_ERROR".to_string(),
            }),
        )
    })?;

    Ok(([(header::CONTENT_TYPE, params.format.content_type())], body).into_response())
}

#[instrument(skip(state))]
async fn purge_events(
    State(state): State<AppState>,
    Query(params): Query<PurgeQuery>,
) -> Result<Json<PurgeReport>, ApiError> {
    let days = params.max_age_days.unwrap_or(state.retention.max_age_days);
    if days == 0 {
        return Err(bad_request("max_age_days must be at least 1"));
    }
    let max_age = Duration::try_days(i64::from(days))
        .ok_or_else(|| bad_request("max_age_days is out of range"))?;

    let report = state
        .engine
        .purge(max_age, PurgeConfirmation::from(params.confirm))
        .await
        .map_err(api_error)?;
    Ok(Json(report))
}

/// Serve the admin API until `shutdown` is cancelled.
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting admin API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::{create_detection, create_test_event};
    use crate::store::{EventStore, MemoryEventStore};
    use std::sync::Arc;

    async fn test_state() -> AppState {
        let store = Arc::new(MemoryEventStore::new("detection_events"));
        store
            .persist(&create_test_event(
                "cam-1",
                &[create_detection("car", 0.9), create_detection("person", 0.8)],
            ))
            .await
            .unwrap();
        store
            .persist(&create_test_event("cam-2", &[create_detection("car", 0.6)]))
            .await
            .unwrap();
        AppState {
            engine: StatisticsEngine::new(store),
            retention: RetentionConfig::default(),
        }
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, body) =
            api_error(StoreError::PurgeConfirmationRequired { cutoff: Utc::now() });
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(body.code, "CONFIRMATION_REQUIRED");

        let (status, _) = api_error(StoreError::InvalidQuery("bad".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = api_error(StoreError::StoreUnavailable("down".to_string()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_recent_events_handler() {
        let state = test_state().await;
        let Json(events) = recent_events(State(state), Query(LimitQuery { limit: 1 }))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_class_statistics_handler() {
        let state = test_state().await;
        let Json(stats) = class_statistics(State(state), Query(SourceQuery { source_id: None }))
            .await
            .unwrap();
        assert_eq!(stats[0].class_name, "car");
        assert_eq!(stats[0].total_count, 2);
    }

    #[tokio::test]
    async fn test_window_handler_ranks_totals() {
        let state = test_state().await;
        let Json(window) = events_in_window(
            State(state),
            Query(WindowQuery {
                hours: 1,
                source_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(window.event_count, 2);
        assert_eq!(window.class_totals[0].class_name, "car");
        assert_eq!(window.class_totals[0].count, 2);
    }

    #[tokio::test]
    async fn test_purge_without_confirm_is_refused() {
        let state = test_state().await;
        let result = purge_events(
            State(state.clone()),
            Query(PurgeQuery {
                max_age_days: Some(7),
                confirm: false,
            }),
        )
        .await;
        let (status, _) = result.unwrap_err();
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);

        let Json(report) = purge_events(
            State(state),
            Query(PurgeQuery {
                max_age_days: Some(7),
                confirm: true,
            }),
        )
        .await
        .unwrap();
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn test_purge_beyond_time_range_is_bad_request() {
        let state = test_state().await;
        let result = purge_events(
            State(state.clone()),
            Query(PurgeQuery {
                max_age_days: Some(u32::MAX),
                confirm: true,
            }),
        )
        .await;
        let (status, _) = result.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let collection = state.engine.collection_info().await.unwrap();
        assert_eq!(collection.total_documents, 2);
    }

    #[tokio::test]
    async fn test_window_beyond_time_range_is_bad_request() {
        let state = test_state().await;
        let result = events_in_window(
            State(state),
            Query(WindowQuery {
                hours: u32::MAX,
                source_id: None,
            }),
        )
        .await;
        let (status, _) = result.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_inverted_range_is_bad_request() {
        let state = test_state().await;
        let now = Utc::now();
        let result = range_totals(
            State(state),
            Query(RangeQuery {
                start: now,
                end: now - Duration::hours(1),
            }),
        )
        .await;
        let (status, _) = result.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
