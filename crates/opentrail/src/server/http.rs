//! HTTP query server: `/api/health`, `/api/logs`, `/api/logs/stream`.
//!
//! Query parameters are parsed leniently as strings and validated here so
//! that every rejection is a consistent `{success:false, error}` 400
//! rather than an extractor-shaped error. Internal failures are logged
//! server-side and never leak database detail to clients.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::response::Json;
use axum::routing::get;
use axum::{middleware, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::model::{LogEntry, SearchQuery, MAX_SEARCH_LIMIT};
use crate::parser::template::{normalize_level, severity_for_level};
use crate::server::{auth, ws};
use crate::state::AppState;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<LogEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    fn success(data: Vec<LogEntry>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Raw query parameters for `/api/logs`. Everything arrives as a string
/// and is validated in `into_search_query`.
#[derive(Debug, Default, Deserialize)]
pub struct LogsParams {
    text: Option<String>,
    level: Option<String>,
    facility: Option<String>,
    severity: Option<String>,
    min_severity: Option<String>,
    hostname: Option<String>,
    app_name: Option<String>,
    proc_id: Option<String>,
    msg_id: Option<String>,
    /// Template-parser compatibility: alias for `msg_id`, where the
    /// template parser stores the tracking id.
    tracking_id: Option<String>,
    structured_data_query: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

impl LogsParams {
    fn into_search_query(self) -> Result<SearchQuery, ApiError> {
        let mut query = SearchQuery {
            text: self.text,
            hostname: self.hostname,
            app_name: self.app_name,
            proc_id: self.proc_id,
            msg_id: self
                .msg_id
                .filter(|m| !m.is_empty())
                .or(self.tracking_id),
            structured_data_query: self.structured_data_query,
            ..SearchQuery::default()
        };

        query.facility = parse_bounded_int(self.facility, "facility", 23)?;
        query.severity = parse_bounded_int(self.severity, "severity", 7)?;
        query.min_severity = parse_bounded_int(self.min_severity, "min_severity", 7)?;

        // `level` is the template-parser spelling of a severity filter.
        if query.severity.is_none() {
            if let Some(level) = self.level.filter(|l| !l.is_empty()) {
                query.severity = Some(severity_for_level(&normalize_level(&level)));
            }
        }

        query.start_time = parse_time(self.start_time, "start_time")?;
        query.end_time = parse_time(self.end_time, "end_time")?;

        if let Some(raw) = self.limit {
            let limit: usize = raw
                .parse()
                .map_err(|_| ApiError::InvalidRequest(format!("invalid limit: {:?}", raw)))?;
            if limit < 1 || limit > MAX_SEARCH_LIMIT {
                return Err(ApiError::InvalidRequest(format!(
                    "limit must be in 1..={}",
                    MAX_SEARCH_LIMIT
                )));
            }
            query.limit = limit;
        }
        if let Some(raw) = self.offset {
            let offset: i64 = raw
                .parse()
                .map_err(|_| ApiError::InvalidRequest(format!("invalid offset: {:?}", raw)))?;
            if offset < 0 {
                return Err(ApiError::InvalidRequest("offset must be >= 0".to_string()));
            }
            query.offset = offset as usize;
        }

        Ok(query)
    }
}

fn parse_bounded_int(
    raw: Option<String>,
    name: &str,
    max: u8,
) -> Result<Option<u8>, ApiError> {
    match raw.filter(|r| !r.is_empty()) {
        None => Ok(None),
        Some(raw) => {
            let value: u8 = raw
                .parse()
                .map_err(|_| ApiError::InvalidRequest(format!("invalid {}: {:?}", name, raw)))?;
            if value > max {
                return Err(ApiError::InvalidRequest(format!(
                    "{} must be in 0..={}",
                    name, max
                )));
            }
            Ok(Some(value))
        }
    }
}

fn parse_time(raw: Option<String>, name: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
    match raw.filter(|r| !r.is_empty()) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| ApiError::InvalidRequest(format!("invalid {}: {:?}", name, raw))),
    }
}

/// Build the full application router. Auth guards everything except
/// `/api/health`; the request timeout is not applied to the stream route.
pub fn build_router(state: AppState) -> Router {
    let query_routes = Router::new()
        .route("/api/logs", get(get_logs))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let stream_routes = Router::new().route("/api/logs/stream", get(ws::stream_handler));

    let protected = query_routes.merge(stream_routes).layer(
        middleware::from_fn_with_state(state.clone(), auth::require_basic_auth),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .fallback(not_found)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Serve until the shutdown watch channel flips.
pub async fn run(state: AppState, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    let app = build_router(state.clone());
    let mut shutdown = state.shutdown_rx();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // The signal may predate this subscription; check before waiting.
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

async fn get_logs(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> Result<Json<ApiResponse>, ApiError> {
    let query = params.into_search_query()?;
    let storage = state.storage.clone();
    let entries = tokio::task::spawn_blocking(move || storage.search(&query))
        .await
        .map_err(|e| ApiError::Internal(format!("search task failed: {}", e)))?
        .map_err(|e| ApiError::Internal(format!("search failed: {}", e)))?;
    Ok(Json(ApiResponse::success(entries)))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "log_service": if state.service.is_running() { "running" } else { "stopped" },
            "http_server": "running",
        },
        "metrics": {
            "service": state.service.stats().snapshot(),
            "storage": state.storage.stats().snapshot(),
            "connections": state.connection_stats.snapshot(),
        },
    }))
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "not found" })),
    )
}
