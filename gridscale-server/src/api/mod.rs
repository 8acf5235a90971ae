//! HTTP API endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use gridscale_core::grid::{Diagnostics, GridScale, IterateRequest, Page, StoreSummary};
use gridscale_core::worker::WorkerStats;
use gridscale_core::{now_millis, GridError, RecordBatch, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Application state
pub type AppState = Arc<GridScale>;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the API router
pub fn create_router(grid: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/write", post(write))
        .route("/query", post(query))
        .route("/stats", get(stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(grid)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    /// Stamped on every sample; the server clock when absent
    #[serde(default)]
    pub insert_time: Option<Timestamp>,
    pub records: RecordBatch,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub summary: StoreSummary,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub rows: usize,
    pub pages: Vec<Page>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cardinality: usize,
    pub workers: Vec<WorkerStats>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: GridError) -> ApiError {
    let status = match &e {
        GridError::InvalidTimeRange { .. }
        | GridError::Config(_)
        | GridError::UnknownMethod(_)
        | GridError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
        GridError::CacheFull { .. } | GridError::WorkerUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("Request failed: {}", e);
    }
    (status, Json(ErrorResponse { error: e.to_string() }))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: gridscale_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn write(
    State(grid): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<WriteResponse>, ApiError> {
    let insert_time = req.insert_time.unwrap_or_else(now_millis);
    let mut diagnostics = Diagnostics::new();
    let summary = grid
        .store(&req.records, insert_time, &mut diagnostics)
        .await
        .map_err(error_response)?;
    debug!("Write diagnostics:\n{}", diagnostics.summary());

    Ok(Json(WriteResponse { summary, diagnostics }))
}

async fn query(
    State(grid): State<AppState>,
    Json(req): Json<IterateRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let mut iter = grid.iterator(req).map_err(error_response)?;
    let query_id = iter.query_id().to_string();

    let mut pages = Vec::new();
    while let Some(page) = iter.next().await.map_err(error_response)? {
        pages.push(page);
    }
    let rows = pages.iter().map(|p| p.rows.len()).sum();

    Ok(Json(QueryResponse { query_id, rows, pages }))
}

async fn stats(State(grid): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let workers = grid.stats().await.map_err(error_response)?;
    Ok(Json(StatsResponse {
        cardinality: grid.cardinality(),
        workers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscale_core::grid::{BackendKind, GridConfig};

    fn grid() -> AppState {
        let config = GridConfig {
            worker_count: 2,
            backend: BackendKind::Memory,
            ..GridConfig::default()
        };
        Arc::new(GridScale::open(config).unwrap())
    }

    fn write_request(body: &str) -> WriteRequest {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn test_parse_write_request() {
        let req = write_request(r#"{"records": {"cpu": [{"sample_time": 10, "numeric": 1.5}]}}"#);
        assert!(req.insert_time.is_none());
        let sample = &req.records["cpu"][0];
        assert_eq!(sample.sample_time, 10);
        assert_eq!(sample.insert_time, 0);
        assert!(sample.other.is_none());
    }

    #[test]
    fn test_error_status() {
        let (status, _) = error_response(GridError::InvalidTimeRange { start: 5, end: 1 });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = error_response(GridError::CacheFull { cached: 4, limit: 4 });
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, Json(body)) = error_response(GridError::Corruption("bad block".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.error.contains("bad block"));
    }

    #[tokio::test]
    async fn test_write_then_query() {
        let grid = grid();
        let req = write_request(
            r#"{"insert_time": 5000, "records": {
                "cpu": [
                    {"sample_time": 1000, "numeric": 1.0},
                    {"sample_time": 2000, "numeric": 2.0, "other": "x"}
                ],
                "mem": [{"sample_time": 1500, "numeric": 3.0}]
            }}"#,
        );
        let Json(written) = write(State(grid.clone()), Json(req)).await.unwrap();
        assert_eq!(written.summary.rows, 3);
        assert!(written.diagnostics.phase("write").is_some());

        let request = IterateRequest::new(vec!["cpu".to_string()], 0, 10_000);
        let Json(result) = query(State(grid.clone()), Json(request)).await.unwrap();
        assert_eq!(result.rows, 2);
        let rows: Vec<_> = result.pages.iter().flat_map(|p| p.rows.iter()).collect();
        assert_eq!(rows[0].sample_time, 1000);
        assert_eq!(rows[1].other.as_deref(), Some("x"));
        assert!(rows.iter().all(|r| r.insert_time == 5000));

        let Json(stats) = stats(State(grid.clone())).await.unwrap();
        assert_eq!(stats.workers.len(), stats.cardinality);
        assert_eq!(stats.workers.iter().map(|w| w.rows_written).sum::<u64>(), 3);

        grid.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_rejects_bad_requests() {
        let grid = grid();

        let request = IterateRequest::new(vec!["cpu".to_string()], 10, 10);
        let (status, _) = query(State(grid.clone()), Json(request)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut request = IterateRequest::new(vec!["cpu".to_string()], 0, 10);
        request.aggregate = Some("no-such-aggregator".to_string());
        let (status, _) = query(State(grid.clone()), Json(request)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        grid.shutdown().await.unwrap();
    }
}
