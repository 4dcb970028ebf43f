//! Read-only JSON API over the persisted forecast table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use projtrack_core::{metric_label, CanonicalSchema, ModelName};
use projtrack_sync::pipeline::RUN_SUMMARY_FILE;
use projtrack_sync::{ForecastReader, PipelineConfig, SeriesPoint, SeriesQuery, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "projtrack-web";

#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<dyn ForecastReader>,
    pub workspace_root: PathBuf,
    schema: CanonicalSchema,
}

impl AppState {
    pub fn new(reader: Arc<dyn ForecastReader>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            workspace_root: workspace_root.into(),
            schema: CanonicalSchema::standard(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricInfo {
    pub column: String,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SeriesParams {
    model: String,
    location: String,
    metric: String,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesResponse {
    pub model: String,
    pub location: String,
    pub metric: String,
    pub label: Option<String>,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPeak {
    pub model_version: String,
    pub model_date: NaiveDate,
    pub peak_date: NaiveDate,
    pub peak_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub versions: usize,
    pub latest: Option<VersionPeak>,
    pub highest: Option<VersionPeak>,
    pub lowest: Option<VersionPeak>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReportRow {
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub rows_inserted: u64,
    pub load_error: Option<String>,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Store(StoreError),
    Internal(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownMetric(metric) => {
                ApiError::BadRequest(format!("unknown metric column {metric}"))
            }
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Store(err) => {
                error!(error = %err, "forecast store query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("store error: {err}"))
            }
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("server error: {err}"))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/locations", get(locations_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/series", get(series_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &PipelineConfig) -> anyhow::Result<()> {
    let store = projtrack_sync::connect_store(config).await?;
    let state = AppState::new(Arc::new(store), config.workspace_root.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "query API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn locations_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let locations = state.reader.locations().await?;
    Ok(Json(serde_json::json!({ "locations": locations })))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<Vec<MetricInfo>> {
    Json(metric_catalog(&state.schema))
}

pub fn metric_catalog(schema: &CanonicalSchema) -> Vec<MetricInfo> {
    schema
        .metric_columns()
        .into_iter()
        .map(|column| MetricInfo {
            label: metric_label(column).unwrap_or_else(|| column.to_string()),
            column: column.to_string(),
        })
        .collect()
}

fn series_query(state: &AppState, params: &SeriesParams) -> Result<SeriesQuery, ApiError> {
    let model_name = params
        .model
        .parse::<ModelName>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    if !state.schema.is_metric_column(&params.metric) {
        return Err(ApiError::BadRequest(format!(
            "unknown metric column {}",
            params.metric
        )));
    }
    if let (Some(start), Some(end)) = (params.start, params.end) {
        if start > end {
            return Err(ApiError::BadRequest(format!("start {start} is after end {end}")));
        }
    }
    Ok(SeriesQuery {
        model_name,
        location_name: params.location.clone(),
        metric: params.metric.clone(),
        start: params.start,
        end: params.end,
    })
}

async fn series_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let query = series_query(&state, &params)?;
    let points = state.reader.series(&query).await?;
    Ok(Json(SeriesResponse {
        label: metric_label(&params.metric),
        model: params.model,
        location: params.location,
        metric: params.metric,
        points,
    }))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<SeriesSummary>, ApiError> {
    let query = series_query(&state, &params)?;
    let points = state.reader.series(&query).await?;
    Ok(Json(summarize(&points)))
}

/// Peak value of each model version, then the latest, highest and lowest of those peaks.
pub fn summarize(points: &[SeriesPoint]) -> SeriesSummary {
    let mut peaks: BTreeMap<(NaiveDate, &str), VersionPeak> = BTreeMap::new();
    for point in points {
        let Some(value) = point.value else { continue };
        let peak = peaks
            .entry((point.model_date, point.model_version.as_str()))
            .or_insert_with(|| VersionPeak {
                model_version: point.model_version.clone(),
                model_date: point.model_date,
                peak_date: point.date,
                peak_value: value,
            });
        if value > peak.peak_value {
            peak.peak_value = value;
            peak.peak_date = point.date;
        }
    }

    SeriesSummary {
        versions: peaks.len(),
        latest: peaks.values().last().cloned(),
        highest: peaks
            .values()
            .max_by(|a, b| a.peak_value.total_cmp(&b.peak_value))
            .cloned(),
        lowest: peaks
            .values()
            .min_by(|a, b| a.peak_value.total_cmp(&b.peak_value))
            .cloned(),
    }
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<RunReportRow>>, ApiError> {
    load_runs(&state.workspace_root, 20)
        .map(Json)
        .map_err(ApiError::Internal)
}

fn load_runs(workspace_root: &Path, limit: usize) -> anyhow::Result<Vec<RunReportRow>> {
    let reports_root = workspace_root.join("reports");
    if !reports_root.exists() {
        return Ok(vec![]);
    }
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(&reports_root)?.filter_map(|e| e.ok()) {
        let path = entry.path().join(RUN_SUMMARY_FILE);
        if !path.exists() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        runs.push(RunReportRow {
            run_id: entry.file_name().to_string_lossy().to_string(),
            status: text("status").unwrap_or_else(|| "unknown".into()),
            started_at: text("started_at").unwrap_or_default(),
            rows_inserted: value
                .get("load")
                .and_then(|l| l.get("rows_inserted"))
                .and_then(|n| n.as_u64())
                .unwrap_or(0),
            load_error: text("load_error"),
        });
    }
    // RFC 3339 timestamps sort chronologically as strings.
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);
    Ok(runs)
}
