//! REST API handlers for allocation decisions and operator reports.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use uplift_allocation::AllocationCoordinator;
use uplift_bandit::{ExperimentReport, VariantPosterior};
use uplift_core::types::{AllocationOutcome, ConversionOutcome, ConversionStatus, DEFAULT_SEGMENT};
use uplift_core::UpliftError;
use uplift_ledger::AuditLedger;
use uplift_segmentation::SegmentSummary;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Maximum string field length (user ID, context values, etc.).
const MAX_FIELD_LEN: usize = 256;

/// Maximum number of context entries per allocation request.
const MAX_CONTEXT_FIELDS: usize = 64;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<AllocationCoordinator>,
    pub ledger: Arc<AuditLedger>,
    pub node_id: String,
    pub start_time: Instant,
}

// ─── Request / response bodies ──────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
pub struct AllocateRequest {
    pub user_id: String,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AllocateResponse {
    pub assignment_id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub variant_name: String,
    #[schema(value_type = Object)]
    pub content: serde_json::Value,
    pub segment_key: String,
    pub assigned_at: DateTime<Utc>,
    pub is_new_assignment: bool,
}

impl From<AllocationOutcome> for AllocateResponse {
    fn from(outcome: AllocationOutcome) -> Self {
        Self {
            assignment_id: outcome.assignment_id,
            experiment_id: outcome.experiment_id,
            variant_id: outcome.variant_id,
            variant_name: outcome.variant_name,
            content: outcome.content,
            segment_key: outcome.segment_key,
            assigned_at: outcome.assigned_at,
            is_new_assignment: outcome.is_new_assignment,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConvertRequest {
    pub user_id: String,
    #[serde(default)]
    pub value: Option<f64>,
    /// Conversion time; defaults to now. Must be after the assignment.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConversionState {
    Recorded,
    AlreadyConverted,
    NotFound,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConvertResponse {
    pub status: ConversionState,
    pub assignment_id: Option<Uuid>,
    pub variant_id: Option<Uuid>,
}

impl From<ConversionOutcome> for ConvertResponse {
    fn from(outcome: ConversionOutcome) -> Self {
        let status = match outcome.status {
            ConversionStatus::Recorded => ConversionState::Recorded,
            ConversionStatus::AlreadyConverted => ConversionState::AlreadyConverted,
            ConversionStatus::NotFound => ConversionState::NotFound,
        };
        Self {
            status,
            assignment_id: outcome.assignment_id,
            variant_id: outcome.variant_id,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ReportQuery {
    /// Segment key; defaults to the default segment.
    pub segment: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReportResponse {
    pub experiment_id: Uuid,
    pub segment_key: String,
    pub total_allocations: u64,
    pub total_conversions: u64,
    pub variants: Vec<VariantReport>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VariantReport {
    pub variant_id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub allocations: u64,
    pub conversions: u64,
    pub observed_rate: f64,
    pub posterior_mean: f64,
    pub credible_lower: f64,
    pub credible_upper: f64,
    pub traffic_share: f64,
    pub is_leader: bool,
}

impl From<ExperimentReport> for ReportResponse {
    fn from(report: ExperimentReport) -> Self {
        Self {
            experiment_id: report.experiment_id,
            segment_key: report.segment_key,
            total_allocations: report.total_allocations,
            total_conversions: report.total_conversions,
            variants: report.variants.into_iter().map(Into::into).collect(),
            generated_at: report.generated_at,
        }
    }
}

impl From<VariantPosterior> for VariantReport {
    fn from(v: VariantPosterior) -> Self {
        Self {
            variant_id: v.variant_id,
            name: v.name,
            is_active: v.is_active,
            allocations: v.allocations,
            conversions: v.conversions,
            observed_rate: v.observed_rate,
            posterior_mean: v.posterior_mean,
            credible_lower: v.credible_lower,
            credible_upper: v.credible_upper,
            traffic_share: v.traffic_share,
            is_leader: v.is_leader,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SegmentResponse {
    pub segment_key: String,
    pub descriptor: String,
    pub total_assignments: u64,
    pub total_conversions: u64,
    pub conversion_rate: f64,
    pub computed_at: DateTime<Utc>,
}

impl From<SegmentSummary> for SegmentResponse {
    fn from(summary: SegmentSummary) -> Self {
        Self {
            segment_key: summary.segment_key,
            descriptor: summary.descriptor,
            total_assignments: summary.total_assignments,
            total_conversions: summary.total_conversions,
            conversion_rate: summary.conversion_rate,
            computed_at: summary.computed_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

// ─── Validation and error mapping ───────────────────────────────────────

/// Validate an allocation request at the API boundary.
fn validate_allocate_request(request: &AllocateRequest) -> Result<(), &'static str> {
    if request.user_id.is_empty() {
        return Err("'user_id' must not be empty");
    }
    if request.user_id.len() > MAX_FIELD_LEN {
        return Err("'user_id' exceeds maximum length");
    }
    if request.context.len() > MAX_CONTEXT_FIELDS {
        return Err("context exceeds maximum number of fields");
    }
    for (key, value) in &request.context {
        if key.len() > MAX_FIELD_LEN || value.len() > MAX_FIELD_LEN {
            return Err("context entry exceeds maximum length");
        }
    }
    Ok(())
}

/// Validate a conversion request at the API boundary.
fn validate_convert_request(request: &ConvertRequest) -> Result<(), &'static str> {
    if request.user_id.is_empty() {
        return Err("'user_id' must not be empty");
    }
    if request.user_id.len() > MAX_FIELD_LEN {
        return Err("'user_id' exceeds maximum length");
    }
    if let Some(value) = request.value {
        if !value.is_finite() || value < 0.0 {
            return Err("'value' must be a non-negative number");
        }
    }
    Ok(())
}

fn validation_failure(
    operation: &'static str,
    message: &'static str,
) -> (StatusCode, Json<ErrorResponse>) {
    warn!(operation, error = message, "request validation failed");
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "invalid_request".to_string(),
            message: message.to_string(),
        }),
    )
}

/// Map a decision-path error onto a wire status and body.
///
/// Lookup failures share one opaque body so callers cannot probe which
/// experiments exist; integrity violations carry the rejection detail
/// so auditors see what was refused.
pub(crate) fn map_error(
    operation: &'static str,
    error: UpliftError,
) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code, message) = match &error {
        UpliftError::ExperimentNotFound(_)
        | UpliftError::ExperimentNotRunning(_)
        | UpliftError::NoActiveVariants(_)
        | UpliftError::VariantNotFound(_) => {
            warn!(operation, error = %error, "experiment unavailable");
            (
                StatusCode::NOT_FOUND,
                "experiment_unavailable",
                "experiment unavailable".to_string(),
            )
        }
        UpliftError::IntegrityViolation(detail) => {
            warn!(operation, error = %error, "integrity violation rejected");
            metrics::counter!("conversion.integrity_violations").increment(1);
            (StatusCode::CONFLICT, "integrity_violation", detail.clone())
        }
        UpliftError::CircuitOpen(_) | UpliftError::Storage(_) => {
            error!(operation, error = %error, "storage degraded");
            metrics::counter!("api.errors").increment(1);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "temporarily unable to process requests".to_string(),
            )
        }
        UpliftError::Validation(detail) => {
            warn!(operation, error = %error, "request rejected");
            metrics::counter!("api.validation_errors").increment(1);
            (StatusCode::BAD_REQUEST, "invalid_request", detail.clone())
        }
        _ => {
            error!(operation, error = %error, "request processing failed");
            metrics::counter!("api.errors").increment(1);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal processing error".to_string(),
            )
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message,
        }),
    )
}

// ─── Decision endpoints ─────────────────────────────────────────────────

/// POST /v1/experiments/{id}/allocate: serve the visitor's variant.
#[utoipa::path(
    post,
    path = "/v1/experiments/{id}/allocate",
    tag = "Decisions",
    params(("id" = Uuid, Path, description = "Experiment id")),
    request_body = AllocateRequest,
    responses(
        (status = 200, description = "Variant decision, new or replayed", body = AllocateResponse),
        (status = 400, description = "Malformed request", body = ErrorResponse),
        (status = 404, description = "Experiment unavailable", body = ErrorResponse),
        (status = 503, description = "Storage degraded", body = ErrorResponse),
    )
)]
pub async fn handle_allocate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<AllocateRequest>,
) -> Result<Json<AllocateResponse>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(msg) = validate_allocate_request(&request) {
        return Err(validation_failure("allocate", msg));
    }
    metrics::counter!("allocation.requests").increment(1);

    match state
        .coordinator
        .allocate(id, &request.user_id, &request.context)
    {
        Ok(outcome) => {
            if outcome.is_new_assignment {
                metrics::counter!("allocation.new_assignments").increment(1);
            } else {
                metrics::counter!("allocation.replays").increment(1);
            }
            Ok(Json(outcome.into()))
        }
        Err(error) => Err(map_error("allocate", error)),
    }
}

/// POST /v1/experiments/{id}/convert: record a visitor's conversion.
#[utoipa::path(
    post,
    path = "/v1/experiments/{id}/convert",
    tag = "Decisions",
    params(("id" = Uuid, Path, description = "Experiment id")),
    request_body = ConvertRequest,
    responses(
        (status = 200, description = "Conversion status", body = ConvertResponse),
        (status = 400, description = "Malformed request", body = ErrorResponse),
        (status = 409, description = "Conversion precedes its decision", body = ErrorResponse),
        (status = 503, description = "Storage degraded", body = ErrorResponse),
    )
)]
pub async fn handle_convert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ConvertRequest>,
) -> Result<Json<ConvertResponse>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(msg) = validate_convert_request(&request) {
        return Err(validation_failure("convert", msg));
    }

    match state
        .coordinator
        .record_outcome(id, &request.user_id, request.value, request.occurred_at)
    {
        Ok(outcome) => {
            if outcome.status == ConversionStatus::Recorded {
                metrics::counter!("conversion.recorded").increment(1);
            }
            Ok(Json(outcome.into()))
        }
        Err(error) => Err(map_error("convert", error)),
    }
}

// ─── Operator endpoints ─────────────────────────────────────────────────

/// GET /v1/experiments/{id}/report: posterior statistics for one segment.
#[utoipa::path(
    get,
    path = "/v1/experiments/{id}/report",
    tag = "Reports",
    params(("id" = Uuid, Path, description = "Experiment id"), ReportQuery),
    responses(
        (status = 200, description = "Posterior report", body = ReportResponse),
        (status = 404, description = "Experiment unavailable", body = ErrorResponse),
    )
)]
pub async fn handle_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<ReportResponse>, (StatusCode, Json<ErrorResponse>)> {
    let segment = query.segment.as_deref().unwrap_or(DEFAULT_SEGMENT);
    match state.coordinator.posterior_report(id, segment) {
        Ok(report) => Ok(Json(report.into())),
        Err(error) => Err(map_error("report", error)),
    }
}

/// GET /v1/experiments/{id}/segments: observed segments with aggregates.
#[utoipa::path(
    get,
    path = "/v1/experiments/{id}/segments",
    tag = "Reports",
    params(("id" = Uuid, Path, description = "Experiment id")),
    responses(
        (status = 200, description = "Observed segments", body = [SegmentResponse]),
        (status = 404, description = "Experiment unavailable", body = ErrorResponse),
    )
)]
pub async fn handle_segments(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<SegmentResponse>>, (StatusCode, Json<ErrorResponse>)> {
    match state.coordinator.segments(id) {
        Ok(segments) => Ok(Json(segments.into_iter().map(Into::into).collect())),
        Err(error) => Err(map_error("segments", error)),
    }
}

// ─── Operational endpoints ──────────────────────────────────────────────

/// GET /health: health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service health", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: readiness probe for Kubernetes.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses((status = 200, description = "Ready to accept traffic"))
)]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.start_time.elapsed().as_secs() > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live: liveness probe for Kubernetes.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
