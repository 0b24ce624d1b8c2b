//! REST API handlers for the tamper-evident audit trail.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uplift_ledger::{export_trail, AuditRecord, ExportFormat, IntegrityCheck, IntegrityReport};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::rest::{map_error, AppState, ErrorResponse};

/// Trail page size when the caller does not ask for one.
const DEFAULT_TRAIL_LIMIT: usize = 100;

/// Hard cap on a single trail page.
const MAX_TRAIL_LIMIT: usize = 1000;

// ─── Request / response bodies ──────────────────────────────────────────

#[derive(Debug, Deserialize, IntoParams)]
pub struct AuditTrailQuery {
    /// Only records decided at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Only records decided at or before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Page size, capped at 1000.
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct VerifyQuery {
    /// First sequence number to verify (inclusive).
    pub start: Option<u64>,
    /// Last sequence number to verify (inclusive).
    pub end: Option<u64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ExportQuery {
    /// Export format: "csv" (default) or "json".
    pub format: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditRecordResponse {
    pub sequence: u64,
    pub user_id: String,
    pub variant_id: Uuid,
    pub segment_key: String,
    pub decided_at: DateTime<Utc>,
    pub converted_at: Option<DateTime<Utc>>,
    pub conversion_value: Option<f64>,
    pub decision_hash: String,
    pub previous_hash: String,
}

impl From<AuditRecord> for AuditRecordResponse {
    fn from(record: AuditRecord) -> Self {
        Self {
            sequence: record.sequence,
            user_id: record.user_id,
            variant_id: record.variant_id,
            segment_key: record.segment_key,
            decided_at: record.decided_at,
            converted_at: record.converted_at,
            conversion_value: record.conversion_value,
            decision_hash: record.decision_hash,
            previous_hash: record.previous_hash,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    pub experiment_id: Uuid,
    pub total_records: u64,
    pub chain_intact: bool,
    pub is_fair: bool,
    pub checks: Vec<CheckResponse>,
    pub invalid_sequences: Vec<u64>,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckResponse {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl From<IntegrityReport> for VerifyResponse {
    fn from(report: IntegrityReport) -> Self {
        Self {
            experiment_id: report.experiment_id,
            total_records: report.total_records,
            chain_intact: report.chain_intact,
            is_fair: report.is_fair,
            checks: report.checks.into_iter().map(Into::into).collect(),
            invalid_sequences: report.invalid_sequences,
            verified_at: report.verified_at,
        }
    }
}

impl From<IntegrityCheck> for CheckResponse {
    fn from(check: IntegrityCheck) -> Self {
        Self {
            name: check.name,
            passed: check.passed,
            detail: check.detail,
        }
    }
}

// ─── Audit endpoints ────────────────────────────────────────────────────

/// GET /v1/experiments/{id}/audit: page through the decision trail.
#[utoipa::path(
    get,
    path = "/v1/experiments/{id}/audit",
    tag = "Audit",
    params(("id" = Uuid, Path, description = "Experiment id"), AuditTrailQuery),
    responses(
        (status = 200, description = "Decision trail, latest first", body = [AuditRecordResponse]),
        (status = 404, description = "Experiment unavailable", body = ErrorResponse),
    )
)]
pub async fn handle_audit_trail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AuditTrailQuery>,
) -> Result<Json<Vec<AuditRecordResponse>>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(error) = state.coordinator.experiment(id) {
        return Err(map_error("audit_trail", error));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRAIL_LIMIT)
        .min(MAX_TRAIL_LIMIT);
    let records = state.ledger.trail(id, query.from, query.to, limit);
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// GET /v1/experiments/{id}/audit/verify: recompute the hash chain.
#[utoipa::path(
    get,
    path = "/v1/experiments/{id}/audit/verify",
    tag = "Audit",
    params(("id" = Uuid, Path, description = "Experiment id"), VerifyQuery),
    responses(
        (status = 200, description = "Integrity report", body = VerifyResponse),
        (status = 400, description = "Malformed range", body = ErrorResponse),
        (status = 404, description = "Experiment unavailable", body = ErrorResponse),
    )
)]
pub async fn handle_audit_verify(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<VerifyResponse>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(error) = state.coordinator.experiment(id) {
        return Err(map_error("audit_verify", error));
    }
    let range = match (query.start, query.end) {
        (None, None) => None,
        (Some(start), Some(end)) if start <= end => Some((start, end)),
        _ => {
            return Err(validation_failure(
                "'start' and 'end' must be given together, with start <= end",
            ))
        }
    };
    metrics::counter!("audit.verifications").increment(1);
    let report = state.ledger.verify_chain(id, range);
    if !report.is_fair {
        warn!(experiment_id = %id, "audit verification found violations");
        metrics::counter!("audit.failed_verifications").increment(1);
    }
    Ok(Json(report.into()))
}

/// GET /v1/experiments/{id}/audit/export: flat export of the full trail.
#[utoipa::path(
    get,
    path = "/v1/experiments/{id}/audit/export",
    tag = "Audit",
    params(("id" = Uuid, Path, description = "Experiment id"), ExportQuery),
    responses(
        (status = 200, description = "Trail in CSV or JSON", content_type = "text/csv"),
        (status = 400, description = "Unknown format", body = ErrorResponse),
        (status = 404, description = "Experiment unavailable", body = ErrorResponse),
    )
)]
pub async fn handle_audit_export(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    if let Err(error) = state.coordinator.experiment(id) {
        return Err(map_error("audit_export", error));
    }
    let (format, content_type) = match query.format.as_deref().unwrap_or("csv") {
        "csv" => (ExportFormat::Csv, "text/csv; charset=utf-8"),
        "json" => (ExportFormat::Json, "application/json"),
        _ => return Err(validation_failure("format must be 'csv' or 'json'")),
    };
    let records = state.ledger.records(id);
    match export_trail(&records, format) {
        Ok(body) => Ok(([(header::CONTENT_TYPE, content_type)], body).into_response()),
        Err(error) => Err(map_error("audit_export", error)),
    }
}

fn validation_failure(message: &'static str) -> (StatusCode, Json<ErrorResponse>) {
    warn!(error = message, "audit request validation failed");
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "invalid_request".to_string(),
            message: message.to_string(),
        }),
    )
}
