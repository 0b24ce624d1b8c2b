//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Uplift API",
        version = "0.1.0",
        description = "Self-optimizing experimentation decision service.\n\nAllocates visitors to variants with Thompson sampling, keeps assignments sticky per visitor, and chains every decision into a tamper-evident audit ledger.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Decisions", description = "Variant allocation and conversion tracking"),
        (name = "Reports", description = "Posterior statistics and segment aggregates"),
        (name = "Audit", description = "Hash-chained decision trail, verification, and export"),
        (name = "Operations", description = "Health, readiness, and liveness probes"),
    ),
    paths(
        // Decisions
        crate::rest::handle_allocate,
        crate::rest::handle_convert,
        // Reports
        crate::rest::handle_report,
        crate::rest::handle_segments,
        // Audit
        crate::audit_rest::handle_audit_trail,
        crate::audit_rest::handle_audit_verify,
        crate::audit_rest::handle_audit_export,
        // Operations
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        // Decision types
        crate::rest::AllocateRequest,
        crate::rest::AllocateResponse,
        crate::rest::ConvertRequest,
        crate::rest::ConvertResponse,
        crate::rest::ConversionState,
        // Report types
        crate::rest::ReportResponse,
        crate::rest::VariantReport,
        crate::rest::SegmentResponse,
        // Audit types
        crate::audit_rest::AuditRecordResponse,
        crate::audit_rest::VerifyResponse,
        crate::audit_rest::CheckResponse,
        // REST error/health types
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
    ))
)]
pub struct ApiDoc;
