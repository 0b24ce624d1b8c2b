//! API server: HTTP router, Swagger UI, and the Prometheus exporter.

use crate::rest::{self, AppState};
use crate::{audit_rest, swagger};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uplift_allocation::AllocationCoordinator;
use uplift_core::config::AppConfig;
use uplift_ledger::AuditLedger;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Main API server for the decision and audit endpoints.
pub struct ApiServer {
    config: AppConfig,
    coordinator: Arc<AllocationCoordinator>,
    ledger: Arc<AuditLedger>,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        coordinator: Arc<AllocationCoordinator>,
        ledger: Arc<AuditLedger>,
    ) -> Self {
        Self {
            config,
            coordinator,
            ledger,
        }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let state = AppState {
            coordinator: self.coordinator.clone(),
            ledger: self.ledger.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };

        let app = Router::new()
            // Decision endpoints
            .route("/v1/experiments/:id/allocate", post(rest::handle_allocate))
            .route("/v1/experiments/:id/convert", post(rest::handle_convert))
            // Operator endpoints
            .route("/v1/experiments/:id/report", get(rest::handle_report))
            .route("/v1/experiments/:id/segments", get(rest::handle_segments))
            // Audit endpoints
            .route(
                "/v1/experiments/:id/audit",
                get(audit_rest::handle_audit_trail),
            )
            .route(
                "/v1/experiments/:id/audit/verify",
                get(audit_rest::handle_audit_verify),
            )
            .route(
                "/v1/experiments/:id/audit/export",
                get(audit_rest::handle_audit_export),
            )
            // Operational endpoints
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            // API documentation
            .merge(
                SwaggerUi::new("/docs")
                    .url("/api-docs/openapi.json", swagger::ApiDoc::openapi()),
            )
            // Middleware
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let addr = SocketAddr::new(
            self.config.api.host.parse()?,
            self.config.api.http_port,
        );

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}
