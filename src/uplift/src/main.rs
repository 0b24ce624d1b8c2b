//! Uplift: self-optimizing experimentation decision service.
//!
//! Main entry point that wires the stores, the allocation coordinator,
//! and the API server.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use uplift_allocation::{AllocationCoordinator, AssignmentStore, ExperimentRegistry};
use uplift_api::ApiServer;
use uplift_core::config::{AppConfig, CodecKind};
use uplift_ledger::AuditLedger;
use uplift_segmentation::SegmentCatalog;
use uplift_state::{AesGcmCodec, JsonCodec, SegmentStateStore, StateCodec};
use uplift_storage::{CircuitBreakerConfig, RetryPolicy, StorageRuntime};

#[derive(Parser, Debug)]
#[command(name = "uplift")]
#[command(about = "Self-optimizing experimentation decision service")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "UPLIFT__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "UPLIFT__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Metrics port (overrides config)
    #[arg(long, env = "UPLIFT__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Seed two demo experiments on startup
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "uplift=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Uplift starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    // Posterior state codec
    let codec: Arc<dyn StateCodec> = match config.state.codec {
        CodecKind::AesGcm => Arc::new(AesGcmCodec::from_base64(&config.state.key_base64)?),
        CodecKind::Json => Arc::new(JsonCodec),
    };
    info!(codec = codec.name(), "State codec initialized");

    // One storage runtime per logical store so a degraded store does
    // not trip the breaker for the other.
    let breaker = CircuitBreakerConfig {
        failure_threshold: config.storage.failure_threshold,
        open_duration_secs: config.storage.open_duration_secs,
        half_open_successes: config.storage.half_open_successes,
    };
    let retry = RetryPolicy {
        max_retries: config.storage.max_retries,
        initial_backoff_ms: config.storage.initial_backoff_ms,
        max_backoff_ms: config.storage.max_backoff_ms,
        backoff_multiplier: config.storage.backoff_multiplier,
        jitter: true,
    };
    let state_runtime = Arc::new(StorageRuntime::new(
        "segment-state",
        breaker.clone(),
        retry.clone(),
    ));
    let assignment_runtime = Arc::new(StorageRuntime::new("assignments", breaker, retry));

    // Stores and decision path
    let registry = Arc::new(ExperimentRegistry::new());
    let states = Arc::new(SegmentStateStore::new(codec, state_runtime));
    let assignments = Arc::new(AssignmentStore::new(assignment_runtime));
    let ledger = Arc::new(AuditLedger::new());
    let catalog = Arc::new(SegmentCatalog::new(config.segments.catalog_ttl_secs));

    let coordinator = Arc::new(AllocationCoordinator::new(
        registry.clone(),
        states,
        assignments,
        ledger.clone(),
        catalog.clone(),
    ));

    if cli.seed_demo {
        for experiment in registry.seed_demo() {
            info!(
                experiment_id = %experiment.id,
                name = %experiment.name,
                "Demo experiment seeded"
            );
        }
    }

    // Start API server
    let api_server = ApiServer::new(config.clone(), coordinator, ledger);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Spawn catalog maintenance task
    let catalog_for_maintenance = catalog;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            catalog_for_maintenance.maintenance().await;
        }
    });

    info!("Uplift is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
