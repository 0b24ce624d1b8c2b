//! Shared wiring for end-to-end decision flow tests.

use std::sync::Arc;

use serde_json::json;
use uplift_allocation::{
    AllocationCoordinator, AssignmentStore, ExperimentDraft, ExperimentRegistry, VariantDraft,
};
use uplift_core::types::{Experiment, ExperimentStatus, SegmentationMode};
use uplift_ledger::AuditLedger;
use uplift_segmentation::SegmentCatalog;
use uplift_state::{JsonCodec, SegmentStateStore};
use uplift_storage::StorageRuntime;

/// Fully wired decision stack over in-memory stores.
pub struct TestStack {
    pub registry: Arc<ExperimentRegistry>,
    pub assignments: Arc<AssignmentStore>,
    pub ledger: Arc<AuditLedger>,
    pub coordinator: Arc<AllocationCoordinator>,
}

pub fn test_stack() -> TestStack {
    let registry = Arc::new(ExperimentRegistry::new());
    let states = Arc::new(SegmentStateStore::new(
        Arc::new(JsonCodec),
        Arc::new(StorageRuntime::with_defaults("segment-state")),
    ));
    let assignments = Arc::new(AssignmentStore::new(Arc::new(
        StorageRuntime::with_defaults("assignments"),
    )));
    let ledger = Arc::new(AuditLedger::new());
    let catalog = Arc::new(SegmentCatalog::new(300));
    let coordinator = Arc::new(AllocationCoordinator::new(
        registry.clone(),
        states,
        assignments.clone(),
        ledger.clone(),
        catalog,
    ));
    TestStack {
        registry,
        assignments,
        ledger,
        coordinator,
    }
}

/// Create and start an experiment with one variant per name.
pub fn launch_experiment(stack: &TestStack, name: &str, variant_names: &[&str]) -> Experiment {
    let draft = ExperimentDraft {
        name: name.to_string(),
        description: String::new(),
        segmentation: SegmentationMode::Disabled,
        warm_start: false,
        variants: variant_names
            .iter()
            .map(|variant_name| VariantDraft {
                name: variant_name.to_string(),
                content: json!({ "label": variant_name }),
            })
            .collect(),
    };
    let experiment = stack.registry.create(draft).unwrap();
    stack
        .registry
        .set_status(experiment.id, ExperimentStatus::Running)
        .unwrap()
}
