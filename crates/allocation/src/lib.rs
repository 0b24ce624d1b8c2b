//! Allocation: experiment registry, sticky assignment store, and the
//! coordinator that turns visitor requests into audited decisions.

pub mod assignments;
pub mod coordinator;
pub mod registry;

pub use assignments::{AssignmentStore, InsertOutcome};
pub use coordinator::AllocationCoordinator;
pub use registry::{ExperimentDraft, ExperimentRegistry, VariantDraft};
