use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Experiments ────────────────────────────────────────────────────────

/// A/B/n experiment definition with bandit-driven traffic split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: ExperimentStatus,
    pub segmentation: SegmentationMode,
    /// Seed new segments from the default segment's posterior instead
    /// of the uniform prior.
    pub warm_start: bool,
    pub variants: Vec<Variant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Cancelled,
}

/// How visitor contexts map to segment keys for this experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SegmentationMode {
    #[default]
    Disabled,
    Manual { fields: Vec<String> },
    Auto,
}

/// One arm of an experiment. Content is immutable once the experiment
/// is running; losing arms are retired via `is_active`, never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub name: String,
    pub content: serde_json::Value,
    /// Stable tie-break order for deterministic selection.
    pub position: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    pub fn active_variants(&self) -> Vec<&Variant> {
        self.variants.iter().filter(|v| v.is_active).collect()
    }
}

// ─── Posterior state ────────────────────────────────────────────────────

/// Beta-Bernoulli posterior for one (variant, segment) pair.
///
/// Allocations are booked as provisional failures (`beta += 1`); a later
/// conversion flips one back (`alpha += 1`, `beta -= 1`). The posterior
/// therefore always reflects `Beta(1 + conversions, 1 + non-conversions)`
/// without waiting for conversion windows to close.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantState {
    pub alpha: f64,
    pub beta: f64,
    pub total_allocations: u64,
    pub total_conversions: u64,
    pub last_allocation_at: Option<DateTime<Utc>>,
}

impl VariantState {
    /// Uniform `Beta(1, 1)` prior for a freshly observed segment.
    pub fn prior() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            total_allocations: 0,
            total_conversions: 0,
            last_allocation_at: None,
        }
    }

    /// Warm-start state carrying another segment's posterior shape but
    /// none of its counters.
    pub fn seeded(alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            total_allocations: 0,
            total_conversions: 0,
            last_allocation_at: None,
        }
    }

    pub fn record_allocation(&mut self, at: DateTime<Utc>) {
        self.beta += 1.0;
        self.total_allocations += 1;
        self.last_allocation_at = Some(at);
    }

    pub fn record_conversion(&mut self) {
        self.alpha += 1.0;
        self.beta = (self.beta - 1.0).max(1.0);
        self.total_conversions += 1;
    }

    pub fn posterior_mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn observed_rate(&self) -> f64 {
        if self.total_allocations == 0 {
            return 0.0;
        }
        self.total_conversions as f64 / self.total_allocations as f64
    }
}

/// A variant's posterior within one segment, ready for sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentArm {
    pub variant_id: Uuid,
    pub position: u32,
    pub state: VariantState,
}

// ─── Assignments ────────────────────────────────────────────────────────

/// Sticky visitor-to-variant binding. One row per (experiment, visitor),
/// enforced by the assignment store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub user_id: String,
    pub segment_key: String,
    pub assigned_at: DateTime<Utc>,
    pub converted_at: Option<DateTime<Utc>>,
    pub conversion_value: Option<f64>,
}

impl Assignment {
    pub fn is_converted(&self) -> bool {
        self.converted_at.is_some()
    }
}

// ─── Visitor context ────────────────────────────────────────────────────

/// Segment key used when segmentation is disabled or unresolvable.
pub const DEFAULT_SEGMENT: &str = "default";

/// Normalized visitor attributes used for segment resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitorContext {
    pub fields: HashMap<String, String>,
    /// Behavioral cluster label supplied by an upstream model, if any.
    pub cluster_id: Option<String>,
}

impl VisitorContext {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

// ─── Decision outcomes ──────────────────────────────────────────────────

/// Result of an allocation request, new or replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub assignment_id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub variant_name: String,
    pub content: serde_json::Value,
    pub segment_key: String,
    pub assigned_at: DateTime<Utc>,
    /// False when an existing assignment was replayed instead of drawn.
    pub is_new_assignment: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Recorded,
    AlreadyConverted,
    NotFound,
}

/// Result of a conversion report. Unknown visitors and repeat
/// conversions are explicit outcomes, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutcome {
    pub status: ConversionStatus,
    pub assignment_id: Option<Uuid>,
    pub variant_id: Option<Uuid>,
}

impl ConversionOutcome {
    pub fn not_found() -> Self {
        Self {
            status: ConversionStatus::NotFound,
            assignment_id: None,
            variant_id: None,
        }
    }
}

impl Default for VariantState {
    fn default() -> Self {
        Self::prior()
    }
}
