//! Posterior reporting for operators: credible intervals, traffic
//! shares, and leader detection per segment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uplift_core::types::{Experiment, SegmentArm, VariantState};
use uuid::Uuid;

/// Minimum allocations before a variant may be flagged as the leader.
const LEADER_MIN_ALLOCATIONS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantPosterior {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub experiment_id: Uuid,
    pub segment_key: String,
    pub total_allocations: u64,
    pub total_conversions: u64,
    pub variants: Vec<VariantPosterior>,
    pub generated_at: DateTime<Utc>,
}

/// Build the posterior report for one segment of an experiment.
///
/// Variants without stored state for the segment report the uniform
/// prior. Retired variants stay in the report so operators can still
/// see how they performed.
pub fn build_report(
    experiment: &Experiment,
    segment_key: &str,
    arms: &[SegmentArm],
) -> ExperimentReport {
    let total_allocations: u64 = arms.iter().map(|a| a.state.total_allocations).sum();
    let total_conversions: u64 = arms.iter().map(|a| a.state.total_conversions).sum();

    let mut variants = Vec::with_capacity(experiment.variants.len());
    let mut best_mean = f64::NEG_INFINITY;

    for variant in &experiment.variants {
        let state = arms
            .iter()
            .find(|a| a.variant_id == variant.id)
            .map(|a| a.state.clone())
            .unwrap_or_else(VariantState::prior);

        let mean = state.posterior_mean();
        let (lower, upper) = credible_interval(&state);
        let traffic = if total_allocations > 0 {
            state.total_allocations as f64 / total_allocations as f64
        } else {
            1.0 / experiment.variants.len().max(1) as f64
        };

        if mean > best_mean {
            best_mean = mean;
        }

        variants.push(VariantPosterior {
            variant_id: variant.id,
            name: variant.name.clone(),
            is_active: variant.is_active,
            allocations: state.total_allocations,
            conversions: state.total_conversions,
            observed_rate: state.observed_rate(),
            posterior_mean: mean,
            credible_lower: lower,
            credible_upper: upper,
            traffic_share: traffic,
            is_leader: false,
        });
    }

    for posterior in &mut variants {
        if (posterior.posterior_mean - best_mean).abs() < f64::EPSILON
            && posterior.allocations > LEADER_MIN_ALLOCATIONS
        {
            posterior.is_leader = true;
        }
    }

    ExperimentReport {
        experiment_id: experiment.id,
        segment_key: segment_key.to_string(),
        total_allocations,
        total_conversions,
        variants,
        generated_at: Utc::now(),
    }
}

/// 95% credible interval from the normal approximation of the Beta
/// posterior, clamped to the unit interval.
fn credible_interval(state: &VariantState) -> (f64, f64) {
    let a = state.alpha;
    let b = state.beta;
    let mean = state.posterior_mean();
    let variance = (a * b) / ((a + b).powi(2) * (a + b + 1.0));
    let half_width = 1.96 * variance.sqrt();
    ((mean - half_width).max(0.0), (mean + half_width).min(1.0))
}
