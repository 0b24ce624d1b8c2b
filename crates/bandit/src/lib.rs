//! Thompson Sampling allocation core: Beta-Bernoulli posterior sampling
//! over per-segment variant arms, plus posterior reporting for operators.

pub mod stats;
pub mod thompson;

pub use stats::{build_report, ExperimentReport, VariantPosterior};
pub use thompson::ThompsonSampler;
