//! Thompson Sampling over Beta-Bernoulli arms.

use rand::Rng;
use rand_distr::{Beta, Distribution};
use uplift_core::types::SegmentArm;
use uplift_core::{UpliftError, UpliftResult};
use uuid::Uuid;

/// Stateless Thompson Sampling selector.
///
/// Posterior state lives in the segment state store; the sampler only
/// draws from it. One independent draw per arm, highest draw wins,
/// exact ties go to the lowest variant position.
pub struct ThompsonSampler;

impl ThompsonSampler {
    pub fn new() -> Self {
        Self
    }

    pub fn select(&self, arms: &[SegmentArm]) -> UpliftResult<Uuid> {
        self.select_with_rng(arms, &mut rand::thread_rng())
    }

    /// Selection with a caller-supplied RNG for deterministic replay.
    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        arms: &[SegmentArm],
        rng: &mut R,
    ) -> UpliftResult<Uuid> {
        if arms.is_empty() {
            return Err(UpliftError::NoCandidates);
        }
        if arms.len() == 1 {
            return Ok(arms[0].variant_id);
        }

        let mut ordered: Vec<&SegmentArm> = arms.iter().collect();
        ordered.sort_by_key(|arm| arm.position);

        let mut best_sample = f64::NEG_INFINITY;
        let mut best_variant = ordered[0].variant_id;

        for arm in ordered {
            let sample = sample_beta(rng, arm.state.alpha, arm.state.beta);
            if sample > best_sample {
                best_sample = sample;
                best_variant = arm.variant_id;
            }
        }

        Ok(best_variant)
    }
}

impl Default for ThompsonSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_beta<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    match Beta::new(alpha, beta) {
        Ok(dist) => dist.sample(rng),
        // Degenerate parameters collapse to the posterior mean.
        Err(_) => alpha / (alpha + beta).max(f64::MIN_POSITIVE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uplift_core::types::VariantState;

    fn make_arm(position: u32, alpha: f64, beta: f64) -> SegmentArm {
        SegmentArm {
            variant_id: Uuid::new_v4(),
            position,
            state: VariantState {
                alpha,
                beta,
                total_allocations: 0,
                total_conversions: 0,
                last_allocation_at: None,
            },
        }
    }

    #[test]
    fn test_empty_arms_is_an_error() {
        let sampler = ThompsonSampler::new();
        let result = sampler.select(&[]);
        assert!(matches!(result, Err(UpliftError::NoCandidates)));
    }

    #[test]
    fn test_single_arm_short_circuits() {
        let sampler = ThompsonSampler::new();
        let arm = make_arm(0, 1.0, 1.0);
        let selected = sampler.select(std::slice::from_ref(&arm)).unwrap();
        assert_eq!(selected, arm.variant_id);
    }

    #[test]
    fn test_converged_posterior_dominates() {
        let sampler = ThompsonSampler::new();
        let strong = make_arm(0, 5000.0, 10.0);
        let weak = make_arm(1, 10.0, 5000.0);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let selected = sampler
                .select_with_rng(&[weak.clone(), strong.clone()], &mut rng)
                .unwrap();
            assert_eq!(selected, strong.variant_id);
        }
    }

    #[test]
    fn test_exact_tie_goes_to_lowest_position() {
        // Zero alpha forces the deterministic mean fallback, so both
        // arms draw exactly 0.0 and the tie-break decides.
        let sampler = ThompsonSampler::new();
        let first = make_arm(0, 0.0, 1.0);
        let second = make_arm(1, 0.0, 1.0);
        let mut rng = StdRng::seed_from_u64(7);

        let selected = sampler
            .select_with_rng(&[second.clone(), first.clone()], &mut rng)
            .unwrap();
        assert_eq!(selected, first.variant_id);
    }

    #[test]
    fn test_uniform_priors_explore_every_arm() {
        let sampler = ThompsonSampler::new();
        let arms = vec![
            make_arm(0, 1.0, 1.0),
            make_arm(1, 1.0, 1.0),
            make_arm(2, 1.0, 1.0),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..200 {
            seen.insert(sampler.select_with_rng(&arms, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_draws_converge_on_the_posterior_mean() {
        let mut rng = StdRng::seed_from_u64(11);
        let (alpha, beta) = (21.0, 6.0);

        let total: f64 = (0..100_000)
            .map(|_| sample_beta(&mut rng, alpha, beta))
            .sum();
        let empirical = total / 100_000.0;
        let expected = alpha / (alpha + beta);

        assert!(
            (empirical - expected).abs() < 0.01,
            "empirical mean {empirical} drifted from {expected}"
        );
    }

    #[test]
    fn test_better_arm_accumulates_majority_of_draws() {
        let sampler = ThompsonSampler::new();
        let better = make_arm(0, 30.0, 70.0);
        let worse = make_arm(1, 10.0, 90.0);
        let mut rng = StdRng::seed_from_u64(99);
        let mut better_wins = 0u32;

        for _ in 0..1000 {
            let selected = sampler
                .select_with_rng(&[better.clone(), worse.clone()], &mut rng)
                .unwrap();
            if selected == better.variant_id {
                better_wins += 1;
            }
        }
        assert!(better_wins > 800, "better arm won only {better_wins}/1000");
    }
}
