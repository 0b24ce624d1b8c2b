//! In-memory experiment registry backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or similar ACID store.
//! This provides the same API surface for development and testing.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uplift_core::types::{Experiment, ExperimentStatus, SegmentationMode, Variant};
use uplift_core::{UpliftError, UpliftResult};
use uuid::Uuid;

/// Payload for creating an experiment. Variant positions are assigned
/// from declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub segmentation: SegmentationMode,
    #[serde(default)]
    pub warm_start: bool,
    pub variants: Vec<VariantDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantDraft {
    pub name: String,
    pub content: serde_json::Value,
}

/// Thread-safe store of experiment definitions.
pub struct ExperimentRegistry {
    experiments: DashMap<Uuid, Experiment>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self {
            experiments: DashMap::new(),
        }
    }

    /// Materialize a draft into a stored experiment in `Draft` status.
    pub fn create(&self, draft: ExperimentDraft) -> UpliftResult<Experiment> {
        if draft.name.trim().is_empty() {
            return Err(UpliftError::Validation(
                "experiment name must not be empty".to_string(),
            ));
        }
        if draft.variants.len() < 2 {
            return Err(UpliftError::Validation(
                "an experiment needs at least two variants".to_string(),
            ));
        }

        let now = Utc::now();
        let variants = draft
            .variants
            .into_iter()
            .enumerate()
            .map(|(position, v)| Variant {
                id: Uuid::new_v4(),
                name: v.name,
                content: v.content,
                position: position as u32,
                is_active: true,
                created_at: now,
            })
            .collect::<Vec<_>>();

        let experiment = Experiment {
            id: Uuid::new_v4(),
            name: draft.name,
            description: draft.description,
            status: ExperimentStatus::Draft,
            segmentation: draft.segmentation,
            warm_start: draft.warm_start,
            variants,
            created_at: now,
            updated_at: now,
        };
        self.experiments.insert(experiment.id, experiment.clone());
        info!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            variants = experiment.variants.len(),
            "experiment created"
        );
        Ok(experiment)
    }

    /// Insert a fully built experiment, replacing any previous version.
    pub fn register(&self, experiment: Experiment) {
        self.experiments.insert(experiment.id, experiment);
    }

    pub fn get(&self, id: Uuid) -> Option<Experiment> {
        self.experiments.get(&id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<Experiment> {
        let mut experiments: Vec<Experiment> =
            self.experiments.iter().map(|r| r.value().clone()).collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        experiments
    }

    /// Move an experiment through its lifecycle. Completed and
    /// cancelled experiments are terminal.
    pub fn set_status(&self, id: Uuid, status: ExperimentStatus) -> UpliftResult<Experiment> {
        let mut entry = self
            .experiments
            .get_mut(&id)
            .ok_or(UpliftError::ExperimentNotFound(id))?;
        let experiment = entry.value_mut();
        if matches!(
            experiment.status,
            ExperimentStatus::Completed | ExperimentStatus::Cancelled
        ) {
            return Err(UpliftError::Validation(format!(
                "experiment {id} has ended and cannot change status"
            )));
        }
        experiment.status = status;
        experiment.updated_at = Utc::now();
        info!(experiment_id = %id, status = ?status, "experiment status changed");
        Ok(experiment.clone())
    }

    /// Retire a losing arm. Its history stays intact and its existing
    /// assignments keep replaying; it just stops receiving new traffic.
    pub fn deactivate_variant(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
    ) -> UpliftResult<Experiment> {
        let mut entry = self
            .experiments
            .get_mut(&experiment_id)
            .ok_or(UpliftError::ExperimentNotFound(experiment_id))?;
        let experiment = entry.value_mut();

        let active = experiment.variants.iter().filter(|v| v.is_active).count();
        let variant = experiment
            .variants
            .iter_mut()
            .find(|v| v.id == variant_id)
            .ok_or(UpliftError::VariantNotFound(variant_id))?;
        if variant.is_active && active <= 1 {
            return Err(UpliftError::Validation(
                "cannot retire the last active variant".to_string(),
            ));
        }

        variant.is_active = false;
        experiment.updated_at = Utc::now();
        info!(experiment_id = %experiment_id, variant_id = %variant_id, "variant retired");
        Ok(experiment.clone())
    }

    /// Fetch an experiment that is allowed to allocate traffic.
    pub fn running_experiment(&self, id: Uuid) -> UpliftResult<Experiment> {
        let experiment = self
            .experiments
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(UpliftError::ExperimentNotFound(id))?;
        if !experiment.is_running() {
            return Err(UpliftError::ExperimentNotRunning(id));
        }
        Ok(experiment)
    }

    pub fn count(&self) -> usize {
        self.experiments.len()
    }

    /// Seed two running demo experiments for development environments.
    pub fn seed_demo(&self) -> Vec<Experiment> {
        let now = Utc::now();
        let seeds = vec![
            (
                "Homepage Hero Copy",
                "Which hero headline converts browsers into signups",
                SegmentationMode::Disabled,
                false,
                vec![
                    ("Control", serde_json::json!({"headline": "Grow faster with Uplift", "cta": "Start free"})),
                    ("Urgency", serde_json::json!({"headline": "Your competitors already test. Do you?", "cta": "Start free"})),
                    ("Social proof", serde_json::json!({"headline": "Join 4,200 teams shipping winners", "cta": "Start free"})),
                ],
            ),
            (
                "Checkout CTA",
                "Button copy test, segmented by acquisition source and device",
                SegmentationMode::Manual {
                    fields: vec!["source".to_string(), "device".to_string()],
                },
                true,
                vec![
                    ("Control", serde_json::json!({"label": "Place order"})),
                    ("Reassurance", serde_json::json!({"label": "Place order (free returns)"})),
                ],
            ),
        ];

        let mut created = Vec::new();
        for (name, description, segmentation, warm_start, variants) in seeds {
            let experiment = Experiment {
                id: Uuid::new_v4(),
                name: name.to_string(),
                description: description.to_string(),
                status: ExperimentStatus::Running,
                segmentation,
                warm_start,
                variants: variants
                    .into_iter()
                    .enumerate()
                    .map(|(position, (vname, content))| Variant {
                        id: Uuid::new_v4(),
                        name: vname.to_string(),
                        content,
                        position: position as u32,
                        is_active: true,
                        created_at: now,
                    })
                    .collect(),
                created_at: now,
                updated_at: now,
            };
            info!(experiment_id = %experiment.id, name = %experiment.name, "seeded demo experiment");
            self.experiments.insert(experiment.id, experiment.clone());
            created.push(experiment);
        }
        created
    }
}

impl Default for ExperimentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_draft(variants: usize) -> ExperimentDraft {
        ExperimentDraft {
            name: "pricing page test".to_string(),
            description: String::new(),
            segmentation: SegmentationMode::Disabled,
            warm_start: false,
            variants: (0..variants)
                .map(|i| VariantDraft {
                    name: format!("variant-{i}"),
                    content: serde_json::json!({"index": i}),
                })
                .collect(),
        }
    }

    #[test]
    fn test_create_assigns_ids_and_positions() {
        let registry = ExperimentRegistry::new();
        let experiment = registry.create(make_draft(3)).unwrap();

        assert_eq!(experiment.status, ExperimentStatus::Draft);
        assert_eq!(experiment.variants.len(), 3);
        for (i, variant) in experiment.variants.iter().enumerate() {
            assert_eq!(variant.position, i as u32);
            assert!(variant.is_active);
        }
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_create_requires_two_variants() {
        let registry = ExperimentRegistry::new();
        let result = registry.create(make_draft(1));
        assert!(matches!(result, Err(UpliftError::Validation(_))));
    }

    #[test]
    fn test_status_lifecycle_and_terminal_guard() {
        let registry = ExperimentRegistry::new();
        let experiment = registry.create(make_draft(2)).unwrap();

        registry
            .set_status(experiment.id, ExperimentStatus::Running)
            .unwrap();
        registry
            .set_status(experiment.id, ExperimentStatus::Paused)
            .unwrap();
        registry
            .set_status(experiment.id, ExperimentStatus::Completed)
            .unwrap();

        let result = registry.set_status(experiment.id, ExperimentStatus::Running);
        assert!(matches!(result, Err(UpliftError::Validation(_))));
    }

    #[test]
    fn test_running_experiment_guards() {
        let registry = ExperimentRegistry::new();
        let experiment = registry.create(make_draft(2)).unwrap();

        assert!(matches!(
            registry.running_experiment(Uuid::new_v4()),
            Err(UpliftError::ExperimentNotFound(_))
        ));
        assert!(matches!(
            registry.running_experiment(experiment.id),
            Err(UpliftError::ExperimentNotRunning(_))
        ));

        registry
            .set_status(experiment.id, ExperimentStatus::Running)
            .unwrap();
        assert!(registry.running_experiment(experiment.id).is_ok());
    }

    #[test]
    fn test_retire_variant_keeps_one_active() {
        let registry = ExperimentRegistry::new();
        let experiment = registry.create(make_draft(2)).unwrap();
        let first = experiment.variants[0].id;
        let second = experiment.variants[1].id;

        let updated = registry.deactivate_variant(experiment.id, first).unwrap();
        assert!(!updated.variants[0].is_active);

        let result = registry.deactivate_variant(experiment.id, second);
        assert!(matches!(result, Err(UpliftError::Validation(_))));
    }

    #[test]
    fn test_retire_unknown_variant() {
        let registry = ExperimentRegistry::new();
        let experiment = registry.create(make_draft(2)).unwrap();
        let result = registry.deactivate_variant(experiment.id, Uuid::new_v4());
        assert!(matches!(result, Err(UpliftError::VariantNotFound(_))));
    }

    #[test]
    fn test_seed_demo_creates_running_experiments() {
        let registry = ExperimentRegistry::new();
        let seeded = registry.seed_demo();

        assert_eq!(seeded.len(), 2);
        assert!(seeded.iter().all(|e| e.is_running()));
        assert!(seeded
            .iter()
            .any(|e| matches!(e.segmentation, SegmentationMode::Manual { .. }) && e.warm_start));
    }
}
