//! Allocation coordinator: the decision path from visitor request to
//! sticky assignment, and the conversion path that closes the loop.
//!
//! Per (experiment, visitor) the lifecycle is Unassigned, then
//! Assigned, then Converted, and never moves backwards. The assignment
//! store's uniqueness constraint decides every race; losers re-read the
//! winner's row and replay it, so callers always see one consistent
//! decision.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uplift_bandit::{build_report, ExperimentReport, ThompsonSampler};
use uplift_core::types::{
    AllocationOutcome, Assignment, ConversionOutcome, ConversionStatus, Experiment,
};
use uplift_core::{UpliftError, UpliftResult};
use uplift_ledger::AuditLedger;
use uplift_segmentation::{describe_segment, normalize_context, SegmentCatalog, SegmentResolver, SegmentSummary};
use uplift_state::SegmentStateStore;
use uuid::Uuid;

use crate::assignments::{AssignmentStore, InsertOutcome};
use crate::registry::ExperimentRegistry;

pub struct AllocationCoordinator {
    registry: Arc<ExperimentRegistry>,
    states: Arc<SegmentStateStore>,
    assignments: Arc<AssignmentStore>,
    ledger: Arc<AuditLedger>,
    catalog: Arc<SegmentCatalog>,
    resolver: SegmentResolver,
    sampler: ThompsonSampler,
}

impl AllocationCoordinator {
    pub fn new(
        registry: Arc<ExperimentRegistry>,
        states: Arc<SegmentStateStore>,
        assignments: Arc<AssignmentStore>,
        ledger: Arc<AuditLedger>,
        catalog: Arc<SegmentCatalog>,
    ) -> Self {
        Self {
            registry,
            states,
            assignments,
            ledger,
            catalog,
            resolver: SegmentResolver::new(),
            sampler: ThompsonSampler::new(),
        }
    }

    /// Serve the visitor's variant for an experiment.
    ///
    /// An existing assignment replays unchanged regardless of the
    /// experiment's status: no draw, no counter, no ledger append. Only
    /// a first-touch visitor triggers a Thompson draw, and only the
    /// writer that wins the uniqueness race books it.
    pub fn allocate(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        raw_context: &HashMap<String, String>,
    ) -> UpliftResult<AllocationOutcome> {
        if let Some(existing) = self.assignments.get(experiment_id, user_id)? {
            let experiment = self
                .registry
                .get(experiment_id)
                .ok_or(UpliftError::ExperimentNotFound(experiment_id))?;
            return self.outcome_for(&experiment, &existing, false);
        }

        let experiment = self.registry.running_experiment(experiment_id)?;
        let active = experiment.active_variants();
        if active.is_empty() {
            return Err(UpliftError::NoActiveVariants(experiment_id));
        }

        let context = normalize_context(raw_context);
        let segment_key = self.resolver.resolve(&experiment.segmentation, &context);

        for variant in &active {
            self.states
                .ensure_state(variant.id, &segment_key, experiment.warm_start)?;
        }
        let arms = self.states.states_for_segment(&active, &segment_key)?;
        let variant_id = self.sampler.select(&arms)?;

        let assignment = Assignment {
            id: Uuid::new_v4(),
            experiment_id,
            variant_id,
            user_id: user_id.to_string(),
            segment_key: segment_key.clone(),
            assigned_at: Utc::now(),
            converted_at: None,
            conversion_value: None,
        };

        match self.assignments.insert_if_absent(&assignment)? {
            InsertOutcome::Inserted(stored) => {
                // The ledger append directly follows the insert so the
                // assignment and its decision record land together.
                self.ledger.log_decision(
                    experiment_id,
                    user_id,
                    stored.variant_id,
                    &stored.segment_key,
                    stored.assigned_at,
                );
                if let Err(error) =
                    self.states
                        .increment_allocation(stored.variant_id, &stored.segment_key, stored.assigned_at)
                {
                    warn!(
                        experiment_id = %experiment_id,
                        variant = %stored.variant_id,
                        error = %error,
                        "posterior update failed after assignment was persisted"
                    );
                    return Err(error);
                }
                self.catalog.invalidate(experiment_id, &stored.segment_key);
                info!(
                    experiment_id = %experiment_id,
                    visitor = %user_id,
                    variant = %stored.variant_id,
                    segment = %stored.segment_key,
                    "variant allocated"
                );
                self.outcome_for(&experiment, &stored, true)
            }
            InsertOutcome::Raced(winner) => {
                debug!(
                    experiment_id = %experiment_id,
                    visitor = %user_id,
                    "allocation race lost, replaying winner"
                );
                self.outcome_for(&experiment, &winner, false)
            }
        }
    }

    /// Record a conversion for a visitor's assignment.
    ///
    /// Unknown visitors and repeat conversions are reported as
    /// statuses, not errors. A conversion timestamped at or before the
    /// assignment is an integrity violation and changes nothing.
    pub fn record_outcome(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        value: Option<f64>,
        occurred_at: Option<DateTime<Utc>>,
    ) -> UpliftResult<ConversionOutcome> {
        let assignment = match self.assignments.get(experiment_id, user_id)? {
            Some(assignment) => assignment,
            None => return Ok(ConversionOutcome::not_found()),
        };
        if assignment.is_converted() {
            return Ok(already_converted(&assignment));
        }

        let occurred = occurred_at.unwrap_or_else(Utc::now);
        if occurred <= assignment.assigned_at {
            warn!(
                experiment_id = %experiment_id,
                visitor = %user_id,
                occurred_at = %occurred.to_rfc3339(),
                assigned_at = %assignment.assigned_at.to_rfc3339(),
                "conversion rejected: does not follow its decision"
            );
            return Err(UpliftError::IntegrityViolation(format!(
                "conversion at {} does not follow decision at {} for visitor {}",
                occurred.to_rfc3339(),
                assignment.assigned_at.to_rfc3339(),
                user_id
            )));
        }

        let updated = match self
            .assignments
            .mark_converted(experiment_id, user_id, occurred, value)?
        {
            Some(updated) => updated,
            // Another converter won between the read and the write.
            None => return Ok(already_converted(&assignment)),
        };

        let annotated = self
            .ledger
            .log_conversion(experiment_id, user_id, occurred, value)?;
        if !annotated {
            warn!(
                experiment_id = %experiment_id,
                visitor = %user_id,
                "conversion has no matching decision record in the ledger"
            );
        }
        if let Err(error) = self
            .states
            .increment_conversion(updated.variant_id, &updated.segment_key)
        {
            warn!(
                experiment_id = %experiment_id,
                variant = %updated.variant_id,
                error = %error,
                "posterior update failed after conversion was persisted"
            );
            return Err(error);
        }
        self.catalog.invalidate(experiment_id, &updated.segment_key);
        info!(
            experiment_id = %experiment_id,
            visitor = %user_id,
            variant = %updated.variant_id,
            segment = %updated.segment_key,
            "conversion recorded"
        );

        Ok(ConversionOutcome {
            status: ConversionStatus::Recorded,
            assignment_id: Some(updated.id),
            variant_id: Some(updated.variant_id),
        })
    }

    /// Look up an experiment regardless of status.
    pub fn experiment(&self, experiment_id: Uuid) -> UpliftResult<Experiment> {
        self.registry
            .get(experiment_id)
            .ok_or(UpliftError::ExperimentNotFound(experiment_id))
    }

    /// Posterior stats for one segment of an experiment. Works for any
    /// status so ended experiments stay reviewable.
    pub fn posterior_report(
        &self,
        experiment_id: Uuid,
        segment_key: &str,
    ) -> UpliftResult<ExperimentReport> {
        let experiment = self
            .registry
            .get(experiment_id)
            .ok_or(UpliftError::ExperimentNotFound(experiment_id))?;
        let variants = experiment.variants.iter().collect::<Vec<_>>();
        let arms = self.states.states_for_segment(&variants, segment_key)?;
        Ok(build_report(&experiment, segment_key, &arms))
    }

    /// Cached aggregate for one segment.
    pub fn segment_summary(
        &self,
        experiment_id: Uuid,
        segment_key: &str,
    ) -> UpliftResult<SegmentSummary> {
        if self.registry.get(experiment_id).is_none() {
            return Err(UpliftError::ExperimentNotFound(experiment_id));
        }
        self.catalog.summary(experiment_id, segment_key, || {
            let rows = self.assignments.list_for_experiment(experiment_id)?;
            Ok(summarize_segment(experiment_id, segment_key, &rows))
        })
    }

    /// Every segment observed for an experiment, with aggregates.
    pub fn segments(&self, experiment_id: Uuid) -> UpliftResult<Vec<SegmentSummary>> {
        if self.registry.get(experiment_id).is_none() {
            return Err(UpliftError::ExperimentNotFound(experiment_id));
        }
        let rows = self.assignments.list_for_experiment(experiment_id)?;

        let mut keys: BTreeMap<&str, ()> = BTreeMap::new();
        for row in &rows {
            keys.entry(&row.segment_key).or_insert(());
        }
        Ok(keys
            .into_keys()
            .map(|key| summarize_segment(experiment_id, key, &rows))
            .collect())
    }

    fn outcome_for(
        &self,
        experiment: &Experiment,
        assignment: &Assignment,
        is_new_assignment: bool,
    ) -> UpliftResult<AllocationOutcome> {
        let variant = experiment
            .variants
            .iter()
            .find(|v| v.id == assignment.variant_id)
            .ok_or(UpliftError::VariantNotFound(assignment.variant_id))?;
        Ok(AllocationOutcome {
            assignment_id: assignment.id,
            experiment_id: assignment.experiment_id,
            variant_id: variant.id,
            variant_name: variant.name.clone(),
            content: variant.content.clone(),
            segment_key: assignment.segment_key.clone(),
            assigned_at: assignment.assigned_at,
            is_new_assignment,
        })
    }
}

fn already_converted(assignment: &Assignment) -> ConversionOutcome {
    ConversionOutcome {
        status: ConversionStatus::AlreadyConverted,
        assignment_id: Some(assignment.id),
        variant_id: Some(assignment.variant_id),
    }
}

fn summarize_segment(
    experiment_id: Uuid,
    segment_key: &str,
    rows: &[Assignment],
) -> SegmentSummary {
    let scoped: Vec<&Assignment> = rows
        .iter()
        .filter(|a| a.segment_key == segment_key)
        .collect();
    let total_assignments = scoped.len() as u64;
    let total_conversions = scoped.iter().filter(|a| a.is_converted()).count() as u64;
    let conversion_rate = if total_assignments > 0 {
        total_conversions as f64 / total_assignments as f64
    } else {
        0.0
    };
    SegmentSummary {
        experiment_id,
        segment_key: segment_key.to_string(),
        descriptor: describe_segment(segment_key),
        total_assignments,
        total_conversions,
        conversion_rate,
        computed_at: Utc::now(),
    }
}
