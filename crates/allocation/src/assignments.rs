//! In-memory assignment store backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or similar ACID store.
//! One row per (experiment, visitor). First write wins through an
//! atomic insert-if-absent, so concurrent first-touch requests for the
//! same visitor collapse to a single stored assignment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uplift_core::types::Assignment;
use uplift_core::UpliftResult;
use uplift_storage::StorageRuntime;
use uuid::Uuid;

type RowKey = (Uuid, String);

/// Result of an insert attempt against the uniqueness constraint.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// This call created the row.
    Inserted(Assignment),
    /// Another writer got there first; carries the stored row.
    Raced(Assignment),
}

/// Thread-safe store of sticky visitor assignments.
pub struct AssignmentStore {
    rows: DashMap<RowKey, Assignment>,
    runtime: Arc<StorageRuntime>,
}

impl AssignmentStore {
    pub fn new(runtime: Arc<StorageRuntime>) -> Self {
        Self {
            rows: DashMap::new(),
            runtime,
        }
    }

    /// Insert unless a row already exists for (experiment, visitor).
    pub fn insert_if_absent(&self, assignment: &Assignment) -> UpliftResult<InsertOutcome> {
        self.runtime.run("insert_assignment", || {
            let key: RowKey = (assignment.experiment_id, assignment.user_id.clone());
            match self.rows.entry(key) {
                Entry::Occupied(existing) => Ok(InsertOutcome::Raced(existing.get().clone())),
                Entry::Vacant(slot) => {
                    slot.insert(assignment.clone());
                    Ok(InsertOutcome::Inserted(assignment.clone()))
                }
            }
        })
    }

    pub fn get(&self, experiment_id: Uuid, user_id: &str) -> UpliftResult<Option<Assignment>> {
        self.runtime.run("read_assignment", || {
            Ok(self
                .rows
                .get(&(experiment_id, user_id.to_string()))
                .map(|r| r.value().clone()))
        })
    }

    /// Stamp the conversion onto a visitor's row.
    ///
    /// Returns `Ok(None)` when there is no row or it already carries a
    /// conversion, so racing converters resolve to a single winner.
    pub fn mark_converted(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        occurred_at: DateTime<Utc>,
        value: Option<f64>,
    ) -> UpliftResult<Option<Assignment>> {
        self.runtime.run("mark_converted", || {
            let mut row = match self.rows.get_mut(&(experiment_id, user_id.to_string())) {
                Some(row) => row,
                None => return Ok(None),
            };
            if row.is_converted() {
                return Ok(None);
            }
            row.converted_at = Some(occurred_at);
            row.conversion_value = value;
            Ok(Some(row.value().clone()))
        })
    }

    /// All assignments for an experiment, newest first.
    pub fn list_for_experiment(&self, experiment_id: Uuid) -> UpliftResult<Vec<Assignment>> {
        self.runtime.run("list_assignments", || {
            let mut rows: Vec<Assignment> = self
                .rows
                .iter()
                .filter(|r| r.value().experiment_id == experiment_id)
                .map(|r| r.value().clone())
                .collect();
            rows.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
            Ok(rows)
        })
    }

    pub fn count(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> AssignmentStore {
        AssignmentStore::new(Arc::new(StorageRuntime::with_defaults("assignments")))
    }

    fn make_assignment(experiment_id: Uuid, user_id: &str) -> Assignment {
        Assignment {
            id: Uuid::new_v4(),
            experiment_id,
            variant_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            segment_key: "default".to_string(),
            assigned_at: Utc::now(),
            converted_at: None,
            conversion_value: None,
        }
    }

    #[test]
    fn test_insert_then_read_back() {
        let store = make_store();
        let experiment_id = Uuid::new_v4();
        let assignment = make_assignment(experiment_id, "u1");

        let outcome = store.insert_if_absent(&assignment).unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));

        let stored = store.get(experiment_id, "u1").unwrap().unwrap();
        assert_eq!(stored.id, assignment.id);
    }

    #[test]
    fn test_second_insert_loses_to_first() {
        let store = make_store();
        let experiment_id = Uuid::new_v4();
        let winner = make_assignment(experiment_id, "u1");
        let loser = make_assignment(experiment_id, "u1");

        store.insert_if_absent(&winner).unwrap();
        let outcome = store.insert_if_absent(&loser).unwrap();

        match outcome {
            InsertOutcome::Raced(stored) => assert_eq!(stored.id, winner.id),
            InsertOutcome::Inserted(_) => panic!("duplicate insert must not win"),
        }
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_same_visitor_different_experiments_are_independent() {
        let store = make_store();
        let first = make_assignment(Uuid::new_v4(), "u1");
        let second = make_assignment(Uuid::new_v4(), "u1");

        assert!(matches!(
            store.insert_if_absent(&first).unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert!(matches!(
            store.insert_if_absent(&second).unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_concurrent_inserts_collapse_to_one_row() {
        let store = make_store();
        let experiment_id = Uuid::new_v4();

        let outcomes: Vec<InsertOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let attempt = make_assignment(experiment_id, "u1");
                        store.insert_if_absent(&attempt).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let inserted: Vec<_> = outcomes
            .iter()
            .filter(|o| matches!(o, InsertOutcome::Inserted(_)))
            .collect();
        assert_eq!(inserted.len(), 1);
        assert_eq!(store.count(), 1);

        let winner_id = store.get(experiment_id, "u1").unwrap().unwrap().id;
        for outcome in &outcomes {
            let (InsertOutcome::Inserted(a) | InsertOutcome::Raced(a)) = outcome;
            assert_eq!(a.id, winner_id);
        }
    }

    #[test]
    fn test_mark_converted_once() {
        let store = make_store();
        let experiment_id = Uuid::new_v4();
        let assignment = make_assignment(experiment_id, "u1");
        store.insert_if_absent(&assignment).unwrap();

        let converted_at = Utc::now();
        let updated = store
            .mark_converted(experiment_id, "u1", converted_at, Some(19.99))
            .unwrap()
            .unwrap();
        assert_eq!(updated.converted_at, Some(converted_at));
        assert_eq!(updated.conversion_value, Some(19.99));

        let repeat = store
            .mark_converted(experiment_id, "u1", Utc::now(), Some(5.0))
            .unwrap();
        assert!(repeat.is_none());

        let stored = store.get(experiment_id, "u1").unwrap().unwrap();
        assert_eq!(stored.conversion_value, Some(19.99));
    }

    #[test]
    fn test_mark_converted_without_row() {
        let store = make_store();
        let result = store
            .mark_converted(Uuid::new_v4(), "ghost", Utc::now(), None)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_list_filters_by_experiment() {
        let store = make_store();
        let experiment_id = Uuid::new_v4();
        for i in 0..3 {
            store
                .insert_if_absent(&make_assignment(experiment_id, &format!("u{i}")))
                .unwrap();
        }
        store
            .insert_if_absent(&make_assignment(Uuid::new_v4(), "other"))
            .unwrap();

        let rows = store.list_for_experiment(experiment_id).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|a| a.experiment_id == experiment_id));
    }
}
