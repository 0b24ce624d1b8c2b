//! In-memory segment state store backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or similar ACID store.
//! This provides the same API surface for development and testing.
//!
//! Rows hold codec-encoded blobs keyed by (variant, segment). The
//! decode-mutate-encode cycle of each increment runs while holding the
//! row's shard lock, so concurrent updates to one arm serialize and no
//! increment is lost.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uplift_core::types::{SegmentArm, Variant, VariantState, DEFAULT_SEGMENT};
use uplift_core::{UpliftError, UpliftResult};
use uplift_storage::StorageRuntime;
use uuid::Uuid;

use crate::codec::StateCodec;

type RowKey = (Uuid, String);

/// Thread-safe store of encrypted posterior rows.
pub struct SegmentStateStore {
    rows: DashMap<RowKey, Vec<u8>>,
    codec: Arc<dyn StateCodec>,
    runtime: Arc<StorageRuntime>,
}

impl SegmentStateStore {
    pub fn new(codec: Arc<dyn StateCodec>, runtime: Arc<StorageRuntime>) -> Self {
        Self {
            rows: DashMap::new(),
            codec,
            runtime,
        }
    }

    /// Create the row for (variant, segment) if it does not exist.
    ///
    /// New rows start at the uniform prior. With `warm_start`, a new
    /// segment instead copies the posterior shape already learned in
    /// the default segment, so known-bad arms are not re-explored from
    /// scratch. Counters always start at zero. Idempotent, and a lost
    /// creation race keeps the winner's row.
    pub fn ensure_state(
        &self,
        variant_id: Uuid,
        segment_key: &str,
        warm_start: bool,
    ) -> UpliftResult<()> {
        self.runtime.run("ensure_state", || {
            let key: RowKey = (variant_id, segment_key.to_string());
            if self.rows.contains_key(&key) {
                return Ok(());
            }

            let state = if warm_start && segment_key != DEFAULT_SEGMENT {
                match self.decode_row(&(variant_id, DEFAULT_SEGMENT.to_string()))? {
                    Some(seed) => VariantState::seeded(seed.alpha, seed.beta),
                    None => VariantState::prior(),
                }
            } else {
                VariantState::prior()
            };

            let blob = self.codec.encode(&state)?;
            self.rows.entry(key).or_insert(blob);
            Ok(())
        })
    }

    /// Read one decoded row, if present.
    pub fn read_state(
        &self,
        variant_id: Uuid,
        segment_key: &str,
    ) -> UpliftResult<Option<VariantState>> {
        self.runtime.run("read_state", || {
            self.decode_row(&(variant_id, segment_key.to_string()))
        })
    }

    /// Decode the arms of one segment for the given variants, in one
    /// round trip. Variants without a row report the uniform prior.
    pub fn states_for_segment(
        &self,
        variants: &[&Variant],
        segment_key: &str,
    ) -> UpliftResult<Vec<SegmentArm>> {
        self.runtime.run("read_segment", || {
            let mut arms = Vec::with_capacity(variants.len());
            for variant in variants {
                let state = self
                    .decode_row(&(variant.id, segment_key.to_string()))?
                    .unwrap_or_else(VariantState::prior);
                arms.push(SegmentArm {
                    variant_id: variant.id,
                    position: variant.position,
                    state,
                });
            }
            Ok(arms)
        })
    }

    /// Book one allocation against an arm as a provisional failure.
    pub fn increment_allocation(
        &self,
        variant_id: Uuid,
        segment_key: &str,
        at: DateTime<Utc>,
    ) -> UpliftResult<VariantState> {
        self.runtime.run("increment_allocation", || {
            self.mutate_row(variant_id, segment_key, |state| state.record_allocation(at))
        })
    }

    /// Flip one provisional failure into a success.
    pub fn increment_conversion(
        &self,
        variant_id: Uuid,
        segment_key: &str,
    ) -> UpliftResult<VariantState> {
        self.runtime.run("increment_conversion", || {
            self.mutate_row(variant_id, segment_key, |state| state.record_conversion())
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn decode_row(&self, key: &RowKey) -> UpliftResult<Option<VariantState>> {
        let blob = match self.rows.get(key) {
            Some(row) => row.value().clone(),
            None => return Ok(None),
        };
        self.codec.decode(&blob).map(Some)
    }

    /// Atomic read-modify-write of one row under its shard lock.
    fn mutate_row(
        &self,
        variant_id: Uuid,
        segment_key: &str,
        apply: impl FnOnce(&mut VariantState),
    ) -> UpliftResult<VariantState> {
        let key: RowKey = (variant_id, segment_key.to_string());
        let mut row = self.rows.get_mut(&key).ok_or_else(|| {
            UpliftError::Internal(anyhow!(
                "no state row for variant {variant_id} in segment {segment_key}"
            ))
        })?;
        let mut state = self.codec.decode(row.value())?;
        apply(&mut state);
        *row.value_mut() = self.codec.encode(&state)?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AesGcmCodec, JsonCodec};

    fn make_store() -> SegmentStateStore {
        let codec = AesGcmCodec::from_key_bytes(&[3u8; 32]).unwrap();
        SegmentStateStore::new(
            Arc::new(codec),
            Arc::new(StorageRuntime::with_defaults("segment-state")),
        )
    }

    #[test]
    fn test_ensure_creates_prior_row() {
        let store = make_store();
        let variant_id = Uuid::new_v4();

        store.ensure_state(variant_id, "default", false).unwrap();
        let state = store.read_state(variant_id, "default").unwrap().unwrap();
        assert_eq!(state, VariantState::prior());
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let store = make_store();
        let variant_id = Uuid::new_v4();

        store.ensure_state(variant_id, "default", false).unwrap();
        store
            .increment_allocation(variant_id, "default", Utc::now())
            .unwrap();
        store.ensure_state(variant_id, "default", false).unwrap();

        let state = store.read_state(variant_id, "default").unwrap().unwrap();
        assert_eq!(state.total_allocations, 1);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_increments_follow_conjugate_update() {
        let store = make_store();
        let variant_id = Uuid::new_v4();
        store.ensure_state(variant_id, "default", false).unwrap();

        for _ in 0..10 {
            store
                .increment_allocation(variant_id, "default", Utc::now())
                .unwrap();
        }
        for _ in 0..3 {
            store.increment_conversion(variant_id, "default").unwrap();
        }

        let state = store.read_state(variant_id, "default").unwrap().unwrap();
        assert_eq!(state.alpha, 4.0);
        assert_eq!(state.beta, 8.0);
        assert_eq!(state.total_allocations, 10);
        assert_eq!(state.total_conversions, 3);
    }

    #[test]
    fn test_warm_start_copies_default_shape() {
        let store = make_store();
        let variant_id = Uuid::new_v4();
        store.ensure_state(variant_id, "default", false).unwrap();
        for _ in 0..25 {
            store
                .increment_allocation(variant_id, "default", Utc::now())
                .unwrap();
        }
        for _ in 0..20 {
            store.increment_conversion(variant_id, "default").unwrap();
        }

        // Default segment sits at (21, 6) after 20 of 25 converted.
        store
            .ensure_state(variant_id, "device:mobile", true)
            .unwrap();
        let seeded = store
            .read_state(variant_id, "device:mobile")
            .unwrap()
            .unwrap();

        assert_eq!(seeded.alpha, 21.0);
        assert_eq!(seeded.beta, 6.0);
        assert_eq!(seeded.total_allocations, 0);
        assert_eq!(seeded.total_conversions, 0);
    }

    #[test]
    fn test_warm_start_without_default_row_uses_prior() {
        let store = make_store();
        let variant_id = Uuid::new_v4();

        store
            .ensure_state(variant_id, "source:email", true)
            .unwrap();
        let state = store
            .read_state(variant_id, "source:email")
            .unwrap()
            .unwrap();
        assert_eq!(state, VariantState::prior());
    }

    #[test]
    fn test_increment_without_row_is_an_error() {
        let store = make_store();
        let result = store.increment_allocation(Uuid::new_v4(), "default", Utc::now());
        assert!(matches!(result, Err(UpliftError::Internal(_))));
    }

    #[test]
    fn test_segment_read_defaults_missing_arms_to_prior() {
        let store = make_store();
        let seen = Variant {
            id: Uuid::new_v4(),
            name: "a".to_string(),
            content: serde_json::json!({}),
            position: 0,
            is_active: true,
            created_at: Utc::now(),
        };
        let unseen = Variant {
            id: Uuid::new_v4(),
            name: "b".to_string(),
            content: serde_json::json!({}),
            position: 1,
            is_active: true,
            created_at: Utc::now(),
        };

        store.ensure_state(seen.id, "default", false).unwrap();
        store
            .increment_allocation(seen.id, "default", Utc::now())
            .unwrap();

        let arms = store
            .states_for_segment(&[&seen, &unseen], "default")
            .unwrap();
        assert_eq!(arms.len(), 2);
        assert_eq!(arms[0].state.total_allocations, 1);
        assert_eq!(arms[1].state, VariantState::prior());
    }

    #[test]
    fn test_segments_are_isolated() {
        let store = make_store();
        let variant_id = Uuid::new_v4();
        store.ensure_state(variant_id, "default", false).unwrap();
        store
            .ensure_state(variant_id, "device:mobile", false)
            .unwrap();

        store
            .increment_allocation(variant_id, "device:mobile", Utc::now())
            .unwrap();

        let untouched = store.read_state(variant_id, "default").unwrap().unwrap();
        assert_eq!(untouched.total_allocations, 0);
    }

    #[test]
    fn test_concurrent_increments_lose_nothing() {
        let store = make_store();
        let variant_id = Uuid::new_v4();
        store.ensure_state(variant_id, "default", false).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        store
                            .increment_allocation(variant_id, "default", Utc::now())
                            .unwrap();
                    }
                });
            }
        });

        let state = store.read_state(variant_id, "default").unwrap().unwrap();
        assert_eq!(state.total_allocations, 200);
        assert_eq!(state.beta, 201.0);
    }

    #[test]
    fn test_store_works_with_json_codec() {
        let store = SegmentStateStore::new(
            Arc::new(JsonCodec),
            Arc::new(StorageRuntime::with_defaults("segment-state")),
        );
        let variant_id = Uuid::new_v4();

        store.ensure_state(variant_id, "default", false).unwrap();
        store
            .increment_allocation(variant_id, "default", Utc::now())
            .unwrap();
        let state = store.read_state(variant_id, "default").unwrap().unwrap();
        assert_eq!(state.total_allocations, 1);
    }
}
