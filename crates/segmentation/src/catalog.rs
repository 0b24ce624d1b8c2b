//! Read-through catalog of observed segments with per-segment
//! aggregates. Summaries are cheap to rebuild, so the catalog trades
//! staleness for latency with a short TTL and explicit invalidation on
//! writes.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uplift_core::types::DEFAULT_SEGMENT;
use uplift_core::UpliftResult;
use uuid::Uuid;

/// Operator-facing aggregate for one observed segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub experiment_id: Uuid,
    pub segment_key: String,
    /// Human-readable rendering of the segment key.
    pub descriptor: String,
    pub total_assignments: u64,
    pub total_conversions: u64,
    pub conversion_rate: f64,
    pub computed_at: DateTime<Utc>,
}

struct CatalogEntry {
    summary: SegmentSummary,
    inserted_at: Instant,
}

/// Lock-free read-through cache of segment summaries.
pub struct SegmentCatalog {
    entries: DashMap<(Uuid, String), CatalogEntry>,
    ttl: Duration,
}

impl SegmentCatalog {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Return the cached summary, or compute and cache it. Compute
    /// failures are passed through and nothing is cached.
    pub fn summary<F>(
        &self,
        experiment_id: Uuid,
        segment_key: &str,
        compute: F,
    ) -> UpliftResult<SegmentSummary>
    where
        F: FnOnce() -> UpliftResult<SegmentSummary>,
    {
        let key = (experiment_id, segment_key.to_string());
        if let Some(entry) = self.entries.get(&key) {
            if entry.inserted_at.elapsed() <= self.ttl {
                return Ok(entry.summary.clone());
            }
            drop(entry);
            self.entries.remove(&key);
        }

        let summary = compute()?;
        self.entries.insert(
            key,
            CatalogEntry {
                summary: summary.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(summary)
    }

    /// Drop one segment's cached summary.
    pub fn invalidate(&self, experiment_id: Uuid, segment_key: &str) {
        self.entries
            .remove(&(experiment_id, segment_key.to_string()));
    }

    /// Drop every cached summary for an experiment.
    pub fn invalidate_experiment(&self, experiment_id: Uuid) {
        self.entries.retain(|(id, _), _| *id != experiment_id);
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let expired: Vec<(Uuid, String)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().inserted_at.elapsed() > self.ttl)
            .map(|entry| entry.key().clone())
            .collect();

        // Re-check under the shard lock so a concurrently refreshed
        // entry survives, and count only what this call removed.
        let mut evicted = 0;
        for key in &expired {
            if self
                .entries
                .remove_if(key, |_, entry| entry.inserted_at.elapsed() > self.ttl)
                .is_some()
            {
                evicted += 1;
            }
        }
        evicted
    }

    /// Run periodic maintenance (expired-entry eviction).
    pub async fn maintenance(&self) {
        let evicted = self.evict_expired();
        if evicted > 0 {
            debug!(evicted = evicted, "Segment catalog eviction complete");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Render a segment key for humans: `source:instagram|device:mobile`
/// becomes `source instagram, device mobile`.
pub fn describe_segment(segment_key: &str) -> String {
    if segment_key == DEFAULT_SEGMENT {
        return "all traffic".to_string();
    }
    if let Some(cluster) = segment_key.strip_prefix("cluster:") {
        return format!("behavioral cluster {cluster}");
    }
    segment_key
        .split('|')
        .map(|part| part.replacen(':', " ", 1))
        .collect::<Vec<_>>()
        .join(", ")
}
