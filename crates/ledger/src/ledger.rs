//! Hash-chained decision ledger.
//!
//! Every allocation appends one record to its experiment's chain. Each
//! record hash covers the decision content plus the previous record's
//! hash, so edits, deletions, and reordering are all detectable by
//! recomputation. Conversions annotate their decision record in place
//! behind a causal-ordering gate; they do not extend the chain.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uplift_core::{UpliftError, UpliftResult};
use uuid::Uuid;

/// Previous-hash sentinel for the first record of every chain.
const GENESIS: &str = "genesis";

/// One chained allocation decision, possibly annotated with its
/// conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub experiment_id: Uuid,
    /// Position in the experiment's chain, starting at 1.
    pub sequence: u64,
    pub user_id: String,
    pub variant_id: Uuid,
    pub segment_key: String,
    pub decided_at: DateTime<Utc>,
    pub converted_at: Option<DateTime<Utc>>,
    pub conversion_value: Option<f64>,
    /// SHA-256 over the canonical decision content.
    pub decision_hash: String,
    /// Hash of the previous record ("genesis" for the first).
    pub previous_hash: String,
}

#[derive(Default)]
struct Chain {
    records: Vec<AuditRecord>,
    last_hash: Option<String>,
}

/// Append-only decision ledger with one hash chain per experiment.
///
/// Chains are independent: appends to different experiments never
/// contend, while appends within one experiment serialize on its
/// mutex so sequence numbers and hash links are race-free.
pub struct AuditLedger {
    chains: DashMap<Uuid, Arc<Mutex<Chain>>>,
}

impl Default for AuditLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLedger {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }

    /// Append an allocation decision to the experiment's chain.
    ///
    /// `decided_at` must be the assignment's timestamp so the ledger
    /// and the assignment store agree on when the decision happened.
    pub fn log_decision(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        variant_id: Uuid,
        segment_key: &str,
        decided_at: DateTime<Utc>,
    ) -> AuditRecord {
        let chain = self
            .chains
            .entry(experiment_id)
            .or_insert_with(|| Arc::new(Mutex::new(Chain::default())))
            .clone();
        let mut chain = chain.lock();

        let sequence = chain.records.len() as u64 + 1;
        let previous_hash = chain
            .last_hash
            .clone()
            .unwrap_or_else(|| GENESIS.to_string());
        let content = canonical_content(
            sequence,
            user_id,
            variant_id,
            segment_key,
            decided_at,
            &previous_hash,
        );
        let decision_hash = sha256_hex(&content);

        let record = AuditRecord {
            experiment_id,
            sequence,
            user_id: user_id.to_string(),
            variant_id,
            segment_key: segment_key.to_string(),
            decided_at,
            converted_at: None,
            conversion_value: None,
            decision_hash: decision_hash.clone(),
            previous_hash,
        };
        chain.records.push(record.clone());
        chain.last_hash = Some(decision_hash);

        info!(
            experiment_id = %experiment_id,
            sequence,
            visitor = %user_id,
            variant = %variant_id,
            segment = %segment_key,
            "allocation decision chained"
        );
        record
    }

    /// Annotate a visitor's decision record with its conversion.
    ///
    /// Returns `Ok(false)` when there is nothing to do: no chain, no
    /// decision for this visitor, or the decision already converted.
    /// A conversion timestamp at or before the decision is an
    /// [`UpliftError::IntegrityViolation`] and leaves the record
    /// untouched.
    pub fn log_conversion(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        occurred_at: DateTime<Utc>,
        value: Option<f64>,
    ) -> UpliftResult<bool> {
        let chain = match self.chains.get(&experiment_id) {
            Some(chain) => chain.clone(),
            None => return Ok(false),
        };
        let mut chain = chain.lock();

        let record = match chain.records.iter_mut().find(|r| r.user_id == user_id) {
            Some(record) => record,
            None => return Ok(false),
        };
        if record.converted_at.is_some() {
            return Ok(false);
        }
        if occurred_at <= record.decided_at {
            return Err(UpliftError::IntegrityViolation(format!(
                "conversion at {} does not follow decision at {} for visitor {}",
                occurred_at.to_rfc3339(),
                record.decided_at.to_rfc3339(),
                user_id
            )));
        }

        record.converted_at = Some(occurred_at);
        record.conversion_value = value;
        Ok(true)
    }

    /// Trail of decisions for an experiment, latest first.
    pub fn trail(
        &self,
        experiment_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<AuditRecord> {
        let mut records = self.records(experiment_id);
        records.retain(|r| {
            if let Some(ref f) = from {
                if r.decided_at < *f {
                    return false;
                }
            }
            if let Some(ref t) = to {
                if r.decided_at > *t {
                    return false;
                }
            }
            true
        });
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        records.truncate(limit);
        records
    }

    /// Verify the chain, optionally only the records in
    /// `[start, end]` (sequence numbers, inclusive).
    pub fn verify_chain(
        &self,
        experiment_id: Uuid,
        range: Option<(u64, u64)>,
    ) -> IntegrityReport {
        let all = self.records(experiment_id);
        let (start, end) = match range {
            Some((s, e)) => (s.max(1), e),
            None => (1, all.len() as u64),
        };
        let scoped: Vec<&AuditRecord> = all
            .iter()
            .filter(|r| r.sequence >= start && r.sequence <= end)
            .collect();

        let mut invalid: BTreeSet<u64> = BTreeSet::new();
        let mut checks = Vec::new();

        // Sequence contiguity: no gaps, window starts where requested.
        let mut gaps = Vec::new();
        if let Some(first) = scoped.first() {
            if first.sequence != start {
                gaps.push(first.sequence);
            }
        }
        for pair in scoped.windows(2) {
            if pair[1].sequence != pair[0].sequence + 1 {
                gaps.push(pair[1].sequence);
            }
        }
        invalid.extend(&gaps);
        checks.push(IntegrityCheck::new(
            "sequence_contiguity",
            gaps.is_empty(),
            if gaps.is_empty() {
                format!("{} records, no gaps", scoped.len())
            } else {
                format!("gaps at sequences {gaps:?}")
            },
        ));

        // Chain linkage: previous_hash must match the prior record.
        let mut broken = Vec::new();
        for (i, record) in scoped.iter().enumerate() {
            let expected_prev = if record.sequence == 1 {
                Some(GENESIS.to_string())
            } else if i == 0 {
                // Anchor a ranged window on the record before it.
                all.iter()
                    .find(|r| r.sequence == record.sequence - 1)
                    .map(|r| r.decision_hash.clone())
            } else {
                Some(scoped[i - 1].decision_hash.clone())
            };
            match expected_prev {
                Some(expected) if record.previous_hash == expected => {}
                _ => broken.push(record.sequence),
            }
        }
        invalid.extend(&broken);
        checks.push(IntegrityCheck::new(
            "chain_linkage",
            broken.is_empty(),
            if broken.is_empty() {
                "every record links to its predecessor".to_string()
            } else {
                format!("broken links at sequences {broken:?}")
            },
        ));

        // Hash recomputation: stored hash must match canonical content.
        let mut mismatched = Vec::new();
        for record in &scoped {
            let content = canonical_content(
                record.sequence,
                &record.user_id,
                record.variant_id,
                &record.segment_key,
                record.decided_at,
                &record.previous_hash,
            );
            if sha256_hex(&content) != record.decision_hash {
                mismatched.push(record.sequence);
            }
        }
        invalid.extend(&mismatched);
        checks.push(IntegrityCheck::new(
            "hash_recomputation",
            mismatched.is_empty(),
            if mismatched.is_empty() {
                "all decision hashes recompute".to_string()
            } else {
                format!("hash mismatches at sequences {mismatched:?}")
            },
        ));

        // Causal ordering: conversions must follow their decisions.
        let mut acausal = Vec::new();
        for record in &scoped {
            if let Some(converted_at) = record.converted_at {
                if converted_at <= record.decided_at {
                    acausal.push(record.sequence);
                }
            }
        }
        invalid.extend(&acausal);
        checks.push(IntegrityCheck::new(
            "causal_ordering",
            acausal.is_empty(),
            if acausal.is_empty() {
                "all conversions follow their decisions".to_string()
            } else {
                format!("conversions precede decisions at sequences {acausal:?}")
            },
        ));

        let chain_intact = checks[..3].iter().all(|c| c.passed);
        let is_fair = chain_intact && checks[3].passed;

        IntegrityReport {
            experiment_id,
            total_records: scoped.len() as u64,
            chain_intact,
            is_fair,
            checks,
            invalid_sequences: invalid.into_iter().collect(),
            verified_at: Utc::now(),
        }
    }

    pub fn record_count(&self, experiment_id: Uuid) -> u64 {
        self.chains
            .get(&experiment_id)
            .map(|chain| chain.lock().records.len() as u64)
            .unwrap_or(0)
    }

    /// Full chain in append order, as needed to re-verify an export.
    pub fn records(&self, experiment_id: Uuid) -> Vec<AuditRecord> {
        match self.chains.get(&experiment_id) {
            Some(chain) => chain.lock().records.clone(),
            None => Vec::new(),
        }
    }

    #[cfg(test)]
    fn tamper_with(&self, experiment_id: Uuid, sequence: u64, mutate: impl FnOnce(&mut AuditRecord)) {
        let chain = self.chains.get(&experiment_id).unwrap().clone();
        let mut chain = chain.lock();
        let record = chain
            .records
            .iter_mut()
            .find(|r| r.sequence == sequence)
            .unwrap();
        mutate(record);
    }

    #[cfg(test)]
    fn remove_record(&self, experiment_id: Uuid, sequence: u64) {
        let chain = self.chains.get(&experiment_id).unwrap().clone();
        let mut chain = chain.lock();
        chain.records.retain(|r| r.sequence != sequence);
    }
}

/// Outcome of one named verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl IntegrityCheck {
    fn new(name: &str, passed: bool, detail: String) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail,
        }
    }
}

/// Result of verifying an experiment's decision chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub experiment_id: Uuid,
    pub total_records: u64,
    /// Hashes, links, and sequences all check out.
    pub chain_intact: bool,
    /// Chain intact and every conversion follows its decision.
    pub is_fair: bool,
    pub checks: Vec<IntegrityCheck>,
    pub invalid_sequences: Vec<u64>,
    pub verified_at: DateTime<Utc>,
}

fn canonical_content(
    sequence: u64,
    user_id: &str,
    variant_id: Uuid,
    segment_key: &str,
    decided_at: DateTime<Utc>,
    previous_hash: &str,
) -> String {
    format!(
        "{sequence}:{user_id}:{variant_id}:{segment_key}:{}:{previous_hash}",
        decided_at.to_rfc3339()
    )
}

/// Compute SHA-256 hex digest.
fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
