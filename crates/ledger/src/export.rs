//! Audit trail export for offline review.

use serde::{Deserialize, Serialize};
use uplift_core::UpliftResult;

use crate::ledger::AuditRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
}

const CSV_HEADER: &str =
    "sequence,user_id,variant_id,segment_key,decided_at,converted_at,conversion_value,decision_hash,previous_hash";

/// Render an audit trail in the requested format.
///
/// CSV rows keep the chain fields verbatim so an exported trail can be
/// re-verified outside the service.
pub fn export_trail(records: &[AuditRecord], format: ExportFormat) -> UpliftResult<String> {
    match format {
        ExportFormat::Csv => Ok(to_csv(records)),
        ExportFormat::Json => Ok(serde_json::to_string_pretty(records)?),
    }
}

fn to_csv(records: &[AuditRecord]) -> String {
    let mut csv = String::from(CSV_HEADER);
    csv.push('\n');
    for record in records {
        let cells = [
            record.sequence.to_string(),
            quote(&record.user_id),
            record.variant_id.to_string(),
            quote(&record.segment_key),
            record.decided_at.to_rfc3339(),
            record
                .converted_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            record
                .conversion_value
                .map(|v| v.to_string())
                .unwrap_or_default(),
            record.decision_hash.clone(),
            record.previous_hash.clone(),
        ];
        csv.push_str(&cells.join(","));
        csv.push('\n');
    }
    csv
}

fn quote(cell: &str) -> String {
    format!("\"{}\"", cell.replace('"', "\"\""))
}
