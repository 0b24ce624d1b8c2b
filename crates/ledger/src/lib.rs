//! Tamper-evident allocation ledger: per-experiment hash chains over
//! every bandit decision, integrity verification, and trail export.

pub mod export;
pub mod ledger;

pub use export::{export_trail, ExportFormat};
pub use ledger::{AuditLedger, AuditRecord, IntegrityCheck, IntegrityReport};
