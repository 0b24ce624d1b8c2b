//! Segment resolution: normalizes visitor contexts, maps them onto
//! segment keys, and keeps a read-through catalog of observed segments.

pub mod catalog;
pub mod context;
pub mod resolver;

pub use catalog::{describe_segment, SegmentCatalog, SegmentSummary};
pub use context::normalize_context;
pub use resolver::SegmentResolver;
