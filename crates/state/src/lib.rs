//! Segment-partitioned posterior state: pluggable encryption codec and
//! the store holding one encrypted row per (variant, segment) pair.

pub mod codec;
pub mod store;

pub use codec::{AesGcmCodec, JsonCodec, StateCodec};
pub use store::SegmentStateStore;
