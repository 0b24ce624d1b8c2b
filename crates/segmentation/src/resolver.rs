//! Maps a visitor context onto the segment key that partitions an
//! experiment's posterior state.

use uplift_core::types::{SegmentationMode, VisitorContext, DEFAULT_SEGMENT};

/// Placeholder for a configured field the visitor did not supply.
const MISSING_VALUE: &str = "unknown";

/// Deterministic context-to-segment mapping.
///
/// The same context must always land in the same segment, so resolution
/// is pure: no clocks, no randomness, no stored state.
pub struct SegmentResolver;

impl SegmentResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, mode: &SegmentationMode, context: &VisitorContext) -> String {
        match mode {
            SegmentationMode::Disabled => DEFAULT_SEGMENT.to_string(),
            SegmentationMode::Manual { fields } => {
                if fields.is_empty() {
                    return DEFAULT_SEGMENT.to_string();
                }
                fields
                    .iter()
                    .map(|field| {
                        let value = context.field(field).unwrap_or(MISSING_VALUE);
                        format!("{field}:{value}")
                    })
                    .collect::<Vec<_>>()
                    .join("|")
            }
            SegmentationMode::Auto => match &context.cluster_id {
                Some(cluster) => format!("cluster:{cluster}"),
                None => DEFAULT_SEGMENT.to_string(),
            },
        }
    }
}

impl Default for SegmentResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(pairs: &[(&str, &str)]) -> VisitorContext {
        let mut context = VisitorContext::default();
        for (k, v) in pairs {
            context.fields.insert(k.to_string(), v.to_string());
        }
        context
    }

    #[test]
    fn test_disabled_mode_always_resolves_default() {
        let resolver = SegmentResolver::new();
        let context = context_with(&[("source", "instagram")]);
        assert_eq!(
            resolver.resolve(&SegmentationMode::Disabled, &context),
            "default"
        );
    }

    #[test]
    fn test_manual_mode_joins_fields_in_configured_order() {
        let resolver = SegmentResolver::new();
        let mode = SegmentationMode::Manual {
            fields: vec!["source".to_string(), "device".to_string()],
        };
        let context = context_with(&[("device", "mobile"), ("source", "instagram")]);
        assert_eq!(
            resolver.resolve(&mode, &context),
            "source:instagram|device:mobile"
        );
    }

    #[test]
    fn test_manual_mode_marks_missing_fields() {
        let resolver = SegmentResolver::new();
        let mode = SegmentationMode::Manual {
            fields: vec!["source".to_string(), "device".to_string()],
        };
        let context = context_with(&[("device", "mobile")]);
        assert_eq!(
            resolver.resolve(&mode, &context),
            "source:unknown|device:mobile"
        );
    }

    #[test]
    fn test_manual_mode_without_fields_falls_back_to_default() {
        let resolver = SegmentResolver::new();
        let mode = SegmentationMode::Manual { fields: vec![] };
        let context = context_with(&[("source", "instagram")]);
        assert_eq!(resolver.resolve(&mode, &context), "default");
    }

    #[test]
    fn test_auto_mode_uses_cluster_when_present() {
        let resolver = SegmentResolver::new();
        let mut context = VisitorContext::default();
        context.cluster_id = Some("c4".to_string());
        assert_eq!(resolver.resolve(&SegmentationMode::Auto, &context), "cluster:c4");
    }

    #[test]
    fn test_auto_mode_without_cluster_falls_back_to_default() {
        let resolver = SegmentResolver::new();
        let context = VisitorContext::default();
        assert_eq!(resolver.resolve(&SegmentationMode::Auto, &context), "default");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = SegmentResolver::new();
        let mode = SegmentationMode::Manual {
            fields: vec!["source".to_string()],
        };
        let context = context_with(&[("source", "email")]);
        let first = resolver.resolve(&mode, &context);
        let second = resolver.resolve(&mode, &context);
        assert_eq!(first, second);
    }
}
