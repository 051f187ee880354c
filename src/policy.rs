//! Decision policy: derive a pipeline's stage list from request metadata.
//!
//! The mapping is pure. Each stage has one boolean enable key; the output
//! list is always in canonical ascending-id order, which is also the order
//! the stages execute in. The same metadata always yields the same list.

use crate::metadata::Metadata;
use crate::stage::{StageKind, StageList};

/// Derive the ordered stage list enabled by `metadata`.
///
/// A missing or non-boolean enable key counts as disabled. An empty result
/// means the request asked for no processing at all; callers reject that
/// before building a pipeline.
pub fn stages_for(metadata: &Metadata) -> StageList {
    StageKind::ALL
        .into_iter()
        .filter(|kind| metadata.get_bool(kind.enable_key()).unwrap_or(false))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetaKey, MetaValue};

    #[test]
    fn test_empty_metadata_enables_nothing() {
        assert!(stages_for(&Metadata::new()).is_empty());
    }

    #[test]
    fn test_enabled_stages_in_canonical_order() {
        // Enable out of order; the derived list is ascending by stage id.
        let metadata = Metadata::new()
            .with(MetaKey::EnableSobel, MetaValue::Bool(true))
            .with(MetaKey::EnableHdr, MetaValue::Bool(true))
            .with(MetaKey::EnableWatermark, MetaValue::Bool(true));
        let stages = stages_for(&metadata);
        assert_eq!(
            stages.as_slice(),
            &[StageKind::Hdr, StageKind::Watermark, StageKind::Sobel]
        );
    }

    #[test]
    fn test_false_and_non_boolean_count_as_disabled() {
        let metadata = Metadata::new()
            .with(MetaKey::EnableHdr, MetaValue::Bool(false))
            .with(MetaKey::EnableBokeh, MetaValue::Int(1));
        assert!(stages_for(&metadata).is_empty());
    }

    #[test]
    fn test_pure_mapping_is_stable() {
        let metadata = Metadata::new()
            .with(MetaKey::EnableJpegEncode, MetaValue::Bool(true))
            .with(MetaKey::EnableMandelbrot, MetaValue::Bool(true));
        let first = stages_for(&metadata);
        let second = stages_for(&metadata);
        assert_eq!(first, second);
    }
}
