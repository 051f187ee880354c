//! Typed request metadata.
//!
//! Every request carries a metadata bag: a typed key -> value store with a
//! closed key set. The bag has its own internal lock so that stages and the
//! submitting thread can read and write it concurrently; writes are
//! last-write-wins.

use std::collections::HashMap;
use std::sync::Mutex;

/// Closed set of metadata keys.
///
/// The `Enable*` keys are the per-stage enable flags read by
/// [`DecisionPolicy`](crate::policy); the remaining keys are stage
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    /// Enable the HDR merge stage.
    EnableHdr,
    /// Enable the bokeh (synthetic depth-of-field) stage.
    EnableBokeh,
    /// Enable the watermark overlay stage.
    EnableWatermark,
    /// Enable the Mandelbrot render stage.
    EnableMandelbrot,
    /// Enable the Sobel edge-filter stage.
    EnableSobel,
    /// Enable the JPEG encode stage.
    EnableJpegEncode,
    /// Enable the lens-distortion correction stage.
    EnableLensCorrection,
    /// JPEG encode quality, 1-100.
    JpegQuality,
    /// Watermark opacity, 0.0-1.0.
    WatermarkOpacity,
    /// HDR exposure gain multiplier.
    HdrGain,
}

/// Possible values for metadata fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetaValue {
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
}

/// Thread-safe metadata bag with last-write-wins semantics.
#[derive(Debug, Default)]
pub struct Metadata {
    fields: Mutex<HashMap<MetaKey, MetaValue>>,
}

impl Metadata {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous value for the key.
    pub fn set(&self, key: MetaKey, value: MetaValue) {
        self.fields.lock().unwrap().insert(key, value);
    }

    /// Get the value for a key, if present.
    pub fn get(&self, key: MetaKey) -> Option<MetaValue> {
        self.fields.lock().unwrap().get(&key).copied()
    }

    /// Get a boolean value; `None` if absent or a different type.
    pub fn get_bool(&self, key: MetaKey) -> Option<bool> {
        match self.get(key) {
            Some(MetaValue::Bool(b)) => Some(b),
            _ => None,
        }
    }

    /// Get an integer value; `None` if absent or a different type.
    pub fn get_int(&self, key: MetaKey) -> Option<i64> {
        match self.get(key) {
            Some(MetaValue::Int(i)) => Some(i),
            _ => None,
        }
    }

    /// Get a float value; `None` if absent or a different type.
    pub fn get_float(&self, key: MetaKey) -> Option<f64> {
        match self.get(key) {
            Some(MetaValue::Float(f)) => Some(f),
            _ => None,
        }
    }

    /// Builder-style set, for constructing request metadata inline.
    pub fn with(self, key: MetaKey, value: MetaValue) -> Self {
        self.set(key, value);
        self
    }

    /// Number of fields currently set.
    pub fn len(&self) -> usize {
        self.fields.lock().unwrap().len()
    }

    /// Check if no fields are set.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let meta = Metadata::new();
        meta.set(MetaKey::JpegQuality, MetaValue::Int(80));
        meta.set(MetaKey::JpegQuality, MetaValue::Int(95));
        assert_eq!(meta.get_int(MetaKey::JpegQuality), Some(95));
    }

    #[test]
    fn test_typed_accessors() {
        let meta = Metadata::new()
            .with(MetaKey::EnableSobel, MetaValue::Bool(true))
            .with(MetaKey::WatermarkOpacity, MetaValue::Float(0.5));

        assert_eq!(meta.get_bool(MetaKey::EnableSobel), Some(true));
        assert_eq!(meta.get_float(MetaKey::WatermarkOpacity), Some(0.5));
        // Type mismatch yields None, not a panic.
        assert_eq!(meta.get_int(MetaKey::EnableSobel), None);
        assert_eq!(meta.get_bool(MetaKey::EnableHdr), None);
    }

    #[test]
    fn test_concurrent_writes() {
        use std::sync::Arc;
        let meta = Arc::new(Metadata::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let meta = Arc::clone(&meta);
                std::thread::spawn(move || {
                    meta.set(MetaKey::HdrGain, MetaValue::Float(i as f64));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(meta.get_float(MetaKey::HdrGain).is_some());
    }
}
