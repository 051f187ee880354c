//! Built-in stage implementations.
//!
//! Real processing stages (HDR, bokeh, JPEG encode, ...) live in plugin
//! libraries outside this crate; the stages here are harness implementations
//! used by tests and embedders.

pub mod testing;
