//! # Prism
//!
//! A pluggable, asynchronous image-processing pipeline runtime.
//!
//! Prism chains pluggable processing stages into pipelines, one pipeline
//! per distinct stage sequence, and runs each stage on its own worker
//! thread with an out-of-band deadline monitor. Results are delivered
//! asynchronously through a registered callback.
//!
//! ## Features
//!
//! - **Pluggable stages**: loaded from shared libraries through a
//!   three-symbol C ABI, or registered in-process as factories
//! - **Per-stage concurrency**: one FIFO work queue and worker thread per
//!   stage, with a per-stage timeout budget enforced out-of-band
//! - **Pipeline pooling**: a session reuses the pipeline for a stage
//!   sequence across requests
//! - **Admission control**: the façade refuses work while process memory
//!   stays over a ceiling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use prism::prelude::*;
//! use std::sync::Arc;
//!
//! let mut registry = StageRegistry::new();
//! unsafe { registry.load_plugins("/usr/lib/prism") };
//!
//! let interface = Interface::init(Arc::new(registry));
//! interface.register_result_callback(Arc::new(|request| {
//!     println!("request {} done", request.id());
//! }));
//!
//! let stages = policy::stages_for(request.metadata());
//! interface.process(request, &stages);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod error;
pub mod format;
pub mod interface;
pub mod metadata;
pub mod observability;
pub mod pipeline;
pub mod plugin;
pub mod policy;
pub mod request;
pub mod runtime;
pub mod session;
pub mod stage;
pub mod stages;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::ImageBuffer;
    pub use crate::error::{Error, Result};
    pub use crate::format::ImageFormat;
    pub use crate::interface::{Interface, StatusCode};
    pub use crate::metadata::{MetaKey, MetaValue, Metadata};
    pub use crate::pipeline::{Pipeline, PipelineState};
    pub use crate::plugin::StageRegistry;
    pub use crate::policy;
    pub use crate::request::Request;
    pub use crate::session::Session;
    pub use crate::stage::{ImageStage, StageKind, StageList};
}

pub use error::{Error, Result};
