//! Error types for Prism.

use thiserror::Error;

/// Result type alias using Prism's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Prism operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An image buffer's payload does not match its declared geometry.
    #[error("invalid buffer size: expected {expected} bytes, got {actual}")]
    InvalidBufferSize {
        /// Required payload size for the declared format and dimensions.
        expected: usize,
        /// Actual payload size supplied.
        actual: usize,
    },

    /// A pipeline was configured with an empty stage list.
    #[error("empty stage list")]
    EmptyStageList,

    /// A stage id or name is not known to the registry.
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    /// An operation requires a configured pipeline.
    #[error("pipeline is not configured")]
    NotConfigured,

    /// The pipeline entered a terminal failure state.
    #[error("pipeline failed: {0}")]
    PipelineFailed(String),

    /// A stage reported a processing error.
    #[error("stage error: {0}")]
    Stage(String),

    /// Plugin loading failed.
    #[error(transparent)]
    Plugin(#[from] crate::plugin::PluginError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
