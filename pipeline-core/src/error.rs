//! The error taxonomy of the pipeline, as distinct from the `anyhow::Error`
//! used internally by fragment plumbing. Structural errors abort `load`;
//! runtime errors terminate the active stream and move the pipeline to
//! `Failed`.

use thiserror::Error;

/// Errors produced by the pipeline's public surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fragment discovery could not assemble a complete, well-formed set.
    #[error("manifest malformed: {0}")]
    ManifestMalformed(String),

    /// Declared tensor shapes violate a configuration invariant.
    #[error("shape inconsistent: {0}")]
    ShapeInconsistent(String),

    /// A fragment could not be instantiated from disk.
    #[error("failed to load fragment {fragment_id}: {cause}")]
    LoadFailed {
        fragment_id: String,
        #[source]
        cause: anyhow::Error,
    },

    /// A fragment's `predict` call returned an error.
    #[error("inference failed in fragment {fragment_id}: {cause}")]
    InferenceFailed {
        fragment_id: String,
        #[source]
        cause: anyhow::Error,
    },

    /// The cache cursor would exceed the configured cache capacity.
    #[error("context overflow: cursor {cursor} would exceed cache capacity {capacity}")]
    ContextOverflow { cursor: usize, capacity: usize },

    /// The stream consumer cancelled generation.
    #[error("generation cancelled")]
    Cancelled,

    /// The text-generator layer could not obtain a usable tokenizer.
    #[error("tokenizer unavailable: {0}")]
    TokenizerUnavailable(String),
}

impl PipelineError {
    pub fn load_failed(fragment_id: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self::LoadFailed {
            fragment_id: fragment_id.into(),
            cause: cause.into(),
        }
    }

    pub fn inference_failed(fragment_id: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self::InferenceFailed {
            fragment_id: fragment_id.into(),
            cause: cause.into(),
        }
    }
}
