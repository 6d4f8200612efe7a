//! The `Model` trait is the pipeline's only window into a compiled network
//! artifact. The pipeline never inspects weights; it only reads declared
//! input/output names and shapes and calls `predict`. Everything about how
//! an artifact is actually compiled, scheduled on an accelerator, or paged
//! in from disk is outside this crate (spec §1, "out of scope").

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use candle_core::Tensor;
use serde_json::Value;

/// One declared axis of a tensor. `None` marks a dynamic axis.
pub type Dim = Option<usize>;

/// Declared shape and element type of one named model input or output.
#[derive(Debug, Clone)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<Dim>,
    pub dtype: candle_core::DType,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: Vec<Dim>, dtype: candle_core::DType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }

    /// The last axis, the one the pipeline's configuration probes read
    /// (spec §4.2) for `input_length` and `vocab_size`. `cache_length` is
    /// instead the second-to-last axis of a cache tensor's shape `[cache_length,
    /// kv_width]` (spec §3); see `PipelineConfig::infer`.
    pub fn last_dim(&self) -> Option<usize> {
        self.shape.last().copied().flatten()
    }
}

/// One callable entry point of a fragment. A single-function fragment
/// exposes exactly one; a multi-function block-chunk fragment (spec §3,
/// "Multi-function fragment") exposes two sharing the same weights.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl EntryPoint {
    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|s| s.name == name)
    }
}

/// Name of the sole entry point of a single-function fragment.
pub const DEFAULT_ENTRY: &str = "default";
/// Name of a multi-function block's batch-prefill entry point.
pub const PREFILL_ENTRY: &str = "prefill";
/// Name of a multi-function block's single-token entry point.
pub const GENERATE_ENTRY: &str = "generate";

/// A named bag of tensors passed across a `predict` boundary.
pub type TensorMap = HashMap<String, Tensor>;

/// Opaque handle to one compiled network artifact.
///
/// Implementations own the underlying accelerator resources; `load`/`unload`
/// form the lifecycle the pipeline drives explicitly (spec §3,
/// "Fragments are loaded eagerly on first use").
#[async_trait]
pub trait Model: fmt::Debug + Send + Sync {
    /// Stable identifier used in error messages and logs.
    fn name(&self) -> &str;

    /// The entry points this artifact declares.
    fn entry_points(&self) -> &[EntryPoint];

    /// Arbitrary fragment metadata (e.g. a declared padding token id),
    /// read from artifact side-car data. Empty for artifacts that declare
    /// none.
    fn metadata(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entry_points().iter().find(|e| e.name == name)
    }

    /// Instantiate accelerator-side resources for this artifact.
    async fn load(&mut self) -> anyhow::Result<()>;

    /// Release accelerator-side resources. Safe to call on an
    /// already-unloaded model.
    async fn unload(&mut self) -> anyhow::Result<()>;

    /// Run the named entry point against the given inputs.
    async fn predict(&self, entry: &str, inputs: &TensorMap) -> anyhow::Result<TensorMap>;
}
