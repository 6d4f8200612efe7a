//! This is the core library where all pipeline logic is implemented.

pub mod cache;
pub mod config;
pub mod error;
pub mod fragment;
pub mod generator;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod sampler;

pub use cache::{CacheLayout, KvCache};
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use fragment::{BlockFragment, LayerRange, ModelFactory};
pub use generator::{HfTokenizer, TextGenerator, TextPrediction, Tokenizer};
pub use loader::{load_fragments, DiscoveredPipeline, LoadProgress};
pub use model::{Dim, EntryPoint, Model, TensorMap, TensorSpec};
pub use pipeline::{
    Pipeline, PipelinePhase, PipelineState, Prediction, PredictionStream, PredictionStreamExt,
};
pub use sampler::{ArgmaxSamplerModel, LogitSampler, SamplerState};
