//! The logit sampler (spec §4.5): turns the final hidden state / logits
//! into exactly one selected token id, threading an opaque sampler-state
//! value across steps so richer policies (temperature, top-p, top-k) can
//! land later without a pipeline change (spec §9, "Open questions").

use candle_core::Tensor;

use crate::error::PipelineError;
use crate::model::{Model, TensorMap, DEFAULT_ENTRY};

/// Opaque state threaded between sampler calls. The pipeline never
/// inspects its contents; it only owns it by value and passes it back on
/// the next call (spec §4.5, §5 "The sampler state is owned by the
/// pipeline and passed by value").
#[derive(Debug, Clone, Default)]
pub struct SamplerState(pub Option<Tensor>);

/// Wraps the compiled logit-sampler fragment.
#[derive(Debug)]
pub struct LogitSampler {
    model: Box<dyn Model>,
}

impl LogitSampler {
    pub fn new(model: Box<dyn Model>) -> Self {
        Self { model }
    }

    /// Select one token id from `logits`, returning the updated sampler
    /// state to thread into the next call.
    pub async fn sample(
        &self,
        logits: Tensor,
        state: SamplerState,
    ) -> Result<(u32, SamplerState), PipelineError> {
        let mut inputs = TensorMap::new();
        inputs.insert("logits".to_string(), logits);
        if let Some(state_tensor) = state.0 {
            inputs.insert("sampler_state".to_string(), state_tensor);
        }

        let outputs = self
            .model
            .predict(DEFAULT_ENTRY, &inputs)
            .await
            .map_err(|cause| PipelineError::inference_failed(self.model.name().to_string(), cause))?;

        let next_token_tensor = outputs.get("next_token").ok_or_else(|| {
            PipelineError::inference_failed(
                self.model.name().to_string(),
                anyhow::anyhow!("logit sampler did not produce a next_token output"),
            )
        })?;

        let token_id = tensor_to_u32(next_token_tensor)
            .map_err(|cause| PipelineError::inference_failed(self.model.name().to_string(), cause))?;

        let new_state = SamplerState(outputs.get("sampler_state").cloned());
        Ok((token_id, new_state))
    }
}

fn tensor_to_u32(t: &Tensor) -> anyhow::Result<u32> {
    let scalar = t.to_dtype(candle_core::DType::U32)?.flatten_all()?;
    let values = scalar.to_vec1::<u32>()?;
    values
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("next_token tensor was empty"))
}

/// A reference argmax implementation of the logit-sampler role, usable as
/// the default fragment when a pipeline is composed purely in-process
/// (e.g. in tests) rather than from a compiled artifact. Mirrors the
/// teacher's `create_logits_processor` / `LogitsProcessor::sample` usage.
#[derive(Debug)]
pub struct ArgmaxSamplerModel {
    entries: Vec<crate::model::EntryPoint>,
}

impl ArgmaxSamplerModel {
    pub fn new(vocab_size: usize) -> Self {
        use crate::model::{EntryPoint, TensorSpec};
        Self {
            entries: vec![EntryPoint {
                name: DEFAULT_ENTRY.to_string(),
                inputs: vec![TensorSpec::new(
                    "logits",
                    vec![Some(vocab_size)],
                    candle_core::DType::F32,
                )],
                outputs: vec![TensorSpec::new(
                    "next_token",
                    vec![Some(1)],
                    candle_core::DType::U32,
                )],
            }],
        }
    }
}

#[async_trait::async_trait]
impl Model for ArgmaxSamplerModel {
    fn name(&self) -> &str {
        "argmax-sampler"
    }

    fn entry_points(&self) -> &[crate::model::EntryPoint] {
        &self.entries
    }

    async fn load(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unload(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn predict(&self, _entry: &str, inputs: &TensorMap) -> anyhow::Result<TensorMap> {
        use candle_transformers::generation::{LogitsProcessor, Sampling};

        let logits = inputs
            .get("logits")
            .ok_or_else(|| anyhow::anyhow!("missing logits input"))?;
        let mut processor = LogitsProcessor::from_sampling(0, Sampling::ArgMax);
        let next_token = processor.sample(&logits.flatten_all()?.to_dtype(candle_core::DType::F32)?)?;

        let mut outputs = TensorMap::new();
        outputs.insert(
            "next_token".to_string(),
            Tensor::new(next_token, logits.device())?,
        );
        Ok(outputs)
    }
}
