//! The orchestrator (spec §4.6, §5, §6): owns the fragment chain, the K/V
//! cache, the cache updater and logit sampler, and drives the
//! prefill-then-generate state machine behind a lazy `Prediction` stream.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_stream::try_stream;
use candle_core::{Device, Tensor};
use futures_core::Stream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheLayout, KvCache};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fragment::{BlockFragment, ModelFactory};
use crate::loader::{load_fragments, DiscoveredPipeline, LoadProgress};
use crate::model::{Model, TensorMap, DEFAULT_ENTRY};
use crate::sampler::{LogitSampler, SamplerState};

/// State machine of one decode session (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Prefill,
    Generate,
    Done,
    Cancelled,
    Failed,
}

/// Which entry-point variant of a multi-function block the current step
/// selects (spec §3, "Multi-function fragment").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Prefill,
    Generate,
}

/// One emitted token plus its timing and cumulative id sequence (spec §3,
/// "Prediction record").
#[derive(Debug, Clone)]
pub struct Prediction {
    pub new_token: u32,
    pub all_tokens: Vec<u32>,
    pub latency_ms: f64,
    pub prompt_latency_ms: Option<f64>,
}

fn duration_ms(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// A boxed `Prediction` stream, as returned by `Pipeline::predict`.
pub type PredictionStream<'a> = Pin<Box<dyn Stream<Item = Result<Prediction, PipelineError>> + Send + 'a>>;

/// Convenience adapters over a raw `Prediction` stream (spec §4.6's
/// stream contract, plus the id-level composability a caller driving
/// `Pipeline::predict` directly — without the text layer in
/// `generator.rs` — otherwise has to hand-roll).
pub trait PredictionStreamExt<'a> {
    /// Truncate the stream right after the first prediction whose
    /// `new_token` equals `eos`, inclusive. Useful when a caller wants to
    /// stop on an eos id different from the one the fragment set declared
    /// (the pipeline's own generate loop already stops on its declared
    /// `eos_token_id`; this is for composing with a caller-chosen one, or
    /// for post-processing a stream captured before the pipeline's own
    /// cutoff took effect).
    fn take_until_eos(self, eos: u32) -> PredictionStream<'a>;
}

impl<'a, S> PredictionStreamExt<'a> for S
where
    S: Stream<Item = Result<Prediction, PipelineError>> + Send + 'a,
{
    fn take_until_eos(self, eos: u32) -> PredictionStream<'a> {
        let mut stream: PredictionStream<'a> = Box::pin(self);
        Box::pin(try_stream! {
            use futures_util::StreamExt;
            while let Some(item) = stream.next().await {
                let prediction = item?;
                let done = prediction.new_token == eos;
                yield prediction;
                if done {
                    break;
                }
            }
        })
    }
}

/// Split `ids` into fixed-size `input_length` chunks, right-padding the
/// final chunk with `pad` (spec §4.6, "left-padding or right-truncating the
/// final chunk"; this implementation right-pads so that, mirroring the
/// cache buffer's own `[0, t)` valid / `[t, len)` empty convention, real
/// tokens occupy the front of every chunk — see DESIGN.md). Returns each
/// padded chunk together with its actual, pre-padding length.
fn chunk_prompt(ids: &[u32], input_length: usize, pad: u32) -> Vec<(Vec<u32>, usize)> {
    if ids.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < ids.len() {
        let end = (offset + input_length).min(ids.len());
        let actual = end - offset;
        let mut chunk = ids[offset..end].to_vec();
        chunk.resize(input_length, pad);
        chunks.push((chunk, actual));
        offset = end;
    }
    chunks
}

fn read_u32_metadata(model: &dyn Model, key: &str) -> Option<u32> {
    model
        .metadata()
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
}

/// Dispatch one layer's cache-update call to a background task, returning
/// immediately (spec §4.4, "the updater call is dispatched asynchronously").
fn issue_cache_update(
    updater: Arc<dyn Model>,
    layer: usize,
    k_cache: Tensor,
    v_cache: Tensor,
    k_new: Tensor,
    v_new: Tensor,
    cache_offset: usize,
) -> JoinHandle<Result<(usize, Tensor, Tensor), PipelineError>> {
    tokio::spawn(async move {
        let offset = Tensor::new(cache_offset as u32, k_cache.device())
            .map_err(|e| PipelineError::inference_failed(updater.name().to_string(), e))?;

        let mut inputs = TensorMap::new();
        inputs.insert("k_cache".to_string(), k_cache);
        inputs.insert("v_cache".to_string(), v_cache);
        inputs.insert("k_new".to_string(), k_new);
        inputs.insert("v_new".to_string(), v_new);
        inputs.insert("cache_offset".to_string(), offset);

        let outputs = updater
            .predict(DEFAULT_ENTRY, &inputs)
            .await
            .map_err(|e| PipelineError::inference_failed(updater.name().to_string(), e))?;

        let k = outputs.get("k_cache").cloned().ok_or_else(|| {
            PipelineError::inference_failed(
                updater.name().to_string(),
                anyhow::anyhow!("cache updater did not produce a k_cache output"),
            )
        })?;
        let v = outputs.get("v_cache").cloned().ok_or_else(|| {
            PipelineError::inference_failed(
                updater.name().to_string(),
                anyhow::anyhow!("cache updater did not produce a v_cache output"),
            )
        })?;
        Ok((layer, k, v))
    })
}

/// The orchestrator. See module docs.
#[derive(Debug)]
pub struct Pipeline {
    blocks: Vec<BlockFragment>,
    cache: KvCache,
    cache_updater: Arc<dyn Model>,
    logit_sampler: LogitSampler,
    config: PipelineConfig,
    device: Device,
    state: PipelineState,
    cancel: CancellationToken,
    pad_token_id: u32,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
}

impl Pipeline {
    /// Discover and load a complete fragment set at `dir` and bring up a
    /// fresh, `Idle` pipeline (spec §4.1, §4.2, §4.3).
    pub async fn load(
        dir: &std::path::Path,
        prefix: Option<&str>,
        factory: &dyn ModelFactory,
        device: Device,
        on_progress: impl FnMut(LoadProgress),
    ) -> Result<Self, PipelineError> {
        let DiscoveredPipeline {
            blocks,
            cache_updater,
            logit_sampler,
        } = load_fragments(dir, prefix, factory, on_progress).await?;

        let config = PipelineConfig::infer(&blocks)?;

        let embeddings_block = blocks
            .iter()
            .find(|b| b.has_embeddings)
            .expect("PipelineConfig::infer already validated an embeddings block exists");

        let pad_token_id = read_u32_metadata(embeddings_block.model.as_ref(), "pad_token_id")
            .unwrap_or_else(|| {
                log::warn!(
                    "fragment {} declares no pad_token_id metadata, defaulting to 0",
                    embeddings_block.id
                );
                0
            });
        let bos_token_id = read_u32_metadata(embeddings_block.model.as_ref(), "bos_token_id");
        let eos_token_id = read_u32_metadata(embeddings_block.model.as_ref(), "eos_token_id");

        let layout = CacheLayout {
            num_layers: config.num_layers,
            cache_length: config.cache_length,
            kv_width: config.kv_width,
            dtype: config.kv_dtype,
        };
        let cache = KvCache::allocate(layout, &device)
            .map_err(|cause| PipelineError::load_failed("kv-cache", cause))?;

        Ok(Self {
            blocks,
            cache,
            cache_updater: Arc::from(cache_updater),
            logit_sampler: LogitSampler::new(logit_sampler),
            config,
            device,
            state: PipelineState::Idle,
            cancel: CancellationToken::new(),
            pad_token_id,
            bos_token_id,
            eos_token_id,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// A handle the caller can use to cancel an in-flight `predict` stream
    /// from another task (spec §5, "Cancelling the consumer").
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Clear the K/V cache, reset the cursor, and return to `Idle` (spec
    /// §6, `reset()`).
    pub fn reset(&mut self) -> anyhow::Result<()> {
        self.cache.clear(&self.device)?;
        self.cancel = CancellationToken::new();
        self.state = PipelineState::Idle;
        Ok(())
    }

    /// Run the full fragment chain once for one step, dispatching async
    /// cache updates and awaiting them before returning (spec §4.4, §5:
    /// updates must complete before the *next* step, not before sampling).
    /// Returns the LM-head fragment's logits, if it produced any this step.
    async fn run_step(
        &mut self,
        phase: PipelinePhase,
        input_tensor: &Tensor,
        cache_offset: usize,
    ) -> Result<Option<Tensor>, PipelineError> {
        let mut hidden: Option<Tensor> = None;
        let mut logits: Option<Tensor> = None;
        let mut handles = Vec::new();

        for block in &self.blocks {
            let entry_name = block.entry_for_phase(phase).to_string();

            let mut inputs = TensorMap::new();
            if block.has_embeddings {
                inputs.insert("input_ids".to_string(), input_tensor.clone());
            } else {
                let hidden_in = hidden.clone().ok_or_else(|| {
                    PipelineError::inference_failed(
                        block.id.clone(),
                        anyhow::anyhow!("no hidden state available from a preceding block"),
                    )
                })?;
                inputs.insert("hidden_in".to_string(), hidden_in);
            }

            for layer in block.layer_range.iter() {
                inputs.insert(format!("k_cache_{layer}"), self.cache.key_tensor(layer).clone());
                inputs.insert(format!("v_cache_{layer}"), self.cache.value_tensor(layer).clone());
            }
            let offset_tensor = Tensor::new(cache_offset as u32, &self.device)
                .map_err(|e| PipelineError::inference_failed(block.id.clone(), e))?;
            inputs.insert("cache_offset".to_string(), offset_tensor);

            let outputs = block
                .model
                .predict(&entry_name, &inputs)
                .await
                .map_err(|cause| PipelineError::inference_failed(block.id.clone(), cause))?;

            hidden = outputs.get("hidden_out").cloned();

            for layer in block.layer_range.iter() {
                let k_new = outputs.get(&format!("k_new_{layer}")).cloned().ok_or_else(|| {
                    PipelineError::inference_failed(
                        block.id.clone(),
                        anyhow::anyhow!("fragment did not produce a k_new_{layer} output"),
                    )
                })?;
                let v_new = outputs.get(&format!("v_new_{layer}")).cloned().ok_or_else(|| {
                    PipelineError::inference_failed(
                        block.id.clone(),
                        anyhow::anyhow!("fragment did not produce a v_new_{layer} output"),
                    )
                })?;
                handles.push(issue_cache_update(
                    self.cache_updater.clone(),
                    layer,
                    self.cache.key_tensor(layer).clone(),
                    self.cache.value_tensor(layer).clone(),
                    k_new,
                    v_new,
                    cache_offset,
                ));
            }

            if block.has_lm_head {
                logits = outputs
                    .get("logits")
                    .or_else(|| outputs.get("logits_0"))
                    .cloned();
            }
        }

        for handle in handles {
            let (layer, k, v) = handle
                .await
                .map_err(|e| PipelineError::inference_failed("cache-updater", anyhow::anyhow!(e)))??;
            self.cache.publish(layer, k, v);
        }

        Ok(logits)
    }

    /// `predict(prompt_ids, max_new_tokens) → stream<Prediction>` (spec
    /// §4.6, §6). Borrows `self` for the stream's lifetime; the stream must
    /// be fully drained or dropped before the pipeline can be used again.
    pub fn predict<'a>(&'a mut self, prompt_ids: Vec<u32>, max_new_tokens: usize) -> PredictionStream<'a> {
        Box::pin(try_stream! {
            if self.state != PipelineState::Idle {
                self.state = PipelineState::Failed;
                Err(PipelineError::inference_failed(
                    "pipeline",
                    anyhow::anyhow!("predict called while pipeline is not idle (state = {:?})", self.state),
                ))?;
            }
            self.state = PipelineState::Prefill;

            let mut all_tokens = prompt_ids.clone();

            let priming_ids: Vec<u32> = if prompt_ids.is_empty() {
                let bos = self.bos_token_id.ok_or_else(|| {
                    PipelineError::ManifestMalformed(
                        "empty prompt requires a declared bos_token_id".to_string(),
                    )
                }).map_err(|e| { self.state = PipelineState::Failed; e })?;
                vec![bos]
            } else {
                prompt_ids
            };

            let chunks = chunk_prompt(&priming_ids, self.config.input_length, self.pad_token_id);
            let num_chunks = chunks.len();
            let mut final_logits: Option<Tensor> = None;

            for (idx, (chunk, actual_len)) in chunks.into_iter().enumerate() {
                if self.cancel.is_cancelled() {
                    self.state = PipelineState::Cancelled;
                    Err(PipelineError::Cancelled)?;
                }

                let ids_tensor = Tensor::new(chunk.as_slice(), &self.device)
                    .map_err(|e| PipelineError::inference_failed("pipeline", e))
                    .map_err(|e| { self.state = PipelineState::Failed; e })?;
                let cache_offset = self.cache.cursor();

                let logits = self
                    .run_step(PipelinePhase::Prefill, &ids_tensor, cache_offset)
                    .await
                    .map_err(|e| { self.state = PipelineState::Failed; e })?;

                self.cache
                    .reserve(actual_len)
                    .map_err(|e| { self.state = PipelineState::Failed; e })?;

                if idx + 1 == num_chunks {
                    final_logits = logits;
                }
            }

            if max_new_tokens == 0 {
                self.state = PipelineState::Done;
                return;
            }

            let prompt_start = Instant::now();
            let logits = final_logits.ok_or_else(|| {
                PipelineError::inference_failed(
                    "pipeline",
                    anyhow::anyhow!("LM-head fragment produced no logits after the final prefill chunk"),
                )
            }).map_err(|e| { self.state = PipelineState::Failed; e })?;

            let (mut last_token, mut sampler_state) = self
                .logit_sampler
                .sample(logits, SamplerState::default())
                .await
                .map_err(|e| { self.state = PipelineState::Failed; e })?;

            let prompt_latency_ms = duration_ms(prompt_start.elapsed());
            all_tokens.push(last_token);
            let mut emitted = 1usize;

            yield Prediction {
                new_token: last_token,
                all_tokens: all_tokens.clone(),
                latency_ms: prompt_latency_ms,
                prompt_latency_ms: Some(prompt_latency_ms),
            };

            self.state = PipelineState::Generate;

            loop {
                if Some(last_token) == self.eos_token_id {
                    break;
                }
                if emitted >= max_new_tokens {
                    break;
                }
                if self.cancel.is_cancelled() {
                    self.state = PipelineState::Cancelled;
                    Err(PipelineError::Cancelled)?;
                }

                let step_start = Instant::now();
                let ids_tensor = Tensor::new(&[last_token], &self.device)
                    .map_err(|e| PipelineError::inference_failed("pipeline", e))
                    .map_err(|e| { self.state = PipelineState::Failed; e })?;
                let cache_offset = self.cache.cursor();

                let logits = self
                    .run_step(PipelinePhase::Generate, &ids_tensor, cache_offset)
                    .await
                    .map_err(|e| { self.state = PipelineState::Failed; e })?
                    .ok_or_else(|| {
                        PipelineError::inference_failed(
                            "pipeline",
                            anyhow::anyhow!("LM-head fragment produced no logits"),
                        )
                    })
                    .map_err(|e| { self.state = PipelineState::Failed; e })?;

                self.cache
                    .reserve(1)
                    .map_err(|e| { self.state = PipelineState::Failed; e })?;

                let (token, next_state) = self
                    .logit_sampler
                    .sample(logits, sampler_state)
                    .await
                    .map_err(|e| { self.state = PipelineState::Failed; e })?;
                sampler_state = next_state;

                let latency_ms = duration_ms(step_start.elapsed());
                all_tokens.push(token);
                emitted += 1;
                last_token = token;

                yield Prediction {
                    new_token: token,
                    all_tokens: all_tokens.clone(),
                    latency_ms,
                    prompt_latency_ms: None,
                };
            }

            self.state = PipelineState::Done;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::LayerRange;
    use crate::model::{EntryPoint, TensorSpec, DEFAULT_ENTRY};
    use async_trait::async_trait;
    use candle_core::DType;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::HashMap;

    /// A fake block fragment: forwards a constant hidden state, stamps its
    /// own k_new/v_new with `cache_offset` so tests can assert on cache
    /// writes, and optionally emits rising logits so argmax always selects
    /// `next_token = step index`.
    #[derive(Debug)]
    struct FakeBlock {
        entries: Vec<EntryPoint>,
        vocab_size: usize,
        emits_logits: bool,
        metadata: HashMap<String, serde_json::Value>,
    }

    #[async_trait]
    impl Model for FakeBlock {
        fn name(&self) -> &str {
            "fake-block"
        }
        fn entry_points(&self) -> &[EntryPoint] {
            &self.entries
        }
        fn metadata(&self) -> HashMap<String, serde_json::Value> {
            self.metadata.clone()
        }
        async fn load(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn unload(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn predict(&self, _entry: &str, inputs: &TensorMap) -> anyhow::Result<TensorMap> {
            let device = Device::Cpu;
            let mut outputs = TensorMap::new();
            outputs.insert("hidden_out".to_string(), Tensor::zeros((1, 4), DType::F32, &device)?);
            outputs.insert("k_new_0".to_string(), Tensor::ones((1, 4), DType::F32, &device)?);
            outputs.insert("v_new_0".to_string(), Tensor::ones((1, 4), DType::F32, &device)?);
            if self.emits_logits {
                let offset = inputs
                    .get("cache_offset")
                    .unwrap()
                    .to_dtype(DType::F32)?
                    .to_scalar::<f32>()?;
                let mut row = vec![0f32; self.vocab_size];
                let pick = (offset as usize + 1).min(self.vocab_size - 1);
                row[pick] = 10.0;
                outputs.insert(
                    "logits".to_string(),
                    Tensor::from_vec(row, (1, self.vocab_size), &device)?,
                );
            }
            Ok(outputs)
        }
    }

    fn single_layer_pipeline(vocab: usize, input_length: usize, cache_length: usize) -> Pipeline {
        let embeddings_entry = EntryPoint {
            name: DEFAULT_ENTRY.to_string(),
            inputs: vec![
                TensorSpec::new("input_ids", vec![Some(input_length)], DType::U32),
                TensorSpec::new("k_cache_0", vec![Some(cache_length), Some(4)], DType::F32),
                TensorSpec::new("v_cache_0", vec![Some(cache_length), Some(4)], DType::F32),
            ],
            outputs: vec![
                TensorSpec::new("hidden_out", vec![Some(input_length), Some(4)], DType::F32),
                TensorSpec::new("k_new_0", vec![Some(1), Some(4)], DType::F32),
                TensorSpec::new("v_new_0", vec![Some(1), Some(4)], DType::F32),
                TensorSpec::new("logits", vec![Some(1), Some(vocab)], DType::F32),
            ],
        };
        let mut metadata = HashMap::new();
        metadata.insert("pad_token_id".to_string(), json!(0));
        metadata.insert("bos_token_id".to_string(), json!(1));
        let block = BlockFragment {
            id: "block0".to_string(),
            layer_range: LayerRange::new(0, 1),
            has_embeddings: true,
            has_lm_head: true,
            generate_entry: DEFAULT_ENTRY.to_string(),
            model: Box::new(FakeBlock {
                entries: vec![embeddings_entry],
                vocab_size: vocab,
                emits_logits: true,
                metadata,
            }),
        };

        let updater_entry = EntryPoint {
            name: DEFAULT_ENTRY.to_string(),
            inputs: vec![],
            outputs: vec![],
        };
        let cache_updater: Box<dyn Model> = Box::new(PassthroughUpdater {
            entries: vec![updater_entry],
        });

        let logit_sampler: Box<dyn Model> = Box::new(crate::sampler::ArgmaxSamplerModel::new(vocab));

        let config = PipelineConfig::infer(std::slice::from_ref(&block)).unwrap();
        let layout = CacheLayout {
            num_layers: config.num_layers,
            cache_length: config.cache_length,
            kv_width: config.kv_width,
            dtype: config.kv_dtype,
        };
        let cache = KvCache::allocate(layout, &Device::Cpu).unwrap();

        Pipeline {
            blocks: vec![block],
            cache,
            cache_updater: Arc::from(cache_updater),
            logit_sampler: LogitSampler::new(logit_sampler),
            config,
            device: Device::Cpu,
            state: PipelineState::Idle,
            cancel: CancellationToken::new(),
            pad_token_id: 0,
            bos_token_id: Some(1),
            eos_token_id: None,
        }
    }

    #[derive(Debug)]
    struct PassthroughUpdater {
        entries: Vec<EntryPoint>,
    }

    #[async_trait]
    impl Model for PassthroughUpdater {
        fn name(&self) -> &str {
            "passthrough-updater"
        }
        fn entry_points(&self) -> &[EntryPoint] {
            &self.entries
        }
        async fn load(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn unload(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn predict(&self, _entry: &str, inputs: &TensorMap) -> anyhow::Result<TensorMap> {
            let mut outputs = TensorMap::new();
            outputs.insert("k_cache".to_string(), inputs.get("k_new").unwrap().clone());
            outputs.insert("v_cache".to_string(), inputs.get("v_new").unwrap().clone());
            Ok(outputs)
        }
    }

    #[tokio::test]
    async fn happy_path_emits_requested_token_count_and_advances_cursor() {
        let mut pipeline = single_layer_pipeline(32000, 64, 1024 - 64);
        let stream = pipeline.predict(vec![1, 2, 3], 5);
        let predictions: Vec<_> = stream.collect().await;
        assert_eq!(predictions.len(), 5);
        for (i, p) in predictions.iter().enumerate() {
            let p = p.as_ref().unwrap();
            assert_eq!(p.all_tokens.len(), 3 + i + 1);
        }
        assert!(predictions[0].as_ref().unwrap().prompt_latency_ms.is_some());
        assert!(predictions[1].as_ref().unwrap().prompt_latency_ms.is_none());
        assert_eq!(pipeline.cache.cursor(), 8);
        assert_eq!(pipeline.state(), PipelineState::Done);
    }

    #[tokio::test]
    async fn take_until_eos_truncates_after_the_matching_token_inclusive() {
        let mut pipeline = single_layer_pipeline(32000, 64, 1024 - 64);
        let stream = pipeline.predict(vec![1, 2, 3], 5).take_until_eos(6);
        let predictions: Vec<_> = stream.collect().await;
        let tokens: Vec<u32> = predictions.into_iter().map(|p| p.unwrap().new_token).collect();
        assert_eq!(tokens, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn zero_max_new_tokens_yields_empty_stream() {
        let mut pipeline = single_layer_pipeline(32000, 64, 1024 - 64);
        let stream = pipeline.predict(vec![1, 2, 3], 0);
        let predictions: Vec<_> = stream.collect().await;
        assert!(predictions.is_empty());
        assert_eq!(pipeline.state(), PipelineState::Done);
    }

    #[tokio::test]
    async fn context_overflow_terminates_stream_with_already_emitted_tokens_valid() {
        let mut pipeline = single_layer_pipeline(32000, 1, 2);
        let stream = pipeline.predict(vec![1], 10);
        let predictions: Vec<_> = stream.collect().await;
        let (oks, errs): (Vec<_>, Vec<_>) = predictions.into_iter().partition(|p| p.is_ok());
        assert!(!oks.is_empty());
        assert!(matches!(
            errs.last().unwrap().as_ref().unwrap_err(),
            PipelineError::ContextOverflow { .. }
        ));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn predict_without_reset_after_failure_is_rejected() {
        let mut pipeline = single_layer_pipeline(32000, 1, 1);
        let _: Vec<_> = pipeline.predict(vec![1], 10).collect().await;
        assert_eq!(pipeline.state(), PipelineState::Failed);

        let second: Vec<_> = pipeline.predict(vec![1], 1).collect().await;
        assert!(second[0].is_err());

        pipeline.reset().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn cancellation_closes_stream_and_requires_reset() {
        let mut pipeline = single_layer_pipeline(32000, 1, 64);
        let token = pipeline.cancellation_token();
        let mut stream = pipeline.predict(vec![1], 100);
        let first = stream.next().await.unwrap();
        assert!(first.is_ok());
        token.cancel();
        let rest: Vec<_> = stream.collect().await;
        assert!(matches!(rest.last().unwrap(), Err(PipelineError::Cancelled)));
    }
}
