//! A stand-in `ModelFactory` for this binary. Production deployments
//! supply a factory backed by the target accelerator runtime (CoreML, ONNX
//! Runtime, ...); the compiled artifact format itself is outside
//! `pipeline-core`'s scope (spec §1). This one ignores file contents
//! entirely and derives a fragment's role and layer range from its
//! filename alone, so the CLI can be exercised end-to-end against a
//! directory of empty, appropriately-named placeholder files.

use std::ops::Range;
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use pipeline_core::{EntryPoint, Model, ModelFactory, TensorMap, TensorSpec};

pub struct DemoConfig {
    pub input_length: usize,
    pub cache_length: usize,
    pub vocab_size: usize,
    pub kv_width: usize,
    pub total_layers: usize,
    pub device: Device,
}

pub struct DemoModelFactory {
    pub config: DemoConfig,
}

impl ModelFactory for DemoModelFactory {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn Model>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("fragment path has no file name: {}", path.display()))?
            .to_ascii_lowercase();

        if name.contains("cache") {
            return Ok(Box::new(DemoCacheUpdater::new()));
        }
        if name.contains("logit") {
            return Ok(Box::new(pipeline_core::ArgmaxSamplerModel::new(
                self.config.vocab_size,
            )));
        }

        let range = parse_chunk_layer_range(&name, self.config.total_layers)?;
        let has_embeddings = range.start == 0;
        let has_lm_head = range.end == self.config.total_layers;
        Ok(Box::new(DemoBlock::new(&self.config, range, has_embeddings, has_lm_head)))
    }
}

fn parse_chunk_layer_range(name: &str, total_layers: usize) -> anyhow::Result<Range<usize>> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| regex::Regex::new(r"(?i)chunk_(\d+)of(\d+)").unwrap());
    let caps = pattern
        .captures(name)
        .ok_or_else(|| anyhow::anyhow!("{name:?} does not match the *_chunk_NNofMM.* convention"))?;
    let index: usize = caps[1].parse()?;
    let total: usize = caps[2].parse()?;
    if index == 0 || index > total || total == 0 {
        anyhow::bail!("{name:?} declares an out-of-range chunk index {index} of {total}");
    }
    let per_chunk = total_layers / total;
    let start = (index - 1) * per_chunk;
    let end = if index == total { total_layers } else { start + per_chunk };
    Ok(start..end)
}

/// A block fragment whose forward pass is a fixed, content-free stand-in:
/// zeroed hidden state, ones-valued new K/V slices, and (only for the
/// LM-head-bearing chunk) a logits row nudging argmax forward by one
/// position every call, so a CLI run visibly advances through the
/// vocabulary instead of looping on a single token.
#[derive(Debug)]
struct DemoBlock {
    entries: Vec<EntryPoint>,
    layer_range: Range<usize>,
    has_embeddings: bool,
    has_lm_head: bool,
    vocab_size: usize,
    kv_width: usize,
    device: Device,
}

impl DemoBlock {
    fn new(config: &DemoConfig, layer_range: Range<usize>, has_embeddings: bool, has_lm_head: bool) -> Self {
        let hidden = config.kv_width.max(1) * 4;
        let mut prefill_inputs = Vec::new();
        let mut generate_inputs = Vec::new();
        if has_embeddings {
            prefill_inputs.push(TensorSpec::new("input_ids", vec![Some(config.input_length)], DType::U32));
            generate_inputs.push(TensorSpec::new("input_ids", vec![Some(1)], DType::U32));
        } else {
            prefill_inputs.push(TensorSpec::new("hidden_in", vec![Some(config.input_length), Some(hidden)], DType::F32));
            generate_inputs.push(TensorSpec::new("hidden_in", vec![Some(1), Some(hidden)], DType::F32));
        }
        for layer in layer_range.clone() {
            for inputs in [&mut prefill_inputs, &mut generate_inputs] {
                inputs.push(TensorSpec::new(format!("k_cache_{layer}"), vec![Some(config.cache_length), Some(config.kv_width)], DType::F32));
                inputs.push(TensorSpec::new(format!("v_cache_{layer}"), vec![Some(config.cache_length), Some(config.kv_width)], DType::F32));
            }
        }
        let mut prefill_outputs = vec![TensorSpec::new("hidden_out", vec![Some(config.input_length), Some(hidden)], DType::F32)];
        let mut generate_outputs = vec![TensorSpec::new("hidden_out", vec![Some(1), Some(hidden)], DType::F32)];
        for layer in layer_range.clone() {
            for outputs in [&mut prefill_outputs, &mut generate_outputs] {
                outputs.push(TensorSpec::new(format!("k_new_{layer}"), vec![Some(1), Some(config.kv_width)], DType::F32));
                outputs.push(TensorSpec::new(format!("v_new_{layer}"), vec![Some(1), Some(config.kv_width)], DType::F32));
            }
        }
        if has_lm_head {
            for outputs in [&mut prefill_outputs, &mut generate_outputs] {
                outputs.push(TensorSpec::new("logits", vec![Some(1), Some(config.vocab_size)], DType::F32));
            }
        }

        let entries = vec![
            EntryPoint { name: pipeline_core::model::PREFILL_ENTRY.to_string(), inputs: prefill_inputs, outputs: prefill_outputs },
            EntryPoint { name: pipeline_core::model::GENERATE_ENTRY.to_string(), inputs: generate_inputs, outputs: generate_outputs },
        ];

        Self {
            entries,
            layer_range,
            has_embeddings,
            has_lm_head,
            vocab_size: config.vocab_size,
            kv_width: config.kv_width,
            device: config.device.clone(),
        }
    }
}

#[async_trait]
impl Model for DemoBlock {
    fn name(&self) -> &str {
        "demo-block"
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
        let batch = if self.has_embeddings {
            inputs.get("input_ids").unwrap().dims1()?
        } else {
            inputs.get("hidden_in").unwrap().dims2()?.0
        };
        let hidden = self.kv_width.max(1) * 4;

        let mut outputs = TensorMap::new();
        outputs.insert("hidden_out".to_string(), Tensor::zeros((batch, hidden), DType::F32, &self.device)?);
        for layer in self.layer_range.clone() {
            outputs.insert(format!("k_new_{layer}"), Tensor::ones((1, self.kv_width), DType::F32, &self.device)?);
            outputs.insert(format!("v_new_{layer}"), Tensor::ones((1, self.kv_width), DType::F32, &self.device)?);
        }
        if self.has_lm_head {
            let offset = inputs.get("cache_offset").unwrap().to_dtype(DType::F32)?.to_scalar::<f32>()?;
            let pick = (offset as usize + 1) % self.vocab_size;
            let mut row = vec![0f32; self.vocab_size];
            row[pick] = 10.0;
            outputs.insert("logits".to_string(), Tensor::from_vec(row, (1, self.vocab_size), &self.device)?);
        }
        Ok(outputs)
    }
}

/// Writes `k_new`/`v_new` into the cache tensors at `cache_offset`,
/// unlike the rest of this module's fragments this one really does the
/// job its role implies.
#[derive(Debug)]
struct DemoCacheUpdater {
    entries: Vec<EntryPoint>,
}

impl DemoCacheUpdater {
    fn new() -> Self {
        Self {
            entries: vec![EntryPoint {
                name: pipeline_core::model::DEFAULT_ENTRY.to_string(),
                inputs: vec![],
                outputs: vec![],
            }],
        }
    }
}

#[async_trait]
impl Model for DemoCacheUpdater {
    fn name(&self) -> &str {
        "demo-cache-updater"
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
        let offset = inputs
            .get("cache_offset")
            .ok_or_else(|| anyhow::anyhow!("missing cache_offset input"))?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()? as usize;

        let k_cache = inputs.get("k_cache").ok_or_else(|| anyhow::anyhow!("missing k_cache input"))?;
        let v_cache = inputs.get("v_cache").ok_or_else(|| anyhow::anyhow!("missing v_cache input"))?;
        let k_new = inputs.get("k_new").ok_or_else(|| anyhow::anyhow!("missing k_new input"))?;
        let v_new = inputs.get("v_new").ok_or_else(|| anyhow::anyhow!("missing v_new input"))?;

        let rows = k_new.dim(0)?;
        let k_merged =
            k_cache.slice_assign(&[offset..offset + rows, 0..k_cache.dim(1)?], k_new)?;
        let v_merged =
            v_cache.slice_assign(&[offset..offset + rows, 0..v_cache.dim(1)?], v_new)?;

        let mut outputs = TensorMap::new();
        outputs.insert("k_cache".to_string(), k_merged);
        outputs.insert("v_cache".to_string(), v_merged);
        Ok(outputs)
    }
}
