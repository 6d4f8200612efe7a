//! Pipeline configuration inference (spec §4.2).

use candle_core::DType;

use crate::error::PipelineError;
use crate::fragment::BlockFragment;
use crate::model::GENERATE_ENTRY;

/// Scalar facts probed from the loaded fragment set. These are immutable
/// for the lifetime of a `Pipeline`.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub vocab_size: usize,
    pub input_length: usize,
    pub cache_length: usize,
    pub context_length: usize,
    pub num_layers: usize,
    pub kv_width: usize,
    pub kv_dtype: DType,
}

impl PipelineConfig {
    /// Probe `blocks` for the four scalar facts spec §4.2 requires, failing
    /// with `ShapeInconsistent` if any declared dimension is missing,
    /// non-static, or disagrees across fragments that touch the same
    /// tensor.
    pub fn infer(blocks: &[BlockFragment]) -> Result<Self, PipelineError> {
        if blocks.is_empty() {
            return Err(PipelineError::ShapeInconsistent(
                "no block fragments to infer configuration from".to_string(),
            ));
        }

        let embeddings_block = blocks
            .iter()
            .find(|b| b.has_embeddings)
            .ok_or_else(|| {
                PipelineError::ShapeInconsistent(
                    "no block fragment declares an input_ids input".to_string(),
                )
            })?;
        let lm_head_block = blocks
            .iter()
            .find(|b| b.has_lm_head)
            .ok_or_else(|| {
                PipelineError::ShapeInconsistent(
                    "no block fragment declares a logits/logits_0 output".to_string(),
                )
            })?;

        let input_length = static_last_dim(embeddings_block, "input_ids")?;
        let vocab_size = static_logits_dim(lm_head_block)?;

        let first_block = &blocks[0];
        let cache_length = static_second_dim(first_block, "k_cache_0")?;
        let kv_width = static_last_dim(first_block, "k_cache_0")?;
        let kv_dtype = entry_input(first_block, "k_cache_0")?.dtype;

        for block in blocks {
            for layer in block.layer_range.iter() {
                let name = format!("k_cache_{layer}");
                let got = static_second_dim(block, &name)?;
                if got != cache_length {
                    return Err(PipelineError::ShapeInconsistent(format!(
                        "fragment {} declares {name} with cache_length {got}, expected {cache_length}",
                        block.id
                    )));
                }
            }
        }

        let num_layers: usize = blocks.iter().map(|b| b.layer_range.len()).sum();
        let context_length = input_length + cache_length;

        Ok(Self {
            vocab_size,
            input_length,
            cache_length,
            context_length,
            num_layers,
            kv_width,
            kv_dtype,
        })
    }
}

fn entry_input<'a>(
    block: &'a BlockFragment,
    tensor_name: &str,
) -> Result<&'a crate::model::TensorSpec, PipelineError> {
    let entry = block
        .model
        .entry_point(GENERATE_ENTRY)
        .or_else(|| block.model.entry_point(crate::model::DEFAULT_ENTRY))
        .ok_or_else(|| {
            PipelineError::ShapeInconsistent(format!("fragment {} has no usable entry point", block.id))
        })?;
    entry.input(tensor_name).ok_or_else(|| {
        PipelineError::ShapeInconsistent(format!(
            "fragment {} does not declare input {tensor_name:?}",
            block.id
        ))
    })
}

fn static_last_dim(block: &BlockFragment, tensor_name: &str) -> Result<usize, PipelineError> {
    entry_input(block, tensor_name)?.last_dim().ok_or_else(|| {
        PipelineError::ShapeInconsistent(format!(
            "fragment {} declares {tensor_name:?} with a non-static last dimension",
            block.id
        ))
    })
}

fn static_second_dim(block: &BlockFragment, tensor_name: &str) -> Result<usize, PipelineError> {
    let spec = entry_input(block, tensor_name)?;
    spec.shape
        .get(spec.shape.len().wrapping_sub(2))
        .copied()
        .flatten()
        .ok_or_else(|| {
            PipelineError::ShapeInconsistent(format!(
                "fragment {} declares {tensor_name:?} without a static second-to-last axis",
                block.id
            ))
        })
}

fn static_logits_dim(block: &BlockFragment) -> Result<usize, PipelineError> {
    let entry = block
        .model
        .entry_point(GENERATE_ENTRY)
        .or_else(|| block.model.entry_point(crate::model::DEFAULT_ENTRY))
        .ok_or_else(|| {
            PipelineError::ShapeInconsistent(format!("fragment {} has no usable entry point", block.id))
        })?;
    let spec = entry
        .output("logits")
        .or_else(|| entry.output("logits_0"))
        .ok_or_else(|| {
            PipelineError::ShapeInconsistent(format!(
                "fragment {} does not declare a logits output",
                block.id
            ))
        })?;
    spec.last_dim().ok_or_else(|| {
        PipelineError::ShapeInconsistent(format!(
            "fragment {} declares a logits output with a non-static vocab dimension",
            block.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryPoint, Model, TensorSpec, DEFAULT_ENTRY};
    use async_trait::async_trait;
    use candle_core::DType;
    use std::collections::HashMap;

    #[derive(Debug)]
    struct StubModel {
        entries: Vec<EntryPoint>,
    }

    #[async_trait]
    impl Model for StubModel {
        fn name(&self) -> &str {
            "stub"
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
        async fn predict(&self, _entry: &str, _inputs: &crate::model::TensorMap) -> anyhow::Result<crate::model::TensorMap> {
            Ok(HashMap::new())
        }
    }

    fn make_block(id: &str, start: usize, end: usize, embeddings: bool, lm_head: bool) -> BlockFragment {
        let mut inputs = vec![TensorSpec::new("hidden_in", vec![Some(64), Some(4096)], DType::F32)];
        if embeddings {
            inputs.push(TensorSpec::new("input_ids", vec![Some(1), Some(64)], DType::F32));
        }
        for l in start..end {
            inputs.push(TensorSpec::new(format!("k_cache_{l}"), vec![Some(960), Some(128)], DType::F32));
            inputs.push(TensorSpec::new(format!("v_cache_{l}"), vec![Some(960), Some(128)], DType::F32));
        }
        let mut outputs = vec![TensorSpec::new("hidden_out", vec![Some(64), Some(4096)], DType::F32)];
        if lm_head {
            outputs.push(TensorSpec::new("logits", vec![Some(1), Some(32000)], DType::F32));
        }
        let entry = EntryPoint {
            name: DEFAULT_ENTRY.to_string(),
            inputs,
            outputs,
        };
        BlockFragment {
            id: id.to_string(),
            layer_range: LayerRange::new(start, end),
            has_embeddings: embeddings,
            has_lm_head: lm_head,
            generate_entry: DEFAULT_ENTRY.to_string(),
            model: Box::new(StubModel { entries: vec![entry] }),
        }
    }

    use crate::fragment::LayerRange;

    #[test]
    fn infers_config_from_two_blocks() {
        let blocks = vec![
            make_block("a", 0, 16, true, false),
            make_block("b", 16, 32, false, true),
        ];
        let cfg = PipelineConfig::infer(&blocks).unwrap();
        assert_eq!(cfg.input_length, 64);
        assert_eq!(cfg.cache_length, 960);
        assert_eq!(cfg.context_length, 1024);
        assert_eq!(cfg.vocab_size, 32000);
        assert_eq!(cfg.num_layers, 32);
        assert_eq!(cfg.kv_width, 128);
    }

    #[test]
    fn rejects_inconsistent_cache_length() {
        let mut blocks = vec![make_block("a", 0, 1, true, true)];
        // Corrupt the declared cache_length of layer 0 on a second, larger block.
        let mut bad = make_block("b", 1, 2, false, false);
        bad.model = Box::new(StubModel {
            entries: vec![EntryPoint {
                name: DEFAULT_ENTRY.to_string(),
                inputs: vec![TensorSpec::new("k_cache_1", vec![Some(512), Some(128)], DType::F32)],
                outputs: vec![TensorSpec::new("hidden_out", vec![Some(64), Some(4096)], DType::F32)],
            }],
        });
        blocks.push(bad);
        let err = PipelineConfig::infer(&blocks).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeInconsistent(_)));
    }
}
