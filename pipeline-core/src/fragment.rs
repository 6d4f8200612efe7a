//! Fragment roles and the block-chunk fragment type.
//!
//! Dynamic role discovery (spec §9, "re-express this as a typed fragment
//! role enum") replaces the source's reflective name inspection: the loader
//! inspects declared input/output names once at load time and records the
//! result here. Downstream code (the pipeline's stepping logic) dispatches
//! on these types, never on strings.

use std::fmt;
use std::ops::Range;
use std::path::Path;

use crate::model::Model;

/// A contiguous, half-open range of transformer layer indices served by one
/// block-chunk fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRange(pub Range<usize>);

impl LayerRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self(start..end)
    }

    pub fn len(&self) -> usize {
        self.0.end - self.0.start
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn start(&self) -> usize {
        self.0.start
    }

    pub fn end(&self) -> usize {
        self.0.end
    }

    pub fn iter(&self) -> Range<usize> {
        self.0.clone()
    }
}

impl fmt::Display for LayerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.0.start, self.0.end)
    }
}

/// One block-chunk fragment: an opaque model realizing a contiguous slice
/// of transformer layers, optionally bearing the embeddings or LM-head role
/// (spec §4.1: "the first block is treated as the embeddings-bearing
/// fragment, the last as the LM-head-bearing fragment").
pub struct BlockFragment {
    /// Stable identifier, usually the fragment's filename stem.
    pub id: String,
    pub layer_range: LayerRange,
    pub has_embeddings: bool,
    pub has_lm_head: bool,
    /// Name of this fragment's single-token entry point (`"generate"` for
    /// multi-function fragments, otherwise whatever its sole entry is
    /// named).
    pub generate_entry: String,
    /// The fragment itself. Multi-function fragments (spec §3) expose both
    /// a `"generate"` and a `"prefill"` entry point on this single handle,
    /// sharing weights; single-function fragments expose one.
    pub model: Box<dyn Model>,
}

impl BlockFragment {
    /// Whether this fragment advertises a distinct batch-prefill entry
    /// point in addition to its single-token one.
    pub fn is_multi_function(&self) -> bool {
        self.model.entry_point(crate::model::PREFILL_ENTRY).is_some()
    }

    /// The entry point to call for `phase` (spec §4.6, §9 "Multi-function
    /// entry-point selection"). Single-function fragments have one entry
    /// that must accept both batch shapes (a dynamic batch axis), so the
    /// same name is used for both phases.
    pub fn entry_for_phase(&self, phase: crate::pipeline::PipelinePhase) -> &str {
        if self.is_multi_function() {
            match phase {
                crate::pipeline::PipelinePhase::Prefill => crate::model::PREFILL_ENTRY,
                crate::pipeline::PipelinePhase::Generate => crate::model::GENERATE_ENTRY,
            }
        } else {
            &self.generate_entry
        }
    }
}

impl fmt::Debug for BlockFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockFragment")
            .field("id", &self.id)
            .field("layer_range", &self.layer_range)
            .field("has_embeddings", &self.has_embeddings)
            .field("has_lm_head", &self.has_lm_head)
            .field("multi_function", &self.is_multi_function())
            .finish()
    }
}

impl fmt::Display for BlockFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}{}{}]",
            self.id,
            self.layer_range,
            if self.has_embeddings { "embeddings " } else { "" },
            if self.has_lm_head { "lm_head " } else { "" },
            if self.is_multi_function() {
                "multi-function"
            } else {
                "single-function"
            },
        )
    }
}

/// Constructs `Model` instances from on-disk artifacts.
///
/// The compiled artifact format itself is out of scope for this crate
/// (spec §1); a caller supplies the factory appropriate for its runtime
/// (CoreML, ONNX Runtime, a local test double, ...) and the loader treats
/// every `Model` it produces as opaque.
pub trait ModelFactory: Send + Sync {
    /// Open the artifact at `path`, calling `load()` is the caller's
    /// responsibility once the fragment's role has been established.
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn Model>>;
}

/// Compares two fragment filenames by the numeric `NN` in a
/// `..._chunk_<NN>of<MM>...` suffix, falling back to a plain lexicographic
/// comparison when the pattern isn't present. This gives the stable,
/// platform-independent ordering spec §4.1 requires
/// (`…_chunk_01of02` < `…_chunk_02of02`).
pub fn chunk_sort_key(filename: &str) -> (u64, String) {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| regex::Regex::new(r"(?i)chunk_(\d+)of(\d+)").unwrap());
    let key = pattern
        .captures(filename)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(u64::MAX);
    (key, filename.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sort_key_orders_numerically_not_lexically() {
        let mut names = vec![
            "model_chunk_10of12.bin".to_string(),
            "model_chunk_02of12.bin".to_string(),
            "model_chunk_01of12.bin".to_string(),
        ];
        names.sort_by_key(|n| chunk_sort_key(n));
        assert_eq!(
            names,
            vec![
                "model_chunk_01of12.bin",
                "model_chunk_02of12.bin",
                "model_chunk_10of12.bin",
            ]
        );
    }

    #[test]
    fn layer_range_display() {
        let r = LayerRange::new(2, 5);
        assert_eq!(r.len(), 3);
        assert_eq!(format!("{r}"), "[2, 5)");
    }
}
