//! Fragment discovery and loading (spec §4.1).
//!
//! Given a directory and an optional filename prefix, assembles the
//! ordered block-fragment list plus the cache-updater and logit-sampler
//! handles. Structural problems are reported as `ManifestMalformed` and
//! abort before any fragment is instantiated.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::error::PipelineError;
use crate::fragment::{chunk_sort_key, BlockFragment, LayerRange, ModelFactory};
use crate::model::{Model, DEFAULT_ENTRY, GENERATE_ENTRY};

/// Monotone load progress, reported via the caller-supplied callback in
/// `load()` (spec §4.1, §6).
#[derive(Debug, Clone)]
pub struct LoadProgress {
    pub status: String,
    pub fraction: f32,
}

impl LoadProgress {
    fn new(status: impl Into<String>, fraction: f32) -> Self {
        Self {
            status: status.into(),
            fraction,
        }
    }
}

/// The result of fragment discovery and loading: everything a `Pipeline`
/// needs to infer its configuration and start stepping.
pub struct DiscoveredPipeline {
    pub blocks: Vec<BlockFragment>,
    pub cache_updater: Box<dyn Model>,
    pub logit_sampler: Box<dyn Model>,
}

fn contains_ci(name: &str, needle: &str) -> bool {
    name.to_ascii_lowercase().contains(needle)
}

/// Discover, order and load the fragment set at `dir`.
///
/// `prefix`, if given, restricts the block-chunk file set to names
/// starting with it (spec §4.1, "optionally filtered by prefix"); it never
/// restricts the cache-updater or logit-sampler search.
pub async fn load_fragments(
    dir: &Path,
    prefix: Option<&str>,
    factory: &dyn ModelFactory,
    mut on_progress: impl FnMut(LoadProgress),
) -> Result<DiscoveredPipeline, PipelineError> {
    on_progress(LoadProgress::new("scanning pipeline directory", 0.0));

    let mut entries: Vec<String> = fs::read_dir(dir)
        .map_err(|e| PipelineError::ManifestMalformed(format!("cannot read {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    entries.sort();

    let cache_name = entries
        .iter()
        .find(|name| contains_ci(name, "cache"))
        .cloned()
        .ok_or_else(|| {
            PipelineError::ManifestMalformed(format!(
                "no cache-updater fragment (name containing \"cache\") found in {}",
                dir.display()
            ))
        })?;

    let logit_name = entries
        .iter()
        .find(|name| contains_ci(name, "logit"))
        .cloned()
        .ok_or_else(|| {
            PipelineError::ManifestMalformed(format!(
                "no logit-sampler fragment (name containing \"logit\") found in {}",
                dir.display()
            ))
        })?;

    let mut block_names: Vec<String> = entries
        .into_iter()
        .filter(|name| name != &cache_name && name != &logit_name)
        .filter(|name| contains_ci(name, "chunk"))
        .filter(|name| prefix.map_or(true, |p| name.starts_with(p)))
        .collect();

    if block_names.is_empty() {
        return Err(PipelineError::ManifestMalformed(format!(
            "no block-chunk fragments found in {}{}",
            dir.display(),
            prefix.map(|p| format!(" matching prefix {p:?}")).unwrap_or_default(),
        )));
    }

    block_names.sort_by_key(|name| chunk_sort_key(name));

    on_progress(LoadProgress::new("loading cache updater", 0.05));
    let mut cache_updater = factory
        .open(&dir.join(&cache_name))
        .map_err(|cause| PipelineError::load_failed(cache_name.clone(), cause))?;
    cache_updater
        .load()
        .await
        .map_err(|cause| PipelineError::load_failed(cache_name.clone(), cause))?;

    on_progress(LoadProgress::new("loading logit sampler", 0.1));
    let mut logit_sampler = factory
        .open(&dir.join(&logit_name))
        .map_err(|cause| PipelineError::load_failed(logit_name.clone(), cause))?;
    logit_sampler
        .load()
        .await
        .map_err(|cause| PipelineError::load_failed(logit_name.clone(), cause))?;

    let total_blocks = block_names.len();
    let mut blocks = Vec::with_capacity(total_blocks);
    let mut next_layer_start = 0usize;
    for (idx, name) in block_names.iter().enumerate() {
        let fraction = 0.1 + 0.8 * (idx as f32 + 1.0) / total_blocks as f32;
        on_progress(LoadProgress::new(format!("loading block fragment {name}"), fraction));

        let mut model = factory
            .open(&dir.join(name))
            .map_err(|cause| PipelineError::load_failed(name.clone(), cause))?;
        model
            .load()
            .await
            .map_err(|cause| PipelineError::load_failed(name.clone(), cause))?;

        let (entry_name, layer_range) =
            resolve_generate_entry(name, model.as_ref(), next_layer_start)?;
        next_layer_start = layer_range.end();

        let has_embeddings = model
            .entry_point(&entry_name)
            .is_some_and(|ep| ep.input("input_ids").is_some());
        let has_lm_head = model
            .entry_point(&entry_name)
            .is_some_and(|ep| ep.output("logits").is_some() || ep.output("logits_0").is_some());

        blocks.push(BlockFragment {
            id: name.clone(),
            layer_range,
            has_embeddings,
            has_lm_head,
            generate_entry: entry_name,
            model,
        });
    }

    if next_layer_start == 0 {
        return Err(PipelineError::ManifestMalformed(
            "discovered blocks declare zero transformer layers".to_string(),
        ));
    }

    on_progress(LoadProgress::new("pipeline ready", 1.0));

    Ok(DiscoveredPipeline {
        blocks,
        cache_updater,
        logit_sampler,
    })
}

/// Determine which entry point on a freshly-opened block fragment is its
/// "generate" (single-token) entry and the layer range it declares via its
/// `k_cache_<i>`/`v_cache_<i>` input names.
///
/// A fragment that declares no `k_cache_<i>` inputs at all (a pure
/// embeddings-only or pure LM-head-only fragment, spec §4.1: role
/// assignment comes from declared input/output names, not position) owns
/// zero transformer layers; it reports the empty range `[expected_start,
/// expected_start)` so the next fragment's tiling check is unaffected. A
/// fragment that does declare cache inputs must start exactly where the
/// previous fragment left off (spec §3, "block-chunk fragments are
/// ordered; their declared layer ranges must tile [0, L) exactly once").
fn resolve_generate_entry(
    fragment_id: &str,
    model: &dyn Model,
    expected_start: usize,
) -> Result<(String, LayerRange), PipelineError> {
    let entry_name = if model.entry_point(GENERATE_ENTRY).is_some() {
        GENERATE_ENTRY.to_string()
    } else if model.entry_point(DEFAULT_ENTRY).is_some() {
        DEFAULT_ENTRY.to_string()
    } else {
        return Err(PipelineError::ManifestMalformed(format!(
            "block fragment {fragment_id} declares no {GENERATE_ENTRY:?} or {DEFAULT_ENTRY:?} entry point"
        )));
    };

    let entry = model.entry_point(&entry_name).expect("checked above");

    let mut layers = BTreeSet::new();
    for input in &entry.inputs {
        if let Some(rest) = input.name.strip_prefix("k_cache_") {
            if let Ok(idx) = rest.parse::<usize>() {
                layers.insert(idx);
            }
        }
    }

    if layers.is_empty() {
        return Ok((entry_name, LayerRange::new(expected_start, expected_start)));
    }

    let start = *layers.first().unwrap();
    let end = *layers.last().unwrap() + 1;
    if layers.len() != end - start {
        return Err(PipelineError::ManifestMalformed(format!(
            "block fragment {fragment_id} declares a non-contiguous layer set {layers:?}"
        )));
    }
    if start != expected_start {
        return Err(PipelineError::ManifestMalformed(format!(
            "block fragment {fragment_id} declares layer range [{start}, {end}) but layer {expected_start} was expected next"
        )));
    }

    Ok((entry_name, LayerRange::new(start, end)))
}
