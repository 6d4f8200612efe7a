//! K/V cache buffers (spec §4.3) and the cache-updater protocol (spec §4.4).
//!
//! The hot property the source relies on is that cache tensors and
//! fragment inputs share storage so a cache-updater write is visible to
//! the next fragment without a copy (spec §9, "Shared-memory accelerator
//! buffers"). `candle_core::Tensor` does not expose safe in-place mutation
//! through an immutable reference, so this implementation takes the
//! documented fallback: the updater call returns the merged tensors and
//! the pipeline publishes them into the cache slot under the step-boundary
//! barrier at the end of `Pipeline::run_step`, which awaits every
//! in-flight update and calls `publish` before the next step begins.
//! Throughput cost is the price for that safety; see DESIGN.md.

use candle_core::{DType, Device, Tensor};

use crate::error::PipelineError;

/// Per-layer row/column geometry shared by every K/V cache entry.
#[derive(Debug, Clone, Copy)]
pub struct CacheLayout {
    pub num_layers: usize,
    pub cache_length: usize,
    pub kv_width: usize,
    pub dtype: DType,
}

/// The pipeline's K/V cache: `num_layers` key tensors and `num_layers`
/// value tensors, each shaped `[cache_length, kv_width]` (spec §3).
///
/// Decision (recorded in DESIGN.md): the cache cursor `t` tracks rows
/// written into *this* buffer, so `ContextOverflow` is raised against
/// `cache_length`, the buffer's literal row capacity. There is no
/// eviction (spec §4.3).
#[derive(Debug)]
pub struct KvCache {
    layout: CacheLayout,
    keys: Vec<Tensor>,
    values: Vec<Tensor>,
    cursor: usize,
}

impl KvCache {
    /// Allocate zeroed buffers for every layer (spec §4.3, "allocated at
    /// load time ... reused in place for the entire session").
    pub fn allocate(layout: CacheLayout, device: &Device) -> anyhow::Result<Self> {
        let mut keys = Vec::with_capacity(layout.num_layers);
        let mut values = Vec::with_capacity(layout.num_layers);
        for _ in 0..layout.num_layers {
            keys.push(Tensor::zeros(
                (layout.cache_length, layout.kv_width),
                layout.dtype,
                device,
            )?);
            values.push(Tensor::zeros(
                (layout.cache_length, layout.kv_width),
                layout.dtype,
                device,
            )?);
        }
        Ok(Self {
            layout,
            keys,
            values,
            cursor: 0,
        })
    }

    pub fn layout(&self) -> CacheLayout {
        self.layout
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn key_tensor(&self, layer: usize) -> &Tensor {
        &self.keys[layer]
    }

    pub fn value_tensor(&self, layer: usize) -> &Tensor {
        &self.values[layer]
    }

    /// Publish a merged key/value pair produced by the cache updater for
    /// `layer`. Called only from behind the step-boundary barrier.
    pub fn publish(&mut self, layer: usize, key: Tensor, value: Tensor) {
        self.keys[layer] = key;
        self.values[layer] = value;
    }

    /// Reserve `step` more populated rows, failing with `ContextOverflow`
    /// if that would exceed the buffer's capacity (spec §4.3, §7).
    pub fn reserve(&mut self, step: usize) -> Result<(), PipelineError> {
        let next = self.cursor + step;
        if next > self.layout.cache_length {
            return Err(PipelineError::ContextOverflow {
                cursor: next,
                capacity: self.layout.cache_length,
            });
        }
        self.cursor = next;
        Ok(())
    }

    /// Zero every buffer and reset the cursor to 0 (spec §6, `reset()`).
    pub fn clear(&mut self, device: &Device) -> anyhow::Result<()> {
        for layer in 0..self.layout.num_layers {
            self.keys[layer] = Tensor::zeros(
                (self.layout.cache_length, self.layout.kv_width),
                self.layout.dtype,
                device,
            )?;
            self.values[layer] = Tensor::zeros(
                (self.layout.cache_length, self.layout.kv_width),
                self.layout.dtype,
                device,
            )?;
        }
        self.cursor = 0;
        Ok(())
    }
}
