//! Mutable per-call inference state: sequence and batch cursors, early-exit
//! flags, and the per-layer key/value cache.
//!
//! One `InferenceState` lives on each stage for the duration of a call. The
//! cursors tell the model where the current envelope's positions land in the
//! cache; stage models append their keys and values at `sequence_offset +
//! batch row offset` and read everything before it.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::Result;

/// Per-call decoding state owned by one stage.
#[derive(Debug)]
pub struct InferenceState {
    pub max_batch_size: usize,
    pub max_sequence_length: usize,

    /// First cache position not yet covered by a completed step.
    pub sequence_offset: usize,
    /// Row offset of the current micro-batch chunk within the full batch.
    pub batch_offset: usize,

    /// Set when this stage (or the last stage's threshold check) took an
    /// early exit during the current step.
    pub has_early_exited: bool,
    /// Exit bit received from upstream for the current step.
    pub prev_has_early_exited: bool,
    pub is_first_step: bool,

    key_value_memory: HashMap<usize, (Tensor, Tensor)>,
}

impl InferenceState {
    pub fn new(max_batch_size: usize, max_sequence_length: usize) -> Self {
        Self {
            max_batch_size,
            max_sequence_length,
            sequence_offset: 0,
            batch_offset: 0,
            has_early_exited: false,
            prev_has_early_exited: false,
            is_first_step: true,
            key_value_memory: HashMap::new(),
        }
    }

    /// Advance past `len` just-processed positions.
    pub fn advance_sequence(&mut self, len: usize) {
        self.sequence_offset += len;
        self.is_first_step = false;
    }

    pub fn advance_batch(&mut self, rows: usize) {
        self.batch_offset += rows;
    }

    pub fn reset_batch_offset(&mut self) {
        self.batch_offset = 0;
    }

    pub fn clear_early_exit_flags(&mut self) {
        self.has_early_exited = false;
        self.prev_has_early_exited = false;
    }

    pub fn key_value(&self, layer: usize) -> Option<&(Tensor, Tensor)> {
        self.key_value_memory.get(&layer)
    }

    pub fn set_key_value(&mut self, layer: usize, key: Tensor, value: Tensor) {
        self.key_value_memory.insert(layer, (key, value));
    }

    /// Reorder the batch dimension of every cached layer so row i becomes
    /// the old row `rows[i]`. Beam search calls this after each step so the
    /// cache tracks the surviving hypotheses.
    pub fn swap_key_value_rows(&mut self, rows: &[u32]) -> Result<()> {
        if self.key_value_memory.is_empty() {
            return Ok(());
        }
        let device = self
            .key_value_memory
            .values()
            .next()
            .map(|(k, _)| k.device().clone())
            .unwrap_or(candle_core::Device::Cpu);
        let index = Tensor::from_slice(rows, rows.len(), &device)?;
        for (key, value) in self.key_value_memory.values_mut() {
            *key = key.index_select(&index, 0)?;
            *value = value.index_select(&index, 0)?;
        }
        Ok(())
    }
}
