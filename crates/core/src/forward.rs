//! One pipeline step: receive upstream activation, run this stage's slice,
//! hand the result downstream.
//!
//! Large prompt-fill steps are swept in micro-batch chunks so activation
//! envelopes stay bounded; every chunk is a full recv/compute/send exchange
//! and chunk boundaries are identical on every stage, so the lock-step
//! barrier is preserved inside a step.

use candle_core::Tensor;
use tracing::debug;

use crate::comm::{ActivationShape, StageRouter, StageTransport};
use crate::error::{GenerateError, Result};
use crate::model::{StageInput, StageModel, StageOutput};
use crate::state::InferenceState;
use crate::topology::StageSchedule;

/// Drives stage forward passes for one generation call.
pub struct ForwardStep<'a, M: StageModel, T: StageTransport> {
    model: &'a M,
    router: &'a StageRouter<T>,
    micro_batch_size: usize,
    batching_threshold: usize,
    recv_shape: Option<ActivationShape>,
}

impl<'a, M: StageModel, T: StageTransport> ForwardStep<'a, M, T> {
    pub fn new(
        model: &'a M,
        router: &'a StageRouter<T>,
        schedule: StageSchedule,
        micro_batch_size: usize,
        batching_threshold: usize,
    ) -> Result<Self> {
        if schedule != StageSchedule::Contiguous {
            return Err(GenerateError::InterleavedSchedule);
        }
        Ok(Self {
            model,
            router,
            micro_batch_size,
            batching_threshold,
            recv_shape: None,
        })
    }

    fn expected_shape(&mut self, batch: usize, span: usize) -> &ActivationShape {
        let hidden = self.model.hidden_size();
        if self
            .recv_shape
            .as_ref()
            .is_some_and(|s| s.dims != [batch, span, hidden])
        {
            self.recv_shape = None;
        }
        self.recv_shape
            .get_or_insert_with(|| ActivationShape::new(batch, span, hidden))
    }

    /// Run one step over `[batch, span]` inputs.
    ///
    /// On the last stage the returned tensor is `[batch, span, vocab]`
    /// logits; elsewhere it is this stage's outgoing activation (already
    /// sent downstream, returned for callers that inspect it).
    pub fn run(
        &mut self,
        tokens: &Tensor,
        positions: &Tensor,
        mask: &Tensor,
        state: &mut InferenceState,
        step: u64,
    ) -> Result<Tensor> {
        let (batch, span) = tokens.dims2()?;
        let output = if batch * span > self.batching_threshold && batch > self.micro_batch_size {
            self.run_micro_batched(tokens, positions, mask, state, step, batch, span)?
        } else {
            self.run_chunk(tokens, positions, mask, state, step, batch, span)?
        };
        state.advance_sequence(span);
        state.reset_batch_offset();
        Ok(output)
    }

    fn run_micro_batched(
        &mut self,
        tokens: &Tensor,
        positions: &Tensor,
        mask: &Tensor,
        state: &mut InferenceState,
        step: u64,
        batch: usize,
        span: usize,
    ) -> Result<Tensor> {
        let chunks = batch.div_ceil(self.micro_batch_size);
        debug!(batch, span, chunks, "micro-batched step");
        let mut outputs = Vec::with_capacity(chunks);
        let mut offset = 0;
        while offset < batch {
            let rows = self.micro_batch_size.min(batch - offset);
            let chunk_tokens = tokens.narrow(0, offset, rows)?;
            let chunk_positions = positions.narrow(0, offset, rows)?;
            let out = self.run_chunk(&chunk_tokens, &chunk_positions, mask, state, step, rows, span)?;
            outputs.push(out);
            state.advance_batch(rows);
            offset += rows;
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_chunk(
        &mut self,
        tokens: &Tensor,
        positions: &Tensor,
        mask: &Tensor,
        state: &mut InferenceState,
        step: u64,
        batch: usize,
        span: usize,
    ) -> Result<Tensor> {
        let topology = *self.router.topology();
        let received = if topology.is_first() {
            None
        } else {
            let expected = self.expected_shape(batch, span).clone();
            Some(self.router.recv_activation_from_prev(step, &expected)?)
        };

        let StageOutput { hidden, .. } = self.model.forward(
            StageInput {
                tokens,
                positions,
                mask,
                hidden: received.as_ref(),
            },
            state,
        )?;

        if !topology.is_last() {
            self.router.send_activation_to_next(step, hidden.clone())?;
        }
        Ok(hidden)
    }
}
