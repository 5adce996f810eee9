//! Early-exit decoding: confident predictions leave the pipeline at
//! intermediate exit heads instead of traversing every stage.
//!
//! Activations travel with an exit tag. Once a stage's exit head fires, it
//! finalizes the token itself and every later stage skips compute for the
//! step, so those stages never cache the step's positions. The window start
//! (`full_exit_context_length`) therefore stays pinned on exit steps and
//! the skipped positions are re-consumed, and re-cached where missing, by
//! the next step's window. On steps where nothing exits the window start
//! catches up to the processed position.
//!
//! Exactly one stage finalizes a token per step: the first stage whose exit
//! head fires, or the last stage when none does. The last stage also holds
//! its full-depth distribution against the confidence threshold, so a
//! confident final prediction counts as an exit for window bookkeeping.
//! The finalizing stage delivers the token to the anchor; the anchor writes
//! it, checks stop tokens, and broadcasts the step outcome carrying the
//! done and exit bits so every stage pins its window identically.

use tracing::debug;

use crate::comm::{ActivationShape, StageTransport};
use crate::decode::{build_causal_mask, build_position_ids, causal_mask_slice};
use crate::engine::{GenerateOptions, GenerateOutput, GenerationEngine, PromptBatch};
use crate::error::{GenerateError, Result};
use crate::model::{StageInput, StageModel};
use crate::sampling::{log_softmax as slice_log_softmax, sample, SamplerState};
use crate::state::InferenceState;

/// Exit-head arming for one call.
#[derive(Debug, Clone)]
pub struct EarlyExitOptions {
    /// Probability an exit head's best token must reach to fire.
    pub threshold: f32,
    /// Layers carrying exit heads.
    pub exit_layers: Vec<usize>,
}

/// Token finalized by this stage during one step, if any.
struct StepProduct {
    token: u32,
    log_prob: f32,
    exited: bool,
}

impl<M: StageModel, T: StageTransport> GenerationEngine<M, T> {
    /// Generate a single sequence with early exit armed.
    ///
    /// Returns `Some` on the anchor stage, `None` elsewhere.
    pub fn generate_with_early_exit(
        &self,
        batch: &PromptBatch,
        options: &GenerateOptions,
        early_exit: &EarlyExitOptions,
    ) -> Result<Option<GenerateOutput>> {
        if batch.batch_size() != 1 {
            return Err(GenerateError::EarlyExitBatchSize {
                batch_size: batch.batch_size(),
            });
        }
        let max_sequence_length = batch.tokens.max_len();
        self.validate_budget(1, max_sequence_length)?;
        if batch.max_prompt_length() >= max_sequence_length {
            return Err(GenerateError::PromptFillsSequence {
                prompt_length: batch.max_prompt_length(),
                max_sequence_length,
            });
        }
        options.sampling.validate()?;

        self.model
            .set_early_exit(Some(early_exit.threshold), &early_exit.exit_layers);
        let result = self.run_early_exit_loop(batch, options, early_exit, max_sequence_length);
        self.model.set_early_exit(None, &[]);
        result
    }

    fn run_early_exit_loop(
        &self,
        batch: &PromptBatch,
        options: &GenerateOptions,
        early_exit: &EarlyExitOptions,
        max_sequence_length: usize,
    ) -> Result<Option<GenerateOutput>> {
        let topology = *self.router.topology();
        let device = self.model.device();
        let prompt_length = batch.max_prompt_length();
        debug!(stage = topology.stage_id, prompt_length, "early-exit generate");

        let mut grid = batch.tokens.clone();
        let mut sampling = options.sampling.clone();
        let mut sampler = SamplerState::new(options.seed);
        let stop_tokens = self.stop_set(options);

        let mut state = InferenceState::new(1, max_sequence_length);
        let positions = build_position_ids(1, max_sequence_length, device)?;
        let mask = build_causal_mask(max_sequence_length, device)?;

        let mut log_probs = if options.return_log_probs && topology.is_anchor() {
            Some(vec![vec![0.0f32; max_sequence_length - 1]])
        } else {
            None
        };

        // window start; stays pinned across exit steps
        let mut full_exit_context = 0usize;
        let mut final_context = max_sequence_length - 1;
        let mut generated_length = max_sequence_length as u32;
        let mut step = 0u64;

        for context in prompt_length..max_sequence_length {
            let window = full_exit_context..context;
            let tokens = grid.slice_tensor(window.clone(), device)?;
            let step_positions = positions.narrow(1, window.start, window.len())?;
            let step_mask = causal_mask_slice(&mask, window.clone())?;
            state.clear_early_exit_flags();

            let product = self.early_exit_step(
                StageInput {
                    tokens: &tokens,
                    positions: &step_positions,
                    mask: &step_mask,
                    hidden: None,
                },
                &mut state,
                step,
                window.len(),
                early_exit.threshold,
                &mut sampler,
                &sampling,
            )?;
            sampling.decay_top_p();

            let done: bool;
            let step_exited: bool;
            if topology.is_anchor() {
                let (token, log_prob, exited) = match product {
                    Some(p) => (p.token, p.log_prob, p.exited),
                    None => {
                        let (tokens, lp, exited) = self.router.recv_token_at_anchor(step)?;
                        let log_prob = lp.first().and_then(|row| row.first().copied());
                        (tokens[0], log_prob.unwrap_or(0.0), exited)
                    }
                };
                grid.set(0, context, token);
                if let Some(acc) = log_probs.as_mut() {
                    acc[0][context - 1] = log_prob;
                }
                let stopped = options.use_stop_tokens_for_early_termination
                    && stop_tokens.contains(&token);
                if stopped {
                    generated_length = (context + 1) as u32;
                }
                done = stopped;
                step_exited = exited;
                if !topology.is_single() {
                    self.router.broadcast_outcome(step, done, step_exited)?;
                }
            } else {
                if let Some(p) = product {
                    self.router.send_token_to_anchor(
                        step,
                        vec![p.token],
                        vec![vec![p.log_prob]],
                        p.exited,
                    )?;
                }
                let (recv_done, recv_exited) = self.router.recv_outcome(step)?;
                done = recv_done;
                step_exited = recv_exited;
            }

            // the sequence cursor advances by the processed slice length
            // every step; the window start only catches up on no-exit steps
            state.advance_sequence(window.len());
            if !step_exited {
                full_exit_context = context;
            }
            step += 1;
            if done {
                final_context = context;
                break;
            }
        }

        if !topology.is_anchor() {
            return Ok(None);
        }
        Ok(Some(self.finish_single_row(
            grid,
            batch,
            generated_length,
            log_probs,
            final_context,
            options.echo_prompts,
        )))
    }

    /// Run this stage's share of one exit-tagged step. Returns the token
    /// this stage finalized, or `None` when another stage owns it.
    fn early_exit_step(
        &self,
        input: StageInput<'_>,
        state: &mut InferenceState,
        step: u64,
        span: usize,
        threshold: f32,
        sampler: &mut SamplerState,
        sampling: &crate::sampling::SamplingConfig,
    ) -> Result<Option<StepProduct>> {
        let topology = *self.router.topology();

        let (hidden_in, upstream_exited) = if topology.is_first() {
            (None, false)
        } else {
            let expected = ActivationShape::new(1, span, self.model.hidden_size());
            let (hidden, exited) = self.router.recv_exit_tagged_from_prev(step, &expected)?;
            state.prev_has_early_exited = exited;
            (Some(hidden), exited)
        };

        if upstream_exited {
            // token already finalized upstream; keep the tag moving
            if !topology.is_last() {
                if let Some(hidden) = hidden_in {
                    self.router.send_exit_tagged_to_next(step, hidden, true)?;
                }
            }
            return Ok(None);
        }

        let output = self.model.forward(
            StageInput {
                tokens: input.tokens,
                positions: input.positions,
                mask: input.mask,
                hidden: hidden_in.as_ref(),
            },
            state,
        )?;

        if let Some(exit) = output.early_exit {
            state.has_early_exited = true;
            if !topology.is_last() {
                self.router
                    .send_exit_tagged_to_next(step, output.hidden, true)?;
            }
            return Ok(Some(StepProduct {
                token: exit.token,
                log_prob: exit.log_prob,
                exited: true,
            }));
        }

        if !topology.is_last() {
            self.router
                .send_exit_tagged_to_next(step, output.hidden, false)?;
            return Ok(None);
        }

        // full-depth finalization on the last stage; a top-token probability
        // at or above the threshold pins the window like any head exit
        let last_logits: Vec<f32> = output
            .hidden
            .narrow(1, span - 1, 1)?
            .flatten_all()?
            .to_vec1()?;
        let token = sample(&last_logits, sampling, sampler, 0)?;
        let log_probs = slice_log_softmax(&last_logits);
        let top = log_probs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exited = top.exp() >= threshold;
        state.has_early_exited = exited;
        Ok(Some(StepProduct {
            token,
            log_prob: log_probs[token as usize],
            exited,
        }))
    }

    fn finish_single_row(
        &self,
        mut grid: crate::decode::TokenGrid,
        batch: &PromptBatch,
        mut generated_length: u32,
        mut log_probs: Option<Vec<Vec<f32>>>,
        final_context: usize,
        echo_prompts: bool,
    ) -> GenerateOutput {
        grid.truncate(final_context + 1);
        if let Some(acc) = log_probs.as_mut() {
            acc[0].truncate(final_context);
        }
        if !echo_prompts {
            let prompt_length = batch.lengths[0] as usize;
            grid.roll_row_left(0, prompt_length);
            if let Some(acc) = log_probs.as_mut() {
                let width = acc[0].len();
                if width > 0 {
                    acc[0].rotate_left((prompt_length - 1) % width);
                }
            }
            generated_length -= batch.lengths[0];
        }
        GenerateOutput {
            tokens: grid,
            prompt_lengths: batch.lengths.clone(),
            generated_lengths: vec![generated_length],
            log_probs,
        }
    }
}
