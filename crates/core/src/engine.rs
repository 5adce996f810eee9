//! Generation entry points and the standard decoding loop.
//!
//! Every stage calls the same entry point with identical inputs; roles
//! diverge inside the loop. The first stage embeds tokens, the last stage
//! samples and broadcasts per-step outcomes, and the anchor stage (stage 0)
//! assembles results. Only the anchor returns `Some(output)`; other stages
//! participate and return `None`.

use candle_core::Tensor;
use candle_nn::ops::log_softmax;
use tracing::debug;

use crate::comm::{StageRouter, StageTransport};
use crate::config::EngineConfig;
use crate::decode::{build_causal_mask, build_position_ids, causal_mask_slice, TokenGrid};
use crate::error::{GenerateError, Result};
use crate::forward::ForwardStep;
use crate::model::StageModel;
use crate::sampling::{sample, SamplerState, SamplingConfig};
use crate::state::InferenceState;
use crate::topology::StageSchedule;

const COLON_GUARD_LOGIT: f32 = -1e10;

/// A batch of right-padded prompts plus their true lengths.
#[derive(Debug, Clone)]
pub struct PromptBatch {
    pub tokens: TokenGrid,
    pub lengths: Vec<u32>,
}

impl PromptBatch {
    /// Pad `prompts` to a common grid wide enough for `tokens_to_generate`
    /// more tokens per row.
    pub fn new(prompts: &[Vec<u32>], tokens_to_generate: usize, pad: u32) -> Self {
        assert!(!prompts.is_empty(), "prompt batch must be non-empty");
        assert!(
            prompts.iter().all(|p| !p.is_empty()),
            "prompts must be non-empty"
        );
        let max_prompt = prompts.iter().map(Vec::len).max().unwrap_or(0);
        let width = max_prompt + tokens_to_generate;
        let mut tokens = TokenGrid::new(prompts.len(), width, pad);
        let mut lengths = Vec::with_capacity(prompts.len());
        for (row, prompt) in prompts.iter().enumerate() {
            for (col, &token) in prompt.iter().enumerate() {
                tokens.set(row, col, token);
            }
            lengths.push(prompt.len() as u32);
        }
        Self { tokens, lengths }
    }

    /// Wrap an already-padded grid, checking that every declared prompt
    /// fits inside it.
    pub fn from_grid(tokens: TokenGrid, lengths: Vec<u32>) -> Result<Self> {
        assert_eq!(
            lengths.len(),
            tokens.batch_size(),
            "one length per grid row"
        );
        assert!(lengths.iter().all(|&l| l > 0), "prompts must be non-empty");
        let max_prompt_length = lengths.iter().copied().max().unwrap_or(0) as usize;
        if tokens.max_len() < max_prompt_length {
            return Err(GenerateError::PromptGridMismatch {
                grid_width: tokens.max_len(),
                max_prompt_length,
            });
        }
        Ok(Self { tokens, lengths })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_prompt_length(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0) as usize
    }

    pub fn min_prompt_length(&self) -> usize {
        self.lengths.iter().copied().min().unwrap_or(0) as usize
    }
}

/// Per-call knobs for [`GenerationEngine::generate`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub sampling: SamplingConfig,
    pub seed: Option<u64>,
    pub return_log_probs: bool,
    /// Token ids that finish a row. Empty means the configured
    /// termination id.
    pub stop_tokens: Vec<u32>,
    /// When false, rows run to the full sequence length regardless of stop
    /// tokens.
    pub use_stop_tokens_for_early_termination: bool,
    pub prevent_newline_after_colon: bool,
    /// Keep prompts in place instead of rotating them to the row tail.
    pub echo_prompts: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::greedy(),
            seed: None,
            return_log_probs: false,
            stop_tokens: Vec::new(),
            use_stop_tokens_for_early_termination: true,
            prevent_newline_after_colon: false,
            echo_prompts: false,
        }
    }
}

/// Anchor-side result of a generation call.
///
/// Unless `echo_prompts` was set, each row is rotated so generated tokens
/// come first and the prompt sits at the tail; log-prob rows are rotated by
/// one less since position p scores token p+1.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub tokens: TokenGrid,
    pub prompt_lengths: Vec<u32>,
    /// Generated-token count per row, or the full row length (prompt
    /// included) when echoing; rows that never stopped span the whole grid.
    pub generated_lengths: Vec<u32>,
    pub log_probs: Option<Vec<Vec<f32>>>,
}

/// Anchor-side result of a scoring call.
#[derive(Debug, Clone)]
pub struct ScoreOutput {
    /// `log_probs[row][p]` scores token p+1 of the prompt.
    pub log_probs: Vec<Vec<f32>>,
}

pub struct GenerationEngine<M: StageModel, T: StageTransport> {
    pub(crate) model: M,
    pub(crate) router: StageRouter<T>,
    pub(crate) config: EngineConfig,
    pub(crate) schedule: StageSchedule,
}

impl<M: StageModel, T: StageTransport> GenerationEngine<M, T> {
    pub fn new(
        model: M,
        router: StageRouter<T>,
        config: EngineConfig,
        schedule: StageSchedule,
    ) -> Self {
        Self {
            model,
            router,
            config,
            schedule,
        }
    }

    pub(crate) fn validate_budget(&self, batch_size: usize, sequence_length: usize) -> Result<()> {
        if sequence_length > self.config.max_position_embeddings {
            return Err(GenerateError::SequenceTooLong {
                sequence_length,
                max_position_embeddings: self.config.max_position_embeddings,
            });
        }
        if batch_size * sequence_length > self.config.max_tokens_per_call {
            return Err(GenerateError::TokenBudgetExceeded {
                batch_size,
                sequence_length,
                max_tokens_per_call: self.config.max_tokens_per_call,
            });
        }
        Ok(())
    }

    fn validate_generate(&self, batch: &PromptBatch, options: &GenerateOptions) -> Result<()> {
        let max_sequence_length = batch.tokens.max_len();
        self.validate_budget(batch.batch_size(), max_sequence_length)?;
        if batch.max_prompt_length() >= max_sequence_length {
            return Err(GenerateError::PromptFillsSequence {
                prompt_length: batch.max_prompt_length(),
                max_sequence_length,
            });
        }
        options.sampling.validate()?;
        Ok(())
    }

    /// Stop set for this call, falling back to the configured termination id.
    pub(crate) fn stop_set(&self, options: &GenerateOptions) -> Vec<u32> {
        if options.stop_tokens.is_empty() {
            vec![self.config.termination_id]
        } else {
            options.stop_tokens.clone()
        }
    }

    /// Score every prompt token under the model without generating.
    ///
    /// One forward pass over the whole grid; the last stage gathers
    /// log-probabilities of each observed next token and ships them to the
    /// anchor.
    pub fn score(&self, batch: &PromptBatch) -> Result<Option<ScoreOutput>> {
        let batch_size = batch.batch_size();
        let seq_len = batch.max_prompt_length();
        self.validate_budget(batch_size, seq_len)?;

        let topology = *self.router.topology();
        let device = self.model.device();
        let mut state = InferenceState::new(batch_size, seq_len);
        let mut forward = ForwardStep::new(
            &self.model,
            &self.router,
            self.schedule,
            self.config.micro_batch_size,
            self.config.batching_threshold,
        )?;

        let tokens = batch.tokens.slice_tensor(0..seq_len, device)?;
        let positions = build_position_ids(batch_size, seq_len, device)?;
        let mask = build_causal_mask(seq_len, device)?;
        let output = forward.run(&tokens, &positions, &mask, &mut state, 0)?;

        if topology.is_last() {
            let log_probs = self.gather_next_token_log_probs(&output, &batch.tokens, 0, seq_len)?;
            if topology.is_anchor() {
                return Ok(Some(ScoreOutput { log_probs }));
            }
            self.router
                .send_summary_to_anchor(batch.lengths.clone(), Some(log_probs))?;
            return Ok(None);
        }
        if topology.is_anchor() {
            let (_, log_probs) = self.router.recv_summary_at_anchor()?;
            let log_probs = log_probs.unwrap_or_default();
            return Ok(Some(ScoreOutput { log_probs }));
        }
        Ok(None)
    }

    /// Log-probs of token p+1 at each position p in `[start, end)`, one row
    /// per batch entry. Positions whose next token lies outside the grid
    /// are skipped, so the last row position scores nothing at `end ==
    /// max_len`.
    fn gather_next_token_log_probs(
        &self,
        logits: &Tensor,
        grid: &TokenGrid,
        start: usize,
        end: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let lp = log_softmax(logits, 2)?;
        let lp: Vec<Vec<Vec<f32>>> = lp.to_vec3()?;
        let mut rows = Vec::with_capacity(grid.batch_size());
        for (row, row_lp) in lp.iter().enumerate() {
            let mut out = Vec::with_capacity(end - start);
            for pos in start..end {
                if pos + 1 >= grid.max_len() {
                    break;
                }
                let next = grid.get(row, pos + 1) as usize;
                out.push(row_lp[pos - start][next]);
            }
            rows.push(out);
        }
        Ok(rows)
    }

    /// Generate until every row stops or the grid fills.
    ///
    /// Returns `Some` on the anchor stage, `None` elsewhere.
    pub fn generate(
        &self,
        batch: &PromptBatch,
        options: &GenerateOptions,
    ) -> Result<Option<GenerateOutput>> {
        self.validate_generate(batch, options)?;

        let topology = *self.router.topology();
        let device = self.model.device();
        let batch_size = batch.batch_size();
        let max_sequence_length = batch.tokens.max_len();
        let min_prompt_length = batch.min_prompt_length();
        debug!(
            batch_size,
            max_sequence_length,
            stage = topology.stage_id,
            "generate"
        );

        let mut grid = batch.tokens.clone();
        let mut sampling = options.sampling.clone();
        let mut sampler = SamplerState::new(options.seed);
        let stop_tokens = self.stop_set(options);

        let mut state = InferenceState::new(batch_size, max_sequence_length);
        let mut forward = ForwardStep::new(
            &self.model,
            &self.router,
            self.schedule,
            self.config.micro_batch_size,
            self.config.batching_threshold,
        )?;

        let positions = build_position_ids(batch_size, max_sequence_length, device)?;
        let mask = build_causal_mask(max_sequence_length, device)?;

        // anchor-side log-prob accumulator, one slot per scored position
        let mut log_probs = if options.return_log_probs && topology.is_anchor() {
            Some(vec![vec![0.0f32; max_sequence_length - 1]; batch_size])
        } else {
            None
        };

        let mut row_done = vec![false; batch_size];
        let mut generated_lengths = vec![max_sequence_length as u32; batch_size];

        let mut prev_context = 0usize;
        let mut final_context = max_sequence_length - 1;
        let mut step = 0u64;

        for context in min_prompt_length..max_sequence_length {
            let span = context - prev_context;
            let tokens = grid.slice_tensor(prev_context..context, device)?;
            let step_positions = positions.narrow(1, prev_context, span)?;
            let step_mask = causal_mask_slice(&mask, prev_context..context)?;

            let output = forward.run(&tokens, &step_positions, &step_mask, &mut state, step)?;

            let done;
            if topology.is_last() {
                let mut last_logits: Vec<Vec<f32>> =
                    output.narrow(1, span - 1, 1)?.squeeze(1)?.to_vec2()?;
                if options.prevent_newline_after_colon {
                    self.apply_colon_guard(&grid, context, &mut last_logits);
                }

                for row in 0..batch_size {
                    let started = (batch.lengths[row] as usize) <= context;
                    if !started {
                        continue;
                    }
                    let token = sample(&last_logits[row], &sampling, &mut sampler, row)?;
                    grid.set(row, context, token);
                }
                sampling.decay_top_p();

                let column = grid.column(context);
                for row in 0..batch_size {
                    let started = (batch.lengths[row] as usize) <= context;
                    if started && !row_done[row] && stop_tokens.contains(&column[row]) {
                        row_done[row] = true;
                        generated_lengths[row] = (context + 1) as u32;
                    }
                }
                done = options.use_stop_tokens_for_early_termination
                    && row_done.iter().all(|&d| d);

                let lp_slice = if options.return_log_probs {
                    let mut rows =
                        self.gather_next_token_log_probs(&output, &grid, prev_context, context)?;
                    if options.prevent_newline_after_colon {
                        // the last gathered position scores the just-written
                        // column and must see the guarded logits the sampler
                        // drew from
                        for (row, gathered) in rows.iter_mut().enumerate() {
                            if let Some(last) = gathered.last_mut() {
                                let next = grid.get(row, context) as usize;
                                *last = crate::sampling::log_softmax(&last_logits[row])[next];
                            }
                        }
                    }
                    rows
                } else {
                    Vec::new()
                };

                if !topology.is_single() {
                    self.router
                        .send_token_to_anchor(step, column, lp_slice, false)?;
                    self.router.broadcast_outcome(step, done, false)?;
                } else if let Some(acc) = log_probs.as_mut() {
                    for (row, slice) in lp_slice.iter().enumerate() {
                        acc[row][prev_context..prev_context + slice.len()]
                            .copy_from_slice(slice);
                    }
                }
            } else if topology.is_anchor() {
                let (column, lp_slice, _) = self.router.recv_token_at_anchor(step)?;
                for (row, &token) in column.iter().enumerate() {
                    grid.set(row, context, token);
                }
                if let Some(acc) = log_probs.as_mut() {
                    for (row, slice) in lp_slice.iter().enumerate() {
                        acc[row][prev_context..prev_context + slice.len()]
                            .copy_from_slice(slice);
                    }
                }
                let (recv_done, _) = self.router.recv_outcome(step)?;
                done = recv_done;
            } else {
                let (recv_done, _) = self.router.recv_outcome(step)?;
                done = recv_done;
            }

            prev_context = context;
            step += 1;
            if done {
                final_context = context;
                break;
            }
        }

        if topology.is_last() && !topology.is_anchor() {
            self.router
                .send_summary_to_anchor(generated_lengths.clone(), None)?;
        }
        if !topology.is_anchor() {
            return Ok(None);
        }
        if !topology.is_last() {
            let (lengths, _) = self.router.recv_summary_at_anchor()?;
            generated_lengths = lengths;
        }

        Ok(Some(self.finish_generate(
            grid,
            batch,
            generated_lengths,
            log_probs,
            final_context,
            options.echo_prompts,
        )))
    }

    /// Rows whose last input token is ":" must not produce "\n" next.
    fn apply_colon_guard(&self, grid: &TokenGrid, context: usize, logits: &mut [Vec<f32>]) {
        let (Some(colon), Some(newline)) = (self.config.colon_token_id, self.config.newline_token_id)
        else {
            return;
        };
        for (row, row_logits) in logits.iter_mut().enumerate() {
            if grid.get(row, context - 1) == colon {
                row_logits[newline as usize] = COLON_GUARD_LOGIT;
            }
        }
    }

    fn finish_generate(
        &self,
        mut grid: TokenGrid,
        batch: &PromptBatch,
        mut generated_lengths: Vec<u32>,
        mut log_probs: Option<Vec<Vec<f32>>>,
        final_context: usize,
        echo_prompts: bool,
    ) -> GenerateOutput {
        grid.truncate(final_context + 1);
        if let Some(acc) = log_probs.as_mut() {
            for row in acc.iter_mut() {
                row.truncate(final_context);
            }
        }
        if !echo_prompts {
            for row in 0..grid.batch_size() {
                let prompt_length = batch.lengths[row] as usize;
                grid.roll_row_left(row, prompt_length);
                if let Some(acc) = log_probs.as_mut() {
                    let width = acc[row].len();
                    if width > 0 {
                        acc[row].rotate_left((prompt_length - 1) % width);
                    }
                }
                generated_lengths[row] -= batch.lengths[row];
            }
        }
        GenerateOutput {
            tokens: grid,
            prompt_lengths: batch.lengths.clone(),
            generated_lengths,
            log_probs,
        }
    }
}
