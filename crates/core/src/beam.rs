//! Beam search over the pipeline.
//!
//! One prompt expands into `beam_size` rows that move through the stages as
//! a single batch. The last stage owns candidate selection: it flattens the
//! per-beam next-token distributions, keeps the best `2 * beam_size`
//! candidates, freezes stop-token candidates into the hypothesis set, and
//! broadcasts which beam rows survive so every stage remaps its cache rows
//! in lock step. Survivor indices may repeat, so the remap is a gather, not
//! a permutation.

use candle_nn::ops::log_softmax;
use tracing::debug;

use crate::comm::StageTransport;
use crate::decode::{build_causal_mask, build_position_ids, causal_mask_slice, TokenGrid};
use crate::engine::{GenerationEngine, PromptBatch};
use crate::error::{GenerateError, Result};
use crate::forward::ForwardStep;
use crate::model::StageModel;
use crate::state::InferenceState;

const COLON_GUARD_LOGIT: f32 = -1e10;

/// Per-call knobs for [`GenerationEngine::beam_search`].
#[derive(Debug, Clone)]
pub struct BeamSearchOptions {
    pub beam_size: usize,
    /// How many finished hypotheses to return, best first.
    pub num_return: usize,
    /// Exponent on hypothesis length when normalizing scores.
    pub length_penalty: f32,
    /// Token that freezes a hypothesis. `None` means the configured
    /// termination id.
    pub stop_token: Option<u32>,
    pub prevent_newline_after_colon: bool,
}

impl Default for BeamSearchOptions {
    fn default() -> Self {
        Self {
            beam_size: 4,
            num_return: 1,
            length_penalty: 1.0,
            stop_token: None,
            prevent_newline_after_colon: false,
        }
    }
}

/// Anchor-side result: hypotheses sorted best first, prompt included.
#[derive(Debug, Clone)]
pub struct BeamSearchOutput {
    pub scores: Vec<f32>,
    pub sequences: Vec<Vec<u32>>,
}

/// Bounded set of finished hypotheses ranked by length-normalized score.
pub struct BeamHypotheses {
    beams: Vec<(f32, Vec<u32>)>,
    beam_size: usize,
    length_penalty: f32,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(beam_size: usize, length_penalty: f32) -> Self {
        Self {
            beams: Vec::with_capacity(beam_size + 1),
            beam_size,
            length_penalty,
            worst_score: f32::INFINITY,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    /// Insert a finished hypothesis, evicting the worst when full.
    pub fn add(&mut self, sequence: Vec<u32>, sum_log_probs: f32, generated_length: usize) {
        let score = sum_log_probs / (generated_length.max(1) as f32).powf(self.length_penalty);
        if self.beams.len() < self.beam_size || score > self.worst_score {
            self.beams.push((score, sequence));
            if self.beams.len() > self.beam_size {
                let worst = self
                    .beams
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                self.beams.swap_remove(worst);
            }
            self.worst_score = self
                .beams
                .iter()
                .map(|(s, _)| *s)
                .fold(f32::INFINITY, f32::min);
        }
    }

    /// True once the set is full and no live beam can still displace the
    /// worst frozen hypothesis at the current generated length.
    pub fn is_done(&self, best_sum_log_probs: f32, current_length: usize) -> bool {
        if self.beams.len() < self.beam_size {
            return false;
        }
        let best_possible =
            best_sum_log_probs / (current_length.max(1) as f32).powf(self.length_penalty);
        self.worst_score >= best_possible
    }

    /// Drain hypotheses sorted best first.
    pub fn into_sorted(mut self) -> Vec<(f32, Vec<u32>)> {
        self.beams.sort_by(|a, b| b.0.total_cmp(&a.0));
        self.beams
    }
}

impl<M: StageModel, T: StageTransport> GenerationEngine<M, T> {
    /// Beam-search a single prompt. Returns `Some` on the anchor stage,
    /// `None` elsewhere.
    pub fn beam_search(
        &self,
        batch: &PromptBatch,
        options: &BeamSearchOptions,
    ) -> Result<Option<BeamSearchOutput>> {
        if batch.batch_size() != 1 {
            return Err(GenerateError::BeamBatchSize {
                batch_size: batch.batch_size(),
            });
        }
        assert!(options.beam_size > 0, "beam_size must be > 0");
        assert!(
            options.num_return <= options.beam_size,
            "num_return cannot exceed beam_size"
        );
        let vocab = self.model.vocab_size();
        if options.beam_size >= vocab {
            return Err(GenerateError::BeamWidthExceedsVocab {
                beam_size: options.beam_size,
                vocab_size: vocab,
            });
        }
        let max_sequence_length = batch.tokens.max_len();
        self.validate_budget(options.beam_size, max_sequence_length)?;
        if batch.max_prompt_length() >= max_sequence_length {
            return Err(GenerateError::PromptFillsSequence {
                prompt_length: batch.max_prompt_length(),
                max_sequence_length,
            });
        }

        let topology = *self.router.topology();
        let device = self.model.device();
        let beam_size = options.beam_size;
        let prompt_length = batch.max_prompt_length();
        let stop_token = options.stop_token.unwrap_or(self.config.termination_id);
        debug!(stage = topology.stage_id, beam_size, "beam search");

        // seed every beam row with the prompt
        let mut grid = TokenGrid::new(beam_size, max_sequence_length, 0);
        for col in 0..max_sequence_length {
            let token = batch.tokens.get(0, col);
            for row in 0..beam_size {
                grid.set(row, col, token);
            }
        }

        let mut state = InferenceState::new(beam_size, max_sequence_length);
        let mut forward = ForwardStep::new(
            &self.model,
            &self.router,
            self.schedule,
            self.config.micro_batch_size,
            self.config.batching_threshold,
        )?;
        let positions = build_position_ids(beam_size, max_sequence_length, device)?;
        let mask = build_causal_mask(max_sequence_length, device)?;

        let mut scores = vec![0.0f32; beam_size];
        let mut hypotheses = BeamHypotheses::new(beam_size, options.length_penalty);
        let mut done = false;

        let mut prev_context = 0usize;
        let mut final_context = prompt_length;
        let mut step = 0u64;

        for context in prompt_length..max_sequence_length {
            let span = context - prev_context;
            let tokens = grid.slice_tensor(prev_context..context, device)?;
            let step_positions = positions.narrow(1, prev_context, span)?;
            let step_mask = causal_mask_slice(&mask, prev_context..context)?;

            let output = forward.run(&tokens, &step_positions, &step_mask, &mut state, step)?;

            let survivors: Vec<u32>;
            if topology.is_last() {
                let last = output.narrow(1, span - 1, 1)?.squeeze(1)?;
                let mut log_probs: Vec<Vec<f32>> = log_softmax(&last, 1)?.to_vec2()?;
                if options.prevent_newline_after_colon {
                    if let (Some(colon), Some(newline)) =
                        (self.config.colon_token_id, self.config.newline_token_id)
                    {
                        for (row, lp) in log_probs.iter_mut().enumerate() {
                            if grid.get(row, context - 1) == colon {
                                lp[newline as usize] = COLON_GUARD_LOGIT;
                            }
                        }
                    }
                }

                // all rows are identical on the first step; expanding them
                // all would return beam_size copies of one candidate
                let source_rows = if step == 0 { 1 } else { beam_size };
                let mut candidates: Vec<(f32, usize, u32)> =
                    Vec::with_capacity(source_rows * vocab);
                for row in 0..source_rows {
                    for (token, lp) in log_probs[row].iter().enumerate() {
                        candidates.push((scores[row] + lp, row, token as u32));
                    }
                }
                candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
                let best_score = candidates[0].0;

                let mut next: Vec<(f32, usize, u32)> = Vec::with_capacity(beam_size);
                for (rank, &(score, row, token)) in
                    candidates.iter().take(2 * beam_size).enumerate()
                {
                    if token == stop_token {
                        if rank < beam_size {
                            let generated = context + 1 - prompt_length;
                            hypotheses.add(grid.row(row)[..context].to_vec(), score, generated);
                        }
                        continue;
                    }
                    next.push((score, row, token));
                    if next.len() == beam_size {
                        break;
                    }
                }
                // stop-heavy steps can leave fewer than beam_size survivors;
                // pad from the remaining candidates
                for &(score, row, token) in candidates.iter().skip(2 * beam_size) {
                    if next.len() == beam_size {
                        break;
                    }
                    if token != stop_token {
                        next.push((score, row, token));
                    }
                }

                done = hypotheses.is_done(best_score, context + 1 - prompt_length);

                survivors = next.iter().map(|&(_, row, _)| row as u32).collect();
                grid.reorder_rows(&survivors);
                for (row, &(score, _, token)) in next.iter().enumerate() {
                    grid.set(row, context, token);
                    scores[row] = score;
                }

                if !topology.is_single() {
                    self.router
                        .broadcast_beam_choice(step, survivors.clone(), done)?;
                    if !topology.is_anchor() && !done {
                        let rows: Vec<Vec<u32>> =
                            (0..beam_size).map(|r| grid.row(r).to_vec()).collect();
                        self.router.send_beam_tokens_to_anchor(step, rows)?;
                    }
                }
            } else {
                let (indices, recv_done) = self.router.recv_beam_choice(step)?;
                done = recv_done;
                survivors = indices;
                if topology.is_anchor() && !done {
                    let rows = self.router.recv_beam_tokens_at_anchor(step)?;
                    grid = TokenGrid::from_rows(&rows);
                }
            }

            prev_context = context;
            final_context = context;
            step += 1;
            if done {
                break;
            }
            state.swap_key_value_rows(&survivors)?;
        }

        if topology.is_last() {
            // freeze whatever is still live
            if !done {
                for row in 0..beam_size {
                    let generated = final_context + 1 - prompt_length;
                    hypotheses.add(
                        grid.row(row)[..final_context + 1].to_vec(),
                        scores[row],
                        generated,
                    );
                }
            }
            let ranked = hypotheses.into_sorted();
            let mut out_scores = Vec::with_capacity(options.num_return);
            let mut sequences = Vec::with_capacity(options.num_return);
            for (score, sequence) in ranked.into_iter().take(options.num_return) {
                out_scores.push(score);
                sequences.push(sequence);
            }
            if topology.is_anchor() {
                return Ok(Some(BeamSearchOutput {
                    scores: out_scores,
                    sequences,
                }));
            }
            self.router
                .send_beam_summary_to_anchor(out_scores, sequences)?;
            return Ok(None);
        }
        if topology.is_anchor() {
            let (scores, sequences) = self.router.recv_beam_summary_at_anchor()?;
            return Ok(Some(BeamSearchOutput { scores, sequences }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypotheses_keep_the_best_when_full() {
        let mut hyp = BeamHypotheses::new(2, 1.0);
        hyp.add(vec![1], -4.0, 2);
        hyp.add(vec![2], -2.0, 2);
        hyp.add(vec![3], -1.0, 2);
        assert_eq!(hyp.len(), 2);
        let ranked = hyp.into_sorted();
        assert_eq!(ranked[0].1, vec![3]);
        assert_eq!(ranked[1].1, vec![2]);
    }

    #[test]
    fn not_done_until_full() {
        let mut hyp = BeamHypotheses::new(2, 1.0);
        hyp.add(vec![1], -1.0, 1);
        assert!(!hyp.is_done(-100.0, 5));
    }

    #[test]
    fn done_when_no_live_beam_can_displace_the_worst() {
        let mut hyp = BeamHypotheses::new(2, 1.0);
        hyp.add(vec![1], -1.0, 2);
        hyp.add(vec![2], -2.0, 2);
        // worst frozen score is -1.0; a live sum of -10 over length 4
        // normalizes to -2.5 and cannot displace it
        assert!(hyp.is_done(-10.0, 4));
        // a live sum of -1.0 over length 4 normalizes to -0.25 and can
        assert!(!hyp.is_done(-1.0, 4));
    }

    #[test]
    fn length_penalty_normalizes_scores() {
        let mut hyp = BeamHypotheses::new(1, 2.0);
        hyp.add(vec![1, 2, 3, 4], -8.0, 4);
        let ranked = hyp.into_sorted();
        assert!((ranked[0].0 - (-0.5)).abs() < 1e-6);
    }
}
