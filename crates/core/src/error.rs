//! Error types for generation calls.
//!
//! Every variant here is fatal for the call that raised it. Configuration
//! errors are raised before the first forward pass; protocol and numeric
//! errors abort a run in flight, since partially-updated caches cannot be
//! rolled back.

use thiserror::Error;

use crate::comm::ProtocolError;

pub type Result<T> = std::result::Result<T, GenerateError>;

#[derive(Error, Debug)]
pub enum GenerateError {
    /// Only the contiguous stage schedule supports generation.
    #[error("generation requires a contiguous stage schedule")]
    InterleavedSchedule,

    /// Early exit handles one sequence at a time.
    #[error("early-exit generation requires batch size 1, got {batch_size}")]
    EarlyExitBatchSize { batch_size: usize },

    /// Beam search handles one prompt at a time.
    #[error("beam search requires batch size 1, got {batch_size}")]
    BeamBatchSize { batch_size: usize },

    /// A stop-heavy step must still be able to field `beam_size` live
    /// candidates from the non-stop vocabulary.
    #[error("beam size {beam_size} must be smaller than the vocabulary size {vocab_size}")]
    BeamWidthExceedsVocab {
        beam_size: usize,
        vocab_size: usize,
    },

    #[error(
        "sequence length {sequence_length} exceeds the position budget \
         {max_position_embeddings}"
    )]
    SequenceTooLong {
        sequence_length: usize,
        max_position_embeddings: usize,
    },

    #[error(
        "batch size {batch_size} x sequence length {sequence_length} exceeds \
         the per-call token budget {max_tokens_per_call}"
    )]
    TokenBudgetExceeded {
        batch_size: usize,
        sequence_length: usize,
        max_tokens_per_call: usize,
    },

    /// The longest prompt leaves no room to generate.
    #[error(
        "prompt length {prompt_length} leaves no room to generate within \
         sequence length {max_sequence_length}"
    )]
    PromptFillsSequence {
        prompt_length: usize,
        max_sequence_length: usize,
    },

    #[error(
        "prompt grid width {grid_width} does not match the declared maximum \
         prompt length {max_prompt_length}"
    )]
    PromptGridMismatch {
        grid_width: usize,
        max_prompt_length: usize,
    },

    /// top-k and top-p are mutually exclusive.
    #[error("top_k {top_k} and top_p {top_p} cannot both be active")]
    ExclusiveSamplingStrategies { top_k: usize, top_p: f32 },

    #[error("temperature must be positive, got {temperature}")]
    InvalidTemperature { temperature: f32 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A sampled distribution contained NaN or +inf.
    #[error("non-finite log-probability in row {row}")]
    NonFiniteLogProb { row: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
