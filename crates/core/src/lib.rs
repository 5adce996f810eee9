//! Pipeline-staged autoregressive token generation.
//!
//! A model is split layer-wise across an ordered ring of stages. Each
//! decode step, activations flow first stage to last, the finalized token
//! returns to the anchor stage, and a step outcome broadcast keeps every
//! stage in lock step. On top of that protocol the crate provides greedy
//! and sampled decoding, prompt scoring, early-exit decoding through
//! intermediate exit heads, and cache-consistent beam search.
//!
//! The model itself is opaque: anything implementing [`model::StageModel`]
//! plugs in, and anything implementing [`comm::StageTransport`] carries the
//! messages. [`comm::LocalRing`] runs a whole topology inside one process.

pub mod beam;
pub mod comm;
pub mod config;
pub mod decode;
pub mod early_exit;
pub mod engine;
pub mod error;
pub mod forward;
pub mod model;
pub mod sampling;
pub mod state;
pub mod topology;

pub use beam::{BeamSearchOptions, BeamSearchOutput};
pub use comm::{LocalRing, ProtocolError, StageRouter, StageTransport};
pub use config::EngineConfig;
pub use early_exit::EarlyExitOptions;
pub use engine::{GenerateOptions, GenerateOutput, GenerationEngine, PromptBatch, ScoreOutput};
pub use error::{GenerateError, Result};
pub use model::{StageInput, StageModel, StageOutput};
pub use sampling::SamplingConfig;
pub use state::InferenceState;
pub use topology::{StageSchedule, StageTopology};
