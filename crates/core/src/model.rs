//! The model seam: everything the decode loops need from a stage's slice of
//! the network, and nothing else.
//!
//! The engine never inspects weights or layers. A stage model consumes
//! token or activation input for a span of positions, updates the cache
//! through [`InferenceState`], and hands back either hidden states for the
//! next stage or (on the last stage) vocabulary logits. When early exit is
//! armed, the model itself decides at its exit heads whether confidence
//! clears the threshold.

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::state::InferenceState;

/// Input for one stage forward pass over a span of positions.
///
/// `hidden` is `None` on the first stage (which embeds `tokens`) and the
/// received activation everywhere else. `tokens` and `positions` are
/// `[batch, span]`; `mask` is the causal mask slice for the span.
pub struct StageInput<'a> {
    pub tokens: &'a Tensor,
    pub positions: &'a Tensor,
    pub mask: &'a Tensor,
    pub hidden: Option<&'a Tensor>,
}

/// A confident prediction taken at an intermediate exit head.
#[derive(Debug, Clone)]
pub struct EarlyExit {
    pub token: u32,
    pub log_prob: f32,
    pub layer: usize,
}

/// Result of one stage forward pass.
///
/// `hidden` is the activation for the next stage, or `[batch, span, vocab]`
/// logits on the last stage. `early_exit` is set only when early exit is
/// armed and an exit head on this stage cleared the threshold.
pub struct StageOutput {
    pub hidden: Tensor,
    pub early_exit: Option<EarlyExit>,
}

/// One stage's slice of the network.
pub trait StageModel: Send {
    fn forward(&self, input: StageInput<'_>, state: &mut InferenceState) -> Result<StageOutput>;

    fn hidden_size(&self) -> usize;

    fn vocab_size(&self) -> usize;

    fn device(&self) -> &Device;

    /// Arm or disarm the model's exit heads for the coming call.
    ///
    /// `threshold` is a probability; an exit head fires when the maximum
    /// next-token probability at its layer reaches it. Models without exit
    /// heads ignore this.
    fn set_early_exit(&self, _threshold: Option<f32>, _exit_layers: &[usize]) {}
}
