//! Token sampling over raw logit slices.
//!
//! Logits arrive as `&[f32]` rows pulled off the last stage's output
//! tensor. Strategies modify the logits in place (temperature scaling,
//! top-k / top-p masking) and then draw from the renormalized distribution.
//! top-k and top-p are mutually exclusive; with neither active, sampling
//! degenerates to argmax regardless of temperature.

use rand::distributions::Distribution;
use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{GenerateError, Result};

/// Sampling strategy knobs for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    /// Keep only the k highest logits. 0 disables.
    pub top_k: usize,
    /// Keep the smallest prefix of the sorted distribution whose cumulative
    /// probability reaches this value. 0.0 disables.
    pub top_p: f32,
    /// Multiplied into `top_p` after each decode step. 0.0 disables decay.
    pub top_p_decay: f32,
    /// Floor for the decayed `top_p`. 0.0 disables the floor.
    pub top_p_bound: f32,
    pub temperature: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: 0,
            top_p: 0.0,
            top_p_decay: 0.0,
            top_p_bound: 0.0,
            temperature: 1.0,
        }
    }
}

impl SamplingConfig {
    /// Deterministic argmax decoding.
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k > 0 && self.top_p > 0.0 {
            return Err(GenerateError::ExclusiveSamplingStrategies {
                top_k: self.top_k,
                top_p: self.top_p,
            });
        }
        if self.temperature <= 0.0 {
            return Err(GenerateError::InvalidTemperature {
                temperature: self.temperature,
            });
        }
        Ok(())
    }

    /// Both strategies unset. Temperature scaling never reorders logits,
    /// so the draw collapses to argmax.
    pub fn is_greedy(&self) -> bool {
        self.top_k == 0 && self.top_p == 0.0
    }

    /// Apply one step of geometric top-p decay, clamped to the bound.
    pub fn decay_top_p(&mut self) {
        if self.top_p > 0.0 && self.top_p_decay > 0.0 {
            self.top_p *= self.top_p_decay;
            if self.top_p_bound > 0.0 && self.top_p < self.top_p_bound {
                self.top_p = self.top_p_bound;
            }
        }
    }
}

/// Seeded RNG state carried across decode steps.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

/// Numerically stable softmax over a logit slice.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&x| x / sum).collect()
}

/// Numerically stable log-softmax over a logit slice.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let log_sum: f32 = logits
        .iter()
        .map(|&x| (x - max).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max - log_sum).collect()
}

pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &x) in logits.iter().enumerate() {
        if x > logits[best] {
            best = i;
        }
    }
    best as u32
}

/// Mask all but the k highest logits to -inf.
fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let cutoff = sorted[k - 1];
    for x in logits.iter_mut() {
        if *x < cutoff {
            *x = f32::NEG_INFINITY;
        }
    }
}

/// Mask everything outside the smallest probability-`p` prefix to -inf.
fn apply_top_p(logits: &mut [f32], p: f32) {
    if p <= 0.0 || p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut cumulative = 0.0;
    let mut keep = vec![false; logits.len()];
    for &i in &order {
        keep[i] = true;
        cumulative += probs[i];
        if cumulative >= p {
            break;
        }
    }
    for (i, x) in logits.iter_mut().enumerate() {
        if !keep[i] {
            *x = f32::NEG_INFINITY;
        }
    }
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    match WeightedIndex::new(probs) {
        Ok(dist) => dist.sample(rng) as u32,
        // all-zero weights can only happen when every kept prob underflowed
        Err(_) => argmax(probs),
    }
}

/// Draw one token from a logit row under the given strategy.
///
/// `row` is reported in numeric errors so the caller can name the failing
/// batch row.
pub fn sample(
    logits: &[f32],
    config: &SamplingConfig,
    state: &mut SamplerState,
    row: usize,
) -> Result<u32> {
    if logits.iter().any(|x| x.is_nan() || *x == f32::INFINITY) {
        return Err(GenerateError::NonFiniteLogProb { row });
    }
    if config.is_greedy() {
        return Ok(argmax(logits));
    }

    let mut scaled: Vec<f32> = if (config.temperature - 1.0).abs() > f32::EPSILON {
        logits.iter().map(|&x| x / config.temperature).collect()
    } else {
        logits.to_vec()
    };
    apply_top_k(&mut scaled, config.top_k);
    apply_top_p(&mut scaled, config.top_p);

    let probs = softmax(&scaled);
    Ok(sample_from_probs(&probs, &mut state.rng))
}
