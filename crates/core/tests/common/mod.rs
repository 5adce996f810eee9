//! Shared harness: deterministic table-driven stage models and a
//! thread-per-stage pipeline runner.
//!
//! The model family encodes each token id as an f32 in a width-1 hidden
//! state, so activations survive stage hand-offs losslessly and every
//! topology computes the same function: the last stage maps the id at each
//! position to a fixed logits row. Generation therefore walks a known
//! next-token table, which makes whole outputs hand-checkable.

// not every suite uses every helper
#![allow(dead_code)]

use std::sync::Mutex;
use std::thread;

use candle_core::{Device, Tensor};
use pipegen_core::comm::LocalStageTransport;
use pipegen_core::model::{EarlyExit, StageInput, StageOutput};
use pipegen_core::{
    EngineConfig, GenerationEngine, InferenceState, LocalRing, Result, StageModel, StageRouter,
    StageSchedule, StageTopology,
};

pub const PREFERRED_LOGIT: f32 = 4.0;

/// One-hot-ish logits rows: row t prefers `table[t]`, everything else 0.
pub fn one_hot_rows(table: &[u32]) -> Vec<Vec<f32>> {
    let vocab = table.len();
    table
        .iter()
        .map(|&next| {
            let mut row = vec![0.0; vocab];
            row[next as usize] = PREFERRED_LOGIT;
            row
        })
        .collect()
}

/// Expected log-prob of the preferred token in a one-hot row.
pub fn preferred_log_prob(row: &[f32], token: u32) -> f32 {
    pipegen_core::sampling::log_softmax(row)[token as usize]
}

/// Exit head configuration for one stage of a [`TableStageModel`].
#[derive(Debug, Clone, Copy)]
pub struct ExitRule {
    /// Fires when the window's final token equals this.
    pub trigger: u32,
    /// Token the head emits.
    pub token: u32,
    pub layer: usize,
}

/// Deterministic stage model driven by a per-token logits table.
pub struct TableStageModel {
    topology: StageTopology,
    logits_table: Vec<Vec<f32>>,
    exit_rule: Option<ExitRule>,
    armed: Mutex<Option<f32>>,
    device: Device,
}

impl TableStageModel {
    pub fn new(topology: StageTopology, logits_table: Vec<Vec<f32>>) -> Self {
        Self {
            topology,
            logits_table,
            exit_rule: None,
            armed: Mutex::new(None),
            device: Device::Cpu,
        }
    }

    pub fn with_exit_rule(mut self, rule: ExitRule) -> Self {
        self.exit_rule = Some(rule);
        self
    }

    /// Token ids at every input position, decoded from tokens on the first
    /// stage and from the carried activation elsewhere.
    fn position_ids(&self, input: &StageInput<'_>) -> Result<Vec<Vec<u32>>> {
        if let Some(hidden) = input.hidden {
            let values: Vec<Vec<Vec<f32>>> = hidden.to_vec3()?;
            Ok(values
                .iter()
                .map(|row| row.iter().map(|v| v[0].round() as u32).collect())
                .collect())
        } else {
            Ok(input.tokens.to_vec2()?)
        }
    }
}

impl StageModel for TableStageModel {
    fn forward(&self, input: StageInput<'_>, state: &mut InferenceState) -> Result<StageOutput> {
        let ids = self.position_ids(&input)?;
        let batch = ids.len();
        let span = ids[0].len();

        // keep a cache entry alive so beam row remaps exercise the swap
        let flat: Vec<f32> = ids.iter().flatten().map(|&t| t as f32).collect();
        let probe = Tensor::from_vec(flat, (batch, span), &self.device)?;
        state.set_key_value(self.topology.first_layer, probe.clone(), probe);

        let armed = *self.armed.lock().unwrap();
        if let (Some(threshold), Some(rule)) = (armed, self.exit_rule) {
            let last = ids[0][span - 1];
            if last == rule.trigger {
                let hidden = self.carry(&ids)?;
                return Ok(StageOutput {
                    hidden,
                    early_exit: Some(EarlyExit {
                        token: rule.token,
                        log_prob: threshold.ln(),
                        layer: rule.layer,
                    }),
                });
            }
        }

        let hidden = if self.topology.is_last() {
            let vocab = self.vocab_size();
            let mut flat = Vec::with_capacity(batch * span * vocab);
            for row in &ids {
                for &id in row {
                    flat.extend_from_slice(&self.logits_table[id as usize]);
                }
            }
            Tensor::from_vec(flat, (batch, span, vocab), &self.device)?
        } else {
            self.carry(&ids)?
        };
        Ok(StageOutput {
            hidden,
            early_exit: None,
        })
    }

    fn hidden_size(&self) -> usize {
        1
    }

    fn vocab_size(&self) -> usize {
        self.logits_table.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn set_early_exit(&self, threshold: Option<f32>, _exit_layers: &[usize]) {
        *self.armed.lock().unwrap() = threshold;
    }
}

impl TableStageModel {
    fn carry(&self, ids: &[Vec<u32>]) -> Result<Tensor> {
        let batch = ids.len();
        let span = ids[0].len();
        let flat: Vec<f32> = ids.iter().flatten().map(|&t| t as f32).collect();
        Ok(Tensor::from_vec(flat, (batch, span, 1), &self.device)?)
    }
}

/// Run one closure per stage, non-anchor stages on their own threads.
/// Results come back ordered by stage id.
pub fn run_pipeline<R, F>(num_stages: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize, LocalStageTransport) -> R + Sync + Send,
{
    let mut transports = LocalRing::new(num_stages).into_iter().enumerate();
    let (_, anchor_transport) = transports.next().expect("at least one stage");
    let f = &f;
    thread::scope(|scope| {
        let handles: Vec<_> = transports
            .map(|(stage, transport)| scope.spawn(move || f(stage, transport)))
            .collect();
        let mut results = vec![f(0, anchor_transport)];
        for handle in handles {
            results.push(handle.join().expect("stage thread panicked"));
        }
        results
    })
}

/// Engine over a [`TableStageModel`] for one stage of an n-stage topology.
pub fn table_engine(
    stage: usize,
    num_stages: usize,
    transport: LocalStageTransport,
    logits_table: Vec<Vec<f32>>,
) -> GenerationEngine<TableStageModel, LocalStageTransport> {
    let topology = StageTopology::new(stage, num_stages, num_stages * 2);
    let model = TableStageModel::new(topology, logits_table);
    GenerationEngine::new(
        model,
        StageRouter::new(topology, transport),
        EngineConfig::default(),
        StageSchedule::Contiguous,
    )
}
