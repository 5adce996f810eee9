//! Stage placement within the pipeline ring.

/// Stage that owns the token grid and returns results to the caller.
pub const ANCHOR_STAGE: usize = 0;

/// How transformer layers are assigned to stages.
///
/// Generation requires [`StageSchedule::Contiguous`]: each stage owns one
/// contiguous slice of layers and each token position is processed by every
/// stage exactly once per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSchedule {
    Contiguous,
    Interleaved,
}

/// One stage's position in the ring and its slice of the layer stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTopology {
    pub stage_id: usize,
    pub num_stages: usize,
    pub first_layer: usize,
    pub num_layers: usize,
}

impl StageTopology {
    /// Even contiguous partition of `total_layers` across `num_stages`,
    /// earlier stages absorbing the remainder.
    pub fn new(stage_id: usize, num_stages: usize, total_layers: usize) -> Self {
        assert!(num_stages > 0, "num_stages must be > 0");
        assert!(stage_id < num_stages, "stage_id out of range");
        assert!(
            total_layers >= num_stages,
            "need at least one layer per stage"
        );
        let base = total_layers / num_stages;
        let remainder = total_layers % num_stages;
        let num_layers = base + usize::from(stage_id < remainder);
        let first_layer = stage_id * base + stage_id.min(remainder);
        Self {
            stage_id,
            num_stages,
            first_layer,
            num_layers,
        }
    }

    /// The degenerate single-stage topology.
    pub fn single(total_layers: usize) -> Self {
        Self::new(0, 1, total_layers)
    }

    pub fn layer_range(&self) -> std::ops::Range<usize> {
        self.first_layer..self.first_layer + self.num_layers
    }

    pub fn is_first(&self) -> bool {
        self.stage_id == 0
    }

    pub fn is_last(&self) -> bool {
        self.stage_id == self.num_stages - 1
    }

    pub fn is_anchor(&self) -> bool {
        self.stage_id == ANCHOR_STAGE
    }

    pub fn is_single(&self) -> bool {
        self.num_stages == 1
    }

    /// Panics when called on the first stage.
    pub fn prev_stage(&self) -> usize {
        assert!(!self.is_first(), "first stage has no predecessor");
        self.stage_id - 1
    }

    /// Panics when called on the last stage.
    pub fn next_stage(&self) -> usize {
        assert!(!self.is_last(), "last stage has no successor");
        self.stage_id + 1
    }

    pub fn last_stage(&self) -> usize {
        self.num_stages - 1
    }
}
