//! Engine configuration limits and fixed token ids.

use serde::Deserialize;

/// Static limits and token ids shared by every generation call.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Hard bound on prompt + generated length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// Maximum `batch_size * sequence_length` accepted per call.
    #[serde(default = "default_max_tokens_per_call")]
    pub max_tokens_per_call: usize,

    /// Micro-batching kicks in when `batch_size * sequence_length` exceeds
    /// this threshold.
    #[serde(default = "default_batching_threshold")]
    pub batching_threshold: usize,

    /// Batch chunk size for the micro-batch sweep.
    #[serde(default = "default_micro_batch_size")]
    pub micro_batch_size: usize,

    /// Token id that terminates a row when no explicit stop set is given.
    #[serde(default = "default_termination_id")]
    pub termination_id: u32,

    /// Token id of ":" for the newline-after-colon guard.
    #[serde(default)]
    pub colon_token_id: Option<u32>,

    /// Token id of "\n" for the newline-after-colon guard.
    #[serde(default)]
    pub newline_token_id: Option<u32>,
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_max_tokens_per_call() -> usize {
    65536
}

fn default_batching_threshold() -> usize {
    512
}

fn default_micro_batch_size() -> usize {
    8
}

fn default_termination_id() -> u32 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_position_embeddings: default_max_position_embeddings(),
            max_tokens_per_call: default_max_tokens_per_call(),
            batching_threshold: default_batching_threshold(),
            micro_batch_size: default_micro_batch_size(),
            termination_id: default_termination_id(),
            colon_token_id: None,
            newline_token_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_partial_config_uses_defaults() {
        let json = r#"{
            "max_position_embeddings": 2048,
            "termination_id": 50256,
            "colon_token_id": 25,
            "newline_token_id": 198
        }"#;
        let config: EngineConfig = serde_json::from_str(json).expect("failed to parse config");

        assert_eq!(config.max_position_embeddings, 2048);
        assert_eq!(config.termination_id, 50256);
        assert_eq!(config.colon_token_id, Some(25));
        assert_eq!(config.newline_token_id, Some(198));
        assert_eq!(config.max_tokens_per_call, 65536);
        assert_eq!(config.micro_batch_size, 8);
    }

    #[test]
    fn default_has_no_colon_guard_ids() {
        let config = EngineConfig::default();
        assert!(config.colon_token_id.is_none());
        assert!(config.newline_token_id.is_none());
    }
}
