//! End-to-end tests for the standard decoding loop and prompt scoring,
//! single-stage and multi-stage.

mod common;

use common::{one_hot_rows, preferred_log_prob, run_pipeline, table_engine};
use pipegen_core::{
    EngineConfig, GenerateError, GenerateOptions, GenerateOutput, GenerationEngine, PromptBatch,
    SamplingConfig, StageRouter, StageSchedule, StageTopology,
};

// next-token walk: 3 -> 4 -> 5 -> 2 (stop), 6 -> 7 -> 2 (stop)
const TABLE: [u32; 8] = [0, 0, 2, 4, 5, 2, 7, 2];

fn generate_all(
    num_stages: usize,
    prompts: &[Vec<u32>],
    tokens_to_generate: usize,
    options: &GenerateOptions,
) -> GenerateOutput {
    let batch = PromptBatch::new(prompts, tokens_to_generate, 0);
    let mut results = run_pipeline(num_stages, |stage, transport| {
        let engine = table_engine(stage, num_stages, transport, one_hot_rows(&TABLE));
        engine.generate(&batch, options).unwrap()
    });
    results
        .remove(0)
        .expect("anchor stage must produce output")
}

#[test]
fn greedy_walks_the_table_until_stop() {
    let output = generate_all(1, &[vec![3]], 5, &GenerateOptions::default());
    assert_eq!(output.tokens.row(0), &[4, 5, 2, 3]);
    assert_eq!(output.generated_lengths, vec![3]);
    assert_eq!(output.prompt_lengths, vec![1]);
}

#[test]
fn echo_keeps_prompt_in_place() {
    let options = GenerateOptions {
        echo_prompts: true,
        ..Default::default()
    };
    let output = generate_all(1, &[vec![3]], 5, &options);
    assert_eq!(output.tokens.row(0), &[3, 4, 5, 2]);
}

#[test]
fn unstarted_rows_keep_their_prompt_tokens() {
    // row 1's second prompt token (6) must survive the catch-up step and
    // steer the walk onto the 6 -> 7 -> 2 path
    let output = generate_all(1, &[vec![3], vec![3, 6]], 4, &GenerateOptions::default());
    assert_eq!(output.tokens.row(0), &[4, 5, 2, 3]);
    assert_eq!(output.tokens.row(1), &[7, 2, 3, 6]);
    assert_eq!(output.generated_lengths, vec![3, 2]);
}

#[test]
fn three_stages_match_single_stage() {
    let options = GenerateOptions {
        return_log_probs: true,
        ..Default::default()
    };
    let single = generate_all(1, &[vec![3], vec![3, 6]], 4, &options);
    let staged = generate_all(3, &[vec![3], vec![3, 6]], 4, &options);
    assert_eq!(single.tokens, staged.tokens);
    assert_eq!(single.generated_lengths, staged.generated_lengths);
    assert_eq!(single.log_probs, staged.log_probs);
}

#[test]
fn log_probs_score_each_emitted_token() {
    let options = GenerateOptions {
        return_log_probs: true,
        echo_prompts: true,
        ..Default::default()
    };
    let output = generate_all(1, &[vec![3]], 5, &options);
    let rows = one_hot_rows(&TABLE);
    let log_probs = output.log_probs.unwrap();
    // sequence is [3, 4, 5, 2]; position p scores token p+1
    let expected = vec![
        preferred_log_prob(&rows[3], 4),
        preferred_log_prob(&rows[4], 5),
        preferred_log_prob(&rows[5], 2),
    ];
    assert_eq!(log_probs[0].len(), expected.len());
    for (got, want) in log_probs[0].iter().zip(&expected) {
        assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
    }
}

#[test]
fn top_k_one_matches_greedy() {
    let sampled = GenerateOptions {
        sampling: SamplingConfig {
            top_k: 1,
            temperature: 0.7,
            ..Default::default()
        },
        seed: Some(11),
        ..Default::default()
    };
    let greedy = generate_all(1, &[vec![3]], 5, &GenerateOptions::default());
    let topk = generate_all(1, &[vec![3]], 5, &sampled);
    assert_eq!(greedy.tokens, topk.tokens);
}

#[test]
fn same_seed_reproduces_sampled_output() {
    let options = GenerateOptions {
        sampling: SamplingConfig {
            top_k: 3,
            temperature: 0.8,
            ..Default::default()
        },
        seed: Some(1234),
        ..Default::default()
    };
    let first = generate_all(1, &[vec![3]], 5, &options);
    let second = generate_all(1, &[vec![3]], 5, &options);
    assert_eq!(first.tokens, second.tokens);
}

#[test]
fn disabled_early_termination_fills_the_grid() {
    let options = GenerateOptions {
        use_stop_tokens_for_early_termination: false,
        ..Default::default()
    };
    let output = generate_all(1, &[vec![3]], 5, &options);
    // stop token lands mid-sequence but decoding runs to the full width
    assert_eq!(output.tokens.max_len(), 6);
    assert_eq!(output.generated_lengths, vec![3]);
}

#[test]
fn micro_batching_does_not_change_results() {
    let prompts = vec![vec![3], vec![6], vec![3, 6]];
    let batch = PromptBatch::new(&prompts, 4, 0);
    let options = GenerateOptions::default();

    let run = |config: EngineConfig| {
        let topology = StageTopology::single(2);
        let transport = pipegen_core::LocalRing::new(1).into_iter().next().unwrap();
        let engine = GenerationEngine::new(
            common::TableStageModel::new(topology, one_hot_rows(&TABLE)),
            StageRouter::new(topology, transport),
            config,
            StageSchedule::Contiguous,
        );
        engine.generate(&batch, &options).unwrap().unwrap()
    };

    let plain = run(EngineConfig::default());
    let swept = run(EngineConfig {
        batching_threshold: 1,
        micro_batch_size: 1,
        ..Default::default()
    });
    assert_eq!(plain.tokens, swept.tokens);
    assert_eq!(plain.generated_lengths, swept.generated_lengths);
}

#[test]
fn score_gathers_next_token_log_probs() {
    let batch = PromptBatch::new(&[vec![3, 4, 5]], 0, 0);
    let results = run_pipeline(2, |stage, transport| {
        let engine = table_engine(stage, 2, transport, one_hot_rows(&TABLE));
        engine.score(&batch).unwrap()
    });
    let scored = results[0].as_ref().expect("anchor output");
    let rows = one_hot_rows(&TABLE);
    let expected = vec![
        preferred_log_prob(&rows[3], 4),
        preferred_log_prob(&rows[4], 5),
    ];
    assert_eq!(scored.log_probs[0].len(), 2);
    for (got, want) in scored.log_probs[0].iter().zip(&expected) {
        assert!((got - want).abs() < 1e-5);
    }
    assert!(results[1].is_none());
}

#[test]
fn prompt_filling_the_grid_is_rejected() {
    let batch = PromptBatch::new(&[vec![3, 4]], 0, 0);
    let transport = pipegen_core::LocalRing::new(1).into_iter().next().unwrap();
    let engine = table_engine(0, 1, transport, one_hot_rows(&TABLE));
    let err = engine
        .generate(&batch, &GenerateOptions::default())
        .unwrap_err();
    assert!(matches!(err, GenerateError::PromptFillsSequence { .. }));
}

#[test]
fn position_budget_is_enforced() {
    let topology = StageTopology::single(2);
    let transport = pipegen_core::LocalRing::new(1).into_iter().next().unwrap();
    let engine = GenerationEngine::new(
        common::TableStageModel::new(topology, one_hot_rows(&TABLE)),
        StageRouter::new(topology, transport),
        EngineConfig {
            max_position_embeddings: 4,
            ..Default::default()
        },
        StageSchedule::Contiguous,
    );
    let batch = PromptBatch::new(&[vec![3]], 8, 0);
    let err = engine
        .generate(&batch, &GenerateOptions::default())
        .unwrap_err();
    assert!(matches!(err, GenerateError::SequenceTooLong { .. }));
}

#[test]
fn token_budget_is_enforced() {
    let topology = StageTopology::single(2);
    let transport = pipegen_core::LocalRing::new(1).into_iter().next().unwrap();
    let engine = GenerationEngine::new(
        common::TableStageModel::new(topology, one_hot_rows(&TABLE)),
        StageRouter::new(topology, transport),
        EngineConfig {
            max_tokens_per_call: 8,
            ..Default::default()
        },
        StageSchedule::Contiguous,
    );
    let batch = PromptBatch::new(&[vec![3], vec![3], vec![3]], 4, 0);
    let err = engine
        .generate(&batch, &GenerateOptions::default())
        .unwrap_err();
    assert!(matches!(err, GenerateError::TokenBudgetExceeded { .. }));
}

#[test]
fn colon_guard_suppresses_the_newline_token() {
    // treat 4 as ":" and 5 as "\n"; after emitting 4 the preferred
    // continuation 5 must be masked away
    let topology = StageTopology::single(2);
    let transport = pipegen_core::LocalRing::new(1).into_iter().next().unwrap();
    let engine = GenerationEngine::new(
        common::TableStageModel::new(topology, one_hot_rows(&TABLE)),
        StageRouter::new(topology, transport),
        EngineConfig {
            colon_token_id: Some(4),
            newline_token_id: Some(5),
            ..Default::default()
        },
        StageSchedule::Contiguous,
    );
    let options = GenerateOptions {
        prevent_newline_after_colon: true,
        echo_prompts: true,
        ..Default::default()
    };
    let batch = PromptBatch::new(&[vec![3]], 3, 0);
    let output = engine.generate(&batch, &options).unwrap().unwrap();
    assert_eq!(output.tokens.get(0, 1), 4);
    assert_ne!(output.tokens.get(0, 2), 5);
}

#[test]
fn colon_guard_applies_to_reported_log_probs() {
    let topology = StageTopology::single(2);
    let transport = pipegen_core::LocalRing::new(1).into_iter().next().unwrap();
    let engine = GenerationEngine::new(
        common::TableStageModel::new(topology, one_hot_rows(&TABLE)),
        StageRouter::new(topology, transport),
        EngineConfig {
            colon_token_id: Some(4),
            newline_token_id: Some(5),
            ..Default::default()
        },
        StageSchedule::Contiguous,
    );
    let options = GenerateOptions {
        prevent_newline_after_colon: true,
        return_log_probs: true,
        echo_prompts: true,
        ..Default::default()
    };
    let batch = PromptBatch::new(&[vec![3]], 3, 0);
    let output = engine.generate(&batch, &options).unwrap().unwrap();
    // masking the preferred continuation after ":" leaves seven equal
    // logits; the fallback token 0 must be reported at -ln(7), not at its
    // unguarded probability
    assert_eq!(output.tokens.get(0, 2), 0);
    let log_probs = output.log_probs.unwrap();
    assert!((log_probs[0][1] + (7f32).ln()).abs() < 1e-4);
}

#[test]
fn exclusive_sampling_strategies_are_rejected() {
    let options = GenerateOptions {
        sampling: SamplingConfig {
            top_k: 4,
            top_p: 0.9,
            ..Default::default()
        },
        ..Default::default()
    };
    let batch = PromptBatch::new(&[vec![3]], 4, 0);
    let transport = pipegen_core::LocalRing::new(1).into_iter().next().unwrap();
    let engine = table_engine(0, 1, transport, one_hot_rows(&TABLE));
    let err = engine.generate(&batch, &options).unwrap_err();
    assert!(matches!(
        err,
        GenerateError::ExclusiveSamplingStrategies { .. }
    ));
}
