//! End-to-end tests with the bigram reference backend.

use nano_specdec::{
    BigramBackend, Config, EngineConfig, Error, FinishReason, LLMEngine, SpeculativeConfig,
    TokenEvent,
};
use rstest::rstest;

const VOCAB: usize = 32;
const KV_DIM: usize = 4;

fn config(speculative: SpeculativeConfig) -> Config {
    Config {
        engine: EngineConfig::default()
            .block_size(4)
            .num_blocks(128)
            .num_layers(2)
            .kv_bytes_per_token(KV_DIM * 4),
        speculative,
    }
}

fn engine(temperature: f32, speculative: SpeculativeConfig) -> LLMEngine<BigramBackend> {
    let backend = BigramBackend::new(VOCAB, 2, KV_DIM, 17)
        .unwrap()
        .with_temperature(temperature);
    LLMEngine::new(backend, config(speculative)).unwrap()
}

fn prompts() -> Vec<Vec<u32>> {
    vec![vec![1, 2, 3], vec![7], (10..20).collect()]
}

#[test]
fn test_layout_mismatch_is_config_error() {
    let backend = BigramBackend::new(VOCAB, 3, KV_DIM, 0).unwrap();
    let err = LLMEngine::new(backend, config(SpeculativeConfig::default())).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let backend = BigramBackend::new(VOCAB, 2, KV_DIM, 0).unwrap();
    let spec = SpeculativeConfig::default().depth_bounds(4, 2);
    assert!(matches!(
        LLMEngine::new(backend, config(spec)),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_generate_batch_releases_everything() {
    let spec = SpeculativeConfig::default().max_new_tokens(20).seed(3);
    let mut engine = engine(1.0, spec);

    let outputs = engine.generate_batch(prompts()).unwrap();
    assert_eq!(outputs.len(), 3);
    for (output, prompt) in outputs.iter().zip(prompts()) {
        assert!(output.error.is_none());
        assert_eq!(output.prompt_tokens, prompt);
        assert_eq!(output.output_tokens.len(), 20);
        assert_eq!(output.finish_reason, Some(FinishReason::MaxTokens));
        assert!((1..=20).contains(&output.stats.steps));
        assert_eq!(output.stats.emitted, 20);
    }

    let stats = engine.cache_stats();
    assert_eq!(stats.free_blocks, stats.num_blocks);
    assert_eq!(stats.live_sequences, 0);
}

#[rstest]
#[case::fixed_one(SpeculativeConfig::default().num_tokens(1).depth_bounds(1, 1))]
#[case::fixed_five(SpeculativeConfig::default().num_tokens(5).depth_bounds(5, 5))]
#[case::adaptive(SpeculativeConfig::default().depth_bounds(1, 8).seed(99))]
#[case::no_bonus(SpeculativeConfig::default().bonus_token(false).seed(1234))]
fn test_greedy_output_is_independent_of_speculation(#[case] spec: SpeculativeConfig) {
    let reference = {
        let spec = SpeculativeConfig::default()
            .num_tokens(1)
            .depth_bounds(1, 1)
            .bonus_token(false)
            .max_new_tokens(24)
            .seed(0);
        engine(0.0, spec).generate_batch(prompts()).unwrap()
    };

    let outputs = engine(0.0, spec.max_new_tokens(24))
        .generate_batch(prompts())
        .unwrap();
    for (a, b) in reference.iter().zip(&outputs) {
        assert_eq!(a.output_tokens, b.output_tokens);
    }
}

#[test]
fn test_prior_snapshots_match_context() {
    let backend = BigramBackend::new(VOCAB, 2, KV_DIM, 5)
        .unwrap()
        .with_prior_kv_check(true);
    let spec = SpeculativeConfig::default().max_new_tokens(30).seed(8);
    let mut engine = LLMEngine::new(backend, config(spec)).unwrap();

    for output in engine.generate_batch(prompts()).unwrap() {
        assert!(output.error.is_none(), "{:?}", output.error);
        assert_eq!(output.output_tokens.len(), 30);
    }
}

#[test]
fn test_cache_holds_backend_payloads() -> anyhow::Result<()> {
    let spec = SpeculativeConfig::default().max_new_tokens(64).seed(21);
    let mut engine = engine(1.0, spec);
    let mut seq = engine.allocate_sequence();

    let mut context = vec![4, 8, 15];
    for _ in 0..5 {
        let outcome = engine.generate_step(&mut seq, &context)?;
        assert!(!outcome.finished);
        context = seq.context().to_vec();

        let cached = engine.cache().export_snapshot(seq.sequence_id())?;
        let expected = engine
            .backend()
            .kv_payload(&context[..context.len() - 1], 0)?;
        assert_eq!(cached, expected);
    }
    engine.cache().check_invariants()?;
    assert!(engine.free_sequence(seq)? > 0);
    assert_eq!(engine.cache_stats().used_blocks, 0);
    Ok(())
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let spec = || SpeculativeConfig::default().max_new_tokens(25).seed(42);
    let a = engine(1.0, spec()).generate_batch(prompts()).unwrap();
    let b = engine(1.0, spec()).generate_batch(prompts()).unwrap();
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.output_tokens, y.output_tokens);
        assert_eq!(x.stats, y.stats);
    }
}

#[test]
fn test_stop_token_never_emitted() {
    let stop = 5;
    let spec = SpeculativeConfig::default()
        .stop_token(stop)
        .max_new_tokens(200)
        .seed(77);
    let mut engine = engine(1.0, spec);

    for output in engine.generate_batch(prompts()).unwrap() {
        assert!(!output.output_tokens.contains(&stop));
        match output.finish_reason {
            Some(FinishReason::StopToken) => assert!(output.output_tokens.len() < 200),
            Some(FinishReason::MaxTokens) => assert_eq!(output.output_tokens.len(), 200),
            other => panic!("unexpected finish reason {other:?}"),
        }
    }
    assert_eq!(engine.cache_stats().live_sequences, 0);
}

#[test]
fn test_stream_yields_tokens_then_finished() {
    let spec = SpeculativeConfig::default().max_new_tokens(12).seed(4);
    let mut engine = engine(1.0, spec);

    let events: Vec<TokenEvent> = engine
        .stream(vec![1, 2])
        .unwrap()
        .collect::<nano_specdec::Result<_>>()
        .unwrap();
    assert_eq!(events.len(), 13);
    for (i, event) in events[..12].iter().enumerate() {
        assert!(matches!(event, TokenEvent::Token { index, .. } if *index == i));
    }
    match &events[12] {
        TokenEvent::Finished { reason, stats } => {
            assert_eq!(*reason, FinishReason::MaxTokens);
            assert_eq!(stats.emitted, 12);
        }
        other => panic!("expected Finished, got {other:?}"),
    }
    assert_eq!(engine.cache_stats().live_sequences, 0);
}

#[test]
fn test_dropping_stream_releases_entry() {
    let spec = SpeculativeConfig::default().max_new_tokens(100).seed(4);
    let mut engine = engine(1.0, spec);

    {
        let mut stream = engine.stream(vec![3, 1, 4, 1, 5]).unwrap();
        for _ in 0..3 {
            assert!(matches!(stream.next(), Some(Ok(TokenEvent::Token { .. }))));
        }
    }
    let stats = engine.cache_stats();
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.live_sequences, 0);
}

#[test]
fn test_stream_cancel_reports_freed_blocks() {
    let spec = SpeculativeConfig::default().max_new_tokens(100).seed(4);
    let mut engine = engine(1.0, spec);

    let mut stream = engine.stream((0..9).collect()).unwrap();
    stream.next().unwrap().unwrap();
    // The whole prompt is cached after one round, over 4-token blocks
    assert!(stream.cancel().unwrap() >= 3);
    assert_eq!(engine.cache_stats().used_blocks, 0);
}

#[test]
fn test_stream_rejects_empty_prompt() {
    let mut engine = engine(1.0, SpeculativeConfig::default());
    assert!(matches!(
        engine.stream(Vec::new()),
        Err(Error::MalformedBatch(_))
    ));
}
