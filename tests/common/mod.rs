//! Shared test fixtures: a scripted backend and engine builders.

#![allow(dead_code)]

use std::collections::VecDeque;

use nano_specdec::core::LayerKv;
use nano_specdec::{
    BackendError, Config, EngineConfig, KvLayout, KvSnapshot, LLMEngine, ModelBackend,
    PaddedBatch, SpeculativeConfig, VerifyOutput,
};

pub const VOCAB: usize = 16;
pub const STOP: u32 = 15;
pub const NUM_LAYERS: usize = 2;
pub const BYTES_PER_TOKEN: usize = 4;

/// How the scripted target answers a verify row.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    /// Agree with every candidate; the position after the last one is `bonus`.
    Echo { bonus: u32 },
    /// Put all mass on one token at every position.
    Fixed(u32),
}

/// A backend whose drafts and verdicts are fixed up front.
///
/// Drafts come from a queue, one token per draft row in row order, as
/// one-hot distributions. Payloads depend on token, position and layer only.
#[derive(Debug)]
pub struct ScriptedBackend {
    pub layout: KvLayout,
    pub drafts: VecDeque<u32>,
    pub default_draft: u32,
    pub target: Target,
    pub fail_draft: bool,
    /// Fail only the draft call with this 1-based number.
    pub fail_draft_call: Option<usize>,
    /// `(call, row)`: answer that draft row with an all-zero vector.
    pub blank_draft: Option<(usize, usize)>,
    pub fail_verify: bool,
    pub drop_verify_row: bool,
    pub draft_calls: usize,
    pub verify_calls: usize,
    /// `(row_len, cached_len)` of every verify row, per call.
    pub verify_rows: Vec<Vec<(usize, usize)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            layout: KvLayout::new(NUM_LAYERS, BYTES_PER_TOKEN),
            drafts: VecDeque::new(),
            default_draft: 1,
            target: Target::Echo { bonus: 2 },
            fail_draft: false,
            fail_draft_call: None,
            blank_draft: None,
            fail_verify: false,
            drop_verify_row: false,
            draft_calls: 0,
            verify_calls: 0,
            verify_rows: Vec::new(),
        }
    }

    pub fn with_drafts(mut self, tokens: &[u32]) -> Self {
        self.drafts.extend(tokens);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

impl ModelBackend for ScriptedBackend {
    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn kv_layout(&self) -> KvLayout {
        self.layout
    }

    fn draft_step(&mut self, batch: &PaddedBatch) -> Result<Vec<Vec<f32>>, BackendError> {
        self.draft_calls += 1;
        if self.fail_draft || self.fail_draft_call == Some(self.draft_calls) {
            return Err(BackendError::new("scripted draft failure"));
        }
        let call = self.draft_calls;
        Ok((0..batch.num_rows())
            .map(|row| {
                let token = self.drafts.pop_front().unwrap_or(self.default_draft);
                if self.blank_draft == Some((call, row)) {
                    vec![0.0; VOCAB]
                } else {
                    one_hot(token)
                }
            })
            .collect())
    }

    fn verify(&mut self, batch: &PaddedBatch) -> Result<Vec<VerifyOutput>, BackendError> {
        self.verify_calls += 1;
        if self.fail_verify {
            return Err(BackendError::new("scripted verify failure"));
        }
        self.verify_rows.push(
            (0..batch.num_rows())
                .map(|row| (batch.row_len(row), batch.cached_len(row)))
                .collect(),
        );

        let mut outputs: Vec<VerifyOutput> = (0..batch.num_rows())
            .map(|row| {
                let tokens = batch.row_tokens(row);
                let k = batch.num_scored(row) - 1;
                let mut probs: Vec<Vec<f32>> = tokens[tokens.len() - k..]
                    .iter()
                    .map(|&candidate| match self.target {
                        Target::Echo { .. } => one_hot(candidate),
                        Target::Fixed(t) => one_hot(t),
                    })
                    .collect();
                probs.push(match self.target {
                    Target::Echo { bonus } => one_hot(bonus),
                    Target::Fixed(t) => one_hot(t),
                });

                let cached = batch.cached_len(row);
                VerifyOutput {
                    probs,
                    kv: payload(self.layout, &tokens[cached..], cached),
                }
            })
            .collect();
        if self.drop_verify_row {
            outputs.pop();
        }
        Ok(outputs)
    }
}

pub fn one_hot(token: u32) -> Vec<f32> {
    let mut probs = vec![0.0; VOCAB];
    probs[token as usize] = 1.0;
    probs
}

fn key_byte(token: u32, pos: usize, layer: usize) -> u8 {
    (token as usize * 31 + pos * 7 + layer) as u8
}

/// Payloads the scripted backend produces for `tokens` at positions `start..`.
pub fn payload(layout: KvLayout, tokens: &[u32], start: usize) -> KvSnapshot {
    let layers = (0..layout.num_layers)
        .map(|layer| {
            let key: Vec<u8> = tokens
                .iter()
                .enumerate()
                .flat_map(|(i, &t)| {
                    std::iter::repeat(key_byte(t, start + i, layer)).take(layout.bytes_per_token)
                })
                .collect();
            let value = key.iter().map(|b| b.wrapping_add(128)).collect();
            LayerKv { key, value }
        })
        .collect();
    KvSnapshot::from_layers(layout, layers).unwrap()
}

pub fn engine_config(block_size: usize, num_blocks: usize) -> EngineConfig {
    EngineConfig::default()
        .block_size(block_size)
        .num_blocks(num_blocks)
        .num_layers(NUM_LAYERS)
        .kv_bytes_per_token(BYTES_PER_TOKEN)
}

/// Fixed depth `k`, no bonus token, stop token [`STOP`].
pub fn fixed_depth(k: usize) -> SpeculativeConfig {
    SpeculativeConfig::default()
        .num_tokens(k)
        .depth_bounds(k, k)
        .bonus_token(false)
        .stop_token(STOP)
        .seed(7)
}

pub fn scripted_engine(
    backend: ScriptedBackend,
    engine: EngineConfig,
    speculative: SpeculativeConfig,
) -> LLMEngine<ScriptedBackend> {
    LLMEngine::new(backend, Config { engine, speculative }).unwrap()
}
