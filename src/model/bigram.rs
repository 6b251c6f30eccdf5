//! Bigram reference backend.
//!
//! A draft/target pair where the next-token distribution depends only on the
//! current token. Both models are `[vocab, vocab]` logits tables; the draft
//! table is the target table plus seeded noise, so the two disagree often
//! enough to exercise rejection and resampling.
//!
//! Key/value payloads are a deterministic function of token, position and
//! layer. Tests can therefore rebuild what the cache should hold for any
//! context and compare it byte for byte.
//!
//! ```text
//! key[l][p]   = table[token_p] + p + 1000 * l
//! value[l][p] = 2 * table[token_p] - (p + 1000 * l)
//! ```

use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ModelBackend, PaddedBatch, VerifyOutput};
use crate::core::snapshot::{KvLayout, KvSnapshot, LayerKv};
use crate::error::{BackendError, Error, Result};

/// Spread of the noise added to the target table to form the draft table.
const DRAFT_NOISE: f32 = 1.0;

/// Reference [`ModelBackend`] on CPU tensors.
#[derive(Debug, Clone)]
pub struct BigramBackend {
    /// Target logits `[vocab, vocab]`, row = current token.
    target: Tensor,
    /// Draft logits `[vocab, vocab]`.
    draft: Tensor,
    /// Per-token payload base `[vocab, kv_dim]`.
    kv_table: Tensor,
    vocab_size: usize,
    layout: KvLayout,
    /// Softmax temperature; `0` makes both models greedy.
    temperature: f32,
    /// Validate prior snapshots against the context on every verify.
    check_prior_kv: bool,
    device: Device,
}

impl BigramBackend {
    /// Random tables drawn from `seed`.
    ///
    /// `kv_dim` is the number of `f32` values per token per layer, so the
    /// payload layout has `4 * kv_dim` bytes per token.
    pub fn new(vocab_size: usize, num_layers: usize, kv_dim: usize, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let target: Vec<f32> = (0..vocab_size * vocab_size)
            .map(|_| rng.gen_range(-3.0f32..3.0))
            .collect();
        let draft: Vec<f32> = target
            .iter()
            .map(|&logit| logit + rng.gen_range(-DRAFT_NOISE..DRAFT_NOISE))
            .collect();
        Self::from_tables(target, draft, vocab_size, num_layers, kv_dim, &mut rng)
    }

    /// Build from explicit logits tables, one row per current token.
    pub fn from_logits(
        target: &[Vec<f32>],
        draft: &[Vec<f32>],
        num_layers: usize,
        kv_dim: usize,
    ) -> Result<Self> {
        let vocab_size = target.len();
        let square = |table: &[Vec<f32>]| {
            table.len() == vocab_size && table.iter().all(|row| row.len() == vocab_size)
        };
        if !square(target) || !square(draft) {
            return Err(Error::Config(format!(
                "bigram tables must both be {vocab_size}x{vocab_size}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(0);
        Self::from_tables(
            target.concat(),
            draft.concat(),
            vocab_size,
            num_layers,
            kv_dim,
            &mut rng,
        )
    }

    fn from_tables(
        target: Vec<f32>,
        draft: Vec<f32>,
        vocab_size: usize,
        num_layers: usize,
        kv_dim: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if vocab_size == 0 || num_layers == 0 || kv_dim == 0 {
            return Err(Error::Config(
                "bigram backend needs a vocabulary, layers and a payload width".into(),
            ));
        }
        let device = Device::Cpu;
        let kv: Vec<f32> = (0..vocab_size * kv_dim)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();

        Ok(Self {
            target: Tensor::from_vec(target, (vocab_size, vocab_size), &device)?,
            draft: Tensor::from_vec(draft, (vocab_size, vocab_size), &device)?,
            kv_table: Tensor::from_vec(kv, (vocab_size, kv_dim), &device)?,
            vocab_size,
            layout: KvLayout::new(num_layers, kv_dim * std::mem::size_of::<f32>()),
            temperature: 1.0,
            check_prior_kv: false,
            device,
        })
    }

    /// Set the softmax temperature. `0` selects greedy one-hot output.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.max(0.0);
        self
    }

    /// Ask for prior snapshots on verify rows and check them against the context.
    pub fn with_prior_kv_check(mut self, enabled: bool) -> Self {
        self.check_prior_kv = enabled;
        self
    }

    /// Payloads for `tokens` placed at positions `start_pos..`.
    pub fn kv_payload(&self, tokens: &[u32], start_pos: usize) -> Result<KvSnapshot> {
        if tokens.is_empty() {
            return Ok(KvSnapshot::empty(self.layout));
        }
        self.check_tokens(tokens)?;

        let n = tokens.len();
        let ids = Tensor::from_slice(tokens, n, &self.device)?;
        let base = self.kv_table.index_select(&ids, 0)?;
        let positions = Tensor::arange(start_pos as f32, (start_pos + n) as f32, &self.device)?
            .unsqueeze(1)?;

        let mut layers = Vec::with_capacity(self.layout.num_layers);
        for layer in 0..self.layout.num_layers {
            let offset = positions.affine(1.0, 1000.0 * layer as f64)?;
            let key = base.broadcast_add(&offset)?;
            let value = base.affine(2.0, 0.0)?.broadcast_sub(&offset)?;
            layers.push(LayerKv {
                key: to_le_bytes(&key)?,
                value: to_le_bytes(&value)?,
            });
        }
        KvSnapshot::from_layers(self.layout, layers)
    }

    fn check_tokens(&self, tokens: &[u32]) -> Result<()> {
        match tokens.iter().find(|&&t| t as usize >= self.vocab_size) {
            Some(t) => Err(Error::MalformedBatch(format!(
                "token {t} outside vocabulary of {}",
                self.vocab_size
            ))),
            None => Ok(()),
        }
    }

    /// Next-token distributions after each of `tokens`.
    fn distributions(&self, table: &Tensor, tokens: &[u32]) -> Result<Vec<Vec<f32>>> {
        self.check_tokens(tokens)?;
        let ids = Tensor::from_slice(tokens, tokens.len(), &self.device)?;
        let logits = table.index_select(&ids, 0)?;

        if self.temperature == 0.0 {
            let argmax = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
            return Ok(argmax
                .into_iter()
                .map(|token| one_hot(token, self.vocab_size))
                .collect());
        }

        let logits = (logits / self.temperature as f64)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2::<f32>()?)
    }

    /// Unpadded rows recovered from the padded id tensor and its mask.
    fn unpad(&self, batch: &PaddedBatch) -> Result<Vec<Vec<u32>>> {
        let (ids, mask) = batch.to_tensors(&self.device)?;
        let lengths = mask.to_dtype(DType::U32)?.sum(1)?.to_vec1::<u32>()?;
        let ids = ids.to_vec2::<u32>()?;
        Ok(ids
            .into_iter()
            .zip(lengths)
            .map(|(mut row, len)| {
                row.truncate(len as usize);
                row
            })
            .collect())
    }

    fn check_prior(&self, batch: &PaddedBatch, row: usize, tokens: &[u32]) -> Result<()> {
        let cached = batch.cached_len(row);
        if cached == 0 {
            return Ok(());
        }
        let prior = batch
            .prior_kv(row)
            .ok_or_else(|| Error::MalformedBatch(format!("row {row}: missing prior snapshot")))?;
        if *prior != self.kv_payload(&tokens[..cached], 0)? {
            return Err(Error::CacheCorruption(format!(
                "row {row}: prior snapshot does not match its context"
            )));
        }
        Ok(())
    }

    fn verify_batch(&self, batch: &PaddedBatch) -> Result<Vec<VerifyOutput>> {
        let rows = self.unpad(batch)?;

        // Score every row in one lookup, then split per row.
        let mut scored = Vec::new();
        for (row, tokens) in rows.iter().enumerate() {
            scored.extend_from_slice(&tokens[tokens.len() - batch.num_scored(row)..]);
        }
        let mut probs = self.distributions(&self.target, &scored)?.into_iter();

        let mut outputs = Vec::with_capacity(rows.len());
        for (row, tokens) in rows.iter().enumerate() {
            if self.check_prior_kv {
                self.check_prior(batch, row, tokens)?;
            }
            let cached = batch.cached_len(row);
            outputs.push(VerifyOutput {
                probs: probs.by_ref().take(batch.num_scored(row)).collect(),
                kv: self.kv_payload(&tokens[cached..], cached)?,
            });
        }
        Ok(outputs)
    }
}

impl ModelBackend for BigramBackend {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn kv_layout(&self) -> KvLayout {
        self.layout
    }

    fn wants_prior_kv(&self) -> bool {
        self.check_prior_kv
    }

    fn draft_step(&mut self, batch: &PaddedBatch) -> std::result::Result<Vec<Vec<f32>>, BackendError> {
        let last: Vec<u32> = self
            .unpad(batch)
            .map_err(|e| BackendError::with_source("draft unpadding failed", e))?
            .iter()
            .filter_map(|row| row.last().copied())
            .collect();
        self.distributions(&self.draft, &last)
            .map_err(|e| BackendError::with_source("draft step failed", e))
    }

    fn verify(&mut self, batch: &PaddedBatch) -> std::result::Result<Vec<VerifyOutput>, BackendError> {
        self.verify_batch(batch)
            .map_err(|e| BackendError::with_source("verify failed", e))
    }
}

fn one_hot(token: u32, vocab_size: usize) -> Vec<f32> {
    let mut probs = vec![0.0; vocab_size];
    probs[token as usize] = 1.0;
    probs
}

fn to_le_bytes(tensor: &Tensor) -> candle_core::Result<Vec<u8>> {
    Ok(tensor
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .flat_map(f32::to_le_bytes)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchRow;

    fn backend() -> BigramBackend {
        BigramBackend::new(8, 2, 3, 7).unwrap()
    }

    #[test]
    fn test_draft_distributions_sum_to_one() {
        let mut backend = backend();
        let batch = PaddedBatch::new(
            vec![BatchRow::draft(vec![1, 2]), BatchRow::draft(vec![5])],
            0,
        )
        .unwrap();

        let probs = backend.draft_step(&batch).unwrap();
        assert_eq!(probs.len(), 2);
        for p in &probs {
            assert_eq!(p.len(), 8);
            assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_greedy_is_one_hot() {
        let mut backend = backend().with_temperature(0.0);
        let batch = PaddedBatch::new(vec![BatchRow::draft(vec![3])], 0).unwrap();
        let probs = backend.draft_step(&batch).unwrap();
        assert_eq!(probs[0].iter().filter(|&&p| p == 1.0).count(), 1);
        assert_eq!(probs[0].iter().filter(|&&p| p == 0.0).count(), 7);
    }

    #[test]
    fn test_verify_shapes() {
        let mut backend = backend();
        let batch = PaddedBatch::new(
            vec![
                BatchRow::verify(vec![1, 2, 3, 4, 5], 2, 2),
                BatchRow::verify(vec![6, 7], 0, 1),
            ],
            0,
        )
        .unwrap();

        let out = backend.verify(&batch).unwrap();
        assert_eq!(out[0].probs.len(), 3);
        assert_eq!(out[0].kv.num_tokens(), 3);
        assert_eq!(out[1].probs.len(), 2);
        assert_eq!(out[1].kv.num_tokens(), 2);
        assert_eq!(out[0].kv.layout(), KvLayout::new(2, 12));
    }

    #[test]
    fn test_kv_payload_is_positional() {
        let backend = backend();
        let whole = backend.kv_payload(&[1, 2, 3, 4], 0).unwrap();
        let tail = backend.kv_payload(&[3, 4], 2).unwrap();
        let mut expected = whole.clone();
        expected.truncate(2);
        assert_eq!(expected, backend.kv_payload(&[1, 2], 0).unwrap());
        assert_eq!(
            whole.layer(1).unwrap().key[24..],
            tail.layer(1).unwrap().key[..]
        );
    }

    #[test]
    fn test_prior_check_detects_divergence() {
        let mut backend = backend().with_prior_kv_check(true);
        assert!(backend.wants_prior_kv());

        let good = backend.kv_payload(&[1, 2], 0).unwrap();
        let row = BatchRow::verify(vec![1, 2, 3], 2, 0).with_prior_kv(good);
        assert!(backend.verify(&PaddedBatch::new(vec![row], 0).unwrap()).is_ok());

        let bad = backend.kv_payload(&[2, 1], 0).unwrap();
        let row = BatchRow::verify(vec![1, 2, 3], 2, 0).with_prior_kv(bad);
        assert!(backend.verify(&PaddedBatch::new(vec![row], 0).unwrap()).is_err());
    }

    #[test]
    fn test_rejects_out_of_vocab_tokens() {
        let mut backend = backend();
        let batch = PaddedBatch::new(vec![BatchRow::draft(vec![8])], 0).unwrap();
        assert!(backend.draft_step(&batch).is_err());
    }
}
