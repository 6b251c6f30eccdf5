//! Model-compute boundary.
//!
//! The decode loop never computes logits itself. It hands padded batches of
//! token ids to a [`ModelBackend`] and gets back next-token probability
//! vectors (draft side) or per-position target probabilities plus fresh
//! key/value payloads (target side).
//!
//! Device selection and fallback live outside this crate: callers pick a
//! backend and inject it into the [`LLMEngine`](crate::engine::LLMEngine).

pub mod batch;
pub mod bigram;

pub use batch::{BatchRow, PaddedBatch};
pub use bigram::BigramBackend;
pub use crate::error::BackendError;

use crate::core::snapshot::{KvLayout, KvSnapshot};
use crate::error::{Error, Result};

/// Target-side result for one batch row.
#[derive(Debug, Clone)]
pub struct VerifyOutput {
    /// Next-token distributions for the last `num_scored` positions of the row.
    ///
    /// For a row holding `context + k` candidates this is `k + 1` vectors: one
    /// per candidate plus the position after the last candidate.
    pub probs: Vec<Vec<f32>>,
    /// Payloads for every uncached position, `cached_len .. row_len`.
    pub kv: KvSnapshot,
}

/// A draft/target model pair behind one non-reentrant compute boundary.
///
/// Implementations may fail with [`BackendError`]; the caller decides whether
/// to retry on another backend.
pub trait ModelBackend {
    /// Vocabulary size shared by draft and target.
    fn vocab_size(&self) -> usize;

    /// Layout of the key/value payloads produced by [`verify`](Self::verify).
    fn kv_layout(&self) -> KvLayout;

    /// Whether verify rows should carry a snapshot of the cached prefix.
    fn wants_prior_kv(&self) -> bool {
        false
    }

    /// Draft model: next-token distribution after each row.
    fn draft_step(&mut self, batch: &PaddedBatch) -> std::result::Result<Vec<Vec<f32>>, BackendError>;

    /// Target model: score every row in one call.
    fn verify(&mut self, batch: &PaddedBatch) -> std::result::Result<Vec<VerifyOutput>, BackendError>;
}

impl<B: ModelBackend + ?Sized> ModelBackend for Box<B> {
    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }

    fn kv_layout(&self) -> KvLayout {
        (**self).kv_layout()
    }

    fn wants_prior_kv(&self) -> bool {
        (**self).wants_prior_kv()
    }

    fn draft_step(&mut self, batch: &PaddedBatch) -> std::result::Result<Vec<Vec<f32>>, BackendError> {
        (**self).draft_step(batch)
    }

    fn verify(&mut self, batch: &PaddedBatch) -> std::result::Result<Vec<VerifyOutput>, BackendError> {
        (**self).verify(batch)
    }
}

/// Check that a backend answered once per row with full-vocabulary vectors.
pub(crate) fn check_draft_output(batch: &PaddedBatch, probs: &[Vec<f32>], vocab_size: usize) -> Result<()> {
    if probs.len() != batch.num_rows() {
        return Err(Error::MalformedBatch(format!(
            "draft returned {} rows for a batch of {}",
            probs.len(),
            batch.num_rows()
        )));
    }
    probs.iter().try_for_each(|p| check_distribution(p, vocab_size))
}

/// Check verify outputs against the rows they answer.
pub(crate) fn check_verify_output(
    batch: &PaddedBatch,
    outputs: &[VerifyOutput],
    vocab_size: usize,
    layout: KvLayout,
) -> Result<()> {
    if outputs.len() != batch.num_rows() {
        return Err(Error::MalformedBatch(format!(
            "verify returned {} rows for a batch of {}",
            outputs.len(),
            batch.num_rows()
        )));
    }
    for (row, out) in outputs.iter().enumerate() {
        if out.probs.len() != batch.num_scored(row) {
            return Err(Error::MalformedBatch(format!(
                "row {row}: {} distributions for {} scored positions",
                out.probs.len(),
                batch.num_scored(row)
            )));
        }
        out.probs
            .iter()
            .try_for_each(|p| check_distribution(p, vocab_size))?;

        let uncached = batch.row_len(row) - batch.cached_len(row);
        if out.kv.layout() != layout || out.kv.num_tokens() != uncached {
            return Err(Error::MalformedBatch(format!(
                "row {row}: payloads for {} tokens, expected {uncached}",
                out.kv.num_tokens()
            )));
        }
    }
    Ok(())
}

fn check_distribution(probs: &[f32], vocab_size: usize) -> Result<()> {
    if probs.len() != vocab_size {
        return Err(Error::MalformedBatch(format!(
            "distribution over {} tokens, vocabulary has {vocab_size}",
            probs.len()
        )));
    }
    Ok(())
}
