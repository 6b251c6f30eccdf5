//! Rejection sampling for speculative decoding.
//!
//! Given draft distributions `q_i` and target distributions `p_i`, each
//! drafted token `x_i` is accepted with probability
//!
//! ```text
//! α_i = min(1, p_i(x_i) / q_i(x_i))
//! ```
//!
//! On the first rejection at position `j`, a replacement is drawn from the
//! residual distribution `norm(max(p_j - q_j, 0))` and the step ends. The
//! emitted token is then distributed exactly as a sample from `p_j`. When
//! every draft is accepted, an optional bonus token is drawn from `p_{k+1}`.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Candidate tokens of one step with the draft distributions they came from.
#[derive(Debug, Clone, Default)]
pub struct DraftProposal {
    /// Drafted token ids, in order.
    pub tokens: Vec<u32>,
    /// Draft distribution `q_i` each token was sampled from.
    pub probs: Vec<Vec<f32>>,
}

impl DraftProposal {
    /// An empty proposal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one drafted token.
    pub fn push(&mut self, token: u32, probs: Vec<f32>) {
        self.tokens.push(token);
        self.probs.push(probs);
    }

    /// Number of drafted tokens (k).
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Check if nothing was drafted.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Outcome of verifying one proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    /// Accept/reject decision per evaluated candidate. Stops at the first
    /// rejection, so it is shorter than k when a draft was rejected.
    pub decisions: Vec<bool>,
    /// Number of drafts accepted (a prefix of the proposal).
    pub num_accepted: usize,
    /// Replacement drawn from the residual distribution after a rejection.
    pub resampled: Option<u32>,
    /// Extra token drawn from the target after a full acceptance.
    pub bonus: Option<u32>,
    /// Tokens to emit: accepted drafts, then the replacement or bonus.
    pub tokens: Vec<u32>,
}

impl VerificationResult {
    /// Check if every drafted token was accepted.
    pub fn all_accepted(&self) -> bool {
        self.resampled.is_none() && self.decisions.iter().all(|&d| d)
    }
}

/// Rejection sampler with its own RNG.
#[derive(Debug, Clone)]
pub struct RejectionSampler {
    rng: StdRng,
}

impl Default for RejectionSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RejectionSampler {
    /// Create a sampler seeded from entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a sampler with a fixed seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Acceptance probability `min(1, p / q)`.
    ///
    /// A token the draft could not have produced (`q <= 0`) is accepted only
    /// if the target gives it any mass.
    pub fn acceptance_probability(target_prob: f32, draft_prob: f32) -> f32 {
        if draft_prob <= 0.0 {
            return if target_prob > 0.0 { 1.0 } else { 0.0 };
        }
        (target_prob / draft_prob).min(1.0)
    }

    /// Normalized `max(p - q, 0)`, or `p` itself when the residual is empty.
    pub fn residual(target: &[f32], draft: &[f32]) -> Vec<f32> {
        let residual: Vec<f32> = target
            .iter()
            .zip(draft)
            .map(|(&p, &q)| (p - q).max(0.0))
            .collect();
        let total: f32 = residual.iter().sum();
        if total <= 0.0 {
            return target.to_vec();
        }
        residual.into_iter().map(|r| r / total).collect()
    }

    /// Draw a token from a (not necessarily normalized) distribution.
    pub fn sample(&mut self, probs: &[f32]) -> Result<u32> {
        let dist = WeightedIndex::new(probs).map_err(|e| {
            Error::MalformedBatch(format!("cannot sample from distribution: {e}"))
        })?;
        Ok(dist.sample(&mut self.rng) as u32)
    }

    /// Accept a single candidate with probability `min(1, p / q)`.
    pub fn accept(&mut self, target_prob: f32, draft_prob: f32) -> bool {
        let alpha = Self::acceptance_probability(target_prob, draft_prob);
        self.rng.gen::<f32>() < alpha
    }

    /// Verify a proposal against `k + 1` target distributions.
    ///
    /// `target_probs[i]` scores candidate `i`; `target_probs[k]` is the
    /// distribution after the last candidate, used for the bonus token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedBatch`] when the shapes disagree or a
    /// candidate lies outside the vocabulary.
    pub fn verify(
        &mut self,
        proposal: &DraftProposal,
        target_probs: &[Vec<f32>],
        bonus_token: bool,
    ) -> Result<VerificationResult> {
        let k = proposal.len();
        if target_probs.len() != k + 1 || proposal.probs.len() != k {
            return Err(Error::MalformedBatch(format!(
                "{k} candidates need {} target distributions, got {}",
                k + 1,
                target_probs.len()
            )));
        }

        let mut result = VerificationResult {
            decisions: Vec::with_capacity(k),
            num_accepted: 0,
            resampled: None,
            bonus: None,
            tokens: Vec::with_capacity(k + 1),
        };

        for (i, &token) in proposal.tokens.iter().enumerate() {
            let p = &target_probs[i];
            let q = &proposal.probs[i];
            if p.len() != q.len() || token as usize >= p.len() {
                return Err(Error::MalformedBatch(format!(
                    "candidate {i}: token {token} against distributions of {} and {}",
                    p.len(),
                    q.len()
                )));
            }

            let accepted = self.accept(p[token as usize], q[token as usize]);
            result.decisions.push(accepted);
            if accepted {
                result.num_accepted += 1;
                result.tokens.push(token);
                continue;
            }

            let replacement = self.sample(&Self::residual(p, q))?;
            result.resampled = Some(replacement);
            result.tokens.push(replacement);
            return Ok(result);
        }

        if bonus_token {
            let bonus = self.sample(&target_probs[k])?;
            result.bonus = Some(bonus);
            result.tokens.push(bonus);
        }
        Ok(result)
    }
}
