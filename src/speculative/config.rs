//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for speculative decoding.
///
/// Each step drafts `k` tokens with the draft model and verifies them with
/// the target model in a single call. `k` starts at `num_speculative_tokens`
/// and adapts within `[min_speculative_tokens, max_speculative_tokens]`
/// following an exponential moving average of the acceptance rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Initial speculation depth (K).
    /// Higher values pay off when the acceptance rate is high,
    /// but waste verification work when many tokens are rejected.
    pub num_speculative_tokens: usize,

    /// Lower bound for K. At 1 decoding degenerates to one token per step.
    pub min_speculative_tokens: usize,

    /// Upper bound for K.
    pub max_speculative_tokens: usize,

    /// Smoothing constant of the acceptance-rate EMA, in (0, 1].
    pub ema_alpha: f32,

    /// K grows by one while the EMA is above this rate.
    pub raise_threshold: f32,

    /// K shrinks by one while the EMA is below this rate.
    pub lower_threshold: f32,

    /// EMA value before the first step.
    pub initial_acceptance_rate: f32,

    /// Sample one extra token from the target when all K drafts are accepted.
    pub bonus_token: bool,

    /// Token that ends a sequence. Never emitted or cached.
    pub stop_token_id: Option<u32>,

    /// Maximum number of generated tokens per sequence.
    pub max_new_tokens: usize,

    /// Base seed for per-sequence RNGs. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 4,
            min_speculative_tokens: 1,
            max_speculative_tokens: 8,
            ema_alpha: 0.3,
            raise_threshold: 0.75,
            lower_threshold: 0.4,
            initial_acceptance_rate: 0.5,
            bonus_token: true,
            stop_token_id: None,
            max_new_tokens: 256,
            seed: None,
        }
    }
}

impl SpeculativeConfig {
    /// Set the initial number of speculative tokens.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }

    /// Set the depth bounds.
    pub fn depth_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_speculative_tokens = min;
        self.max_speculative_tokens = max;
        self
    }

    /// Set the EMA smoothing constant.
    pub fn ema_alpha(mut self, alpha: f32) -> Self {
        self.ema_alpha = alpha;
        self
    }

    /// Set the adaptation thresholds.
    pub fn thresholds(mut self, lower: f32, raise: f32) -> Self {
        self.lower_threshold = lower;
        self.raise_threshold = raise;
        self
    }

    /// Enable or disable the bonus token.
    pub fn bonus_token(mut self, enabled: bool) -> Self {
        self.bonus_token = enabled;
        self
    }

    /// Set the stop token.
    pub fn stop_token(mut self, token_id: u32) -> Self {
        self.stop_token_id = Some(token_id);
        self
    }

    /// Set the generation budget.
    pub fn max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = n;
        self
    }

    /// Set the RNG seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.min_speculative_tokens == 0 {
            return Err(Error::Config(
                "min_speculative_tokens must be at least 1".into(),
            ));
        }
        if self.min_speculative_tokens > self.max_speculative_tokens {
            return Err(Error::Config(format!(
                "min_speculative_tokens ({}) exceeds max_speculative_tokens ({})",
                self.min_speculative_tokens, self.max_speculative_tokens
            )));
        }
        if !(self.min_speculative_tokens..=self.max_speculative_tokens)
            .contains(&self.num_speculative_tokens)
        {
            return Err(Error::Config(format!(
                "num_speculative_tokens ({}) outside [{}, {}]",
                self.num_speculative_tokens,
                self.min_speculative_tokens,
                self.max_speculative_tokens
            )));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(Error::Config(format!(
                "ema_alpha must be in (0, 1], got {}",
                self.ema_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.lower_threshold)
            || !(0.0..=1.0).contains(&self.raise_threshold)
            || self.lower_threshold >= self.raise_threshold
        {
            return Err(Error::Config(format!(
                "thresholds must satisfy 0 <= lower ({}) < raise ({}) <= 1",
                self.lower_threshold, self.raise_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.initial_acceptance_rate) {
            return Err(Error::Config(format!(
                "initial_acceptance_rate must be in [0, 1], got {}",
                self.initial_acceptance_rate
            )));
        }
        if self.max_new_tokens == 0 {
            return Err(Error::Config("max_new_tokens must be positive".into()));
        }
        Ok(())
    }
}
