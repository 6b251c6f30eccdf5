//! Adaptive speculation depth.
//!
//! The observed acceptance rate of each step is smoothed with an EMA:
//!
//! ```text
//! ema ← α · observed + (1 − α) · ema
//! ```
//!
//! Above the raise threshold k grows by one, below the lower threshold it
//! shrinks by one, always clamped to `[k_min, k_max]`. At `k = 1` decoding
//! falls back to one target-verified token per step.

use super::config::SpeculativeConfig;

/// Per-sequence speculation state, carried across steps.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeculationState {
    depth: usize,
    min_depth: usize,
    max_depth: usize,
    acceptance_ema: f32,
    alpha: f32,
    raise_threshold: f32,
    lower_threshold: f32,
    generated: usize,
    finished: bool,
}

impl SpeculationState {
    /// Initial state from a validated config.
    pub fn new(config: &SpeculativeConfig) -> Self {
        Self {
            depth: config
                .num_speculative_tokens
                .clamp(config.min_speculative_tokens, config.max_speculative_tokens),
            min_depth: config.min_speculative_tokens,
            max_depth: config.max_speculative_tokens,
            acceptance_ema: config.initial_acceptance_rate,
            alpha: config.ema_alpha,
            raise_threshold: config.raise_threshold,
            lower_threshold: config.lower_threshold,
            generated: 0,
            finished: false,
        }
    }

    /// Current speculation depth k.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Smoothed acceptance rate.
    pub fn acceptance_ema(&self) -> f32 {
        self.acceptance_ema
    }

    /// Tokens generated so far.
    pub fn generated(&self) -> usize {
        self.generated
    }

    /// Check if the sequence has finished.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record the outcome of a step: `accepted` of `drafted` candidates.
    ///
    /// A step that drafted nothing leaves the estimate untouched.
    pub fn observe(&mut self, accepted: usize, drafted: usize) {
        if drafted == 0 {
            return;
        }
        self.observe_rate(accepted as f32 / drafted as f32);
    }

    /// Fold one observed acceptance rate into the EMA and adapt k.
    pub fn observe_rate(&mut self, rate: f32) {
        let rate = rate.clamp(0.0, 1.0);
        self.acceptance_ema = self.alpha * rate + (1.0 - self.alpha) * self.acceptance_ema;

        if self.acceptance_ema > self.raise_threshold {
            self.depth = (self.depth + 1).min(self.max_depth);
        } else if self.acceptance_ema < self.lower_threshold {
            self.depth = self.depth.saturating_sub(1).max(self.min_depth);
        }
    }

    /// Count emitted tokens.
    pub fn record_generated(&mut self, n: usize) {
        self.generated += n;
    }

    /// Mark the sequence finished.
    pub fn finish(&mut self) {
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = SpeculationState::new(&SpeculativeConfig::default());
        assert_eq!(state.depth(), 4);
        assert_eq!(state.acceptance_ema(), 0.5);
        assert!(!state.is_finished());
    }

    #[test]
    fn test_ema_update() {
        let mut state = SpeculationState::new(&SpeculativeConfig::default());
        state.observe(4, 4);
        // 0.3 * 1.0 + 0.7 * 0.5
        assert!((state.acceptance_ema() - 0.65).abs() < 1e-6);
        assert_eq!(state.depth(), 4);

        state.observe(0, 0);
        assert!((state.acceptance_ema() - 0.65).abs() < 1e-6);
    }
}
