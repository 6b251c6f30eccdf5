//! Per-sequence speculative decode state machine.
//!
//! ```text
//!            begin_step          verify_row           accept
//!   Idle ──────────────▶ Drafting ─────────▶ Verifying ───────▶ Accepting
//!                           ▲                                      │
//!                           └────────────── begin_step ────────────┤
//!                                                                  ├──▶ Finished
//!   (any live state) ── fail ──▶ Failed                            │
//!   (any live state) ── cancel ─▶ Finished ◀───────────────────────┘
//! ```
//!
//! The controller never calls the model itself. A driver (the batch round in
//! [`crate::scheduler::batch`]) collects [`draft_row`](SpeculativeController::draft_row)
//! and [`verify_row`](SpeculativeController::verify_row) from every live
//! controller, issues one backend call per round, and feeds the answers back.
//!
//! ## Cache lag
//!
//! After every step the cache holds exactly `context_len - 1` positions. The
//! newest token's payload is produced by the next verify call, which scores
//! it as part of the row. A stop token is never cached.

use tracing::{debug, warn};

use super::adaptive::SpeculationState;
use super::config::SpeculativeConfig;
use super::sampler::{DraftProposal, RejectionSampler};
use crate::core::paged_cache::SequenceHandle;
use crate::core::sequence::{FinishReason, Sequence, SequenceId};
use crate::error::{Error, Result};
use crate::model::{BatchRow, VerifyOutput};

/// Decode state of one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Created, no step run yet.
    Idle,
    /// Collecting draft tokens.
    Drafting,
    /// Waiting for the target to score the candidates.
    Verifying,
    /// Step done; ready for the next one.
    Accepting,
    /// Stopped normally or cancelled. Cache entry released.
    Finished,
    /// Stopped by an error. Cache entry released.
    Failed,
}

impl DecodeState {
    /// Get the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Drafting => "drafting",
            Self::Verifying => "verifying",
            Self::Accepting => "accepting",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    fn can_transition_to(&self, to: DecodeState) -> bool {
        use DecodeState::*;
        match (self, to) {
            (Idle | Accepting, Drafting) => true,
            (Drafting, Verifying) => true,
            (Verifying, Accepting) => true,
            (from, Finished | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Result of one speculative round for one sequence.
#[derive(Debug)]
pub struct StepOutcome {
    /// The sequence this outcome belongs to.
    pub sequence_id: SequenceId,
    /// Tokens emitted this step, in order. Never contains the stop token.
    pub accepted_tokens: Vec<u32>,
    /// Whether the sequence is done (finished or failed).
    pub finished: bool,
    /// Why the sequence ended, once it has.
    pub finish_reason: Option<FinishReason>,
    /// Failure confined to this sequence.
    pub error: Option<Error>,
}

impl StepOutcome {
    /// Check if this step failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Counters accumulated over the life of a sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeculationStats {
    /// Completed steps.
    pub steps: usize,
    /// Candidates drafted.
    pub drafted: usize,
    /// Candidates accepted.
    pub accepted: usize,
    /// Tokens emitted, after stop-token and budget truncation.
    pub emitted: usize,
    /// Replacement tokens drawn after a rejection.
    pub resampled: usize,
    /// Bonus tokens drawn after a full acceptance.
    pub bonus: usize,
}

impl SpeculationStats {
    /// Fraction of drafted candidates that were accepted.
    pub fn acceptance_rate(&self) -> f32 {
        if self.drafted == 0 {
            return 0.0;
        }
        self.accepted as f32 / self.drafted as f32
    }

    /// Average tokens emitted per step.
    pub fn tokens_per_step(&self) -> f32 {
        if self.steps == 0 {
            return 0.0;
        }
        self.emitted as f32 / self.steps as f32
    }
}

/// Drives one sequence through draft, verify and accept steps.
#[derive(Debug)]
pub struct SpeculativeController {
    handle: SequenceHandle,
    sequence: Sequence,
    state: DecodeState,
    speculation: SpeculationState,
    sampler: RejectionSampler,
    proposal: DraftProposal,
    /// Draft depth of the step in flight.
    step_depth: usize,
    /// Cached positions when the verify row was built.
    verify_cached_len: usize,
    stats: SpeculationStats,
    finish_reason: Option<FinishReason>,
    stop_token_id: Option<u32>,
    max_new_tokens: usize,
    bonus_token: bool,
}

impl SpeculativeController {
    /// Create a controller owning `handle`, starting from `prompt`.
    ///
    /// An empty prompt is allowed; the first
    /// [`sync_context`](Self::sync_context) then supplies it.
    pub fn new(
        handle: SequenceHandle,
        prompt: Vec<u32>,
        config: &SpeculativeConfig,
        seed: u64,
    ) -> Self {
        Self {
            handle,
            sequence: Sequence::new(prompt),
            state: DecodeState::Idle,
            speculation: SpeculationState::new(config),
            sampler: RejectionSampler::with_seed(seed),
            proposal: DraftProposal::new(),
            step_depth: 0,
            verify_cached_len: 0,
            stats: SpeculationStats::default(),
            finish_reason: None,
            stop_token_id: config.stop_token_id,
            max_new_tokens: config.max_new_tokens,
            bonus_token: config.bonus_token,
        }
    }

    /// The cache sequence id.
    pub fn sequence_id(&self) -> SequenceId {
        self.handle.id()
    }

    /// Current decode state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Check if the sequence has finished or failed.
    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    /// Prompt followed by every emitted token.
    pub fn context(&self) -> &[u32] {
        self.sequence.all_token_ids()
    }

    /// Token record of the sequence.
    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    /// Tokens emitted so far.
    pub fn output(&self) -> &[u32] {
        self.sequence.output_token_ids()
    }

    /// Adaptive depth state.
    pub fn speculation(&self) -> &SpeculationState {
        &self.speculation
    }

    /// Lifetime counters.
    pub fn stats(&self) -> SpeculationStats {
        self.stats
    }

    /// Why the sequence ended, once it has.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Extend the recorded context with tokens supplied by the caller.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedBatch`] if `context` does not extend the tokens the
    /// cache was built from.
    pub fn sync_context(&mut self, context: &[u32]) -> Result<()> {
        self.ensure_live()?;
        if !self.sequence.sync(context) {
            return Err(Error::MalformedBatch(format!(
                "context of sequence {} diverges from its cached tokens",
                self.sequence_id()
            )));
        }
        Ok(())
    }

    /// Start a step: pick this step's depth and enter `Drafting`.
    pub fn begin_step(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.sequence.total_len() == 0 {
            return Err(Error::MalformedBatch(format!(
                "sequence {} has no context",
                self.sequence_id()
            )));
        }
        self.transition(DecodeState::Drafting)?;

        let remaining = self.max_new_tokens.saturating_sub(self.speculation.generated());
        self.step_depth = self.speculation.depth().min(remaining).max(1);
        self.proposal = DraftProposal::new();
        Ok(())
    }

    /// Depth of the step in flight.
    pub fn step_depth(&self) -> usize {
        self.step_depth
    }

    /// Check if the step still needs draft tokens.
    pub fn wants_draft(&self) -> bool {
        self.state == DecodeState::Drafting && self.proposal.len() < self.step_depth
    }

    /// Row for the next draft call: context plus candidates drafted so far.
    pub fn draft_row(&self) -> Result<BatchRow> {
        if !self.wants_draft() {
            return Err(self.invalid(DecodeState::Drafting));
        }
        Ok(BatchRow::draft(self.candidate_tokens()))
    }

    /// Sample the next candidate from a draft distribution.
    pub fn push_draft(&mut self, probs: Vec<f32>) -> Result<u32> {
        if !self.wants_draft() {
            return Err(self.invalid(DecodeState::Drafting));
        }
        let token = self.sampler.sample(&probs)?;
        self.proposal.push(token, probs);
        Ok(token)
    }

    /// Candidates drafted in the step in flight.
    pub fn proposal(&self) -> &DraftProposal {
        &self.proposal
    }

    /// Row for the verify call, entering `Verifying`.
    ///
    /// With `include_prior` the row carries a snapshot of the cached prefix.
    pub fn verify_row(&mut self, include_prior: bool) -> Result<BatchRow> {
        if self.wants_draft() {
            return Err(self.invalid(DecodeState::Verifying));
        }
        self.transition(DecodeState::Verifying)?;

        let cache = self.handle.cache();
        let seq_id = self.handle.id();
        self.verify_cached_len = cache.sequence_len(seq_id)?;

        let row = BatchRow::verify(
            self.candidate_tokens(),
            self.verify_cached_len,
            self.proposal.len(),
        );
        if include_prior {
            return Ok(row.with_prior_kv(cache.export_snapshot(seq_id)?));
        }
        Ok(row)
    }

    /// Accept or reject the candidates against the target's answer.
    ///
    /// Cache and budget failures end this sequence and are reported in the
    /// outcome; only state misuse is returned as `Err`.
    pub fn accept(&mut self, output: VerifyOutput) -> Result<StepOutcome> {
        self.transition(DecodeState::Accepting)?;

        let k = self.proposal.len();
        let result = match self.sampler.verify(&self.proposal, &output.probs, self.bonus_token) {
            Ok(result) => result,
            Err(err) => return Ok(self.fail(err)),
        };

        let remaining = self.max_new_tokens.saturating_sub(self.speculation.generated());
        let mut emitted = Vec::with_capacity(result.tokens.len());
        let mut finish = None;
        for &token in &result.tokens {
            if Some(token) == self.stop_token_id {
                finish = Some(FinishReason::StopToken);
                break;
            }
            emitted.push(token);
            if emitted.len() >= remaining {
                finish = Some(FinishReason::MaxTokens);
                break;
            }
        }

        if finish.is_none() {
            let context_len = self.sequence.total_len();
            let new_len = context_len + emitted.len();
            let keep = (new_len - 1)
                .min(context_len + k)
                .saturating_sub(self.verify_cached_len);

            let mut kv = output.kv;
            kv.truncate(keep);
            if let Err(err) = self.handle.cache().import_snapshot(self.handle.id(), &kv) {
                return Ok(self.fail(err));
            }
        }

        self.stats.steps += 1;
        self.stats.drafted += k;
        self.stats.accepted += result.num_accepted;
        self.stats.emitted += emitted.len();
        self.stats.resampled += usize::from(result.resampled.is_some());
        self.stats.bonus += usize::from(result.bonus.is_some());

        self.speculation.observe(result.num_accepted, k);
        self.speculation.record_generated(emitted.len());
        self.sequence.extend(&emitted);

        debug!(
            seq_id = self.sequence_id(),
            drafted = k,
            accepted = result.num_accepted,
            emitted = emitted.len(),
            next_depth = self.speculation.depth(),
            "Speculative step"
        );

        if let Some(reason) = finish {
            self.finish(reason)?;
        }

        Ok(StepOutcome {
            sequence_id: self.sequence_id(),
            accepted_tokens: emitted,
            finished: finish.is_some(),
            finish_reason: finish,
            error: None,
        })
    }

    /// End the sequence with an error and release its cache entry.
    pub fn fail(&mut self, err: Error) -> StepOutcome {
        warn!(seq_id = self.sequence_id(), error = %err, "Sequence failed");
        self.state = DecodeState::Failed;
        self.finish_reason = Some(FinishReason::Failed);
        self.speculation.finish();
        if let Err(release_err) = self.handle.release() {
            warn!(seq_id = self.sequence_id(), error = %release_err, "Releasing failed sequence");
        }

        StepOutcome {
            sequence_id: self.sequence_id(),
            accepted_tokens: Vec::new(),
            finished: true,
            finish_reason: Some(FinishReason::Failed),
            error: Some(err),
        }
    }

    /// Cancel the sequence, returning the number of blocks freed.
    ///
    /// Cancelling a sequence that already ended frees nothing.
    pub fn cancel(&mut self) -> Result<usize> {
        if self.is_done() {
            return Ok(0);
        }
        debug!(seq_id = self.sequence_id(), "Sequence cancelled");
        self.finish(FinishReason::Cancelled)
    }

    /// Release the cache entry without touching the decode state.
    pub(crate) fn release(&mut self) -> Result<usize> {
        self.handle.release()
    }

    fn finish(&mut self, reason: FinishReason) -> Result<usize> {
        self.transition(DecodeState::Finished)?;
        self.finish_reason = Some(reason);
        self.speculation.finish();
        self.handle.release()
    }

    fn candidate_tokens(&self) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(self.sequence.total_len() + self.proposal.len());
        tokens.extend_from_slice(self.sequence.all_token_ids());
        tokens.extend_from_slice(&self.proposal.tokens);
        tokens
    }

    fn ensure_live(&self) -> Result<()> {
        if self.handle.is_released() {
            return Err(Error::InvalidSequenceHandle(self.sequence_id()));
        }
        Ok(())
    }

    fn transition(&mut self, to: DecodeState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(())
    }

    fn invalid(&self, to: DecodeState) -> Error {
        Error::InvalidStateTransition {
            from: self.state.as_str(),
            to: to.as_str(),
        }
    }
}
