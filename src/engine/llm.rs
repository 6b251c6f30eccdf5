//! Speculative decoding engine.
//!
//! The LLMEngine is the explicit context object that ties the pieces
//! together:
//! - the paged KV cache shared by every sequence
//! - the injected draft/target backend
//! - the speculative configuration and per-sequence seeding
//!
//! ## Engine Flow
//!
//! ```text
//!  allocate_sequence()          start_batch(prompts)
//!         │                            │
//!         ▼                            ▼
//!  ┌──────────────┐             ┌──────────────┐
//!  │ generate_step│             │  batch_step  │  ◀── until finished
//!  │ (one round)  │             │ (one round)  │
//!  └──────────────┘             └──────────────┘
//!         │                            │
//!         └──────────┬─────────────────┘
//!                    ▼
//!          draft ▸ verify ▸ accept
//!                    │
//!                    ▼
//!          PagedCache append / free
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use super::stream::TokenStream;
use crate::config::Config;
use crate::core::paged_cache::{CacheStats, PagedCache, SequenceHandle};
use crate::core::sequence::{FinishReason, SequenceId};
use crate::error::{Error, Result};
use crate::model::ModelBackend;
use crate::scheduler::batch::{run_round, BatchHandle};
use crate::speculative::controller::{SpeculationStats, SpeculativeController, StepOutcome};

/// Output of one sequence of a finished batch.
#[derive(Debug)]
pub struct GenerationOutput {
    /// Cache sequence id.
    pub sequence_id: SequenceId,
    /// Prompt token ids.
    pub prompt_tokens: Vec<u32>,
    /// Generated token ids.
    pub output_tokens: Vec<u32>,
    /// Reason for finishing.
    pub finish_reason: Option<FinishReason>,
    /// Speculation counters.
    pub stats: SpeculationStats,
    /// Error that ended the sequence, if any.
    pub error: Option<Error>,
}

/// Speculative decoding engine over one backend and one cache.
#[derive(Debug)]
pub struct LLMEngine<B: ModelBackend> {
    /// Draft/target compute.
    backend: B,
    /// Shared paged cache.
    cache: Arc<PagedCache>,
    /// Engine and decode configuration.
    config: Config,
    /// Sequences started so far, used to derive per-sequence seeds.
    num_started: u64,
}

impl<B: ModelBackend> LLMEngine<B> {
    /// Create an engine, allocating the whole cache up front.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the configuration is invalid or the backend's
    /// payload layout does not match the cache's.
    pub fn new(backend: B, config: Config) -> Result<Self> {
        config.validate()?;
        let cache = PagedCache::new(&config.engine)?;
        if backend.kv_layout() != cache.layout() {
            return Err(Error::Config(format!(
                "backend payload layout {:?} does not match cache layout {:?}",
                backend.kv_layout(),
                cache.layout()
            )));
        }

        info!(
            num_blocks = config.engine.num_blocks,
            block_size = config.engine.block_size,
            vocab_size = backend.vocab_size(),
            "Engine initialized"
        );

        Ok(Self {
            backend,
            cache: Arc::new(cache),
            config,
            num_started: 0,
        })
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<PagedCache> {
        &self.cache
    }

    /// Pool usage.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Start an empty sequence; its context arrives with the first
    /// [`generate_step`](Self::generate_step).
    ///
    /// Dropping the returned controller releases its cache entry.
    pub fn allocate_sequence(&mut self) -> SpeculativeController {
        self.new_controller(Vec::new())
    }

    /// Run one speculative round for a single sequence.
    ///
    /// `context` must extend the tokens the sequence has seen so far (its
    /// prompt and every token emitted). Backend and cache failures end the
    /// sequence and are reported in the outcome.
    pub fn generate_step(
        &mut self,
        sequence: &mut SpeculativeController,
        context: &[u32],
    ) -> Result<StepOutcome> {
        sequence.sync_context(context)?;
        self.step_controller(sequence)
    }

    /// Release a sequence's cache entry, returning the number of blocks freed.
    pub fn free_sequence(&self, mut sequence: SpeculativeController) -> Result<usize> {
        if sequence.is_done() {
            return Ok(0);
        }
        sequence.release()
    }

    /// Start a batch, one sequence per prompt.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedBatch`] for an empty prompt list or an empty prompt.
    pub fn start_batch(&mut self, prompts: Vec<Vec<u32>>) -> Result<BatchHandle> {
        if prompts.is_empty() {
            return Err(Error::MalformedBatch("batch has no prompts".into()));
        }
        if let Some(idx) = prompts.iter().position(Vec::is_empty) {
            return Err(Error::MalformedBatch(format!("prompt {idx} is empty")));
        }

        let slots = prompts
            .into_iter()
            .map(|prompt| self.new_controller(prompt))
            .collect();
        Ok(BatchHandle::new(slots))
    }

    /// Run one round over every live sequence of a batch.
    pub fn batch_step(&mut self, batch: &mut BatchHandle) -> Result<Vec<StepOutcome>> {
        batch.step(&mut self.backend, self.config.engine.pad_token_id)
    }

    /// Run a batch to completion.
    pub fn generate_batch(&mut self, prompts: Vec<Vec<u32>>) -> Result<Vec<GenerationOutput>> {
        let mut batch = self.start_batch(prompts)?;
        let mut errors: Vec<Option<Error>> = (0..batch.num_slots()).map(|_| None).collect();

        while !batch.is_finished() {
            for outcome in self.batch_step(&mut batch)? {
                if let Some(err) = outcome.error {
                    if let Some(idx) = batch
                        .slots()
                        .iter()
                        .position(|s| s.sequence_id() == outcome.sequence_id)
                    {
                        errors[idx] = Some(err);
                    }
                }
            }
        }

        Ok(batch
            .into_slots()
            .into_iter()
            .zip(errors)
            .map(|(slot, error)| GenerationOutput {
                sequence_id: slot.sequence_id(),
                prompt_tokens: slot.sequence().prompt_token_ids().to_vec(),
                output_tokens: slot.output().to_vec(),
                finish_reason: slot.finish_reason(),
                stats: slot.stats(),
                error,
            })
            .collect())
    }

    /// Lazily generate from one prompt, yielding accepted tokens as they come.
    pub fn stream(&mut self, prompt: Vec<u32>) -> Result<TokenStream<'_, B>> {
        if prompt.is_empty() {
            return Err(Error::MalformedBatch("prompt is empty".into()));
        }
        let controller = self.new_controller(prompt);
        Ok(TokenStream::new(self, controller))
    }

    /// One round for a single controller.
    pub(crate) fn step_controller(
        &mut self,
        controller: &mut SpeculativeController,
    ) -> Result<StepOutcome> {
        controller.begin_step()?;
        let mut outcomes = run_round(
            &mut self.backend,
            &mut [controller],
            self.config.engine.pad_token_id,
        )?;
        outcomes
            .pop()
            .ok_or_else(|| Error::MalformedBatch("round produced no outcome".into()))
    }

    fn new_controller(&mut self, prompt: Vec<u32>) -> SpeculativeController {
        let seed = match self.config.speculative.seed {
            Some(base) => base.wrapping_add(self.num_started),
            None => rand::random(),
        };
        self.num_started += 1;

        let handle = SequenceHandle::allocate(&self.cache);
        debug!(seq_id = handle.id(), prompt_len = prompt.len(), "Sequence started");
        SpeculativeController::new(handle, prompt, &self.config.speculative, seed)
    }
}
