//! Batched speculative decoding.
//!
//! The coordinator drives several independent [`SpeculativeController`]s
//! through shared backend calls. Each round is:
//!
//! ```text
//!   begin_step (every live slot)
//!        │
//!        ▼
//!   ┌───────────────┐  one padded draft batch per sub-step,
//!   │  draft × kmax │  only slots still short of their depth
//!   └───────────────┘
//!        │
//!        ▼
//!   ┌───────────────┐  one padded verify batch
//!   │    verify     │  (context + candidates per slot)
//!   └───────────────┘
//!        │
//!        ▼
//!   accept (per slot) ──▶ finished slots free their blocks right away
//! ```
//!
//! Slots finish in any order. A backend failure fails only the slots that
//! took part in the failed call; other slots keep their state. A slot whose
//! own step goes wrong (no context, a draft distribution it cannot sample
//! from) fails alone and the round goes on without it. A backend answer with
//! the wrong shape aborts the round: every slot in it is failed and the error
//! is returned.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use nano_specdec::config::EngineConfig;
//! use nano_specdec::core::{PagedCache, SequenceHandle};
//! use nano_specdec::model::BigramBackend;
//! use nano_specdec::scheduler::BatchCoordinator;
//! use nano_specdec::speculative::{SpeculativeConfig, SpeculativeController};
//!
//! let mut backend = BigramBackend::new(16, 2, 4, 0).unwrap();
//! let engine = EngineConfig::default().num_layers(2).kv_bytes_per_token(16);
//! let cache = Arc::new(PagedCache::new(&engine).unwrap());
//! let spec = SpeculativeConfig::default().max_new_tokens(8);
//!
//! let slots = vec![
//!     SpeculativeController::new(SequenceHandle::allocate(&cache), vec![1, 2, 3], &spec, 1),
//!     SpeculativeController::new(SequenceHandle::allocate(&cache), vec![4, 5], &spec, 2),
//! ];
//! let mut batch = BatchCoordinator::new(slots);
//! while !batch.is_finished() {
//!     batch.step(&mut backend, 0).unwrap();
//! }
//! assert_eq!(batch.slot(0).unwrap().output().len(), 8);
//! assert_eq!(cache.stats().used_blocks, 0);
//! ```

use tracing::{debug, info, warn};

use crate::error::{BackendError, Error, Result};
use crate::model::{check_draft_output, check_verify_output, ModelBackend, PaddedBatch};
use crate::speculative::controller::{SpeculativeController, StepOutcome};

/// Handle to a running batch.
pub type BatchHandle = BatchCoordinator;

/// Independent sequences sharing vectorized backend calls.
#[derive(Debug)]
pub struct BatchCoordinator {
    slots: Vec<SpeculativeController>,
    rounds: usize,
}

impl BatchCoordinator {
    /// Create a batch over the given controllers.
    pub fn new(slots: Vec<SpeculativeController>) -> Self {
        info!(num_slots = slots.len(), "Batch started");
        Self { slots, rounds: 0 }
    }

    /// Number of slots.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Slots still generating.
    pub fn num_active(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_done()).count()
    }

    /// Check if every slot has finished or failed.
    pub fn is_finished(&self) -> bool {
        self.slots.iter().all(SpeculativeController::is_done)
    }

    /// Rounds run so far.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// One slot's controller.
    pub fn slot(&self, index: usize) -> Option<&SpeculativeController> {
        self.slots.get(index)
    }

    /// All slots, in submission order.
    pub fn slots(&self) -> &[SpeculativeController] {
        &self.slots
    }

    /// Consume the batch, yielding its controllers.
    pub fn into_slots(self) -> Vec<SpeculativeController> {
        self.slots
    }

    /// Run one speculative round over every live slot.
    ///
    /// Returns one outcome per slot that took part, in slot order.
    pub fn step<B: ModelBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        pad_token_id: u32,
    ) -> Result<Vec<StepOutcome>> {
        let mut outcomes: Vec<(usize, StepOutcome)> = Vec::new();
        let mut ready: Vec<(usize, &mut SpeculativeController)> = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_done() {
                continue;
            }
            match slot.begin_step() {
                Ok(()) => ready.push((index, slot)),
                Err(err) => outcomes.push((index, slot.fail(err))),
            }
        }
        if ready.is_empty() && outcomes.is_empty() {
            return Ok(Vec::new());
        }

        self.rounds += 1;
        if !ready.is_empty() {
            let (indices, mut live): (Vec<usize>, Vec<&mut SpeculativeController>) =
                ready.into_iter().unzip();
            let round = run_round(backend, &mut live, pad_token_id)?;
            outcomes.extend(indices.into_iter().zip(round));
        }
        outcomes.sort_by_key(|(index, _)| *index);

        if self.is_finished() {
            info!(rounds = self.rounds, num_slots = self.slots.len(), "Batch finished");
        }
        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }

    /// Cancel one slot, returning the number of blocks freed.
    pub fn cancel(&mut self, index: usize) -> Result<usize> {
        let num_slots = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or_else(|| Error::MalformedBatch(format!("no slot {index} in a batch of {num_slots}")))?
            .cancel()
    }
}

/// Run one draft/verify/accept round over `slots`.
///
/// Every slot must have begun its step. Returns one outcome per slot, in
/// order. Failures of one slot or of one backend call are reported in the
/// outcomes of the slots they hit; a backend answer with the wrong shape
/// fails every slot still in the round and is returned as
/// [`Error::MalformedBatch`].
pub(crate) fn run_round<B: ModelBackend + ?Sized>(
    backend: &mut B,
    slots: &mut [&mut SpeculativeController],
    pad_token_id: u32,
) -> Result<Vec<StepOutcome>> {
    let mut outcomes: Vec<Option<StepOutcome>> = slots.iter().map(|_| None).collect();
    let vocab_size = backend.vocab_size();

    // Drafting: slots with a smaller depth drop out of later sub-steps.
    loop {
        let drafting: Vec<usize> = (0..slots.len()).filter(|&i| slots[i].wants_draft()).collect();
        if drafting.is_empty() {
            break;
        }
        let batch = match drafting
            .iter()
            .map(|&i| slots[i].draft_row())
            .collect::<Result<Vec<_>>>()
            .and_then(|rows| PaddedBatch::new(rows, pad_token_id))
        {
            Ok(batch) => batch,
            Err(err) => return Err(abort_round(slots, err)),
        };

        let probs = match backend.draft_step(&batch) {
            Ok(probs) => probs,
            Err(err) => {
                fail_participants(slots, &drafting, &mut outcomes, err, "draft");
                continue;
            }
        };
        if let Err(err) = check_draft_output(&batch, &probs, vocab_size) {
            return Err(abort_round(slots, err));
        }
        for (&i, p) in drafting.iter().zip(probs) {
            if let Err(err) = slots[i].push_draft(p) {
                outcomes[i] = Some(slots[i].fail(err));
            }
        }
    }

    // Verifying: one call for every slot still in the round.
    let include_prior = backend.wants_prior_kv();
    let live: Vec<usize> = (0..slots.len()).filter(|&i| !slots[i].is_done()).collect();
    let mut verifying = Vec::with_capacity(live.len());
    let mut rows = Vec::with_capacity(live.len());
    for i in live {
        match slots[i].verify_row(include_prior) {
            Ok(row) => {
                verifying.push(i);
                rows.push(row);
            }
            Err(err) => outcomes[i] = Some(slots[i].fail(err)),
        }
    }

    if !verifying.is_empty() {
        let batch = match PaddedBatch::new(rows, pad_token_id) {
            Ok(batch) => batch,
            Err(err) => return Err(abort_round(slots, err)),
        };
        debug!(rows = batch.num_rows(), width = batch.max_len(), "Verify batch");

        match backend.verify(&batch) {
            Ok(outputs) => {
                if let Err(err) =
                    check_verify_output(&batch, &outputs, vocab_size, backend.kv_layout())
                {
                    return Err(abort_round(slots, err));
                }
                // Accepting: finished slots release their blocks inside accept.
                for (&i, output) in verifying.iter().zip(outputs) {
                    let outcome = match slots[i].accept(output) {
                        Ok(outcome) => outcome,
                        Err(err) => slots[i].fail(err),
                    };
                    outcomes[i] = Some(outcome);
                }
            }
            Err(err) => fail_participants(slots, &verifying, &mut outcomes, err, "verify"),
        }
    }

    outcomes
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| Error::MalformedBatch("round left a slot without an outcome".into()))
}

fn fail_participants(
    slots: &mut [&mut SpeculativeController],
    indices: &[usize],
    outcomes: &mut [Option<StepOutcome>],
    err: BackendError,
    phase: &str,
) {
    warn!(phase, error = %err, slots = indices.len(), "Backend call failed");
    for &i in indices {
        outcomes[i] = Some(slots[i].fail(Error::Backend(err.clone())));
    }
}

/// Fail every slot still in the round and hand back the error.
fn abort_round(slots: &mut [&mut SpeculativeController], err: Error) -> Error {
    warn!(error = %err, "Round aborted");
    for slot in slots.iter_mut().filter(|slot| !slot.is_done()) {
        slot.fail(Error::MalformedBatch(err.to_string()));
    }
    err
}
