//! nano-specdec: speculative decoding over a paged KV cache.
//!
//! This crate implements two tightly coupled inference optimizations:
//! - A paged KV cache: fixed-size blocks from a pre-allocated pool, one block
//!   table per sequence, guaranteed release on every exit path
//! - Speculative decoding: draft, verify with rejection sampling, adapt the
//!   speculation depth, and batch many sequences through shared backend calls
//!
//! Model compute sits behind the [`ModelBackend`] trait; the crate only ever
//! reads probability vectors and moves opaque key/value bytes.

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod engine;
pub mod model;
pub mod scheduler;
pub mod speculative;

pub use config::{Config, EngineConfig};
pub use crate::core::{FinishReason, KvLayout, KvSnapshot, PagedCache, SequenceHandle, SequenceId};
pub use engine::{GenerationOutput, LLMEngine, TokenEvent, TokenStream};
pub use error::{BackendError, Error, Result};
pub use model::{BatchRow, BigramBackend, ModelBackend, PaddedBatch, VerifyOutput};
pub use scheduler::{BatchCoordinator, BatchHandle};
pub use speculative::{
    DecodeState, DraftProposal, RejectionSampler, SpeculationState, SpeculationStats,
    SpeculativeConfig, SpeculativeController, StepOutcome, VerificationResult,
};
