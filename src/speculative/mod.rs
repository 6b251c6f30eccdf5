//! Speculative decoding.
//!
//! This module implements draft-verify speculative decoding
//! for faster token generation.
//!
//! ## How it works
//!
//! 1. **Draft Phase**: A cheap draft model proposes K tokens, one call per
//!    token, each conditioned on the context plus the earlier drafts.
//!
//! 2. **Verify Phase**: The target model scores all K+1 positions in a
//!    single call.
//!
//! 3. **Rejection Sampling**: Each draft token is accepted or rejected based on
//!    the probability ratio between target and draft distributions.
//!
//! 4. **Adaptation**: K follows an EMA of the acceptance rate.
//!
//! ## Example
//!
//! ```text
//! Draft (K=4):     [prompt] -> t1 -> t2 -> t3 -> t4
//! Target verify:   [prompt, t1, t2, t3, t4] -> distributions for all 5 positions
//! Rejection:       Accept t1, t2, reject t3, resample -> final: t1, t2, t3'
//! ```

pub mod adaptive;
pub mod config;
pub mod controller;
pub mod sampler;

pub use adaptive::SpeculationState;
pub use config::SpeculativeConfig;
pub use controller::{DecodeState, SpeculationStats, SpeculativeController, StepOutcome};
pub use sampler::{DraftProposal, RejectionSampler, VerificationResult};
