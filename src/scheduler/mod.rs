//! Batch scheduling for speculative decoding.
//!
//! This module handles:
//! - Padding live sequences into shared draft and verify calls
//! - Independent termination with immediate block release
//! - Per-slot failure isolation

pub mod batch;

pub use batch::{BatchCoordinator, BatchHandle};
