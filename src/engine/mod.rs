//! Inference engine.
//!
//! This module contains:
//! - LLMEngine, the context object owning the cache and the backend
//! - TokenStream for lazy, per-token output

pub mod llm;
pub mod stream;

pub use llm::{GenerationOutput, LLMEngine};
pub use stream::{TokenEvent, TokenStream};
