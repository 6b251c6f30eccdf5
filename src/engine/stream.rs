//! Lazy token streams.
//!
//! A [`TokenStream`] runs one speculative round whenever its buffer of
//! accepted tokens runs dry, yields those tokens one by one, and ends with a
//! single [`TokenEvent::Finished`]. The stream is finite and cannot be
//! restarted. Ceasing to pull and dropping it is how a caller cancels: the
//! sequence's cache entry is released on drop.

use std::collections::VecDeque;

use super::llm::LLMEngine;
use crate::core::sequence::{FinishReason, SequenceId};
use crate::error::{Error, Result};
use crate::model::ModelBackend;
use crate::speculative::controller::{SpeculationStats, SpeculativeController};

/// One event of a token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// An accepted token.
    Token {
        /// Token id.
        token_id: u32,
        /// Position in the generated output, from 0.
        index: usize,
    },
    /// The sequence ended. Always the last event of a successful stream.
    Finished {
        /// Why it ended.
        reason: FinishReason,
        /// Counters over the whole generation.
        stats: SpeculationStats,
    },
}

/// Accepted tokens of one sequence, produced on demand.
#[derive(Debug)]
pub struct TokenStream<'a, B: ModelBackend> {
    engine: &'a mut LLMEngine<B>,
    controller: SpeculativeController,
    pending: VecDeque<u32>,
    emitted: usize,
    done: bool,
}

impl<'a, B: ModelBackend> TokenStream<'a, B> {
    pub(crate) fn new(engine: &'a mut LLMEngine<B>, controller: SpeculativeController) -> Self {
        Self {
            engine,
            controller,
            pending: VecDeque::new(),
            emitted: 0,
            done: false,
        }
    }

    /// The cache sequence id.
    pub fn sequence_id(&self) -> SequenceId {
        self.controller.sequence_id()
    }

    /// Counters so far.
    pub fn stats(&self) -> SpeculationStats {
        self.controller.stats()
    }

    /// Cancel the generation, returning the number of blocks freed.
    pub fn cancel(mut self) -> Result<usize> {
        self.done = true;
        self.controller.cancel()
    }

    fn advance(&mut self) -> Option<Error> {
        match self.engine.step_controller(&mut self.controller) {
            Ok(outcome) => {
                self.pending.extend(outcome.accepted_tokens);
                outcome.error
            }
            Err(err) => Some(err),
        }
    }
}

impl<B: ModelBackend> Iterator for TokenStream<'_, B> {
    type Item = Result<TokenEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(token_id) = self.pending.pop_front() {
                let index = self.emitted;
                self.emitted += 1;
                return Some(Ok(TokenEvent::Token { token_id, index }));
            }
            if self.done {
                return None;
            }
            if self.controller.is_done() {
                self.done = true;
                return self.controller.finish_reason().map(|reason| {
                    Ok(TokenEvent::Finished {
                        reason,
                        stats: self.controller.stats(),
                    })
                });
            }
            if let Some(err) = self.advance() {
                self.done = true;
                self.pending.clear();
                return Some(Err(err));
            }
        }
    }
}
