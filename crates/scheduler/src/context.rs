//! Run context shared by the scheduler, model pool and pipelines

use crate::emitter::ProgressEmitter;
use crate::state::{ProgressSnapshot, RunState, TokenCounter};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

/// Owns the engine's run state and publishes a snapshot after each mutation.
///
/// Lock order is `state` then `tokens`; `tokens` is never held while taking
/// `state`.
#[derive(Debug)]
pub struct RunContext {
    state: Mutex<RunState>,
    tokens: Mutex<TokenCounter>,
    emitter: ProgressEmitter,
}

impl RunContext {
    #[must_use]
    pub fn new(emitter: ProgressEmitter) -> Self {
        let ctx = Self {
            state: Mutex::new(RunState::new()),
            tokens: Mutex::new(TokenCounter::default()),
            emitter,
        };
        ctx.publish();
        ctx
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tokens(&self) -> MutexGuard<'_, TokenCounter> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the run state and publish the result
    pub fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        let mut state = self.lock_state();
        let out = f(&mut state);
        // Publish under the state lock so snapshots leave in mutation order
        let snapshot = state.snapshot(*self.lock_tokens());
        self.emitter.publish(snapshot);
        out
    }

    /// Read without publishing
    pub fn read<R>(&self, f: impl FnOnce(&RunState) -> R) -> R {
        f(&self.lock_state())
    }

    /// Add generated tokens and replace the throughput estimate
    pub fn record_tokens(&self, output_tokens: u64, tokens_per_sec: f64) {
        self.lock_tokens().record(output_tokens, tokens_per_sec);
        self.publish();
    }

    #[must_use]
    pub fn tokens(&self) -> TokenCounter {
        *self.lock_tokens()
    }

    /// Publish the current state unchanged
    pub fn publish(&self) {
        self.update(|_| ());
    }

    /// Replace state and counters with fresh values
    pub fn reset(&self) {
        let mut state = self.lock_state();
        *state = RunState::new();
        *self.lock_tokens() = TokenCounter::default();
        let snapshot = state.snapshot(TokenCounter::default());
        self.emitter.publish(snapshot);
    }

    /// Latest published snapshot; does not take the state lock
    #[must_use]
    pub fn status(&self) -> ProgressSnapshot {
        self.emitter.latest().refreshed()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.emitter.subscribe()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ProgressSnapshot> {
        self.emitter.watch()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(ProgressEmitter::default())
    }
}
