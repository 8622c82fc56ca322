//! Cancellation framework: CancellationToken + generation guard.
//! The recognition engine offers no cancel primitive, so a superseded job is
//! allowed to run to completion and its guard tells it to drop the result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Image generations. Each new image advances the generation, cancels every
/// guard handed out for the previous one, and installs a fresh token.
pub struct TaskGeneration {
    current_token: RwLock<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl TaskGeneration {
    pub fn new() -> Self {
        Self {
            current_token: RwLock::new(CancellationToken::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel all guards of the current generation and advance. Returns the new generation.
    pub fn cancel_and_advance(&self) -> u64 {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        *token_guard = CancellationToken::new();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Guard bound to the current generation.
    pub fn guard(&self) -> GenerationGuard {
        let token_guard = self.current_token.read();
        GenerationGuard {
            generation: Arc::clone(&self.generation),
            my_generation: self.generation.load(Ordering::SeqCst),
            token: token_guard.child_token(),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cancel all current guards without advancing (teardown).
    pub fn cancel_all(&self) {
        self.current_token.read().cancel();
    }
}

impl Default for TaskGeneration {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard a job checks before writing results.
/// If the generation has advanced past `my_generation`, the job is stale.
#[derive(Clone, Debug)]
pub struct GenerationGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True while the job may still publish progress and results.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}
