//! Cancellation tokens and working-set generations
//!
//! Every fetch carries the token of the generation it was admitted under.
//! Replacing the working set advances the generation and cancels the old
//! token: sources able to abort can stop outright, and results that still
//! arrive are recognised as stale by their generation.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cancellation token for cooperative cancellation
///
/// Workers can check `is_cancelled()` before and during a fetch to determine
/// if they should stop. Clones share the same underlying state.
///
/// # Example
///
/// ```
/// use thumbgrid_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let fetch_token = token.clone();
///
/// token.cancel();
/// assert!(fetch_token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, non-cancelled token
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel this token and every clone of it. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonically increasing working-set identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// The generation a freshly constructed loader starts in
    pub const FIRST: Generation = Generation(1);

    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::FIRST
    }
}

/// The current generation together with its cancellation token
///
/// # Example
///
/// ```
/// use thumbgrid_scheduler::{Generation, GenerationScope};
///
/// let mut scope = GenerationScope::new();
/// let old_token = scope.token();
///
/// let next = scope.advance();
/// assert_eq!(next, Generation::FIRST.next());
/// assert!(old_token.is_cancelled());
/// assert!(!scope.token().is_cancelled());
/// ```
#[derive(Debug)]
pub struct GenerationScope {
    generation: Generation,
    token: CancellationToken,
}

impl GenerationScope {
    pub fn new() -> Self {
        Self {
            generation: Generation::FIRST,
            token: CancellationToken::new(),
        }
    }

    pub fn current(&self) -> Generation {
        self.generation
    }

    /// Token shared by everything admitted in the current generation
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.generation == generation
    }

    /// Cancel the current token and move to the next generation
    pub fn advance(&mut self) -> Generation {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.generation = self.generation.next();
        self.generation
    }
}

impl Default for GenerationScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shared_by_scope_clones() {
        let scope = GenerationScope::default();
        let worker_token = scope.token();
        let filler_token = scope.token();
        assert!(!worker_token.is_cancelled());

        // Cancelling one handle cancels every clone, and repeating it is harmless
        filler_token.cancel();
        filler_token.cancel();
        assert!(worker_token.is_cancelled());
        assert!(scope.token().is_cancelled());
        assert!(scope.is_current(Generation::FIRST));
    }

    #[test]
    fn test_generation_monotonic() {
        let first = Generation::default();
        assert_eq!(first, Generation::FIRST);
        assert!(first.next() > first);
        assert_eq!(first.next().value(), first.value() + 1);
    }

    #[test]
    fn test_scope_advance_cancels_previous_token() {
        let mut scope = GenerationScope::new();
        let first = scope.current();
        let token = scope.token();

        let second = scope.advance();
        assert!(second > first);
        assert!(token.is_cancelled());
        assert!(scope.is_current(second));
        assert!(!scope.is_current(first));

        let token2 = scope.token();
        scope.advance();
        assert!(token2.is_cancelled());
    }
}
