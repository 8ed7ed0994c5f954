//! Generation tracking for batch supersession
//!
//! Every snapshot gets a fresh [`Generation`]. Operations capture the token they
//! were started under and ask the tracker whether it is still current before
//! registering or settling. The tracker is a single atomic, so the check is a
//! plain load with no lock and no check-then-act gap.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Generation;

/// Issues strictly increasing generation tokens
///
/// Cloning is cheap and all clones share the same counter.
#[derive(Clone, Debug, Default)]
pub struct GenerationTracker {
    current: Arc<AtomicU64>,
}

impl GenerationTracker {
    /// Create a tracker at generation 0 (no batch yet)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to a new generation
    ///
    /// Returns `(previous, current)`. The increment is a single atomic
    /// read-modify-write, so two concurrent callers always receive distinct
    /// tokens.
    pub fn begin_generation(&self) -> (Generation, Generation) {
        let previous = self.current.fetch_add(1, Ordering::SeqCst);
        (Generation(previous), Generation(previous.wrapping_add(1)))
    }

    /// The live generation
    pub fn current(&self) -> Generation {
        Generation(self.current.load(Ordering::SeqCst))
    }

    /// Whether `generation` is still the live generation
    pub fn is_current(&self, generation: Generation) -> bool {
        self.current.load(Ordering::SeqCst) == generation.0
    }
}
