//! Monotonic id generation.
//!
//! One generator instance exists per id space (file ids, chunk ids); the
//! two spaces are kept apart by construction, never by partitioning one
//! counter. The seed is the last id handed out, so persisting the seed and
//! restoring it resumes generation without reuse.

use serde::{Deserialize, Serialize};

/// Generator of strictly increasing ids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueId {
    seed: i64,
}

impl UniqueId {
    /// Creates a generator whose next id will be `seed + 1`.
    pub fn new(seed: i64) -> Self {
        UniqueId { seed }
    }

    /// Generates a new id. Every call returns a value strictly greater
    /// than all earlier returns.
    pub fn genid(&mut self) -> i64 {
        self.seed += 1;
        self.seed
    }

    /// The last id handed out; the value to persist in checkpoints.
    pub fn seed(&self) -> i64 {
        self.seed
    }

    /// Restores the generator from a persisted seed.
    pub fn set_seed(&mut self, seed: i64) {
        self.seed = seed;
    }
}
