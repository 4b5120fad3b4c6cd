use crate::error::SeqlogError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFLICT_CACHE_CAPACITY: usize = 250_000;

/// Runtime configuration for a sequencer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Number of distinct conflict keys tracked before the oldest are folded
    /// into the wildcard watermark.
    pub conflict_cache_capacity: usize,
    /// Bound of the request queue feeding the executor task.
    pub max_inflight_requests: usize,
    pub initial_epoch: u64,
    pub max_tokens_per_request: u64,
    /// Run the cache consistency check after every mutating request.
    pub verify_invariants: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            conflict_cache_capacity: DEFAULT_CONFLICT_CACHE_CAPACITY,
            max_inflight_requests: 1024,
            initial_epoch: 0,
            max_tokens_per_request: 1 << 20,
            verify_invariants: false,
        }
    }
}

impl SequencerConfig {
    pub fn production() -> Self {
        Self {
            verify_invariants: false,
            ..Self::default()
        }
    }

    /// Small cache and per-request consistency checks; meant for tests and
    /// local clusters where eviction should be easy to provoke.
    pub fn development() -> Self {
        Self {
            conflict_cache_capacity: 1024,
            max_inflight_requests: 128,
            verify_invariants: true,
            ..Self::default()
        }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.conflict_cache_capacity = capacity;
        self
    }

    pub fn with_initial_epoch(mut self, epoch: u64) -> Self {
        self.initial_epoch = epoch;
        self
    }

    pub fn with_verify_invariants(mut self, enabled: bool) -> Self {
        self.verify_invariants = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), SeqlogError> {
        if self.conflict_cache_capacity == 0 {
            return Err(SeqlogError::InvalidConfig {
                message: "conflict_cache_capacity must be > 0".into(),
            });
        }
        if self.max_inflight_requests == 0 {
            return Err(SeqlogError::InvalidConfig {
                message: "max_inflight_requests must be > 0".into(),
            });
        }
        if self.max_tokens_per_request == 0 {
            return Err(SeqlogError::InvalidConfig {
                message: "max_tokens_per_request must be > 0".into(),
            });
        }
        Ok(())
    }
}
