//! Runtime configuration
//!
//! Timeouts, pool sizing, and checkpoint cadence for the executor and the
//! event-loop node runtime. All knobs have conservative defaults; override
//! with the builder-style `with_*` methods.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a run of the graph executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Timeout applied to every individual LLM call and tool call
    pub step_timeout: Duration,

    /// Grace period an in-flight call gets after a cancellation signal
    /// before it is force-abandoned and treated as failed
    pub quiescence: Duration,

    /// Worker-pool size for parallel branch batches
    pub parallelism: usize,

    /// Write a `periodic` checkpoint every N event-loop steps
    /// (None disables periodic checkpoints)
    pub checkpoint_interval: Option<u32>,

    /// Upper bound on total steps across the whole run
    pub max_run_steps: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            quiescence: Duration::from_secs(5),
            parallelism: 4,
            checkpoint_interval: None,
            max_run_steps: 1000,
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call step timeout
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Set the cancellation quiescence window
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    /// Set the parallel-branch worker pool size
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Enable periodic checkpoints every `interval` steps
    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = Some(interval.max(1));
        self
    }

    /// Set the run-wide step ceiling
    pub fn with_max_run_steps(mut self, max: u64) -> Self {
        self.max_run_steps = max;
        self
    }

    /// Wall-clock budget for one visit of a node with the given step limit
    pub fn visit_timeout(&self, max_steps_per_visit: u32) -> Duration {
        self.step_timeout * max_steps_per_visit.max(1)
    }

    /// Whether a periodic checkpoint is due at the given step count
    pub fn should_checkpoint(&self, step: u32) -> bool {
        match self.checkpoint_interval {
            Some(interval) => step > 0 && step % interval == 0,
            None => false,
        }
    }
}
