//! Run control and results
//!
//! A [`RunControl`] is the shared handle through which pause and cancel
//! requests reach a running graph. Flags are checked at every suspension
//! point; in-flight calls additionally race the cancel signal so a
//! cancelled run stops within the configured quiescence window.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::eventlog::StepRecord;
use crate::memory::Memory;
use crate::session::{SessionId, SessionStatus};

/// Shared pause/cancel handle for one run
#[derive(Clone, Default)]
pub struct RunControl {
    inner: Arc<ControlInner>,
    /// Parallel branches mask pause: a batch is one scheduling unit and
    /// pause takes effect at the join. Cancel is never masked.
    mask_pause: bool,
}

#[derive(Default)]
struct ControlInner {
    pause: AtomicBool,
    cancel: AtomicBool,
    notify: Notify,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to pause at the next inter-step boundary
    pub fn request_pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Ask the run to stop; resume is not possible afterwards
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Clear a pause request (used when a paused run resumes)
    pub fn clear_pause(&self) {
        self.inner.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        !self.mask_pause && self.inner.pause.load(Ordering::SeqCst)
    }

    /// A handle sharing this run's cancel signal but ignoring pause
    pub fn fork_cancel_only(&self) -> RunControl {
        RunControl {
            inner: Arc::clone(&self.inner),
            mask_pause: true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TerminalNode,
    NoValidEdge,
    HardConstraint,
    MaxVisits,
    PauseRequested,
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::TerminalNode => "terminal_node",
            TerminationReason::NoValidEdge => "no_valid_edge",
            TerminationReason::HardConstraint => "hard_constraint",
            TerminationReason::MaxVisits => "max_visits",
            TerminationReason::PauseRequested => "pause_requested",
            TerminationReason::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Outcome of `execute`, `resume`, or `recover`
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub memory: Memory,
    pub terminated_by: TerminationReason,
    pub events: Vec<StepRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flags_start_clear() {
        let control = RunControl::new();
        assert!(!control.is_pause_requested());
        assert!(!control.is_cancelled());
    }

    #[test]
    fn test_pause_and_clear() {
        let control = RunControl::new();
        control.request_pause();
        assert!(control.is_pause_requested());
        control.clear_pause();
        assert!(!control.is_pause_requested());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let control = RunControl::new();
        let waiter = control.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        control.cancel();
        let resolved = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved);
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_set() {
        let control = RunControl::new();
        control.cancel();
        tokio::time::timeout(Duration::from_millis(50), control.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_fork_shares_cancel_but_masks_pause() {
        let control = RunControl::new();
        let branch = control.fork_cancel_only();

        control.request_pause();
        assert!(control.is_pause_requested());
        assert!(!branch.is_pause_requested());

        control.cancel();
        assert!(branch.is_cancelled());
    }

    #[test]
    fn test_termination_reason_display() {
        assert_eq!(TerminationReason::TerminalNode.to_string(), "terminal_node");
        assert_eq!(
            TerminationReason::PauseRequested.to_string(),
            "pause_requested"
        );
    }
}
