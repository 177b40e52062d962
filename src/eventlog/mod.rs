//! Runtime event log
//!
//! Append-only structured step records keyed by `(run_id, node_id,
//! step_no)`. Step numbers are allocated under a per-run lock, so records
//! within a run are totally ordered even when parallel branches append
//! concurrently. Downstream consumers can subscribe to appends without
//! mutating state; queries live in [`report`].

mod report;

pub use report::{NodeDetail, RunSummary, VerdictCounts};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Kind of one step event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    LlmCall,
    ToolCall,
    ToolResult,
    SetOutput,
    JudgeVerdict,
    UserInputRequest,
    UserInputReceived,
}

/// One appended step record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub node_id: String,
    pub step_no: u64,
    pub kind: StepKind,
    pub payload: Value,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub latency_ms: u64,
    pub ts: DateTime<Utc>,
}

/// Observer notified on every append
pub trait EventSubscriber: Send + Sync {
    fn on_step(&self, step: &StepRecord);
}

/// The append-only event log
#[derive(Default)]
pub struct EventLog {
    runs: RwLock<HashMap<String, Vec<StepRecord>>>,
    counters: Mutex<HashMap<String, u64>>,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for appended steps
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    /// Append a step without usage accounting
    pub fn append(
        &self,
        run_id: &str,
        node_id: &str,
        kind: StepKind,
        payload: Value,
    ) -> StepRecord {
        self.append_with_usage(run_id, node_id, kind, payload, 0, 0)
    }

    /// Append a step with token and latency accounting
    pub fn append_with_usage(
        &self,
        run_id: &str,
        node_id: &str,
        kind: StepKind,
        payload: Value,
        tokens_used: u64,
        latency_ms: u64,
    ) -> StepRecord {
        let step_no = {
            let mut counters = self.counters.lock().expect("counter lock poisoned");
            let counter = counters.entry(run_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let record = StepRecord {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            step_no,
            kind,
            payload,
            tokens_used,
            latency_ms,
            ts: Utc::now(),
        };

        self.runs
            .write()
            .expect("run lock poisoned")
            .entry(run_id.to_string())
            .or_default()
            .push(record.clone());

        for subscriber in self
            .subscribers
            .read()
            .expect("subscriber lock poisoned")
            .iter()
        {
            subscriber.on_step(&record);
        }

        record
    }

    /// All steps of a run, ordered by step number
    pub fn steps(&self, run_id: &str) -> Vec<StepRecord> {
        self.runs
            .read()
            .expect("run lock poisoned")
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Steps of one node within a run (L3 query)
    pub fn node_steps(&self, run_id: &str, node_id: &str) -> Vec<StepRecord> {
        self.steps(run_id)
            .into_iter()
            .filter(|s| s.node_id == node_id)
            .collect()
    }

    /// One step by its number
    pub fn step(&self, run_id: &str, node_id: &str, step_no: u64) -> Option<StepRecord> {
        self.steps(run_id)
            .into_iter()
            .find(|s| s.node_id == node_id && s.step_no == step_no)
    }

    /// Ids of every logged run
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .runs
            .read()
            .expect("run lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Total step count for a run
    pub fn step_count(&self, run_id: &str) -> u64 {
        self.runs
            .read()
            .expect("run lock poisoned")
            .get(run_id)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }

    /// Drop every record after the cutoff timestamp
    ///
    /// Used by recovery: events after a restored checkpoint must be
    /// absent. The step counter rewinds to the highest surviving number
    /// so appends after recovery continue the sequence.
    pub fn truncate_after(&self, run_id: &str, cutoff: DateTime<Utc>) {
        let mut runs = self.runs.write().expect("run lock poisoned");
        if let Some(steps) = runs.get_mut(run_id) {
            steps.retain(|s| s.ts <= cutoff);
            let max_step = steps.iter().map(|s| s.step_no).max().unwrap_or(0);
            self.counters
                .lock()
                .expect("counter lock poisoned")
                .insert(run_id.to_string(), max_step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_step_numbers_are_monotonic_per_run() {
        let log = EventLog::new();
        let a = log.append("run-1", "n", StepKind::LlmCall, json!({}));
        let b = log.append("run-1", "n", StepKind::JudgeVerdict, json!({}));
        let other = log.append("run-2", "n", StepKind::LlmCall, json!({}));

        assert_eq!(a.step_no, 1);
        assert_eq!(b.step_no, 2);
        assert_eq!(other.step_no, 1);
    }

    #[test]
    fn test_queries_by_node_and_step() {
        let log = EventLog::new();
        log.append("r", "intake", StepKind::LlmCall, json!({"text": "hi"}));
        log.append("r", "intake", StepKind::JudgeVerdict, json!({"verdict": "ACCEPT"}));
        log.append("r", "writer", StepKind::LlmCall, json!({}));

        assert_eq!(log.steps("r").len(), 3);
        assert_eq!(log.node_steps("r", "intake").len(), 2);
        let step = log.step("r", "intake", 2).unwrap();
        assert_eq!(step.kind, StepKind::JudgeVerdict);
        assert!(log.step("r", "intake", 3).is_none());
    }

    #[test]
    fn test_concurrent_appends_allocate_unique_numbers() {
        let log = Arc::new(EventLog::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let log = Arc::clone(&log);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    log.append("r", "n", StepKind::ToolCall, json!({}));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let steps = log.steps("r");
        assert_eq!(steps.len(), 400);
        let mut numbers: Vec<u64> = steps.iter().map(|s| s.step_no).collect();
        numbers.sort_unstable();
        numbers.dedup();
        assert_eq!(numbers.len(), 400);
    }

    #[test]
    fn test_truncate_after_rewinds_counter() {
        let log = EventLog::new();
        log.append("r", "n", StepKind::LlmCall, json!({}));
        let cutoff = log.append("r", "n", StepKind::JudgeVerdict, json!({})).ts;
        std::thread::sleep(std::time::Duration::from_millis(5));
        log.append("r", "n", StepKind::LlmCall, json!({}));

        log.truncate_after("r", cutoff);
        assert_eq!(log.steps("r").len(), 2);

        let next = log.append("r", "n", StepKind::LlmCall, json!({}));
        assert_eq!(next.step_no, 3);
    }

    struct CountingSubscriber(AtomicUsize);

    impl EventSubscriber for CountingSubscriber {
        fn on_step(&self, _step: &StepRecord) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_subscribers_see_every_append() {
        let log = EventLog::new();
        let subscriber = Arc::new(CountingSubscriber(AtomicUsize::new(0)));
        log.subscribe(subscriber.clone());

        log.append("r", "n", StepKind::LlmCall, json!({}));
        log.append("r", "n", StepKind::ToolCall, json!({}));
        assert_eq!(subscriber.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_record_serde_round_trip() {
        let log = EventLog::new();
        let record = log.append_with_usage(
            "r",
            "n",
            StepKind::ToolResult,
            json!({"ok": true}),
            120,
            45,
        );
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: StepRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.step_no, record.step_no);
        assert_eq!(decoded.tokens_used, 120);
        assert_eq!(decoded.kind, StepKind::ToolResult);
    }
}
