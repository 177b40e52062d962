//! Report queries over the event log
//!
//! Two roll-up shapes above the raw step records: run summaries (L1) and
//! per-node details (L2). Both are read-only projections; the attention
//! flags mirror the runtime's operational thresholds.

use serde::{Deserialize, Serialize};

use super::{EventLog, StepKind, StepRecord};

/// Attention thresholds for run and node roll-ups
const ATTENTION_RETRIES: u64 = 3;
const ATTENTION_ESCALATES: u64 = 2;
const ATTENTION_LATENCY_MS: u64 = 60_000;
const ATTENTION_TOKENS: u64 = 100_000;
const ATTENTION_STEPS: u64 = 20;

/// Verdict tallies within a scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub accept: u64,
    pub retry: u64,
    pub escalate: u64,
    pub r#continue: u64,
}

impl VerdictCounts {
    fn record(&mut self, verdict: &str) {
        match verdict {
            "ACCEPT" => self.accept += 1,
            "RETRY" => self.retry += 1,
            "ESCALATE" => self.escalate += 1,
            "CONTINUE" => self.r#continue += 1,
            _ => {}
        }
    }
}

/// L1: one row per run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub needs_attention: bool,
    pub attention_reasons: Vec<String>,
    pub duration_ms: u64,
    pub total_tokens: u64,
    pub total_steps: u64,
    pub verdict_counts: VerdictCounts,
    /// Distinct nodes in first-seen order
    pub node_path: Vec<String>,
}

/// L2: per-node roll-up within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetail {
    pub node_id: String,
    pub exit_status: String,
    pub total_steps: u64,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub verdict_counts: VerdictCounts,
    pub needs_attention: bool,
    pub attention_reasons: Vec<String>,
}

fn verdict_of(step: &StepRecord) -> Option<&str> {
    (step.kind == StepKind::JudgeVerdict)
        .then(|| step.payload.get("verdict").and_then(|v| v.as_str()))
        .flatten()
}

fn attention_reasons(
    counts: &VerdictCounts,
    latency_ms: u64,
    tokens: u64,
    steps: u64,
) -> Vec<String> {
    let mut reasons = Vec::new();
    if counts.retry > ATTENTION_RETRIES {
        reasons.push(format!("high_retry_count:{}", counts.retry));
    }
    if counts.escalate > ATTENTION_ESCALATES {
        reasons.push(format!("high_escalate_count:{}", counts.escalate));
    }
    if latency_ms > ATTENTION_LATENCY_MS {
        reasons.push(format!("high_latency_ms:{latency_ms}"));
    }
    if tokens > ATTENTION_TOKENS {
        reasons.push(format!("high_token_usage:{tokens}"));
    }
    if steps > ATTENTION_STEPS {
        reasons.push(format!("high_step_count:{steps}"));
    }
    reasons
}

impl EventLog {
    /// L1 summary for one run
    ///
    /// `status` comes from the session envelope; the log itself only
    /// knows what happened, not how the run ended.
    pub fn run_summary(&self, run_id: &str, status: impl Into<String>) -> RunSummary {
        let steps = self.steps(run_id);

        let mut counts = VerdictCounts::default();
        let mut total_tokens = 0;
        let mut total_latency = 0;
        let mut node_path: Vec<String> = Vec::new();

        for step in &steps {
            total_tokens += step.tokens_used;
            total_latency += step.latency_ms;
            if let Some(verdict) = verdict_of(step) {
                counts.record(verdict);
            }
            if !node_path.contains(&step.node_id) {
                node_path.push(step.node_id.clone());
            }
        }

        let duration_ms = match (steps.first(), steps.last()) {
            (Some(first), Some(last)) => (last.ts - first.ts).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        // Wall-clock duration can undercount parallel branches; fold in
        // accumulated step latency when it dominates.
        let duration_ms = duration_ms.max(total_latency);

        let total_steps = steps.len() as u64;
        let reasons = attention_reasons(&counts, duration_ms, total_tokens, total_steps);

        RunSummary {
            run_id: run_id.to_string(),
            status: status.into(),
            needs_attention: !reasons.is_empty(),
            attention_reasons: reasons,
            duration_ms,
            total_tokens,
            total_steps,
            verdict_counts: counts,
            node_path,
        }
    }

    /// L2 roll-ups for every node of a run, in first-seen order
    pub fn node_details(&self, run_id: &str) -> Vec<NodeDetail> {
        let steps = self.steps(run_id);
        let mut order: Vec<String> = Vec::new();
        for step in &steps {
            if !order.contains(&step.node_id) {
                order.push(step.node_id.clone());
            }
        }

        order
            .into_iter()
            .map(|node_id| {
                let node_steps: Vec<&StepRecord> =
                    steps.iter().filter(|s| s.node_id == node_id).collect();

                let mut counts = VerdictCounts::default();
                let mut tokens = 0;
                let mut latency = 0;
                let mut awaiting_input = false;
                for step in &node_steps {
                    tokens += step.tokens_used;
                    latency += step.latency_ms;
                    if let Some(verdict) = verdict_of(step) {
                        counts.record(verdict);
                    }
                    match step.kind {
                        StepKind::UserInputRequest => awaiting_input = true,
                        StepKind::UserInputReceived => awaiting_input = false,
                        _ => {}
                    }
                }

                let last_verdict = node_steps.iter().rev().find_map(|s| verdict_of(s));
                let exit_status = if awaiting_input {
                    "paused"
                } else {
                    match last_verdict {
                        Some("ACCEPT") => "success",
                        Some("ESCALATE") => "escalated",
                        Some("RETRY") => "retrying",
                        Some("CONTINUE") | None => "in_progress",
                        Some(_) => "in_progress",
                    }
                };

                let total_steps = node_steps.len() as u64;
                let reasons = attention_reasons(&counts, latency, tokens, total_steps);

                NodeDetail {
                    node_id,
                    exit_status: exit_status.to_string(),
                    total_steps,
                    tokens_used: tokens,
                    latency_ms: latency,
                    verdict_counts: counts,
                    needs_attention: !reasons.is_empty(),
                    attention_reasons: reasons,
                }
            })
            .collect()
    }
}
