//! Verdicts and judges
//!
//! The judge adjudicates a node's proposed outputs against the goal.
//! Evaluation is pure with respect to `(node, memory, goal, attempt)`.
//! Three judges ship with the crate: the criteria judge (default), a
//! priority-rule judge with a configurable fallback, and an LLM-backed
//! judge with confidence-threshold escalation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::CoreError;
use crate::goal::Goal;
use crate::graph::NodeSpec;
use crate::llm::{CompletionOptions, LlmProvider, Message};
use crate::memory::Memory;

/// The judge's decision for a node visit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// The node's outputs satisfy the applicable criteria
    Accept,
    /// Criteria unmet but progress is achievable; feedback is attached
    Retry,
    /// Unrecoverable within this node; hand control up
    Escalate,
    /// More work remains in this visit (event-loop nodes only)
    Continue,
}

impl Verdict {
    /// Tie-break precedence: ESCALATE > RETRY > ACCEPT > CONTINUE
    pub fn precedence(&self) -> u8 {
        match self {
            Verdict::Escalate => 3,
            Verdict::Retry => 2,
            Verdict::Accept => 1,
            Verdict::Continue => 0,
        }
    }

    /// The higher-precedence of two verdicts
    pub fn prefer(a: Verdict, b: Verdict) -> Verdict {
        if a.precedence() >= b.precedence() {
            a
        } else {
            b
        }
    }

    /// Parse a verdict name case-insensitively
    pub fn parse(s: &str) -> Option<Verdict> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" => Some(Verdict::Accept),
            "RETRY" => Some(Verdict::Retry),
            "ESCALATE" => Some(Verdict::Escalate),
            "CONTINUE" => Some(Verdict::Continue),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Retry => "RETRY",
            Verdict::Escalate => "ESCALATE",
            Verdict::Continue => "CONTINUE",
        };
        write!(f, "{s}")
    }
}

/// A judge's full decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default)]
    pub reasoning: String,
    /// Ids of goal constraints found violated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violated_constraints: Vec<String>,
    /// Rule id when a rule judge decided definitively
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_matched: Option<String>,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

impl Judgment {
    pub fn accept(reasoning: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Accept,
            feedback: None,
            reasoning: reasoning.into(),
            violated_constraints: Vec::new(),
            rule_matched: None,
            confidence: 1.0,
        }
    }

    pub fn retry(feedback: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Retry,
            feedback: Some(feedback.into()),
            reasoning: reasoning.into(),
            violated_constraints: Vec::new(),
            rule_matched: None,
            confidence: 1.0,
        }
    }

    pub fn escalate(reasoning: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Escalate,
            feedback: None,
            reasoning: reasoning.into(),
            violated_constraints: Vec::new(),
            rule_matched: None,
            confidence: 1.0,
        }
    }

    pub fn proceed(reasoning: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Continue,
            feedback: None,
            reasoning: reasoning.into(),
            violated_constraints: Vec::new(),
            rule_matched: None,
            confidence: 1.0,
        }
    }

    pub fn with_violated_constraints(mut self, ids: Vec<String>) -> Self {
        self.violated_constraints = ids;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Inputs a judge evaluates; nothing else may influence the decision
pub struct JudgeContext<'a> {
    pub node: &'a NodeSpec,
    pub memory: &'a Memory,
    pub goal: &'a Goal,
    /// Retry attempts already spent in this visit
    pub attempt: u32,
    /// Whether `set_output` has written anything this visit
    pub outputs_written: bool,
}

/// The adjudication interface
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, ctx: &JudgeContext<'_>) -> Result<Judgment, CoreError>;
}

// ---------------------------------------------------------------------------
// CriteriaJudge
// ---------------------------------------------------------------------------

/// Default judge driven by the goal's success criteria
///
/// A criterion applies to a node iff its metric's key is among the node's
/// output keys. Hard constraints always apply.
pub struct CriteriaJudge {
    /// Retry attempts allowed before escalating
    max_retries: u32,
}

impl CriteriaJudge {
    pub fn new() -> Self {
        Self { max_retries: 3 }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for CriteriaJudge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Judge for CriteriaJudge {
    async fn evaluate(&self, ctx: &JudgeContext<'_>) -> Result<Judgment, CoreError> {
        let violated = ctx.goal.violated_hard_constraints(ctx.memory);
        if !violated.is_empty() {
            let ids: Vec<String> = violated.iter().map(|c| c.id.clone()).collect();
            let descriptions: Vec<&str> =
                violated.iter().map(|c| c.description.as_str()).collect();
            return Ok(Judgment::escalate(format!(
                "hard constraint violated: {}",
                descriptions.join("; ")
            ))
            .with_violated_constraints(ids));
        }

        let required = ctx.node.required_output_keys();
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|k| !ctx.memory.contains(k))
            .collect();

        if !missing.is_empty() {
            if !ctx.outputs_written {
                return Ok(Judgment::proceed(format!(
                    "outputs not yet produced: {}",
                    missing.join(", ")
                )));
            }
            if ctx.attempt >= self.max_retries {
                return Ok(Judgment::escalate(format!(
                    "required outputs still missing after {} attempts: {}",
                    ctx.attempt,
                    missing.join(", ")
                )));
            }
            return Ok(Judgment::retry(
                format!("missing required outputs: {}", missing.join(", ")),
                "required output keys absent",
            ));
        }

        for criterion in &ctx.goal.success_criteria {
            let key = criterion.metric.key();
            if !ctx.node.output_keys.iter().any(|k| k == key) {
                continue;
            }
            if !criterion.metric.is_met(ctx.memory) {
                if ctx.attempt >= self.max_retries {
                    return Ok(Judgment::escalate(format!(
                        "criterion '{}' still unmet after {} attempts",
                        criterion.id, ctx.attempt
                    )));
                }
                return Ok(Judgment::retry(
                    format!(
                        "criterion '{}' unmet: {}",
                        criterion.id,
                        criterion.metric.failure_reason()
                    ),
                    criterion.description.clone(),
                ));
            }
        }

        Ok(Judgment::accept("all applicable criteria met"))
    }
}

// ---------------------------------------------------------------------------
// RuleJudge
// ---------------------------------------------------------------------------

/// Typed condition of an evaluation rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum RuleCondition {
    OutputPresent { key: String },
    OutputMissing { key: String },
    OutputEquals { key: String, value: Value },
    AttemptAtLeast { attempts: u32 },
    ConstraintViolated { constraint_id: String },
}

impl RuleCondition {
    fn matches(&self, ctx: &JudgeContext<'_>) -> bool {
        match self {
            RuleCondition::OutputPresent { key } => ctx.memory.contains(key),
            RuleCondition::OutputMissing { key } => !ctx.memory.contains(key),
            RuleCondition::OutputEquals { key, value } => ctx.memory.get(key) == Some(value),
            RuleCondition::AttemptAtLeast { attempts } => ctx.attempt >= *attempts,
            RuleCondition::ConstraintViolated { constraint_id } => ctx
                .goal
                .constraints
                .iter()
                .any(|c| &c.id == constraint_id && c.is_violated(ctx.memory)),
        }
    }
}

/// One rule of a [`RuleJudge`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRule {
    pub id: String,
    pub description: String,
    pub condition: RuleCondition,
    pub verdict: Verdict,
    /// Feedback attached to the judgment; `{node}` and `{attempt}`
    /// placeholders are substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Higher priority rules are checked first
    #[serde(default)]
    pub priority: i32,
}

impl EvaluationRule {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        condition: RuleCondition,
        verdict: Verdict,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            condition,
            verdict,
            feedback: None,
            priority: 0,
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn render_feedback(&self, ctx: &JudgeContext<'_>) -> Option<String> {
        self.feedback.as_ref().map(|template| {
            template
                .replace("{node}", ctx.node.id.as_str())
                .replace("{attempt}", &ctx.attempt.to_string())
        })
    }
}

/// Priority-ordered rule evaluation with a fallback judge
///
/// Rules are checked highest priority first; the first match is
/// definitive. When nothing matches, the fallback judge decides; without
/// a fallback the judgment is a low-confidence ACCEPT.
pub struct RuleJudge {
    rules: Vec<EvaluationRule>,
    fallback: Option<Arc<dyn Judge>>,
}

impl RuleJudge {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Judge>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Add a rule, keeping the list sorted by descending priority
    pub fn add_rule(&mut self, rule: EvaluationRule) -> &mut Self {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        self
    }

    /// Remove a rule by id; returns whether it existed
    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != rule_id);
        self.rules.len() != before
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for RuleJudge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Judge for RuleJudge {
    async fn evaluate(&self, ctx: &JudgeContext<'_>) -> Result<Judgment, CoreError> {
        for rule in &self.rules {
            if rule.condition.matches(ctx) {
                let mut judgment = Judgment {
                    verdict: rule.verdict,
                    feedback: rule.render_feedback(ctx),
                    reasoning: rule.description.clone(),
                    violated_constraints: Vec::new(),
                    rule_matched: Some(rule.id.clone()),
                    confidence: 1.0,
                };
                if let RuleCondition::ConstraintViolated { constraint_id } = &rule.condition {
                    judgment.violated_constraints = vec![constraint_id.clone()];
                }
                return Ok(judgment);
            }
        }

        match &self.fallback {
            Some(fallback) => fallback.evaluate(ctx).await,
            None => Ok(
                Judgment::accept("no definitive rule matched and no fallback judge configured")
                    .with_confidence(0.5),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmJudge
// ---------------------------------------------------------------------------

/// LLM-backed judge with line-oriented verdict parsing
///
/// Low-confidence judgments escalate rather than silently accepting, and
/// an LLM failure escalates to a human rather than failing the run.
pub struct LlmJudge {
    llm: Arc<dyn LlmProvider>,
    confidence_threshold: f32,
}

impl LlmJudge {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            confidence_threshold: 0.7,
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn system_prompt(goal: &Goal) -> String {
        let criteria: Vec<String> = goal
            .success_criteria
            .iter()
            .map(|c| format!("- {}", c.description))
            .collect();
        let constraints: Vec<String> = goal
            .constraints
            .iter()
            .map(|c| format!("- {}", c.description))
            .collect();

        format!(
            "You are a judge evaluating a node's outputs against a goal.\n\n\
             GOAL: {}\n\nSUCCESS CRITERIA:\n{}\n\nCONSTRAINTS:\n{}\n\n\
             Respond in this exact format:\n\
             VERDICT: [ACCEPT|RETRY|ESCALATE|CONTINUE]\n\
             CONFIDENCE: [0.0-1.0]\n\
             REASONING: [your reasoning]\n\
             FEEDBACK: [feedback for a retry, or empty when accepting]",
            goal.description,
            criteria.join("\n"),
            constraints.join("\n"),
        )
    }

    fn user_prompt(ctx: &JudgeContext<'_>) -> String {
        let outputs: Vec<String> = ctx
            .node
            .output_keys
            .iter()
            .map(|key| match ctx.memory.get(key) {
                Some(value) => format!("{key} = {value}"),
                None => format!("{key} = <absent>"),
            })
            .collect();

        format!(
            "Evaluate node '{}' (attempt {}).\n\nDECLARED OUTPUTS:\n{}\n\n\
             Provide your judgment.",
            ctx.node.id,
            ctx.attempt,
            outputs.join("\n"),
        )
    }

    /// Parse the line-oriented judge reply
    fn parse_response(text: &str) -> Judgment {
        let mut verdict = None;
        let mut confidence = 0.8f32;
        let mut reasoning = String::new();
        let mut feedback = String::new();

        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("VERDICT:") {
                verdict = Verdict::parse(rest);
            } else if let Some(rest) = line.strip_prefix("CONFIDENCE:") {
                confidence = rest.trim().parse().unwrap_or(0.5);
            } else if let Some(rest) = line.strip_prefix("REASONING:") {
                reasoning = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("FEEDBACK:") {
                feedback = rest.trim().to_string();
            }
        }

        let verdict = verdict.unwrap_or(Verdict::Escalate);
        Judgment {
            verdict,
            feedback: (!feedback.is_empty()).then_some(feedback),
            reasoning: if reasoning.is_empty() {
                "model judgment".to_string()
            } else {
                reasoning
            },
            violated_constraints: Vec::new(),
            rule_matched: None,
            confidence,
        }
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn evaluate(&self, ctx: &JudgeContext<'_>) -> Result<Judgment, CoreError> {
        let messages = vec![
            Message::system(Self::system_prompt(ctx.goal)),
            Message::user(Self::user_prompt(ctx)),
        ];

        let completion = match self
            .llm
            .complete(&messages, &[], Some(&CompletionOptions::default()))
            .await
        {
            Ok(completion) => completion,
            Err(err) => {
                return Ok(Judgment::escalate(format!(
                    "judge model unavailable: {err}"
                ))
                .with_confidence(0.0));
            }
        };

        let judgment = Self::parse_response(&completion.text);
        if judgment.confidence < self.confidence_threshold {
            return Ok(Judgment::escalate(format!(
                "judge confidence {:.2} below threshold {:.2}",
                judgment.confidence, self.confidence_threshold
            ))
            .with_confidence(judgment.confidence));
        }
        Ok(judgment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::{Constraint, ConstraintCheck, Metric, SuccessCriterion};
    use crate::llm::{Completion, ToolSchema};
    use serde_json::json;

    fn node() -> NodeSpec {
        NodeSpec::event_loop("intake").with_output_keys(["summary"])
    }

    fn goal() -> Goal {
        Goal::new("g", "summarize").with_criterion(SuccessCriterion::new(
            "c1",
            "summary must be non-empty",
            Metric::OutputNonEmpty {
                key: "summary".into(),
            },
        ))
    }

    fn ctx<'a>(
        node: &'a NodeSpec,
        memory: &'a Memory,
        goal: &'a Goal,
        attempt: u32,
        outputs_written: bool,
    ) -> JudgeContext<'a> {
        JudgeContext {
            node,
            memory,
            goal,
            attempt,
            outputs_written,
        }
    }

    #[test]
    fn test_verdict_precedence() {
        assert_eq!(
            Verdict::prefer(Verdict::Accept, Verdict::Continue),
            Verdict::Accept
        );
        assert_eq!(
            Verdict::prefer(Verdict::Continue, Verdict::Retry),
            Verdict::Retry
        );
        assert_eq!(
            Verdict::prefer(Verdict::Retry, Verdict::Escalate),
            Verdict::Escalate
        );
    }

    #[test]
    fn test_verdict_parse_round_trip() {
        for verdict in [
            Verdict::Accept,
            Verdict::Retry,
            Verdict::Escalate,
            Verdict::Continue,
        ] {
            assert_eq!(Verdict::parse(&verdict.to_string()), Some(verdict));
        }
        assert_eq!(Verdict::parse("accept"), Some(Verdict::Accept));
        assert_eq!(Verdict::parse("REPLAN"), None);
    }

    #[tokio::test]
    async fn test_criteria_judge_accepts_when_met() {
        let node = node();
        let goal = goal();
        let mut memory = Memory::new();
        memory.insert("summary".into(), json!("done"), "intake");

        let judgment = CriteriaJudge::new()
            .evaluate(&ctx(&node, &memory, &goal, 0, true))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn test_criteria_judge_continue_before_outputs() {
        let node = node();
        let goal = goal();
        let memory = Memory::new();

        let judgment = CriteriaJudge::new()
            .evaluate(&ctx(&node, &memory, &goal, 0, false))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Continue);
    }

    #[tokio::test]
    async fn test_criteria_judge_retries_unmet_criterion() {
        let node = node();
        let goal = goal();
        let mut memory = Memory::new();
        memory.insert("summary".into(), json!(""), "intake");

        let judgment = CriteriaJudge::new()
            .evaluate(&ctx(&node, &memory, &goal, 1, true))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Retry);
        assert!(judgment.feedback.unwrap().contains("c1"));
    }

    #[tokio::test]
    async fn test_criteria_judge_escalates_after_exhausted_attempts() {
        let node = node();
        let goal = goal();
        let mut memory = Memory::new();
        memory.insert("summary".into(), json!(""), "intake");

        let judgment = CriteriaJudge::new()
            .with_max_retries(2)
            .evaluate(&ctx(&node, &memory, &goal, 2, true))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Escalate);
    }

    #[tokio::test]
    async fn test_criteria_judge_escalates_hard_constraint() {
        let node = node();
        let goal = goal().with_constraint(
            Constraint::hard("h1", "never produce 'forbidden'").with_check(
                ConstraintCheck::ForbidKey {
                    key: "forbidden".into(),
                },
            ),
        );
        let mut memory = Memory::new();
        memory.insert("summary".into(), json!("ok"), "intake");
        memory.insert("forbidden".into(), json!(1), "intake");

        let judgment = CriteriaJudge::new()
            .evaluate(&ctx(&node, &memory, &goal, 0, true))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Escalate);
        assert_eq!(judgment.violated_constraints, vec!["h1".to_string()]);
    }

    #[tokio::test]
    async fn test_rule_judge_priority_order() {
        let mut judge = RuleJudge::new();
        judge.add_rule(
            EvaluationRule::new(
                "low",
                "low priority accept",
                RuleCondition::OutputPresent {
                    key: "summary".into(),
                },
                Verdict::Accept,
            )
            .with_priority(10),
        );
        judge.add_rule(
            EvaluationRule::new(
                "high",
                "high priority escalate",
                RuleCondition::OutputPresent {
                    key: "summary".into(),
                },
                Verdict::Escalate,
            )
            .with_priority(100),
        );

        let node = node();
        let goal = goal();
        let mut memory = Memory::new();
        memory.insert("summary".into(), json!("x"), "intake");

        let judgment = judge
            .evaluate(&ctx(&node, &memory, &goal, 0, true))
            .await
            .unwrap();
        assert_eq!(judgment.rule_matched.as_deref(), Some("high"));
        assert_eq!(judgment.verdict, Verdict::Escalate);
    }

    #[tokio::test]
    async fn test_rule_judge_falls_back() {
        let judge = RuleJudge::new().with_fallback(Arc::new(CriteriaJudge::new()));
        let node = node();
        let goal = goal();
        let mut memory = Memory::new();
        memory.insert("summary".into(), json!("fine"), "intake");

        let judgment = judge
            .evaluate(&ctx(&node, &memory, &goal, 0, true))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Accept);
        assert!(judgment.rule_matched.is_none());
    }

    #[tokio::test]
    async fn test_rule_judge_without_fallback_low_confidence_accept() {
        let judge = RuleJudge::new();
        let node = node();
        let goal = goal();
        let memory = Memory::new();

        let judgment = judge
            .evaluate(&ctx(&node, &memory, &goal, 0, false))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Accept);
        assert!(judgment.confidence < 1.0);
    }

    #[tokio::test]
    async fn test_rule_feedback_placeholders() {
        let mut judge = RuleJudge::new();
        judge.add_rule(
            EvaluationRule::new(
                "r",
                "attempt ceiling",
                RuleCondition::AttemptAtLeast { attempts: 2 },
                Verdict::Escalate,
            )
            .with_feedback("node {node} stuck after {attempt} attempts"),
        );

        let node = node();
        let goal = goal();
        let memory = Memory::new();
        let judgment = judge
            .evaluate(&ctx(&node, &memory, &goal, 2, false))
            .await
            .unwrap();
        assert_eq!(
            judgment.feedback.as_deref(),
            Some("node intake stuck after 2 attempts")
        );
    }

    struct ScriptedJudgeLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for ScriptedJudgeLlm {
        async fn complete(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            _options: Option<&CompletionOptions>,
        ) -> Result<Completion, CoreError> {
            Ok(Completion::text(self.reply.clone()))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_llm_judge_parses_reply() {
        let llm = Arc::new(ScriptedJudgeLlm {
            reply: "VERDICT: RETRY\nCONFIDENCE: 0.9\nREASONING: too short\nFEEDBACK: add detail"
                .into(),
        });
        let judge = LlmJudge::new(llm);
        let node = node();
        let goal = goal();
        let memory = Memory::new();

        let judgment = judge
            .evaluate(&ctx(&node, &memory, &goal, 0, true))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Retry);
        assert_eq!(judgment.feedback.as_deref(), Some("add detail"));
        assert_eq!(judgment.reasoning, "too short");
    }

    #[tokio::test]
    async fn test_llm_judge_low_confidence_escalates() {
        let llm = Arc::new(ScriptedJudgeLlm {
            reply: "VERDICT: ACCEPT\nCONFIDENCE: 0.3\nREASONING: unsure".into(),
        });
        let judge = LlmJudge::new(llm);
        let node = node();
        let goal = goal();
        let memory = Memory::new();

        let judgment = judge
            .evaluate(&ctx(&node, &memory, &goal, 0, true))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Escalate);
    }

    #[tokio::test]
    async fn test_llm_judge_unparseable_verdict_escalates() {
        let llm = Arc::new(ScriptedJudgeLlm {
            reply: "VERDICT: REPLAN\nCONFIDENCE: 0.95".into(),
        });
        let judge = LlmJudge::new(llm);
        let node = node();
        let goal = goal();
        let memory = Memory::new();

        let judgment = judge
            .evaluate(&ctx(&node, &memory, &goal, 0, true))
            .await
            .unwrap();
        assert_eq!(judgment.verdict, Verdict::Escalate);
    }
}
