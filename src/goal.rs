//! Goals, success criteria, and constraints
//!
//! A goal declares what a run must achieve. Success criteria are typed
//! predicates over memory keys consulted by the judge; constraints are
//! goal-level guardrails, where hard constraints can abort a run.
//! Goals are immutable once accepted by the executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::CoreError;
use crate::memory::Memory;

/// A typed success predicate over a memory key
///
/// The target value, where one applies, is embedded in the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum Metric {
    /// The key must be present in memory
    OutputPresent { key: String },
    /// The key must equal the target value exactly
    OutputEquals { key: String, target: Value },
    /// The key must be present and non-empty (non-empty string, array,
    /// or object; any number or boolean counts as non-empty)
    OutputNonEmpty { key: String },
    /// The key must be a string of at least `min_chars` characters
    MinLength { key: String, min_chars: usize },
}

impl Metric {
    /// The memory key this metric inspects
    pub fn key(&self) -> &str {
        match self {
            Metric::OutputPresent { key }
            | Metric::OutputEquals { key, .. }
            | Metric::OutputNonEmpty { key }
            | Metric::MinLength { key, .. } => key,
        }
    }

    /// Evaluate the metric against memory
    pub fn is_met(&self, memory: &Memory) -> bool {
        match self {
            Metric::OutputPresent { key } => memory.contains(key),
            Metric::OutputEquals { key, target } => memory.get(key) == Some(target),
            Metric::OutputNonEmpty { key } => match memory.get(key) {
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(Value::Object(o)) => !o.is_empty(),
                Some(Value::Null) | None => false,
                Some(_) => true,
            },
            Metric::MinLength { key, min_chars } => match memory.get(key) {
                Some(Value::String(s)) => s.chars().count() >= *min_chars,
                _ => false,
            },
        }
    }

    /// Human-readable description of why the metric failed
    pub fn failure_reason(&self) -> String {
        match self {
            Metric::OutputPresent { key } => format!("output '{key}' is missing"),
            Metric::OutputEquals { key, target } => {
                format!("output '{key}' does not equal {target}")
            }
            Metric::OutputNonEmpty { key } => format!("output '{key}' is empty or missing"),
            Metric::MinLength { key, min_chars } => {
                format!("output '{key}' is shorter than {min_chars} characters")
            }
        }
    }
}

/// One success criterion of a goal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub id: String,
    pub description: String,
    #[serde(flatten)]
    pub metric: Metric,
    /// Relative weight; informational for reporting, must be positive
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl SuccessCriterion {
    pub fn new(id: impl Into<String>, description: impl Into<String>, metric: Metric) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            metric,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Constraint severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Violation aborts the run
    Hard,
    /// Violation is recorded but does not abort
    Soft,
}

/// A typed constraint predicate over memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ConstraintCheck {
    /// The key must never appear in memory
    ForbidKey { key: String },
    /// The key must never hold the given value
    ForbidValue { key: String, value: Value },
    /// The key must be present by the time the constraint is checked
    RequireKey { key: String },
}

impl ConstraintCheck {
    /// Whether memory currently violates this check
    pub fn is_violated(&self, memory: &Memory) -> bool {
        match self {
            ConstraintCheck::ForbidKey { key } => memory.contains(key),
            ConstraintCheck::ForbidValue { key, value } => memory.get(key) == Some(value),
            ConstraintCheck::RequireKey { key } => !memory.contains(key),
        }
    }
}

/// A goal-level constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub description: String,
    pub kind: ConstraintKind,
    /// Free-form grouping label (e.g. "safety", "budget")
    #[serde(default)]
    pub category: String,
    /// Typed predicate; constraints without a check are advisory and are
    /// only surfaced through judge feedback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<ConstraintCheck>,
}

impl Constraint {
    pub fn hard(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind: ConstraintKind::Hard,
            category: String::new(),
            check: None,
        }
    }

    pub fn soft(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind: ConstraintKind::Soft,
            category: String::new(),
            check: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_check(mut self, check: ConstraintCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Whether memory currently violates this constraint
    pub fn is_violated(&self, memory: &Memory) -> bool {
        self.check
            .as_ref()
            .map(|c| c.is_violated(memory))
            .unwrap_or(false)
    }
}

/// The declared goal of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Goal {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            success_criteria: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn with_criterion(mut self, criterion: SuccessCriterion) -> Self {
        self.success_criteria.push(criterion);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Validate the goal before the executor accepts it
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.trim().is_empty() {
            return Err(CoreError::goal_invalid("goal id must not be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(CoreError::goal_invalid("goal description must not be empty"));
        }

        let mut seen = HashSet::new();
        for criterion in &self.success_criteria {
            if !seen.insert(criterion.id.as_str()) {
                return Err(CoreError::goal_invalid(format!(
                    "duplicate success criterion id '{}'",
                    criterion.id
                )));
            }
            if criterion.weight <= 0.0 {
                return Err(CoreError::goal_invalid(format!(
                    "criterion '{}' weight must be positive",
                    criterion.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for constraint in &self.constraints {
            if !seen.insert(constraint.id.as_str()) {
                return Err(CoreError::goal_invalid(format!(
                    "duplicate constraint id '{}'",
                    constraint.id
                )));
            }
        }

        Ok(())
    }

    /// Hard constraints currently violated by memory
    pub fn violated_hard_constraints(&self, memory: &Memory) -> Vec<&Constraint> {
        self.constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::Hard && c.is_violated(memory))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_with(key: &str, value: Value) -> Memory {
        let mut memory = Memory::new();
        memory.insert(key.into(), value, "test");
        memory
    }

    #[test]
    fn test_metric_output_present() {
        let metric = Metric::OutputPresent {
            key: "summary".into(),
        };
        assert!(metric.is_met(&memory_with("summary", json!("ok"))));
        assert!(!metric.is_met(&Memory::new()));
    }

    #[test]
    fn test_metric_output_equals() {
        let metric = Metric::OutputEquals {
            key: "status".into(),
            target: json!("done"),
        };
        assert!(metric.is_met(&memory_with("status", json!("done"))));
        assert!(!metric.is_met(&memory_with("status", json!("pending"))));
    }

    #[test]
    fn test_metric_non_empty() {
        let metric = Metric::OutputNonEmpty {
            key: "summary".into(),
        };
        assert!(!metric.is_met(&memory_with("summary", json!(""))));
        assert!(!metric.is_met(&memory_with("summary", json!([]))));
        assert!(!metric.is_met(&memory_with("summary", Value::Null)));
        assert!(metric.is_met(&memory_with("summary", json!("done"))));
        assert!(metric.is_met(&memory_with("summary", json!(0))));
    }

    #[test]
    fn test_metric_min_length() {
        let metric = Metric::MinLength {
            key: "report".into(),
            min_chars: 5,
        };
        assert!(metric.is_met(&memory_with("report", json!("hello world"))));
        assert!(!metric.is_met(&memory_with("report", json!("hi"))));
        assert!(!metric.is_met(&memory_with("report", json!(42))));
    }

    #[test]
    fn test_constraint_checks() {
        let forbid = ConstraintCheck::ForbidKey {
            key: "deleted".into(),
        };
        assert!(forbid.is_violated(&memory_with("deleted", json!(true))));
        assert!(!forbid.is_violated(&Memory::new()));

        let require = ConstraintCheck::RequireKey {
            key: "approved".into(),
        };
        assert!(require.is_violated(&Memory::new()));
        assert!(!require.is_violated(&memory_with("approved", json!(true))));
    }

    #[test]
    fn test_goal_validation() {
        let goal = Goal::new("g1", "summarize the input")
            .with_criterion(SuccessCriterion::new(
                "c1",
                "summary exists",
                Metric::OutputPresent {
                    key: "summary".into(),
                },
            ))
            .with_constraint(Constraint::hard("h1", "no deletions"));
        assert!(goal.validate().is_ok());

        let empty_id = Goal::new("", "desc");
        assert!(matches!(
            empty_id.validate(),
            Err(CoreError::GoalInvalid { .. })
        ));

        let duplicate = Goal::new("g2", "desc")
            .with_criterion(SuccessCriterion::new(
                "c1",
                "a",
                Metric::OutputPresent { key: "x".into() },
            ))
            .with_criterion(SuccessCriterion::new(
                "c1",
                "b",
                Metric::OutputPresent { key: "y".into() },
            ));
        assert!(duplicate.validate().is_err());
    }

    #[test]
    fn test_violated_hard_constraints() {
        let goal = Goal::new("g", "desc")
            .with_constraint(
                Constraint::hard("h1", "never write 'dangerous'").with_check(
                    ConstraintCheck::ForbidKey {
                        key: "dangerous".into(),
                    },
                ),
            )
            .with_constraint(
                Constraint::soft("s1", "avoid 'sloppy'").with_check(ConstraintCheck::ForbidKey {
                    key: "sloppy".into(),
                }),
            );

        let mut memory = Memory::new();
        memory.insert("dangerous".into(), json!(1), "n");
        memory.insert("sloppy".into(), json!(1), "n");

        let violated = goal.violated_hard_constraints(&memory);
        assert_eq!(violated.len(), 1);
        assert_eq!(violated[0].id, "h1");
    }

    #[test]
    fn test_goal_serde_round_trip() {
        let goal = Goal::new("g", "desc").with_criterion(
            SuccessCriterion::new(
                "c1",
                "equals",
                Metric::OutputEquals {
                    key: "k".into(),
                    target: json!({"a": 1}),
                },
            )
            .with_weight(2.0),
        );

        let encoded = serde_json::to_string(&goal).unwrap();
        let decoded: Goal = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.success_criteria[0].metric, goal.success_criteria[0].metric);
        assert_eq!(decoded.success_criteria[0].weight, 2.0);
    }
}
