//! Edges and edge conditions
//!
//! Edges carry control between nodes. Conditions are evaluated against
//! the source node's last verdict and current memory; for a fixed input
//! the first matching edge in declaration order fires, which makes
//! selection deterministic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node::NodeId;
use crate::judge::Verdict;
use crate::memory::Memory;

/// Predicate selecting the next node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// The source node completed with ACCEPT
    OnSuccess,
    /// The source node's verdict matches exactly
    OnVerdict { verdict: Verdict },
    /// A memory key equals the given value
    OnOutputEquals { key: String, value: Value },
    /// A memory key is present
    OnOutputPresent { key: String },
    /// Unconditional
    Always,
}

impl EdgeCondition {
    /// Evaluate against `(last_verdict, memory)`
    pub fn matches(&self, last_verdict: Option<Verdict>, memory: &Memory) -> bool {
        match self {
            EdgeCondition::OnSuccess => last_verdict == Some(Verdict::Accept),
            EdgeCondition::OnVerdict { verdict } => last_verdict == Some(*verdict),
            EdgeCondition::OnOutputEquals { key, value } => memory.get(key) == Some(value),
            EdgeCondition::OnOutputPresent { key } => memory.contains(key),
            EdgeCondition::Always => true,
        }
    }
}

/// A directed control edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub condition: EdgeCondition,
}

impl Edge {
    pub fn new(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition,
        }
    }

    pub fn on_success(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self::new(source, target, EdgeCondition::OnSuccess)
    }

    pub fn on_verdict(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        verdict: Verdict,
    ) -> Self {
        Self::new(source, target, EdgeCondition::OnVerdict { verdict })
    }

    pub fn always(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self::new(source, target, EdgeCondition::Always)
    }
}

/// Select the outgoing edge for a node
///
/// Edges are scanned in declaration order; the first match wins. Returns
/// `None` when no edge out of `source` matches.
pub fn select_edge<'a>(
    edges: &'a [Edge],
    source: &NodeId,
    last_verdict: Option<Verdict>,
    memory: &Memory,
) -> Option<&'a Edge> {
    edges
        .iter()
        .filter(|e| &e.source == source)
        .find(|e| e.condition.matches(last_verdict, memory))
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
    fn test_on_success_requires_accept() {
        let condition = EdgeCondition::OnSuccess;
        assert!(condition.matches(Some(Verdict::Accept), &Memory::new()));
        assert!(!condition.matches(Some(Verdict::Retry), &Memory::new()));
        assert!(!condition.matches(None, &Memory::new()));
    }

    #[test]
    fn test_on_verdict_exact_match() {
        let condition = EdgeCondition::OnVerdict {
            verdict: Verdict::Escalate,
        };
        assert!(condition.matches(Some(Verdict::Escalate), &Memory::new()));
        assert!(!condition.matches(Some(Verdict::Accept), &Memory::new()));
    }

    #[test]
    fn test_output_conditions() {
        let memory = memory_with("route", json!("fast"));

        let equals = EdgeCondition::OnOutputEquals {
            key: "route".into(),
            value: json!("fast"),
        };
        assert!(equals.matches(None, &memory));

        let not_equal = EdgeCondition::OnOutputEquals {
            key: "route".into(),
            value: json!("slow"),
        };
        assert!(!not_equal.matches(None, &memory));

        let present = EdgeCondition::OnOutputPresent {
            key: "route".into(),
        };
        assert!(present.matches(None, &memory));
        assert!(!present.matches(None, &Memory::new()));
    }

    #[test]
    fn test_select_edge_declaration_order() {
        let edges = vec![
            Edge::on_verdict("a", "retry_target", Verdict::Retry),
            Edge::always("a", "fallback"),
            Edge::always("a", "never_reached"),
        ];

        // Verdict edge wins when it matches
        let edge = select_edge(&edges, &"a".into(), Some(Verdict::Retry), &Memory::new()).unwrap();
        assert_eq!(edge.target.as_str(), "retry_target");

        // Otherwise the first Always in order
        let edge = select_edge(&edges, &"a".into(), Some(Verdict::Accept), &Memory::new()).unwrap();
        assert_eq!(edge.target.as_str(), "fallback");
    }

    #[test]
    fn test_select_edge_is_deterministic() {
        let edges = vec![
            Edge::always("a", "first"),
            Edge::always("a", "second"),
        ];
        let memory = Memory::new();
        for _ in 0..10 {
            let edge = select_edge(&edges, &"a".into(), None, &memory).unwrap();
            assert_eq!(edge.target.as_str(), "first");
        }
    }

    #[test]
    fn test_select_edge_none_when_no_match() {
        let edges = vec![Edge::on_success("a", "b")];
        assert!(select_edge(&edges, &"a".into(), Some(Verdict::Retry), &Memory::new()).is_none());
        assert!(select_edge(&edges, &"other".into(), Some(Verdict::Accept), &Memory::new()).is_none());
    }

    #[test]
    fn test_edge_serde_round_trip() {
        let edge = Edge::new(
            "router",
            "fast_path",
            EdgeCondition::OnOutputEquals {
                key: "route".into(),
                value: json!("fast"),
            },
        );
        let encoded = serde_json::to_string(&edge).unwrap();
        let decoded: Edge = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, edge);
    }
}
