//! Graph model and static validation
//!
//! A graph is loaded once per run and never mutated. Cycles are allowed
//! (retry edges loop back to their own node) and are bounded by per-node
//! visit counts, never by topology rewrites. Parallel execution happens
//! only where the graph declares a [`ParallelGroup`] whose independence
//! is proven statically before the run.

mod edge;
mod node;

pub use edge::{select_edge, Edge, EdgeCondition};
pub use node::{NodeId, NodeKind, NodeSpec};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::CoreError;

/// One branch of a parallel group, identified by its entry node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub entry: NodeId,
}

impl ParallelBranch {
    pub fn new(entry: impl Into<NodeId>) -> Self {
        Self {
            entry: entry.into(),
        }
    }
}

/// Static declaration of independent branches between a source and a join
///
/// When the source node completes with ACCEPT, all branches run
/// concurrently on branch-local memory snapshots and merge at the join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub source: NodeId,
    pub branches: Vec<ParallelBranch>,
    pub join: NodeId,
}

impl ParallelGroup {
    pub fn new(
        source: impl Into<NodeId>,
        branches: Vec<ParallelBranch>,
        join: impl Into<NodeId>,
    ) -> Self {
        Self {
            source: source.into(),
            branches,
            join: join.into(),
        }
    }
}

/// The executable graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<Edge>,
    pub entry_node_id: NodeId,
    pub terminal_node_ids: BTreeSet<NodeId>,
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroup>,
}

impl Graph {
    pub fn new(nodes: Vec<NodeSpec>, edges: Vec<Edge>, entry_node_id: impl Into<NodeId>) -> Self {
        let terminal_node_ids = nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Terminal)
            .map(|n| n.id.clone())
            .collect();
        Self {
            nodes,
            edges,
            entry_node_id: entry_node_id.into(),
            terminal_node_ids,
            parallel_groups: Vec::new(),
        }
    }

    pub fn with_parallel_group(mut self, group: ParallelGroup) -> Self {
        self.parallel_groups.push(group);
        self
    }

    /// Look up a node by id
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Whether the id names a terminal node
    pub fn is_terminal(&self, id: &NodeId) -> bool {
        self.terminal_node_ids.contains(id)
    }

    /// The parallel group fanning out of a node, if declared
    pub fn parallel_group_for(&self, source: &NodeId) -> Option<&ParallelGroup> {
        self.parallel_groups.iter().find(|g| &g.source == source)
    }

    /// Validate the graph's structural invariants
    ///
    /// Checks id uniqueness, per-node invariants, endpoint resolution,
    /// reachability of every node from the entry, the terminal set, and
    /// static independence of every declared parallel group.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.nodes.is_empty() {
            return Err(CoreError::graph_invalid("graph has no nodes"));
        }

        let mut ids = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !ids.insert(node.id.clone()) {
                return Err(CoreError::graph_invalid(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        if !ids.contains(&self.entry_node_id) {
            return Err(CoreError::graph_invalid(format!(
                "entry node '{}' does not exist",
                self.entry_node_id
            )));
        }

        for terminal in &self.terminal_node_ids {
            if !ids.contains(terminal) {
                return Err(CoreError::graph_invalid(format!(
                    "terminal node '{}' does not exist",
                    terminal
                )));
            }
        }

        for edge in &self.edges {
            if !ids.contains(&edge.source) {
                return Err(CoreError::graph_invalid(format!(
                    "edge source '{}' does not exist",
                    edge.source
                )));
            }
            if !ids.contains(&edge.target) {
                return Err(CoreError::graph_invalid(format!(
                    "edge target '{}' does not exist",
                    edge.target
                )));
            }
        }

        self.validate_reachability(&ids)?;

        for group in &self.parallel_groups {
            self.validate_parallel_group(group, &ids)?;
        }

        Ok(())
    }

    /// Check that the dispatcher resolves every tool named by a node
    ///
    /// Run-start validation: tool availability is a property of the
    /// deployment, not of the graph document itself.
    pub fn validate_tools(&self, dispatcher: &dyn crate::tools::ToolDispatcher) -> Result<(), CoreError> {
        for node in &self.nodes {
            for tool in &node.tools {
                if !dispatcher.contains(tool) {
                    return Err(CoreError::tool_unavailable(
                        tool.clone(),
                        format!("named by node '{}' but not registered", node.id),
                    ));
                }
            }
        }
        Ok(())
    }

    fn adjacency(&self) -> HashMap<&NodeId, Vec<&NodeId>> {
        let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(&edge.source).or_default().push(&edge.target);
        }
        adjacency
    }

    fn validate_reachability(&self, ids: &HashSet<NodeId>) -> Result<(), CoreError> {
        let mut adjacency = self.adjacency();
        // Parallel groups imply control flow from source to branch entries
        for group in &self.parallel_groups {
            for branch in &group.branches {
                adjacency
                    .entry(&group.source)
                    .or_default()
                    .push(&branch.entry);
            }
        }

        let mut reached: HashSet<&NodeId> = HashSet::new();
        let mut queue = VecDeque::new();
        reached.insert(&self.entry_node_id);
        queue.push_back(&self.entry_node_id);
        while let Some(current) = queue.pop_front() {
            if let Some(targets) = adjacency.get(current) {
                for &target in targets {
                    if reached.insert(target) {
                        queue.push_back(target);
                    }
                }
            }
        }

        for id in ids {
            if !reached.contains(id) {
                return Err(CoreError::graph_invalid(format!(
                    "node '{}' is unreachable from the entry node",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Nodes belonging to a branch: reachable from its entry without
    /// passing through the join
    fn branch_node_set(&self, entry: &NodeId, join: &NodeId) -> Result<BTreeSet<NodeId>, CoreError> {
        let adjacency = self.adjacency();
        let mut set = BTreeSet::new();
        let mut queue = VecDeque::new();
        let mut reaches_join = false;

        set.insert(entry.clone());
        queue.push_back(entry);
        while let Some(current) = queue.pop_front() {
            if self.is_terminal(current) {
                return Err(CoreError::graph_invalid(format!(
                    "parallel branch starting at '{}' runs into terminal node '{}' before the join",
                    entry, current
                )));
            }
            if let Some(targets) = adjacency.get(current) {
                for &target in targets {
                    if target == join {
                        reaches_join = true;
                        continue;
                    }
                    if set.insert(target.clone()) {
                        queue.push_back(target);
                    }
                }
            }
        }

        if !reaches_join {
            return Err(CoreError::graph_invalid(format!(
                "parallel branch starting at '{}' never reaches join node '{}'",
                entry, join
            )));
        }
        Ok(set)
    }

    fn validate_parallel_group(
        &self,
        group: &ParallelGroup,
        ids: &HashSet<NodeId>,
    ) -> Result<(), CoreError> {
        if group.branches.len() < 2 {
            return Err(CoreError::graph_invalid(format!(
                "parallel group at '{}' needs at least two branches",
                group.source
            )));
        }
        for id in std::iter::once(&group.source)
            .chain(std::iter::once(&group.join))
            .chain(group.branches.iter().map(|b| &b.entry))
        {
            if !ids.contains(id) {
                return Err(CoreError::graph_invalid(format!(
                    "parallel group references unknown node '{}'",
                    id
                )));
            }
        }

        let mut branch_sets = Vec::with_capacity(group.branches.len());
        for branch in &group.branches {
            let set = self.branch_node_set(&branch.entry, &group.join)?;
            for id in &set {
                if let Some(node) = self.node(id) {
                    if node.kind.is_client_facing() {
                        return Err(CoreError::graph_invalid(format!(
                            "client-facing node '{}' cannot run inside a parallel branch",
                            id
                        )));
                    }
                }
                if self
                    .parallel_groups
                    .iter()
                    .any(|g| &g.source == id && g.source != group.source)
                {
                    return Err(CoreError::graph_invalid(format!(
                        "parallel group source '{}' cannot be nested inside another branch",
                        id
                    )));
                }
            }
            branch_sets.push((branch.entry.clone(), set));
        }

        // Branch node sets must be disjoint until the join
        for i in 0..branch_sets.len() {
            for j in (i + 1)..branch_sets.len() {
                if let Some(shared) = branch_sets[i].1.intersection(&branch_sets[j].1).next() {
                    return Err(CoreError::graph_invalid(format!(
                        "parallel branches '{}' and '{}' share node '{}' without a declared join",
                        branch_sets[i].0, branch_sets[j].0, shared
                    )));
                }
            }
        }

        // Branch key footprints must not overlap: one branch's outputs may
        // not intersect another branch's inputs or outputs
        let footprints: Vec<(NodeId, HashSet<&str>, HashSet<&str>)> = branch_sets
            .iter()
            .map(|(entry, set)| {
                let mut inputs = HashSet::new();
                let mut outputs = HashSet::new();
                for id in set {
                    if let Some(node) = self.node(id) {
                        inputs.extend(node.input_keys.iter().map(|k| k.as_str()));
                        outputs.extend(node.output_keys.iter().map(|k| k.as_str()));
                    }
                }
                (entry.clone(), inputs, outputs)
            })
            .collect();

        for i in 0..footprints.len() {
            for j in 0..footprints.len() {
                if i == j {
                    continue;
                }
                for key in &footprints[i].2 {
                    if footprints[j].1.contains(key) || footprints[j].2.contains(key) {
                        return Err(CoreError::graph_invalid(format!(
                            "parallel branches '{}' and '{}' overlap on key '{}'",
                            footprints[i].0, footprints[j].0, key
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::Verdict;

    fn linear_graph() -> Graph {
        Graph::new(
            vec![
                NodeSpec::event_loop("intake").with_output_keys(["summary"]),
                NodeSpec::terminal("done"),
            ],
            vec![Edge::on_verdict("intake", "done", Verdict::Accept)],
            "intake",
        )
    }

    #[test]
    fn test_linear_graph_validates() {
        assert!(linear_graph().validate().is_ok());
    }

    #[test]
    fn test_terminal_set_derived_from_kinds() {
        let graph = linear_graph();
        assert!(graph.is_terminal(&"done".into()));
        assert!(!graph.is_terminal(&"intake".into()));
    }

    #[test]
    fn test_missing_entry_rejected() {
        let mut graph = linear_graph();
        graph.entry_node_id = "ghost".into();
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let mut graph = linear_graph();
        graph.edges.push(Edge::always("intake", "nowhere"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let mut graph = linear_graph();
        graph.nodes.push(NodeSpec::event_loop("orphan"));
        let err = graph.validate().unwrap_err();
        assert!(format!("{err}").contains("unreachable"));
    }

    #[test]
    fn test_retry_cycle_is_allowed() {
        let mut graph = linear_graph();
        graph
            .edges
            .insert(0, Edge::on_verdict("intake", "intake", Verdict::Retry));
        assert!(graph.validate().is_ok());
    }

    fn fan_out_graph() -> Graph {
        Graph::new(
            vec![
                NodeSpec::event_loop("plan").with_output_keys(["brief"]),
                NodeSpec::event_loop("research")
                    .with_input_keys(["brief"])
                    .with_output_keys(["findings"]),
                NodeSpec::event_loop("outline")
                    .with_input_keys(["brief"])
                    .with_output_keys(["structure"]),
                NodeSpec::event_loop("write")
                    .with_input_keys(["findings", "structure"])
                    .with_output_keys(["report"]),
                NodeSpec::terminal("done"),
            ],
            vec![
                Edge::on_verdict("research", "write", Verdict::Accept),
                Edge::on_verdict("outline", "write", Verdict::Accept),
                Edge::on_verdict("write", "done", Verdict::Accept),
            ],
            "plan",
        )
        .with_parallel_group(ParallelGroup::new(
            "plan",
            vec![ParallelBranch::new("research"), ParallelBranch::new("outline")],
            "write",
        ))
    }

    #[test]
    fn test_independent_parallel_group_validates() {
        assert!(fan_out_graph().validate().is_ok());
    }

    #[test]
    fn test_parallel_group_output_overlap_rejected() {
        let mut graph = fan_out_graph();
        // Make both branches write the same key
        graph
            .nodes
            .iter_mut()
            .find(|n| n.id.as_str() == "outline")
            .unwrap()
            .output_keys = vec!["findings".into()];
        let err = graph.validate().unwrap_err();
        assert!(format!("{err}").contains("overlap"));
    }

    #[test]
    fn test_parallel_group_shared_node_rejected() {
        let mut graph = fan_out_graph();
        // research now also flows through outline before the join
        graph.edges.push(Edge::always("research", "outline"));
        let err = graph.validate().unwrap_err();
        assert!(format!("{err}").contains("share node"));
    }

    #[test]
    fn test_parallel_branch_must_reach_join() {
        let mut graph = fan_out_graph();
        graph.edges.retain(|e| e.source.as_str() != "outline");
        // outline becomes a dead end; it no longer reaches the join
        let err = graph.validate().unwrap_err();
        assert!(format!("{err}").contains("never reaches join"));
    }

    #[test]
    fn test_client_facing_node_rejected_in_branch() {
        let mut graph = fan_out_graph();
        graph
            .nodes
            .iter_mut()
            .find(|n| n.id.as_str() == "research")
            .unwrap()
            .kind = NodeKind::ClientFacingEventLoop;
        let err = graph.validate().unwrap_err();
        assert!(format!("{err}").contains("client-facing"));
    }

    #[test]
    fn test_single_branch_group_rejected() {
        let mut graph = fan_out_graph();
        graph.parallel_groups[0].branches.pop();
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_validate_tools_against_dispatcher() {
        use crate::tools::ToolRegistry;

        let mut graph = linear_graph();
        graph
            .nodes
            .iter_mut()
            .find(|n| n.id.as_str() == "intake")
            .unwrap()
            .tools = vec!["search".into()];

        let empty = ToolRegistry::new();
        assert!(matches!(
            graph.validate_tools(&empty),
            Err(CoreError::ToolUnavailable { .. })
        ));
    }
}
