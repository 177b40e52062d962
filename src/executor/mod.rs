//! Graph executor
//!
//! Drives a run: schedules node visits along condition-selected edges,
//! enforces visit limits, writes checkpoints at every boundary, runs
//! declared parallel batches on a bounded worker pool, and honors pause
//! and cancel requests at suspension points. The executor is bound to one
//! (graph, goal) pair; both are validated at construction and never
//! mutated afterwards.

mod control;
mod functions;

pub use control::{RunControl, RunResult, TerminationReason};
pub use functions::{FunctionRegistry, NodeFunction};

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Semaphore};

use crate::config::RuntimeConfig;
use crate::error::CoreError;
use crate::eventlog::{EventLog, StepKind};
use crate::goal::Goal;
use crate::graph::{select_edge, Graph, NodeId, NodeKind, NodeSpec, ParallelGroup};
use crate::judge::{CriteriaJudge, Judge, Judgment, Verdict};
use crate::llm::LlmProvider;
use crate::memory::Memory;
use crate::runtime::{NodeRuntime, VisitOutcome};
use crate::session::{
    Checkpoint, CheckpointKind, ExecutionState, MemorySessionStore, SessionId, SessionStatus,
    SessionStore, SuspendedVisit,
};
use crate::tools::ToolDispatcher;

/// Executes a graph against a goal
pub struct GraphExecutor {
    graph: Arc<Graph>,
    goal: Arc<Goal>,
    agent_name: String,
    llm: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolDispatcher>,
    judge: Arc<dyn Judge>,
    functions: FunctionRegistry,
    sessions: Arc<dyn SessionStore>,
    events: Arc<EventLog>,
    config: RuntimeConfig,
    controls: StdMutex<HashMap<String, RunControl>>,
}

impl GraphExecutor {
    /// Bind an executor to a validated (graph, goal) pair
    pub fn new(
        graph: Graph,
        goal: Goal,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolDispatcher>,
    ) -> Result<Self, CoreError> {
        goal.validate()?;
        graph.validate()?;
        Ok(Self {
            graph: Arc::new(graph),
            goal: Arc::new(goal),
            agent_name: "agent".to_string(),
            llm,
            tools,
            judge: Arc::new(CriteriaJudge::new()),
            functions: FunctionRegistry::new(),
            sessions: Arc::new(MemorySessionStore::new()),
            events: Arc::new(EventLog::new()),
            config: RuntimeConfig::default(),
            controls: StdMutex::new(HashMap::new()),
        })
    }

    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = name.into();
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// The event log this executor appends to
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// The session store backing this executor
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Start a fresh run with the given input
    pub async fn execute(&self, input: Value) -> Result<RunResult, CoreError> {
        self.validate_run_start()?;
        let session = self.sessions.create_session(&self.agent_name, &input).await?;
        let state = session.execution_state.clone();
        let run_id = state.run_id.clone();
        let control = self.register_control(&run_id);

        tracing::info!(run_id = %run_id, session_id = %session.session_id, "run started");
        let result = self
            .drive(session.session_id.clone(), state, control, None)
            .await;
        self.controls.lock().expect("control lock poisoned").remove(&run_id);
        result
    }

    /// Resume a paused or failed session
    pub async fn resume(&self, session_id: &SessionId) -> Result<RunResult, CoreError> {
        self.resume_with_input(session_id, None).await
    }

    /// Resume, delivering user input to a visit that requested it
    pub async fn resume_with_input(
        &self,
        session_id: &SessionId,
        user_input: Option<Value>,
    ) -> Result<RunResult, CoreError> {
        self.validate_run_start()?;
        let session = self.sessions.load_session(session_id).await?;
        if !session.status.is_resumable() {
            return Err(CoreError::SessionNotResumable {
                id: session_id.to_string(),
                status: session.status.to_string(),
            });
        }

        let state = session.execution_state.clone();
        if let Some(suspended) = &state.suspended_visit {
            if suspended.awaiting_user_input && user_input.is_none() {
                return Err(CoreError::SessionNotResumable {
                    id: session_id.to_string(),
                    status: "paused awaiting user input".to_string(),
                });
            }
        }

        let run_id = state.run_id.clone();
        let control = self.register_control(&run_id);
        self.sessions
            .set_status(session_id, SessionStatus::Active)
            .await?;

        tracing::info!(run_id = %run_id, session_id = %session_id, "run resumed");
        let result = self
            .drive(session_id.clone(), state, control, user_input)
            .await;
        self.controls.lock().expect("control lock poisoned").remove(&run_id);
        result
    }

    /// Rewind to a prior checkpoint, discard everything after it, and
    /// continue execution from the snapshot
    pub async fn recover(
        &self,
        session_id: &SessionId,
        checkpoint_id: &str,
    ) -> Result<RunResult, CoreError> {
        self.validate_run_start()?;
        // Confirm the session exists before touching its checkpoints
        self.sessions.load_session(session_id).await?;
        let checkpoint = self
            .sessions
            .truncate_checkpoints_after(session_id, checkpoint_id)
            .await?;

        let state = checkpoint.state.clone();
        self.events.truncate_after(&state.run_id, checkpoint.ts);
        self.sessions.save_state(session_id, &state).await?;
        self.sessions
            .set_status(session_id, SessionStatus::Active)
            .await?;

        let run_id = state.run_id.clone();
        let control = self.register_control(&run_id);
        tracing::info!(
            run_id = %run_id,
            session_id = %session_id,
            checkpoint_id,
            "run recovered from checkpoint"
        );
        let result = self.drive(session_id.clone(), state, control, None).await;
        self.controls.lock().expect("control lock poisoned").remove(&run_id);
        result
    }

    /// Request a pause; honored at the next inter-step boundary
    ///
    /// Returns whether the run id is live.
    pub fn pause(&self, run_id: &str) -> bool {
        let controls = self.controls.lock().expect("control lock poisoned");
        match controls.get(run_id) {
            Some(control) => {
                control.request_pause();
                true
            }
            None => false,
        }
    }

    /// Request cancellation; the run is not resumable afterwards
    pub fn cancel(&self, run_id: &str) -> bool {
        let controls = self.controls.lock().expect("control lock poisoned");
        match controls.get(run_id) {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn register_control(&self, run_id: &str) -> RunControl {
        let control = RunControl::new();
        self.controls
            .lock()
            .expect("control lock poisoned")
            .insert(run_id.to_string(), control.clone());
        control
    }

    /// Run-start validation: every named tool and function must resolve
    fn validate_run_start(&self) -> Result<(), CoreError> {
        self.graph.validate_tools(self.tools.as_ref())?;
        for node in &self.graph.nodes {
            if node.kind == NodeKind::Function {
                let name = node.function_name.as_deref().unwrap_or_default();
                if !self.functions.contains(name) {
                    return Err(CoreError::graph_invalid(format!(
                        "function '{}' named by node '{}' is not registered",
                        name, node.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// The main scheduling loop
    async fn drive(
        &self,
        session_id: SessionId,
        mut state: ExecutionState,
        control: RunControl,
        mut user_input: Option<Value>,
    ) -> Result<RunResult, CoreError> {
        let runtime = Arc::new(NodeRuntime::new(
            Arc::clone(&self.llm),
            Arc::clone(&self.tools),
            Arc::clone(&self.judge),
            Arc::clone(&self.events),
            self.config.clone(),
        ));
        let run_id = state.run_id.clone();

        let mut pending_resume: Option<(SuspendedVisit, Option<Value>)> = None;
        let mut current: NodeId = match state.suspended_visit.take() {
            Some(suspended) => {
                let node_id = suspended.node_id.clone();
                pending_resume = Some((suspended, user_input.take()));
                node_id
            }
            // Re-entry at last_node_id is a fresh visit of that node;
            // fresh runs start at the entry node
            None => match &state.last_node_id {
                Some(last) => last.clone(),
                None => self.graph.entry_node_id.clone(),
            },
        };

        loop {
            if control.is_cancelled() {
                return self.finish_cancelled(&session_id, &state).await;
            }
            if control.is_pause_requested() && pending_resume.is_none() {
                self.write_checkpoint(&session_id, CheckpointKind::Pause, &state)
                    .await?;
                return self
                    .finish(
                        &session_id,
                        &state,
                        SessionStatus::Paused,
                        TerminationReason::PauseRequested,
                    )
                    .await;
            }
            if self.events.step_count(&run_id) > self.config.max_run_steps {
                tracing::warn!(run_id = %run_id, "run step ceiling reached");
                return self
                    .finish(
                        &session_id,
                        &state,
                        SessionStatus::Failed,
                        TerminationReason::MaxVisits,
                    )
                    .await;
            }

            if self.graph.is_terminal(&current) {
                return self
                    .finish(
                        &session_id,
                        &state,
                        SessionStatus::Completed,
                        TerminationReason::TerminalNode,
                    )
                    .await;
            }

            let node = self
                .graph
                .node(&current)
                .ok_or_else(|| {
                    CoreError::graph_invalid(format!("edge leads to unknown node '{current}'"))
                })?
                .clone();

            let continuing = pending_resume.is_some();
            if !continuing {
                if state.visits(&current) >= node.max_visits {
                    match self.handle_visit_breach(&session_id, &mut state, &node).await? {
                        BreachOutcome::Routed(next) => {
                            current = next;
                            continue;
                        }
                        BreachOutcome::Terminal => {
                            return self
                                .finish(
                                    &session_id,
                                    &state,
                                    SessionStatus::Completed,
                                    TerminationReason::TerminalNode,
                                )
                                .await;
                        }
                        BreachOutcome::Exhausted => {
                            return self
                                .finish(
                                    &session_id,
                                    &state,
                                    SessionStatus::Failed,
                                    TerminationReason::MaxVisits,
                                )
                                .await;
                        }
                    }
                }
                state.record_visit(&current);
                state.last_node_id = Some(current.clone());
                tracing::debug!(run_id = %run_id, node = %current, visit = state.visits(&current), "node entry");
                self.write_checkpoint(&session_id, CheckpointKind::NodeEntry, &state)
                    .await?;
            }

            let judgment = match node.kind {
                NodeKind::Terminal => unreachable!("terminal nodes are handled before execution"),
                NodeKind::Function => {
                    apply_function(
                        &self.functions,
                        &self.events,
                        &run_id,
                        &node,
                        &mut state.memory,
                    )
                    .await
                }
                NodeKind::EventLoop | NodeKind::ClientFacingEventLoop => {
                    let (snapshot_tx, drain) =
                        self.spawn_periodic_drain(&session_id, &state);
                    let outcome = runtime
                        .run_visit(
                            &node,
                            &self.goal,
                            &mut state.memory,
                            &run_id,
                            &control,
                            pending_resume.take(),
                            snapshot_tx.as_ref(),
                        )
                        .await;
                    drop(snapshot_tx);
                    if let Some(handle) = drain {
                        let _ = handle.await;
                    }

                    match outcome {
                        Ok(VisitOutcome::Completed(judgment)) => judgment,
                        Ok(VisitOutcome::Suspended(suspended)) => {
                            state.paused_at = Some(current.clone());
                            state.suspended_visit = Some(suspended);
                            self.sessions.save_state(&session_id, &state).await?;
                            self.write_checkpoint(&session_id, CheckpointKind::Pause, &state)
                                .await?;
                            return self
                                .finish(
                                    &session_id,
                                    &state,
                                    SessionStatus::Paused,
                                    TerminationReason::PauseRequested,
                                )
                                .await;
                        }
                        Err(CoreError::Cancelled) => {
                            return self.finish_cancelled(&session_id, &state).await;
                        }
                        Err(err) => {
                            state.failed_nodes.insert(current.clone(), err.to_string());
                            let _ = self.sessions.save_state(&session_id, &state).await;
                            let _ = self
                                .sessions
                                .set_status(&session_id, SessionStatus::Failed)
                                .await;
                            return Err(err);
                        }
                    }
                }
            };

            // Hard constraints abort regardless of what edge would fire
            let memory_violations = self.goal.violated_hard_constraints(&state.memory);
            if !judgment.violated_constraints.is_empty() || !memory_violations.is_empty() {
                let reason = if judgment.violated_constraints.is_empty() {
                    memory_violations
                        .iter()
                        .map(|c| c.id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                } else {
                    judgment.violated_constraints.join(", ")
                };
                tracing::warn!(run_id = %run_id, node = %current, constraints = %reason, "hard constraint violated");
                state
                    .failed_nodes
                    .insert(current.clone(), format!("hard constraint violated: {reason}"));
                return self
                    .finish(
                        &session_id,
                        &state,
                        SessionStatus::Failed,
                        TerminationReason::HardConstraint,
                    )
                    .await;
            }

            state.last_verdict = Some(judgment.verdict);
            state.last_node_id = Some(current.clone());
            state.paused_at = None;
            if judgment.verdict == Verdict::Accept {
                state.completed_nodes.insert(current.clone());
            }
            self.sessions.save_state(&session_id, &state).await?;
            if judgment.verdict == Verdict::Accept {
                self.write_checkpoint(&session_id, CheckpointKind::NodeComplete, &state)
                    .await?;
            }

            // Declared parallel fan-out fires on accepted completion
            if judgment.verdict == Verdict::Accept {
                if let Some(group) = self.graph.parallel_group_for(&current).cloned() {
                    if let Err(err) = self
                        .run_parallel_batch(&group, &mut state, &control, &runtime)
                        .await
                    {
                        if matches!(err, CoreError::Cancelled) {
                            return self.finish_cancelled(&session_id, &state).await;
                        }
                        state
                            .failed_nodes
                            .insert(group.source.clone(), err.to_string());
                        let _ = self.sessions.save_state(&session_id, &state).await;
                        let _ = self
                            .sessions
                            .set_status(&session_id, SessionStatus::Failed)
                            .await;
                        return Err(err);
                    }
                    self.sessions.save_state(&session_id, &state).await?;
                    current = group.join.clone();
                    continue;
                }
            }

            match select_edge(
                &self.graph.edges,
                &current,
                state.last_verdict,
                &state.memory,
            ) {
                Some(edge) => {
                    if self.graph.is_terminal(&edge.target) {
                        return self
                            .finish(
                                &session_id,
                                &state,
                                SessionStatus::Completed,
                                TerminationReason::TerminalNode,
                            )
                            .await;
                    }
                    current = edge.target.clone();
                }
                None => {
                    tracing::warn!(run_id = %run_id, node = %current, verdict = ?state.last_verdict, "no valid edge");
                    return self
                        .finish(
                            &session_id,
                            &state,
                            SessionStatus::Failed,
                            TerminationReason::NoValidEdge,
                        )
                        .await;
                }
            }
        }
    }

    /// Visit-limit breach: record it, then follow an escalate edge if the
    /// graph declares one, else exhaust the run
    async fn handle_visit_breach(
        &self,
        session_id: &SessionId,
        state: &mut ExecutionState,
        node: &NodeSpec,
    ) -> Result<BreachOutcome, CoreError> {
        tracing::warn!(node = %node.id, max_visits = node.max_visits, "visit limit breached");
        self.events.append(
            &state.run_id,
            node.id.as_str(),
            StepKind::JudgeVerdict,
            json!({
                "verdict": Verdict::Escalate.to_string(),
                "reasoning": format!("visit limit ({}) breached", node.max_visits),
            }),
        );
        state.last_verdict = Some(Verdict::Escalate);
        state.last_node_id = Some(node.id.clone());
        self.sessions.save_state(session_id, state).await?;

        if let Some(edge) = select_edge(
            &self.graph.edges,
            &node.id,
            Some(Verdict::Escalate),
            &state.memory,
        ) {
            // Only an explicit escalate (or always) edge may absorb the
            // breach; retry loops back to the same node would spin
            if edge.target != node.id {
                if self.graph.is_terminal(&edge.target) {
                    return Ok(BreachOutcome::Terminal);
                }
                return Ok(BreachOutcome::Routed(edge.target.clone()));
            }
        }
        Ok(BreachOutcome::Exhausted)
    }

    /// Run a declared parallel batch: branch tasks on a bounded pool,
    /// branch-local memory snapshots, deterministic merge at the join
    async fn run_parallel_batch(
        &self,
        group: &ParallelGroup,
        state: &mut ExecutionState,
        control: &RunControl,
        runtime: &Arc<NodeRuntime>,
    ) -> Result<(), CoreError> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let base = state.memory.snapshot();
        let mut handles = Vec::with_capacity(group.branches.len());

        for branch in &group.branches {
            let ctx = BranchContext {
                graph: Arc::clone(&self.graph),
                goal: Arc::clone(&self.goal),
                runtime: Arc::clone(runtime),
                functions: self.functions.clone(),
                events: Arc::clone(&self.events),
                run_id: state.run_id.clone(),
                join: group.join.clone(),
            };
            let entry = branch.entry.clone();
            let memory = base.snapshot();
            let visit_counts = state.visit_counts.clone();
            let branch_control = control.fork_cancel_only();
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("branch pool semaphore closed");
                run_branch(ctx, entry, memory, visit_counts, branch_control).await
            }));
        }

        let mut branch_writes = Vec::with_capacity(handles.len());
        let mut merged_counts = state.visit_counts.clone();
        for (branch, handle) in group.branches.iter().zip(handles) {
            let joined = handle.await.map_err(|e| {
                CoreError::storage_with_source(
                    "parallel branch task failed",
                    std::io::Error::other(e.to_string()),
                )
            })?;
            let (branch_memory, branch_counts) = joined?;
            branch_writes.push((branch.entry.to_string(), branch_memory.writes_since(&base)));
            for (node_id, count) in branch_counts {
                let entry = merged_counts.entry(node_id).or_insert(0);
                *entry = (*entry).max(count);
            }
        }

        state.memory.merge_branches(branch_writes)?;
        state.visit_counts = merged_counts;
        Ok(())
    }

    /// Periodic checkpoint plumbing for long event loops
    fn spawn_periodic_drain(
        &self,
        session_id: &SessionId,
        state: &ExecutionState,
    ) -> (
        Option<mpsc::UnboundedSender<(SuspendedVisit, Memory)>>,
        Option<tokio::task::JoinHandle<()>>,
    ) {
        if self.config.checkpoint_interval.is_none() {
            return (None, None);
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<(SuspendedVisit, Memory)>();
        let sessions = Arc::clone(&self.sessions);
        let session_id = session_id.clone();
        let base_state = state.clone();
        let handle = tokio::spawn(async move {
            while let Some((suspended, memory)) = rx.recv().await {
                let mut snapshot = base_state.clone();
                snapshot.memory = memory;
                snapshot.paused_at = Some(suspended.node_id.clone());
                snapshot.suspended_visit = Some(suspended);
                let checkpoint = Checkpoint::new(CheckpointKind::Periodic, snapshot);
                if let Err(err) = sessions.append_checkpoint(&session_id, &checkpoint).await {
                    tracing::error!(session_id = %session_id, error = %err, "periodic checkpoint write failed");
                }
            }
        });
        (Some(tx), Some(handle))
    }

    async fn write_checkpoint(
        &self,
        session_id: &SessionId,
        kind: CheckpointKind,
        state: &ExecutionState,
    ) -> Result<(), CoreError> {
        let checkpoint = Checkpoint::new(kind, state.clone());
        self.sessions
            .append_checkpoint(session_id, &checkpoint)
            .await
    }

    async fn finish(
        &self,
        session_id: &SessionId,
        state: &ExecutionState,
        status: SessionStatus,
        reason: TerminationReason,
    ) -> Result<RunResult, CoreError> {
        self.sessions.save_state(session_id, state).await?;
        self.sessions.set_status(session_id, status).await?;
        tracing::info!(run_id = %state.run_id, terminated_by = %reason, "run finished");
        Ok(RunResult {
            run_id: state.run_id.clone(),
            session_id: session_id.clone(),
            status,
            memory: state.memory.clone(),
            terminated_by: reason,
            events: self.events.steps(&state.run_id),
        })
    }

    /// Cancel skips the state save; only the status flips
    async fn finish_cancelled(
        &self,
        session_id: &SessionId,
        state: &ExecutionState,
    ) -> Result<RunResult, CoreError> {
        let _ = self
            .sessions
            .set_status(session_id, SessionStatus::Cancelled)
            .await;
        tracing::info!(run_id = %state.run_id, "run cancelled");
        Ok(RunResult {
            run_id: state.run_id.clone(),
            session_id: session_id.clone(),
            status: SessionStatus::Cancelled,
            memory: state.memory.clone(),
            terminated_by: TerminationReason::Cancelled,
            events: self.events.steps(&state.run_id),
        })
    }
}

enum BreachOutcome {
    Routed(NodeId),
    Terminal,
    Exhausted,
}

/// Shared context for one parallel branch task
struct BranchContext {
    graph: Arc<Graph>,
    goal: Arc<Goal>,
    runtime: Arc<NodeRuntime>,
    functions: FunctionRegistry,
    events: Arc<EventLog>,
    run_id: String,
    join: NodeId,
}

/// Execute one branch sequentially from its entry to the join
async fn run_branch(
    ctx: BranchContext,
    entry: NodeId,
    mut memory: Memory,
    mut visit_counts: BTreeMap<NodeId, u32>,
    control: RunControl,
) -> Result<(Memory, BTreeMap<NodeId, u32>), CoreError> {
    let mut current = entry;

    loop {
        if current == ctx.join {
            return Ok((memory, visit_counts));
        }
        if control.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let node = ctx
            .graph
            .node(&current)
            .ok_or_else(|| {
                CoreError::graph_invalid(format!("branch edge leads to unknown node '{current}'"))
            })?
            .clone();

        let visits = visit_counts.entry(current.clone()).or_insert(0);
        if *visits >= node.max_visits {
            return Err(CoreError::NodeMaxVisits {
                node_id: current.to_string(),
                visits: node.max_visits,
            });
        }
        *visits += 1;

        let judgment = match node.kind {
            NodeKind::Function => {
                apply_function(&ctx.functions, &ctx.events, &ctx.run_id, &node, &mut memory).await
            }
            NodeKind::Terminal => {
                // Static validation rejects this; keep the guard anyway
                return Err(CoreError::graph_invalid(format!(
                    "terminal node '{current}' inside a parallel branch"
                )));
            }
            NodeKind::EventLoop | NodeKind::ClientFacingEventLoop => {
                match ctx
                    .runtime
                    .run_visit(
                        &node,
                        &ctx.goal,
                        &mut memory,
                        &ctx.run_id,
                        &control,
                        None,
                        None,
                    )
                    .await?
                {
                    VisitOutcome::Completed(judgment) => judgment,
                    VisitOutcome::Suspended(_) => {
                        return Err(CoreError::graph_invalid(format!(
                            "node '{current}' suspended inside a parallel branch"
                        )));
                    }
                }
            }
        };

        match select_edge(
            &ctx.graph.edges,
            &current,
            Some(judgment.verdict),
            &memory,
        ) {
            Some(edge) => current = edge.target.clone(),
            None => {
                return Err(CoreError::NoValidEdge {
                    node_id: current.to_string(),
                })
            }
        }
    }
}

/// Run a function node: declared inputs in, declared outputs out
async fn apply_function(
    functions: &FunctionRegistry,
    events: &EventLog,
    run_id: &str,
    node: &NodeSpec,
    memory: &mut Memory,
) -> Judgment {
    let name = node.function_name.as_deref().unwrap_or_default();
    let Some(function) = functions.get(name) else {
        let judgment = Judgment::escalate(format!("function '{name}' is not registered"));
        log_function_verdict(events, run_id, node, &judgment);
        return judgment;
    };

    let mut inputs = BTreeMap::new();
    for key in &node.input_keys {
        if let Some(value) = memory.get(key) {
            inputs.insert(key.clone(), value.clone());
        }
    }

    let judgment = match function.call(inputs).await {
        Ok(outputs) => {
            if let Some(bad) = outputs.keys().find(|k| !node.output_keys.contains(*k)) {
                Judgment::escalate(format!("function '{name}' wrote undeclared key '{bad}'"))
            } else {
                let keys: Vec<String> = outputs.keys().cloned().collect();
                for (key, value) in outputs {
                    memory.insert(key, value, node.id.as_str());
                }
                events.append(
                    run_id,
                    node.id.as_str(),
                    StepKind::SetOutput,
                    json!({ "keys": keys }),
                );

                let missing: Vec<&str> = node
                    .required_output_keys()
                    .into_iter()
                    .filter(|k| !memory.contains(k))
                    .collect();
                if missing.is_empty() {
                    Judgment::accept("function completed")
                } else {
                    Judgment::escalate(format!(
                        "function '{name}' left required outputs missing: {}",
                        missing.join(", ")
                    ))
                }
            }
        }
        Err(err) => Judgment::escalate(format!("function '{name}' failed: {err}")),
    };

    log_function_verdict(events, run_id, node, &judgment);
    judgment
}

fn log_function_verdict(events: &EventLog, run_id: &str, node: &NodeSpec, judgment: &Judgment) {
    events.append(
        run_id,
        node.id.as_str(),
        StepKind::JudgeVerdict,
        json!({
            "verdict": judgment.verdict.to_string(),
            "reasoning": judgment.reasoning,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goal::{Metric, SuccessCriterion};
    use crate::graph::{Edge, ParallelBranch};
    use crate::llm::{Completion, CompletionOptions, Message, ToolCall, ToolSchema};
    use crate::tools::{ToolRegistry, SET_OUTPUT};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted LLM keyed by node id (taken from the system prompt tag)
    struct ScriptedLlm {
        scripts: Mutex<HashMap<String, VecDeque<Completion>>>,
    }

    impl ScriptedLlm {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
            }
        }

        fn script(self, marker: &str, completions: Vec<Completion>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(marker.to_string(), completions.into());
            self
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(
            &self,
            messages: &[Message],
            _tools: &[ToolSchema],
            _options: Option<&CompletionOptions>,
        ) -> Result<Completion, CoreError> {
            let system = messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let mut scripts = self.scripts.lock().unwrap();
            for (marker, queue) in scripts.iter_mut() {
                if system.contains(marker.as_str()) {
                    return queue
                        .pop_front()
                        .ok_or_else(|| CoreError::llm_unavailable("script exhausted"));
                }
            }
            Err(CoreError::llm_unavailable("no script for node"))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn set_output_call(args: Value) -> Completion {
        Completion::text("").with_tool_calls(vec![ToolCall::new(SET_OUTPUT, args)])
    }

    fn summary_goal() -> Goal {
        Goal::new("g", "produce a summary").with_criterion(SuccessCriterion::new(
            "c1",
            "summary present",
            Metric::OutputNonEmpty {
                key: "summary".into(),
            },
        ))
    }

    fn intake_graph() -> Graph {
        Graph::new(
            vec![
                NodeSpec::event_loop("intake")
                    .with_system_prompt("node:intake")
                    .with_output_keys(["summary"]),
                NodeSpec::terminal("done"),
            ],
            vec![
                Edge::on_verdict("intake", "intake", Verdict::Retry),
                Edge::on_verdict("intake", "done", Verdict::Accept),
            ],
            "intake",
        )
    }

    #[tokio::test]
    async fn test_execute_happy_path() {
        let llm = ScriptedLlm::new().script(
            "node:intake",
            vec![
                set_output_call(json!({"summary": "ok"})),
                Completion::text("done"),
            ],
        );
        let executor = GraphExecutor::new(
            intake_graph(),
            summary_goal(),
            Arc::new(llm),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap();

        let result = executor.execute(json!({"topic": "rust"})).await.unwrap();
        assert_eq!(result.terminated_by, TerminationReason::TerminalNode);
        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.memory.get("summary"), Some(&json!("ok")));
    }

    #[tokio::test]
    async fn test_no_valid_edge_terminates() {
        let mut graph = intake_graph();
        graph.edges.clear();
        graph.edges.push(Edge::on_verdict("intake", "done", Verdict::Escalate));

        let llm = ScriptedLlm::new().script(
            "node:intake",
            vec![
                set_output_call(json!({"summary": "ok"})),
                Completion::text("done"),
            ],
        );
        let executor = GraphExecutor::new(
            graph,
            summary_goal(),
            Arc::new(llm),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap();

        // Judge accepts but only an escalate edge exists
        let result = executor.execute(json!(null)).await.unwrap();
        assert_eq!(result.terminated_by, TerminationReason::NoValidEdge);
        assert_eq!(result.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_max_visits_exhausts_run() {
        // Judge always retries, retry edge loops back, one visit allowed:
        // a retry is intra-visit, so force re-visits via escalate edge
        struct AlwaysEscalate;

        #[async_trait]
        impl Judge for AlwaysEscalate {
            async fn evaluate(&self, _ctx: &crate::judge::JudgeContext<'_>) -> Result<Judgment, CoreError> {
                Ok(Judgment::escalate("always"))
            }
        }

        let mut graph = intake_graph();
        graph.edges.clear();
        graph
            .edges
            .push(Edge::on_verdict("intake", "intake", Verdict::Escalate));
        graph.nodes[0].max_visits = 2;

        let llm = ScriptedLlm::new().script(
            "node:intake",
            vec![
                Completion::text("a"),
                Completion::text("b"),
                Completion::text("c"),
            ],
        );
        let executor = GraphExecutor::new(
            graph,
            summary_goal(),
            Arc::new(llm),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap()
        .with_judge(Arc::new(AlwaysEscalate));

        let result = executor.execute(json!(null)).await.unwrap();
        assert_eq!(result.terminated_by, TerminationReason::MaxVisits);

        // The recorded count never exceeds the limit
        let session = executor
            .sessions()
            .load_session(&result.session_id)
            .await
            .unwrap();
        assert_eq!(session.execution_state.visits(&"intake".into()), 2);
    }

    #[tokio::test]
    async fn test_function_node_maps_inputs_to_outputs() {
        struct WordCount;

        #[async_trait]
        impl NodeFunction for WordCount {
            async fn call(
                &self,
                inputs: BTreeMap<String, Value>,
            ) -> Result<BTreeMap<String, Value>, CoreError> {
                let text = inputs
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let mut out = BTreeMap::new();
                out.insert(
                    "word_count".to_string(),
                    json!(text.split_whitespace().count()),
                );
                Ok(out)
            }
        }

        let graph = Graph::new(
            vec![
                NodeSpec::function("count", "word_count")
                    .with_input_keys(["text"])
                    .with_output_keys(["word_count"]),
                NodeSpec::terminal("done"),
            ],
            vec![Edge::on_success("count", "done")],
            "count",
        );

        let mut functions = FunctionRegistry::new();
        functions.register("word_count", Arc::new(WordCount));

        let executor = GraphExecutor::new(
            graph,
            Goal::new("g", "count words"),
            Arc::new(ScriptedLlm::new()),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap()
        .with_functions(functions);

        let result = executor
            .execute(json!({"text": "one two three"}))
            .await
            .unwrap();
        assert_eq!(result.terminated_by, TerminationReason::TerminalNode);
        assert_eq!(result.memory.get("word_count"), Some(&json!(3)));
        assert_eq!(result.memory.writer_of("word_count"), Some("count"));
    }

    #[tokio::test]
    async fn test_unregistered_function_fails_run_start() {
        let graph = Graph::new(
            vec![
                NodeSpec::function("f", "missing"),
                NodeSpec::terminal("done"),
            ],
            vec![Edge::on_success("f", "done")],
            "f",
        );
        let executor = GraphExecutor::new(
            graph,
            Goal::new("g", "test"),
            Arc::new(ScriptedLlm::new()),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap();

        let err = executor.execute(json!(null)).await.unwrap_err();
        assert!(matches!(err, CoreError::GraphInvalid { .. }));
    }

    #[tokio::test]
    async fn test_parallel_batch_merges_disjoint_writes() {
        let graph = Graph::new(
            vec![
                NodeSpec::event_loop("plan")
                    .with_system_prompt("node:plan")
                    .with_output_keys(["brief"]),
                NodeSpec::event_loop("research")
                    .with_system_prompt("node:research")
                    .with_output_keys(["findings"]),
                NodeSpec::event_loop("outline")
                    .with_system_prompt("node:outline")
                    .with_output_keys(["structure"]),
                NodeSpec::event_loop("write")
                    .with_system_prompt("node:write")
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
        ));

        let llm = ScriptedLlm::new()
            .script(
                "node:plan",
                vec![set_output_call(json!({"brief": "b"})), Completion::text("ok")],
            )
            .script(
                "node:research",
                vec![
                    set_output_call(json!({"findings": "f"})),
                    Completion::text("ok"),
                ],
            )
            .script(
                "node:outline",
                vec![
                    set_output_call(json!({"structure": "s"})),
                    Completion::text("ok"),
                ],
            )
            .script(
                "node:write",
                vec![
                    set_output_call(json!({"report": "r"})),
                    Completion::text("ok"),
                ],
            );

        let executor = GraphExecutor::new(
            graph,
            Goal::new("g", "write a report"),
            Arc::new(llm),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap();

        let result = executor.execute(json!(null)).await.unwrap();
        assert_eq!(result.terminated_by, TerminationReason::TerminalNode);
        assert_eq!(result.memory.get("findings"), Some(&json!("f")));
        assert_eq!(result.memory.get("structure"), Some(&json!("s")));
        assert_eq!(result.memory.get("report"), Some(&json!("r")));
    }

    #[tokio::test]
    async fn test_hard_constraint_aborts_run() {
        use crate::goal::{Constraint, ConstraintCheck};

        let goal = summary_goal().with_constraint(
            Constraint::hard("h1", "the word DELETED is forbidden").with_check(
                ConstraintCheck::ForbidValue {
                    key: "summary".into(),
                    value: json!("DELETED"),
                },
            ),
        );
        let llm = ScriptedLlm::new().script(
            "node:intake",
            vec![
                set_output_call(json!({"summary": "DELETED"})),
                Completion::text("done"),
            ],
        );
        let executor = GraphExecutor::new(
            intake_graph(),
            goal,
            Arc::new(llm),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap();

        let result = executor.execute(json!(null)).await.unwrap();
        assert_eq!(result.terminated_by, TerminationReason::HardConstraint);
        assert_eq!(result.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_pause_unknown_run_is_false() {
        let executor = GraphExecutor::new(
            intake_graph(),
            summary_goal(),
            Arc::new(ScriptedLlm::new()),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap();
        assert!(!executor.pause("ghost"));
        assert!(!executor.cancel("ghost"));
    }

    #[tokio::test]
    async fn test_completed_session_not_resumable() {
        let llm = ScriptedLlm::new().script(
            "node:intake",
            vec![
                set_output_call(json!({"summary": "ok"})),
                Completion::text("done"),
            ],
        );
        let executor = GraphExecutor::new(
            intake_graph(),
            summary_goal(),
            Arc::new(llm),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap();

        let result = executor.execute(json!(null)).await.unwrap();
        let err = executor.resume(&result.session_id).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionNotResumable { .. }));
    }
}
