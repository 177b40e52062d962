//! The per-visit event loop
//!
//! One visit interleaves LLM steps, tool dispatch, `set_output` writes,
//! and judge verdicts until a terminal condition: ACCEPT or ESCALATE from
//! the judge, an exhausted step budget, a suspension (user input or
//! pause), or cancellation. Retries never mutate memory; only
//! `set_output` writes, and feedback travels as a system-prompt addendum.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;

use super::conversation::Conversation;
use crate::config::RuntimeConfig;
use crate::error::CoreError;
use crate::eventlog::{EventLog, StepKind};
use crate::executor::RunControl;
use crate::goal::Goal;
use crate::graph::NodeSpec;
use crate::judge::{Judge, JudgeContext, Judgment, Verdict};
use crate::llm::{Completion, LlmProvider, ToolSchema};
use crate::memory::Memory;
use crate::session::SuspendedVisit;
use crate::tools::{set_output_schema, ToolDispatcher, SET_OUTPUT};

/// How one visit ended
#[derive(Debug)]
pub enum VisitOutcome {
    /// The judge (or a node-local guard) decided
    Completed(Judgment),
    /// The visit parked; its partial state goes into the session
    Suspended(SuspendedVisit),
}

/// Result of a guarded in-flight call
enum Guarded<T> {
    Done(T),
    TimedOut,
    /// Cancellation fired and the call did not finish within quiescence
    Abandoned,
}

/// Drives event-loop node visits
pub struct NodeRuntime {
    llm: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolDispatcher>,
    judge: Arc<dyn Judge>,
    events: Arc<EventLog>,
    config: RuntimeConfig,
}

impl NodeRuntime {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolDispatcher>,
        judge: Arc<dyn Judge>,
        events: Arc<EventLog>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            judge,
            events,
            config,
        }
    }

    /// Run one visit of an event-loop node
    ///
    /// `resume` re-enters a suspended visit with its serialized state and
    /// optional user input. `snapshots` receives periodic (visit, memory)
    /// snapshots for checkpointing when the config asks for them.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_visit(
        &self,
        node: &NodeSpec,
        goal: &Goal,
        memory: &mut Memory,
        run_id: &str,
        control: &RunControl,
        resume: Option<(SuspendedVisit, Option<Value>)>,
        snapshots: Option<&UnboundedSender<(SuspendedVisit, Memory)>>,
    ) -> Result<VisitOutcome, CoreError> {
        let node_id = node.id.as_str();

        let mut steps: u32;
        let mut attempt: u32;
        let mut feedback: Vec<String>;
        let mut conversation: Conversation;
        let mut input_received: bool;
        let mut outputs_written: bool;

        match resume {
            Some((suspended, user_input)) => {
                steps = suspended.steps_taken;
                attempt = suspended.attempt;
                feedback = suspended.feedback;
                conversation = suspended.conversation;
                input_received = suspended.input_received;
                outputs_written = suspended.outputs_written;

                if suspended.awaiting_user_input {
                    match user_input {
                        Some(value) => {
                            self.events.append(
                                run_id,
                                node_id,
                                StepKind::UserInputReceived,
                                json!({ "input": value }),
                            );
                            conversation.push_user(render_value(&value));
                            input_received = true;
                        }
                        None => {
                            // Still waiting; park again unchanged
                            return Ok(VisitOutcome::Suspended(SuspendedVisit {
                                node_id: node.id.clone(),
                                conversation,
                                steps_taken: steps,
                                attempt,
                                feedback,
                                awaiting_user_input: true,
                                input_received,
                                outputs_written,
                            }));
                        }
                    }
                }
            }
            None => {
                steps = 0;
                attempt = 0;
                feedback = Vec::new();
                conversation = Conversation::new(compose_system_prompt(node, memory, &[]))
                    .with_output_keys(node.output_keys.clone());
                input_received = false;
                outputs_written = false;
            }
        }

        let tool_schemas = self.tool_schemas(node);
        let deadline = Instant::now() + self.config.visit_timeout(node.max_steps_per_visit);

        loop {
            // Inter-step boundary: the only legal suspension point
            if control.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if control.is_pause_requested() {
                return Ok(VisitOutcome::Suspended(SuspendedVisit {
                    node_id: node.id.clone(),
                    conversation,
                    steps_taken: steps,
                    attempt,
                    feedback,
                    awaiting_user_input: false,
                    input_received,
                    outputs_written,
                }));
            }

            steps += 1;
            if steps > node.max_steps_per_visit {
                let judgment = Judgment::escalate(format!(
                    "step budget exhausted ({} steps)",
                    node.max_steps_per_visit
                ));
                self.log_verdict(run_id, node_id, &judgment);
                return Ok(VisitOutcome::Completed(judgment));
            }
            if Instant::now() >= deadline {
                let judgment = Judgment::escalate("visit wall-clock budget exhausted");
                self.log_verdict(run_id, node_id, &judgment);
                return Ok(VisitOutcome::Completed(judgment));
            }

            if self.config.should_checkpoint(steps) {
                if let Some(tx) = snapshots {
                    let _ = tx.send((
                        SuspendedVisit {
                            node_id: node.id.clone(),
                            conversation: conversation.clone(),
                            steps_taken: steps,
                            attempt,
                            feedback: feedback.clone(),
                            awaiting_user_input: false,
                            input_received,
                            outputs_written,
                        },
                        memory.clone(),
                    ));
                }
            }

            // LLM step
            let started = Instant::now();
            let messages = conversation.to_llm_messages();
            let completion = match self
                .guarded(control, self.llm.complete(&messages, &tool_schemas, None))
                .await
            {
                Guarded::Done(Ok(completion)) => completion,
                Guarded::Done(Err(err)) => {
                    // Step-local failure: capture into the history and loop
                    self.events.append(
                        run_id,
                        node_id,
                        StepKind::LlmCall,
                        json!({ "error": err.to_string() }),
                    );
                    conversation.push_user(format!(
                        "The model call failed ({err}). Continue with the task."
                    ));
                    continue;
                }
                Guarded::TimedOut => {
                    self.events.append(
                        run_id,
                        node_id,
                        StepKind::LlmCall,
                        json!({ "error": "timeout" }),
                    );
                    conversation
                        .push_user("The model call timed out. Continue with the task.".to_string());
                    continue;
                }
                Guarded::Abandoned => return Err(CoreError::Cancelled),
            };

            let latency_ms = started.elapsed().as_millis() as u64;
            self.log_llm_call(run_id, node_id, &completion, latency_ms);
            conversation.push_assistant(completion.text.clone(), completion.tool_calls.clone());

            let mut wrote_this_step = false;
            if !completion.tool_calls.is_empty() {
                for call in &completion.tool_calls {
                    if control.is_cancelled() {
                        return Err(CoreError::Cancelled);
                    }
                    if call.name == SET_OUTPUT {
                        let (reply, is_error) = self.handle_set_output(
                            node,
                            memory,
                            run_id,
                            input_received,
                            &call.arguments,
                            &mut outputs_written,
                        );
                        wrote_this_step |= !is_error;
                        conversation.push_tool_result(call.id.clone(), reply, is_error);
                    } else {
                        self.events.append(
                            run_id,
                            node_id,
                            StepKind::ToolCall,
                            json!({ "tool": call.name, "arguments": call.arguments }),
                        );
                        let started = Instant::now();
                        let outcome = match self
                            .guarded(control, self.tools.invoke(&call.name, call.arguments.clone()))
                            .await
                        {
                            Guarded::Done(outcome) => outcome,
                            Guarded::TimedOut => crate::tools::ToolOutcome::failure(
                                crate::tools::ToolError::new(
                                    crate::tools::ToolErrorKind::Timeout,
                                    format!("tool '{}' timed out", call.name),
                                ),
                            ),
                            Guarded::Abandoned => return Err(CoreError::Cancelled),
                        };
                        self.events.append_with_usage(
                            run_id,
                            node_id,
                            StepKind::ToolResult,
                            serde_json::to_value(&outcome).unwrap_or(Value::Null),
                            0,
                            started.elapsed().as_millis() as u64,
                        );
                        conversation.push_tool_result(
                            call.id.clone(),
                            outcome.render(),
                            !outcome.ok,
                        );
                    }
                }
                // Tool results go back to the model unless this step also
                // wrote outputs, in which case the judge decides now
                if !wrote_this_step {
                    continue;
                }
            } else if node.kind.is_client_facing() && !input_received {
                // A client-facing node must collect input before outputs
                self.events.append(
                    run_id,
                    node_id,
                    StepKind::UserInputRequest,
                    json!({ "prompt": completion.text }),
                );
                return Ok(VisitOutcome::Suspended(SuspendedVisit {
                    node_id: node.id.clone(),
                    conversation,
                    steps_taken: steps,
                    attempt,
                    feedback,
                    awaiting_user_input: true,
                    input_received,
                    outputs_written,
                }));
            }

            // Output contract guard
            if outputs_written {
                let missing: Vec<&str> = node
                    .required_output_keys()
                    .into_iter()
                    .filter(|k| !memory.contains(k))
                    .collect();
                if !missing.is_empty() {
                    conversation.push_user(format!(
                        "Required output keys are still missing: {}. \
                         Call set_output with the missing keys.",
                        missing.join(", ")
                    ));
                    continue;
                }
            }

            // Judge
            let ctx = JudgeContext {
                node,
                memory,
                goal,
                attempt,
                outputs_written,
            };
            let judgment = self.judge.evaluate(&ctx).await?;
            self.log_verdict(run_id, node_id, &judgment);

            match judgment.verdict {
                Verdict::Accept | Verdict::Escalate => {
                    return Ok(VisitOutcome::Completed(judgment));
                }
                Verdict::Retry => {
                    attempt += 1;
                    if let Some(text) = &judgment.feedback {
                        feedback.push(text.clone());
                    }
                    conversation.set_system_prompt(compose_system_prompt(node, memory, &feedback));
                    if let Some(text) = &judgment.feedback {
                        conversation.push_user(format!("Revise your work: {text}"));
                    }
                }
                Verdict::Continue => {
                    if !node.kind.is_event_loop() {
                        let judgment =
                            Judgment::escalate("CONTINUE verdict outside an event-loop node");
                        self.log_verdict(run_id, node_id, &judgment);
                        return Ok(VisitOutcome::Completed(judgment));
                    }
                }
            }
        }
    }

    /// Schemas offered to the model: `set_output` plus the node's tools
    fn tool_schemas(&self, node: &NodeSpec) -> Vec<ToolSchema> {
        let mut schemas = vec![set_output_schema(&node.output_keys)];
        for schema in self.tools.list() {
            if node.tools.iter().any(|t| t == &schema.name) {
                schemas.push(schema);
            }
        }
        schemas
    }

    /// Handle the privileged `set_output` call; returns (reply, is_error)
    fn handle_set_output(
        &self,
        node: &NodeSpec,
        memory: &mut Memory,
        run_id: &str,
        input_received: bool,
        arguments: &Value,
        outputs_written: &mut bool,
    ) -> (String, bool) {
        let node_id = node.id.as_str();

        // Client-facing ordering: user_input_request ≺ user_input_received ≺ set_output
        if node.kind.is_client_facing() && !input_received {
            let reply = "guard failure: request user input before calling set_output";
            self.events.append(
                run_id,
                node_id,
                StepKind::ToolResult,
                json!({ "ok": false, "guard_failure": reply }),
            );
            return (reply.to_string(), true);
        }

        let Some(fields) = arguments.as_object() else {
            return (
                "set_output arguments must be an object of declared output keys".to_string(),
                true,
            );
        };

        let undeclared: Vec<&String> = fields
            .keys()
            .filter(|k| !node.output_keys.contains(k))
            .collect();
        if !undeclared.is_empty() {
            return (
                format!(
                    "set_output rejected: keys not declared by this node: {}",
                    undeclared
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                true,
            );
        }

        for (key, value) in fields {
            memory.insert(key.clone(), value.clone(), node_id);
        }
        *outputs_written = true;
        self.events.append(
            run_id,
            node_id,
            StepKind::SetOutput,
            json!({ "keys": fields.keys().collect::<Vec<_>>() }),
        );
        ("outputs recorded".to_string(), false)
    }

    fn log_llm_call(&self, run_id: &str, node_id: &str, completion: &Completion, latency_ms: u64) {
        let tool_names: Vec<&str> = completion
            .tool_calls
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        self.events.append_with_usage(
            run_id,
            node_id,
            StepKind::LlmCall,
            json!({ "text": completion.text, "tool_calls": tool_names }),
            completion.usage.total_tokens(),
            latency_ms.max(completion.usage.latency_ms),
        );
    }

    fn log_verdict(&self, run_id: &str, node_id: &str, judgment: &Judgment) {
        self.events.append(
            run_id,
            node_id,
            StepKind::JudgeVerdict,
            json!({
                "verdict": judgment.verdict.to_string(),
                "feedback": judgment.feedback,
                "reasoning": judgment.reasoning,
                "violated_constraints": judgment.violated_constraints,
            }),
        );
    }

    /// Race a call against its timeout and the cancel signal
    ///
    /// On cancellation the call gets the quiescence window to finish; if
    /// it does not, it is abandoned and the visit stops. Never parks an
    /// in-flight call indefinitely.
    async fn guarded<T>(&self, control: &RunControl, fut: impl std::future::Future<Output = T>) -> Guarded<T> {
        tokio::pin!(fut);
        tokio::select! {
            result = timeout(self.config.step_timeout, &mut fut) => match result {
                Ok(value) => Guarded::Done(value),
                Err(_) => Guarded::TimedOut,
            },
            _ = control.cancelled() => {
                match timeout(self.config.quiescence, &mut fut).await {
                    Ok(value) => Guarded::Done(value),
                    Err(_) => Guarded::Abandoned,
                }
            }
        }
    }
}

/// Compose the system prompt for a visit
///
/// Renders the node's own prompt, its inputs from memory, the output
/// contract, tool-failure guidance, and accumulated retry feedback.
pub(crate) fn compose_system_prompt(node: &NodeSpec, memory: &Memory, feedback: &[String]) -> String {
    let mut sections = vec![node.system_prompt.clone()];

    if !node.input_keys.is_empty() {
        let mut lines = vec!["INPUTS:".to_string()];
        for key in &node.input_keys {
            match memory.get(key) {
                Some(value) => lines.push(format!("- {key}: {}", render_value(value))),
                None => lines.push(format!("- {key}: <absent>")),
            }
        }
        sections.push(lines.join("\n"));
    }

    if !node.output_keys.is_empty() {
        let required = node.required_output_keys();
        let optional: Vec<&str> = node
            .output_keys
            .iter()
            .map(|k| k.as_str())
            .filter(|k| !required.contains(k))
            .collect();
        let mut contract = format!(
            "OUTPUT CONTRACT:\nWrite your results with the set_output tool. \
             Required keys: {}.",
            if required.is_empty() {
                "(none)".to_string()
            } else {
                required.join(", ")
            }
        );
        if !optional.is_empty() {
            contract.push_str(&format!(" Optional keys: {}.", optional.join(", ")));
        }
        sections.push(contract);
    }

    if node.kind.is_client_facing() {
        sections.push(
            "This node is client-facing: ask the user for input by replying without \
             tool calls, and only call set_output after their reply arrives."
                .to_string(),
        );
    }

    sections.push(
        "If a tool fails, try an alternative; when alternatives are exhausted, \
         call set_output with your best partial results."
            .to_string(),
    );

    if !feedback.is_empty() {
        let mut lines = vec!["FEEDBACK FROM PREVIOUS ATTEMPTS:".to_string()];
        for (i, item) in feedback.iter().enumerate() {
            lines.push(format!("{}. {item}", i + 1));
        }
        sections.push(lines.join("\n"));
    }

    sections.retain(|s| !s.is_empty());
    sections.join("\n\n")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
