//! agent-loom: an agent-runtime core
//!
//! Executes a directed graph of nodes that cooperate through shared
//! memory, an LLM, and a toolchain toward a declared goal whose success
//! is adjudicated at runtime. Four subsystems make up the core:
//!
//! - **Graph executor** ([`executor`]): schedules node visits along
//!   condition-selected edges, enforces visit limits, runs declared
//!   parallel batches, and honors pause/cancel at suspension points.
//! - **Event-loop node runtime** ([`runtime`]): the per-node inner loop
//!   of LLM steps, tool dispatch, `set_output` writes, and judge
//!   verdicts, with client-facing suspension for human input.
//! - **Sessions and checkpoints** ([`session`]): durable run state with
//!   pause/resume/recover semantics.
//! - **Credential store** ([`credentials`]): encrypted multi-key
//!   credentials with pluggable refresh providers and `{{id.key}}`
//!   template resolution.
//!
//! The LLM provider and tool transport stay behind the [`llm`] and
//! [`tools`] contracts; the crate ships registries and test doubles, not
//! vendor bindings.
//!
//! # Example
//!
//! ```ignore
//! use agent_loom::executor::GraphExecutor;
//! use agent_loom::goal::{Goal, Metric, SuccessCriterion};
//! use agent_loom::graph::{Edge, Graph, NodeSpec};
//! use agent_loom::judge::Verdict;
//!
//! let graph = Graph::new(
//!     vec![
//!         NodeSpec::event_loop("intake").with_output_keys(["summary"]),
//!         NodeSpec::terminal("done"),
//!     ],
//!     vec![Edge::on_verdict("intake", "done", Verdict::Accept)],
//!     "intake",
//! );
//! let goal = Goal::new("summarize", "Summarize the input").with_criterion(
//!     SuccessCriterion::new(
//!         "non_empty",
//!         "summary is non-empty",
//!         Metric::OutputNonEmpty { key: "summary".into() },
//!     ),
//! );
//!
//! let executor = GraphExecutor::new(graph, goal, llm, tools)?;
//! let result = executor.execute(serde_json::json!({"topic": "rust"})).await?;
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod eventlog;
pub mod executor;
pub mod goal;
pub mod graph;
pub mod judge;
pub mod llm;
pub mod memory;
pub mod runtime;
pub mod session;
pub mod tools;

pub use config::RuntimeConfig;
pub use error::CoreError;
pub use executor::{GraphExecutor, RunResult, TerminationReason};
pub use judge::Verdict;
pub use memory::Memory;
