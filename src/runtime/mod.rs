//! Event-loop node runtime
//!
//! The per-node inner loop and its conversation history. The runtime
//! composes the system prompt, drives the LLM, dispatches tool calls,
//! handles the privileged `set_output` tool, consults the judge, and
//! models suspension as a serializable sentinel rather than
//! language-level coroutines.

mod conversation;
mod node_runtime;

pub use conversation::Conversation;
pub use node_runtime::{NodeRuntime, VisitOutcome};
