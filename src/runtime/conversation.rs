//! Per-visit conversation history
//!
//! Message history for one node visit, with rough token accounting and
//! compaction. Compaction scans the messages being discarded for the
//! node's declared output-key values and carries them into the summary so
//! a long visit cannot lose the values it already produced. The whole
//! conversation serializes into the session for suspended visits.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::llm::{Message, Role, ToolCall};

/// Default history budget before compaction is suggested
const DEFAULT_MAX_HISTORY_TOKENS: usize = 32_000;
const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.8;

/// Message history for one node visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    system_prompt: String,
    messages: Vec<Message>,
    max_history_tokens: usize,
    compaction_threshold: f64,
    /// Output keys whose values compaction must preserve
    output_keys: Vec<String>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            max_history_tokens: DEFAULT_MAX_HISTORY_TOKENS,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            output_keys: Vec::new(),
        }
    }

    pub fn with_output_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.output_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_history_tokens(mut self, max: usize) -> Self {
        self.max_history_tokens = max;
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Replace the system prompt (retry feedback is folded in this way)
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Conversational turns (one turn per user message)
    pub fn turn_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCall>) {
        if tool_calls.is_empty() {
            self.messages.push(Message::assistant(content));
        } else {
            self.messages
                .push(Message::assistant_with_tool_calls(content, tool_calls));
        }
    }

    pub fn push_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) {
        let message = if is_error {
            Message::tool_error(content, tool_call_id)
        } else {
            Message::tool(content, tool_call_id)
        };
        self.messages.push(message);
    }

    /// Full message list for the provider, system prompt first
    pub fn to_llm_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(Message::system(self.system_prompt.clone()));
        out.extend(self.messages.iter().cloned());
        out
    }

    /// Rough token estimate: total characters divided by four
    pub fn estimate_tokens(&self) -> usize {
        let chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        chars / 4
    }

    pub fn needs_compaction(&self) -> bool {
        self.estimate_tokens() as f64
            >= self.max_history_tokens as f64 * self.compaction_threshold
    }

    /// Replace old messages with a summary, keeping the most recent ones
    ///
    /// `keep_recent` is clamped so at least one message is discarded.
    /// Output-key values found in the discarded messages are prepended to
    /// the summary under a PRESERVED VALUES header.
    pub fn compact(&mut self, summary: &str, keep_recent: usize) {
        if self.messages.is_empty() {
            return;
        }
        let keep_recent = keep_recent.min(self.messages.len() - 1);
        let split = self.messages.len() - keep_recent;
        let discarded = &self.messages[..split];

        let protected = self.extract_protected_values(discarded);
        let summary_text = if protected.is_empty() {
            summary.to_string()
        } else {
            let mut lines = vec!["PRESERVED VALUES (do not lose these):".to_string()];
            for (key, value) in &protected {
                lines.push(format!("- {key}: {value}"));
            }
            lines.push(String::new());
            lines.push("CONVERSATION SUMMARY:".to_string());
            lines.push(summary.to_string());
            lines.join("\n")
        };

        let mut compacted = vec![Message::user(summary_text)];
        compacted.extend(self.messages[split..].iter().cloned());
        self.messages = compacted;
    }

    /// Structured summary with [STATS] and [RECENT_MESSAGES] sections
    pub fn export_summary(&self) -> String {
        let prompt_preview = preview(&self.system_prompt, 80);

        let mut lines = vec![
            "[STATS]".to_string(),
            format!("turns: {}", self.turn_count()),
            format!("messages: {}", self.message_count()),
            format!("estimated_tokens: {}", self.estimate_tokens()),
            String::new(),
            "[CONFIG]".to_string(),
            format!("system_prompt: {prompt_preview:?}"),
        ];
        if !self.output_keys.is_empty() {
            lines.push(format!("output_keys: {}", self.output_keys.join(", ")));
        }
        lines.push(String::new());
        lines.push("[RECENT_MESSAGES]".to_string());
        let start = self.messages.len().saturating_sub(5);
        for message in &self.messages[start..] {
            lines.push(format!(
                "  [{:?}] {}",
                message.role,
                preview(&message.content, 60)
            ));
        }
        lines.join("\n")
    }

    /// Scan assistant messages newest-first for output-key values
    fn extract_protected_values(&self, messages: &[Message]) -> BTreeMap<String, String> {
        let mut found = BTreeMap::new();
        if self.output_keys.is_empty() {
            return found;
        }

        let mut remaining: Vec<&str> = self.output_keys.iter().map(|k| k.as_str()).collect();
        for message in messages.iter().rev() {
            if message.role != Role::Assistant || remaining.is_empty() {
                continue;
            }
            remaining.retain(|key| {
                match try_extract_key(&message.content, key) {
                    Some(value) => {
                        found.insert((*key).to_string(), value);
                        false
                    }
                    None => true,
                }
            });
        }
        found
    }
}

/// Try four strategies to extract a key's value from message content:
/// whole-message JSON, embedded JSON object, `key: value`, `key = value`
fn try_extract_key(content: &str, key: &str) -> Option<String> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content) {
        if let Some(value) = map.get(key) {
            return Some(render_value(value));
        }
    }

    if let Some(json_str) = find_json_object(content) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(json_str) {
            if let Some(value) = map.get(key) {
                return Some(render_value(value));
            }
        }
    }

    let colon = Regex::new(&format!(r"\b{}\s*:\s*(.+)", regex::escape(key))).ok()?;
    if let Some(captures) = colon.captures(content) {
        return Some(captures[1].trim().to_string());
    }

    let equals = Regex::new(&format!(r"\b{}\s*=\s*(.+)", regex::escape(key))).ok()?;
    if let Some(captures) = equals.captures(content) {
        return Some(captures[1].trim().to_string());
    }

    None
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Char-safe truncation with an ellipsis
fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// First balanced `{...}` object embedded in the text
fn find_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
