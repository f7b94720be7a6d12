//! Call stack, execution state, and session log (C5).
//!
//! The session log is a typed, append-only sequence of timestamped,
//! classified entries, trimmed to a rolling window rather than compacted.

use crate::identifiers::MeetingID;
use crate::prompt::YieldKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A captured value. The embedded mini-language's value sum type (§9):
/// number/string/sequence/mapping cases are representable; callable/agent
/// references are represented as opaque tokens since they cannot round-trip
/// through a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Sequence(Vec<Value>),
    Mapping(HashMap<String, Value>),
    /// A value that exists at runtime (a tool handle, an agent proxy) but
    /// cannot be serialized; checkpointed as this placeholder carrying a
    /// human-readable type tag (non-literal complex values shown this way
    /// in the interpreter prompt too, per §4.7).
    Opaque(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
            Value::Opaque(_) => "opaque",
        }
    }

    /// Whether this value can be shown inline as a literal in the
    /// interpreter prompt, vs. as a type-tagged placeholder (§4.7).
    pub fn is_literal(&self) -> bool {
        !matches!(self, Value::Opaque(_))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Mapping(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Opaque(tag) => write!(f, "<{}>", tag),
        }
    }
}

/// A single playbook invocation's frame: instruction pointer into the
/// source, and locals captured during embedded-code execution.
///
/// Invariant: locals persist across suspensions within the same frame — a
/// frame is never reconstructed from scratch while its invocation is still
/// live, only restored verbatim from a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStackFrame {
    pub playbook_name: String,
    pub instruction_pointer: String,
    pub locals: HashMap<String, Value>,
    /// Identifies the caller waiting on this frame's `RET`, if any (an
    /// opaque callsite token bound by `YLD call <callsite>`).
    pub return_channel: Option<String>,
}

impl CallStackFrame {
    pub fn new(playbook_name: impl Into<String>) -> Self {
        CallStackFrame {
            playbook_name: playbook_name.into(),
            instruction_pointer: String::new(),
            locals: HashMap::new(),
            return_channel: None,
        }
    }

    pub fn with_locals(mut self, locals: HashMap<String, Value>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_return_channel(mut self, channel: impl Into<String>) -> Self {
        self.return_channel = Some(channel.into());
        self
    }

    /// Merges `updates` into locals. The local-capture invariant (§8): every
    /// name assigned by an executed statement appears here before the next
    /// statement begins — callers invoke this once per completed statement,
    /// never batching multiple statements' writes together.
    pub fn merge_locals(&mut self, updates: HashMap<String, Value>) {
        self.locals.extend(updates);
    }
}

/// A typed, timestamped session log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionLogEntry {
    AssistantOutput { content: String, created_at: DateTime<Utc> },
    ToolCall { name: String, args: Vec<Value>, created_at: DateTime<Utc> },
    ToolResult { name: String, result: Value, created_at: DateTime<Utc> },
    IncomingMessage { sender: String, content: String, created_at: DateTime<Utc> },
    StateChange { name: String, value: Value, created_at: DateTime<Utc> },
    SystemEvent { description: String, created_at: DateTime<Utc> },
}

impl SessionLogEntry {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            SessionLogEntry::AssistantOutput { created_at, .. }
            | SessionLogEntry::ToolCall { created_at, .. }
            | SessionLogEntry::ToolResult { created_at, .. }
            | SessionLogEntry::IncomingMessage { created_at, .. }
            | SessionLogEntry::StateChange { created_at, .. }
            | SessionLogEntry::SystemEvent { created_at, .. } => *created_at,
        }
    }
}

/// Full execution state of an AI agent: the call stack, `$`-prefixed global
/// state vars, the append-only session log, and the meeting currently in
/// scope (if any).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    pub call_stack: Vec<CallStackFrame>,
    pub state_vars: HashMap<String, Value>,
    pub session_log: Vec<SessionLogEntry>,
    pub current_meeting_id: Option<MeetingID>,
    /// Retry count of the invocation currently in flight, mirrored from
    /// [`crate::executor::InterpreterInvocation`] after each turn so a
    /// checkpoint/inspection of `ExecutionState` alone shows how close this
    /// agent is to `InterpreterStalled` (§11 supplemented feature).
    pub retries: u32,
    /// The `YLD` this agent's top frame is suspended on, when that
    /// suspension can only be lifted by an external message (`user`,
    /// `agent <id>`, or `meeting`). `None` while active, or while suspended
    /// on a `call`/`timeout` that the scheduler resolves without waiting on
    /// the queue. Checkpointed alongside the rest of the state so a
    /// restored agent resumes against the same condition it suspended on.
    pub suspended_yield: Option<YieldKind>,
}

impl ExecutionState {
    pub fn new() -> Self {
        ExecutionState::default()
    }

    pub fn push(&mut self, frame: CallStackFrame) {
        self.call_stack.push(frame);
    }

    /// Pops the top frame. Popping the last frame ends the playbook
    /// invocation (invariant: the stack is never empty during *active*
    /// execution — `pop` on the last frame is exactly how activity ends).
    pub fn pop(&mut self) -> Option<CallStackFrame> {
        self.call_stack.pop()
    }

    pub fn peek(&self) -> Option<&CallStackFrame> {
        self.call_stack.last()
    }

    pub fn peek_mut(&mut self) -> Option<&mut CallStackFrame> {
        self.call_stack.last_mut()
    }

    pub fn is_active(&self) -> bool {
        !self.call_stack.is_empty()
    }

    pub fn set_ip(&mut self, label: impl Into<String>) {
        if let Some(frame) = self.peek_mut() {
            frame.instruction_pointer = label.into();
        }
    }

    pub fn locals_update(&mut self, updates: HashMap<String, Value>) {
        if let Some(frame) = self.peek_mut() {
            frame.merge_locals(updates);
        }
    }

    pub fn add_session_entry(&mut self, entry: SessionLogEntry) {
        self.session_log.push(entry);
    }

    /// The most recent `window` session log entries, oldest first — what C7
    /// assembles into the prompt's "recent session log window".
    pub fn recent_session_log(&self, window: usize) -> &[SessionLogEntry] {
        let len = self.session_log.len();
        let start = len.saturating_sub(window);
        &self.session_log[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_capture_survives_push_and_merge() {
        let mut state = ExecutionState::new();
        state.push(CallStackFrame::new("Main"));
        let mut updates = HashMap::new();
        updates.insert("name".to_string(), Value::String("Amol".to_string()));
        state.locals_update(updates);
        assert_eq!(
            state.peek().unwrap().locals.get("name"),
            Some(&Value::String("Amol".to_string()))
        );
    }

    #[test]
    fn popping_last_frame_ends_activity() {
        let mut state = ExecutionState::new();
        state.push(CallStackFrame::new("Main"));
        assert!(state.is_active());
        state.pop();
        assert!(!state.is_active());
    }

    #[test]
    fn recent_session_log_window_is_bounded() {
        let mut state = ExecutionState::new();
        for i in 0..10 {
            state.add_session_entry(SessionLogEntry::SystemEvent {
                description: format!("event-{}", i),
                created_at: Utc::now(),
            });
        }
        let window = state.recent_session_log(3);
        assert_eq!(window.len(), 3);
        if let SessionLogEntry::SystemEvent { description, .. } = &window[2] {
            assert_eq!(description, "event-9");
        } else {
            panic!("expected SystemEvent");
        }
    }
}
