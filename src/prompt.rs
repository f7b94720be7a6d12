//! Interpreter prompt assembly and the directive output contract (C7).
//!
//! The per-agent playbook body is spliced into a base system prompt
//! alongside callable-playbook summaries and a session-log window, behind
//! a `SessionLogStrategy` trait so an embedder can later plug in
//! summarization without changing the prompt contract (§11 supplemented
//! feature).

use crate::callstack::{ExecutionState, SessionLogEntry, Value};
use crate::error::ExecutorError;
use crate::identifiers::AgentID;
use crate::triggers::TriggerSpec;
use serde::{Deserialize, Serialize};

/// A summary of a callable playbook shown in the prompt: full signature +
/// one-line description for everything except the currently active
/// playbook, whose full source is shown instead (§4.7).
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookSummary {
    pub owner_klass: String,
    pub signature: String,
    pub description: String,
}

/// Produces the session-log window handed to the interpreter prompt. The
/// default keeps the most recent `max_entries` (oldest-first trimming, no
/// compaction).
pub trait SessionLogStrategy: Send + Sync {
    fn window<'a>(&self, log: &'a [SessionLogEntry]) -> &'a [SessionLogEntry];
}

pub struct FixedWindowStrategy {
    pub max_entries: usize,
}

impl Default for FixedWindowStrategy {
    fn default() -> Self {
        FixedWindowStrategy { max_entries: 40 }
    }
}

impl SessionLogStrategy for FixedWindowStrategy {
    fn window<'a>(&self, log: &'a [SessionLogEntry]) -> &'a [SessionLogEntry] {
        let start = log.len().saturating_sub(self.max_entries);
        &log[start..]
    }
}

const INSTRUCTION_PREAMBLE: &str = "\
You are the interpreter for a running playbook. Advance the playbook one \
step at a time by emitting labelled directive lines in the form \
`<label>: <DIRECTIVE> <rest>`, where DIRECTIVE is one of EXE, EXT, YLD, \
CND, RET. Only emit labels that exist in the active playbook's source. Any \
free text you emit outside a labelled directive line is recorded as \
commentary and never executed.";

fn render_locals(locals: &std::collections::HashMap<String, Value>) -> String {
    let mut lines: Vec<String> = locals
        .iter()
        .map(|(name, value)| {
            if value.is_literal() {
                format!("{} = {}", name, value)
            } else {
                format!("{}: <{}>", name, value.type_name())
            }
        })
        .collect();
    lines.sort();
    lines.join("\n")
}

fn render_state_vars(state_vars: &std::collections::HashMap<String, Value>) -> String {
    let mut lines: Vec<String> = state_vars
        .iter()
        .map(|(name, value)| {
            if value.is_literal() {
                format!("self.state.{} = {}", name, value)
            } else {
                format!("self.state.{}: <{}>", name, value.type_name())
            }
        })
        .collect();
    lines.sort();
    lines.join("\n")
}

fn render_session_log(entries: &[SessionLogEntry]) -> String {
    entries
        .iter()
        .map(|e| match e {
            SessionLogEntry::AssistantOutput { content, .. } => format!("[assistant] {}", content),
            SessionLogEntry::ToolCall { name, .. } => format!("[tool_call] {}", name),
            SessionLogEntry::ToolResult { name, result, .. } => {
                format!("[tool_result] {} -> {}", name, result)
            }
            SessionLogEntry::IncomingMessage { sender, content, .. } => {
                format!("[message] {}: {}", sender, content)
            }
            SessionLogEntry::StateChange { name, value, .. } => {
                format!("[state_change] {} = {}", name, value)
            }
            SessionLogEntry::SystemEvent { description, .. } => {
                format!("[system] {}", description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_triggers(triggers: &[TriggerSpec]) -> String {
    triggers
        .iter()
        .map(|t| format!("- {} => {}", t.descriptor, t.playbook_name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assembles the LLM input string that drives one step of playbook
/// interpretation (§4.7). `active_playbook_source` is the verbatim source of
/// the top-of-stack playbook; `callable_playbooks` excludes it (shown
/// summarized, not here).
pub fn assemble_prompt(
    execution_state: &ExecutionState,
    active_playbook_source: &str,
    callable_playbooks: &[PlaybookSummary],
    trigger_catalog: &[TriggerSpec],
    session_log_strategy: &dyn SessionLogStrategy,
) -> String {
    let frame = execution_state.peek();
    let locals = frame.map(|f| render_locals(&f.locals)).unwrap_or_default();
    let ip = frame
        .map(|f| f.instruction_pointer.as_str())
        .unwrap_or("<none>");
    let state_vars = render_state_vars(&execution_state.state_vars);
    let window = session_log_strategy.window(&execution_state.session_log);
    let session_log = render_session_log(window);
    let playbooks_summary = callable_playbooks
        .iter()
        .map(|p| format!("- {} ({}): {}", p.signature, p.owner_klass, p.description))
        .collect::<Vec<_>>()
        .join("\n");
    let triggers = render_triggers(trigger_catalog);

    format!(
        "{preamble}\n\n\
        # Current instruction pointer\n{ip}\n\n\
        # Locals\n{locals}\n\n\
        # State vars\n{state_vars}\n\n\
        # Active playbook source\n{source}\n\n\
        # Callable playbooks\n{playbooks}\n\n\
        # Trigger catalog\n{triggers}\n\n\
        # Recent session log\n{log}\n",
        preamble = INSTRUCTION_PREAMBLE,
        ip = ip,
        locals = locals,
        state_vars = state_vars,
        source = active_playbook_source,
        playbooks = playbooks_summary,
        triggers = triggers,
        log = session_log,
    )
}

/// A yield kind, parameterizing `YLD <kind>` (§4.8). Persisted on
/// [`crate::callstack::ExecutionState::suspended_yield`] so the scheduler
/// can recognize, across a process restart, which external event the
/// suspended frame is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum YieldKind {
    User,
    Agent(AgentID),
    Meeting,
    Call(String),
    Timeout(u64),
}

/// One directive as emitted by the interpreter (§4.7/§4.8). The GLOSSARY
/// calls this "the atomic unit of execution."
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Exe(String),
    Ext(String),
    Yld(YieldKind),
    Cnd(String),
    Ret(Option<String>),
}

/// A directive preceded by its step label.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveLine {
    pub label: String,
    pub directive: Directive,
}

fn parse_yield_kind(rest: &str) -> Result<YieldKind, ExecutorError> {
    let rest = rest.trim();
    if rest == "user" {
        return Ok(YieldKind::User);
    }
    if rest == "meeting" {
        return Ok(YieldKind::Meeting);
    }
    if let Some(id) = rest.strip_prefix("agent ") {
        return Ok(YieldKind::Agent(AgentID::new(id.trim())));
    }
    if let Some(callsite) = rest.strip_prefix("call ") {
        return Ok(YieldKind::Call(callsite.trim().to_string()));
    }
    if let Some(secs) = rest.strip_prefix("timeout ") {
        let seconds: u64 = secs
            .trim()
            .parse()
            .map_err(|_| ExecutorError::LLMOutputInvalid(format!("bad YLD timeout: {:?}", rest)))?;
        return Ok(YieldKind::Timeout(seconds));
    }
    Err(ExecutorError::LLMOutputInvalid(format!(
        "unknown YLD kind: {:?}",
        rest
    )))
}

/// Parses one complete statement line into a labelled directive, or `None`
/// if the line is free text (assistant commentary, captured but never
/// executed, §6). Returns [`ExecutorError::LLMOutputInvalid`] for a line
/// that looks labelled but names an unknown directive keyword.
pub fn parse_directive_line(line: &str) -> Result<Option<DirectiveLine>, ExecutorError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let (label, after_label) = match trimmed.split_once(':') {
        Some((l, r)) if !l.trim().is_empty() && !l.contains(' ') => (l.trim().to_string(), r.trim()),
        _ => return Ok(None),
    };
    let (keyword, rest) = match after_label.split_once(' ') {
        Some((k, r)) => (k, r.trim()),
        None => (after_label, ""),
    };
    let directive = match keyword {
        "EXE" => Directive::Exe(rest.to_string()),
        "EXT" => Directive::Ext(rest.to_string()),
        "YLD" => Directive::Yld(parse_yield_kind(rest)?),
        "CND" => Directive::Cnd(rest.to_string()),
        "RET" => {
            if rest.is_empty() {
                Directive::Ret(None)
            } else {
                Directive::Ret(Some(rest.to_string()))
            }
        }
        other => {
            return Err(ExecutorError::LLMOutputInvalid(format!(
                "unknown directive keyword: {:?}",
                other
            )))
        }
    };
    Ok(Some(DirectiveLine { label, directive }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exe_directive() {
        let line = "step1: EXE $name = \"Amol\"";
        let parsed = parse_directive_line(line).unwrap().unwrap();
        assert_eq!(parsed.label, "step1");
        assert_eq!(parsed.directive, Directive::Exe("$name = \"Amol\"".into()));
    }

    #[test]
    fn parses_yld_user() {
        let parsed = parse_directive_line("step2: YLD user").unwrap().unwrap();
        assert_eq!(parsed.directive, Directive::Yld(YieldKind::User));
    }

    #[test]
    fn parses_yld_agent() {
        let parsed = parse_directive_line("step2: YLD agent a1").unwrap().unwrap();
        assert_eq!(
            parsed.directive,
            Directive::Yld(YieldKind::Agent(AgentID::new("a1")))
        );
    }

    #[test]
    fn free_text_is_not_a_directive() {
        assert_eq!(parse_directive_line("just some commentary").unwrap(), None);
    }

    #[test]
    fn unknown_directive_keyword_is_invalid() {
        assert!(matches!(
            parse_directive_line("step1: FOO bar"),
            Err(ExecutorError::LLMOutputInvalid(_))
        ));
    }

    #[test]
    fn fixed_window_strategy_bounds_log() {
        let strategy = FixedWindowStrategy { max_entries: 2 };
        let log = vec![
            SessionLogEntry::SystemEvent {
                description: "a".into(),
                created_at: chrono::Utc::now(),
            },
            SessionLogEntry::SystemEvent {
                description: "b".into(),
                created_at: chrono::Utc::now(),
            },
            SessionLogEntry::SystemEvent {
                description: "c".into(),
                created_at: chrono::Utc::now(),
            },
        ];
        assert_eq!(strategy.window(&log).len(), 2);
    }
}
