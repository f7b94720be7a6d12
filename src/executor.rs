//! Streaming embedded-code executor (C8) — the hardest component.
//!
//! Consumes LLM output incrementally, executing each complete statement as
//! soon as it is parseable, writing assignments through to the current
//! frame's locals, and suspending at `YLD` points. `evalexpr` backs the
//! small arithmetic/mapping mini-language (exactly the value domain §9
//! calls for: number/string/sequence, with mutation written through to an
//! environment).

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::collections::HashMap;

use crate::callstack::{CallStackFrame, SessionLogEntry, Value};
use crate::completion::CompletionStream;
use crate::error::ExecutorError;
use crate::prompt::{parse_directive_line, Directive, YieldKind};

/// Bounded retry budget per interpreter invocation (§7): after this many
/// off-contract emissions, the invocation escalates to
/// [`ExecutorError::InterpreterStalled`].
pub const MAX_RETRY_BUDGET: u32 = 3;

/// Resolves an `EXT Call(args)` call spec to either a native playbook, a
/// peer-agent routed call, or a markdown-playbook recursion. The concrete
/// routing (C10) is injected here so the executor itself stays agnostic of
/// the scheduler.
#[async_trait]
pub trait ExternalCallDispatcher: Send + Sync {
    async fn call(
        &self,
        call_spec: &str,
        frame: &CallStackFrame,
        state_vars: &HashMap<String, Value>,
    ) -> Result<Value, ExecutorError>;
}

/// Per-invocation interpreter bookkeeping: the retry counter that
/// [`MAX_RETRY_BUDGET`] is measured against. One of these lives for the
/// whole lifetime of a single top-level playbook invocation, across
/// however many LLM turns it takes to complete.
#[derive(Debug, Default)]
pub struct InterpreterInvocation {
    pub retries: u32,
}

impl InterpreterInvocation {
    pub fn new() -> Self {
        InterpreterInvocation::default()
    }
}

/// What happened after draining one LLM completion.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The completion ended (or was abandoned after an invalid directive)
    /// without reaching a suspension or `RET`; the caller must invoke the
    /// LLM again for the next turn.
    NeedsNextTurn,
    /// A `YLD` was reached; the caller must checkpoint (C11) and await the
    /// corresponding condition before resuming.
    Suspended { label: String, kind: YieldKind },
    /// `RET` was reached with the stack at its last frame, or the frame
    /// popped with a value for its caller.
    Completed(Option<Value>),
}

/// Rewrites `$name` to `state_ref_name` outside of quoted string spans,
/// since evalexpr identifiers cannot contain `$` but a string literal may
/// legitimately contain one (e.g. `EXE $total = "price: $5"`).
fn translate_state_refs(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut in_string = false;
    let mut chars = code.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                in_string = !in_string;
                out.push(ch);
            }
            '\\' if in_string => {
                out.push(ch);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '$' if !in_string => out.push_str("state_ref_"),
            other => out.push(other),
        }
    }
    out
}

fn to_evalexpr_value(value: &Value) -> evalexpr::Value {
    match value {
        Value::Null => evalexpr::Value::Empty,
        Value::Bool(b) => evalexpr::Value::Boolean(*b),
        Value::Number(n) => evalexpr::Value::Float(*n),
        Value::String(s) => evalexpr::Value::String(s.clone()),
        Value::Sequence(items) => {
            evalexpr::Value::Tuple(items.iter().map(to_evalexpr_value).collect())
        }
        // Mappings and opaque handles have no evalexpr equivalent; EXE
        // statements that reference them see an empty placeholder. Mutating
        // a mapping from inside the mini-language is one of the
        // re-architecting Non-goals (§9): quarantined, not supported.
        Value::Mapping(_) | Value::Opaque(_) => evalexpr::Value::Empty,
    }
}

fn from_evalexpr_value(value: &evalexpr::Value) -> Value {
    match value {
        evalexpr::Value::String(s) => Value::String(s.clone()),
        evalexpr::Value::Float(f) => Value::Number(*f),
        evalexpr::Value::Int(i) => Value::Number(*i as f64),
        evalexpr::Value::Boolean(b) => Value::Bool(*b),
        evalexpr::Value::Tuple(items) => {
            Value::Sequence(items.iter().map(from_evalexpr_value).collect())
        }
        evalexpr::Value::Empty => Value::Null,
    }
}

/// Evaluates one `EXE` statement's code against `locals` + `state_vars`,
/// returning the locals captured and the state vars that statement actually
/// changed. Bare names resolve to frame locals; `$name` resolves to state
/// vars (rewritten to a plain identifier before evaluation, since evalexpr
/// identifiers cannot contain `$`). Unchanged state vars are filtered out
/// here rather than left for the caller, so a statement that touches one
/// state var doesn't re-log every other pre-existing one as "changed".
fn evaluate_exe(
    code: &str,
    locals: &HashMap<String, Value>,
    state_vars: &HashMap<String, Value>,
) -> Result<(HashMap<String, Value>, HashMap<String, Value>), ExecutorError> {
    use evalexpr::{ContextWithMutableVariables, HashMapContext, IterateVariablesContext};

    let mut context = HashMapContext::new();
    for (name, value) in locals {
        context
            .set_value(name.clone(), to_evalexpr_value(value))
            .map_err(|e| ExecutorError::LLMOutputInvalid(e.to_string()))?;
    }
    for (name, value) in state_vars {
        context
            .set_value(format!("state_ref_{}", name), to_evalexpr_value(value))
            .map_err(|e| ExecutorError::LLMOutputInvalid(e.to_string()))?;
    }

    let translated = translate_state_refs(code);
    evalexpr::eval_with_context_mut(&translated, &mut context)
        .map_err(|e| ExecutorError::LLMOutputInvalid(e.to_string()))?;

    let mut new_locals = HashMap::new();
    let mut changed_state_vars = HashMap::new();
    for (name, value) in context.iter_variables() {
        let captured = from_evalexpr_value(&value);
        match name.strip_prefix("state_ref_") {
            Some(state_name) => {
                if state_vars.get(state_name) != Some(&captured) {
                    changed_state_vars.insert(state_name.to_string(), captured);
                }
            }
            None => {
                new_locals.insert(name, captured);
            }
        }
    }
    Ok((new_locals, changed_state_vars))
}

struct PendingExt {
    label: String,
    call_spec: String,
}

/// Drains one LLM completion stream, executing statements as they become
/// parseable (§4.8). `frame`/`state_vars`/`session_log` are the live pieces
/// of [`crate::callstack::ExecutionState`] this invocation mutates in
/// place; the caller owns checkpointing after a `Suspended` outcome.
pub async fn run_turn(
    invocation: &mut InterpreterInvocation,
    mut completion: CompletionStream,
    frame: &mut CallStackFrame,
    state_vars: &mut HashMap<String, Value>,
    session_log: &mut Vec<SessionLogEntry>,
    dispatcher: &dyn ExternalCallDispatcher,
) -> Result<TurnOutcome, ExecutorError> {
    let mut buffer = String::new();
    let mut pending_ext: Vec<PendingExt> = Vec::new();

    macro_rules! invalid_and_bail {
        ($msg:expr) => {{
            session_log.push(SessionLogEntry::SystemEvent {
                description: format!("correction: {}", $msg),
                created_at: chrono::Utc::now(),
            });
            invocation.retries += 1;
            // Statements execute in emission order even when the turn is
            // abandoned mid-stream: any EXT already queued by an earlier
            // line in this turn still runs rather than being silently
            // dropped with the rest of the buffer.
            flush_pending_sequentially(&mut pending_ext, frame, state_vars, session_log, dispatcher).await;
            if invocation.retries > MAX_RETRY_BUDGET {
                return Err(ExecutorError::InterpreterStalled);
            }
            return Ok(TurnOutcome::NeedsNextTurn);
        }};
    }

    while let Some(chunk) = completion.next().await {
        buffer.push_str(&chunk);
        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].to_string();
            buffer.drain(..=pos);
            match process_line(
                &line,
                frame,
                state_vars,
                session_log,
                dispatcher,
                &mut pending_ext,
            )
            .await
            {
                Ok(Some(outcome)) => {
                    flush_pending_sequentially(&mut pending_ext, frame, state_vars, session_log, dispatcher).await;
                    return Ok(outcome);
                }
                Ok(None) => continue,
                Err(e) => invalid_and_bail!(e),
            }
        }
    }

    if !buffer.trim().is_empty() {
        let line = std::mem::take(&mut buffer);
        match process_line(
            &line,
            frame,
            state_vars,
            session_log,
            dispatcher,
            &mut pending_ext,
        )
        .await
        {
            Ok(Some(outcome)) => {
                flush_pending_sequentially(&mut pending_ext, frame, state_vars, session_log, dispatcher).await;
                return Ok(outcome);
            }
            Ok(None) => {}
            Err(e) => invalid_and_bail!(e),
        }
    }

    flush_pending_sequentially(&mut pending_ext, frame, state_vars, session_log, dispatcher).await;
    Ok(TurnOutcome::NeedsNextTurn)
}

async fn flush_pending_sequentially(
    pending_ext: &mut Vec<PendingExt>,
    frame: &mut CallStackFrame,
    state_vars: &HashMap<String, Value>,
    session_log: &mut Vec<SessionLogEntry>,
    dispatcher: &dyn ExternalCallDispatcher,
) {
    for pending in pending_ext.drain(..) {
        let result = dispatcher.call(&pending.call_spec, frame, state_vars).await;
        bind_ext_result(frame, session_log, &pending.label, &pending.call_spec, result);
    }
}

fn bind_ext_result(
    frame: &mut CallStackFrame,
    session_log: &mut Vec<SessionLogEntry>,
    label: &str,
    call_spec: &str,
    result: Result<Value, ExecutorError>,
) {
    let value = match result {
        Ok(v) => v,
        Err(e) => Value::Opaque(format!("error: {}", e)),
    };
    session_log.push(SessionLogEntry::ToolResult {
        name: call_spec.to_string(),
        result: value.clone(),
        created_at: chrono::Utc::now(),
    });
    frame.locals.insert(label.to_string(), value);
}

/// Processes one complete statement line. Returns `Ok(Some(outcome))` when
/// this line ends the turn (suspend/complete), `Ok(None)` to keep draining,
/// or `Err` for an off-contract emission.
async fn process_line(
    line: &str,
    frame: &mut CallStackFrame,
    state_vars: &mut HashMap<String, Value>,
    session_log: &mut Vec<SessionLogEntry>,
    dispatcher: &dyn ExternalCallDispatcher,
    pending_ext: &mut Vec<PendingExt>,
) -> Result<Option<TurnOutcome>, ExecutorError> {
    let parsed = match parse_directive_line(line)? {
        None => {
            if !line.trim().is_empty() {
                session_log.push(SessionLogEntry::AssistantOutput {
                    content: line.to_string(),
                    created_at: chrono::Utc::now(),
                });
            }
            return Ok(None);
        }
        Some(dl) => dl,
    };

    frame.instruction_pointer = parsed.label.clone();

    match parsed.directive {
        Directive::Exe(code) => {
            let (new_locals, new_state) = evaluate_exe(&code, &frame.locals, state_vars)?;
            frame.merge_locals(new_locals);
            for (name, value) in new_state {
                session_log.push(SessionLogEntry::StateChange {
                    name: name.clone(),
                    value: value.clone(),
                    created_at: chrono::Utc::now(),
                });
                state_vars.insert(name, value);
            }
            Ok(None)
        }
        Directive::Ext(call_spec) => {
            pending_ext.push(PendingExt {
                label: parsed.label,
                call_spec,
            });
            Ok(None)
        }
        Directive::Cnd(predicate) => {
            session_log.push(SessionLogEntry::SystemEvent {
                description: format!("branch taken: {}", predicate),
                created_at: chrono::Utc::now(),
            });
            Ok(None)
        }
        Directive::Yld(YieldKind::Call(callsite)) => {
            // Contiguous EXT directives preceding this yield run
            // concurrently; results bind positionally by label (§4.8
            // "Parallel external calls").
            let calls = std::mem::take(pending_ext);
            let futures = calls
                .iter()
                .map(|p| dispatcher.call(&p.call_spec, frame, state_vars));
            let results = join_all(futures).await;
            for (pending, result) in calls.into_iter().zip(results.into_iter()) {
                bind_ext_result(frame, session_log, &pending.label, &pending.call_spec, result);
            }
            session_log.push(SessionLogEntry::SystemEvent {
                description: format!("yield: call {}", callsite),
                created_at: chrono::Utc::now(),
            });
            Ok(Some(TurnOutcome::Suspended {
                label: parsed.label,
                kind: YieldKind::Call(callsite),
            }))
        }
        Directive::Yld(kind) => {
            session_log.push(SessionLogEntry::SystemEvent {
                description: format!("yield: {:?}", kind),
                created_at: chrono::Utc::now(),
            });
            Ok(Some(TurnOutcome::Suspended {
                label: parsed.label,
                kind,
            }))
        }
        Directive::Ret(expr) => {
            let value = match expr {
                None => None,
                Some(code) => {
                    let (locals, _) = evaluate_exe(&format!("ret_value_holder = {}", code), &frame.locals, state_vars)?;
                    locals.get("ret_value_holder").cloned()
                }
            };
            Ok(Some(TurnOutcome::Completed(value)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    struct NoopDispatcher;

    #[async_trait]
    impl ExternalCallDispatcher for NoopDispatcher {
        async fn call(
            &self,
            call_spec: &str,
            _frame: &CallStackFrame,
            _state_vars: &HashMap<String, Value>,
        ) -> Result<Value, ExecutorError> {
            Ok(Value::String(format!("called:{}", call_spec)))
        }
    }

    fn chunks_of(text: &str) -> CompletionStream {
        let chunks: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn local_capture_survives_across_yield() {
        let mut invocation = InterpreterInvocation::new();
        let mut frame = CallStackFrame::new("Main");
        let mut state_vars = HashMap::new();
        let mut session_log = Vec::new();
        let dispatcher = NoopDispatcher;

        let completion = chunks_of("step1: EXE name = \"Amol\"\nstep2: YLD user\n");
        let outcome = run_turn(
            &mut invocation,
            completion,
            &mut frame,
            &mut state_vars,
            &mut session_log,
            &dispatcher,
        )
        .await
        .unwrap();

        assert!(matches!(
            outcome,
            TurnOutcome::Suspended { kind: YieldKind::User, .. }
        ));
        assert_eq!(
            frame.locals.get("name"),
            Some(&Value::String("Amol".to_string()))
        );

        // Resume: "reply" assignment referencing the captured local.
        let completion2 = chunks_of("step3: EXE reply = \"Hello \" + name\nstep4: RET reply\n");
        let outcome2 = run_turn(
            &mut invocation,
            completion2,
            &mut frame,
            &mut state_vars,
            &mut session_log,
            &dispatcher,
        )
        .await
        .unwrap();

        assert_eq!(
            frame.locals.get("reply"),
            Some(&Value::String("Hello Amol".to_string()))
        );
        match outcome2 {
            TurnOutcome::Completed(Some(Value::String(s))) => assert_eq!(s, "Hello Amol"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn state_var_assignment_round_trips_through_dollar_prefix() {
        let mut invocation = InterpreterInvocation::new();
        let mut frame = CallStackFrame::new("Main");
        let mut state_vars = HashMap::new();
        let mut session_log = Vec::new();
        let dispatcher = NoopDispatcher;

        let completion = chunks_of("step1: EXE $counter = 1\nstep2: YLD user\n");
        run_turn(&mut invocation, completion, &mut frame, &mut state_vars, &mut session_log, &dispatcher)
            .await
            .unwrap();

        assert_eq!(state_vars.get("counter"), Some(&Value::Number(1.0)));
    }

    #[tokio::test]
    async fn bounded_retries_escalate_to_stalled() {
        let mut invocation = InterpreterInvocation::new();
        let mut frame = CallStackFrame::new("Main");
        let mut state_vars = HashMap::new();
        let mut session_log = Vec::new();
        let dispatcher = NoopDispatcher;

        for _ in 0..MAX_RETRY_BUDGET {
            let completion = chunks_of("step1: BOGUS nonsense\n");
            let outcome = run_turn(&mut invocation, completion, &mut frame, &mut state_vars, &mut session_log, &dispatcher)
                .await
                .unwrap();
            assert!(matches!(outcome, TurnOutcome::NeedsNextTurn));
        }

        let completion = chunks_of("step1: BOGUS nonsense\n");
        let result = run_turn(&mut invocation, completion, &mut frame, &mut state_vars, &mut session_log, &dispatcher).await;
        assert!(matches!(result, Err(ExecutorError::InterpreterStalled)));
    }

    #[tokio::test]
    async fn queued_ext_calls_run_concurrently_and_bind_positionally() {
        let mut invocation = InterpreterInvocation::new();
        let mut frame = CallStackFrame::new("Main");
        let mut state_vars = HashMap::new();
        let mut session_log = Vec::new();
        let dispatcher = NoopDispatcher;

        let completion = chunks_of(
            "c1: EXT Foo(1)\nc2: EXT Bar(2)\nc3: YLD call c1\n",
        );
        let outcome = run_turn(&mut invocation, completion, &mut frame, &mut state_vars, &mut session_log, &dispatcher)
            .await
            .unwrap();

        assert!(matches!(outcome, TurnOutcome::Suspended { .. }));
        assert_eq!(frame.locals.get("c1"), Some(&Value::String("called:Foo(1)".to_string())));
        assert_eq!(frame.locals.get("c2"), Some(&Value::String("called:Bar(2)".to_string())));
    }

    #[test]
    fn translate_state_refs_skips_dollar_inside_string_literal() {
        let translated = translate_state_refs(r#"$total = "price: $5""#);
        assert_eq!(translated, r#"state_ref_total = "price: $5""#);
    }

    #[tokio::test]
    async fn evaluate_exe_only_reports_changed_state_vars() {
        let mut state_vars = HashMap::new();
        state_vars.insert("counter".to_string(), Value::Number(1.0));
        state_vars.insert("name".to_string(), Value::String("Amol".to_string()));

        let (_, changed) = evaluate_exe("$counter = 1", &HashMap::new(), &state_vars).unwrap();
        assert!(changed.is_empty());

        let (_, changed) = evaluate_exe("$counter = 2", &HashMap::new(), &state_vars).unwrap();
        assert_eq!(changed.get("counter"), Some(&Value::Number(2.0)));
        assert!(!changed.contains_key("name"));
    }

    #[tokio::test]
    async fn ext_queued_before_an_abandoned_statement_still_runs() {
        let mut invocation = InterpreterInvocation::new();
        let mut frame = CallStackFrame::new("Main");
        let mut state_vars = HashMap::new();
        let mut session_log = Vec::new();
        let dispatcher = NoopDispatcher;

        let completion = chunks_of("c1: EXT Foo(1)\nc2: BOGUS nonsense\n");
        let outcome = run_turn(&mut invocation, completion, &mut frame, &mut state_vars, &mut session_log, &dispatcher)
            .await
            .unwrap();

        assert!(matches!(outcome, TurnOutcome::NeedsNextTurn));
        assert_eq!(frame.locals.get("c1"), Some(&Value::String("called:Foo(1)".to_string())));
    }
}
