//! Trigger catalog and control-flow matching (C12).
//!
//! A natural-language trigger descriptor compiles into a keyword predicate
//! plus a specificity score; matching picks the highest-scoring trigger and
//! breaks ties deterministically.

use crate::identifiers::AgentID;
use crate::message::{Message, MessageType};

/// The compiled form of a `### Triggers` bullet (§4.6, §4.12).
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerKind {
    /// Fires once, when the program starts (the "at program start"-style
    /// trigger §4.6 calls out for pre-instantiation).
    ProgramStart,
    /// Fires on any message whose content contains every keyword.
    MessageKeywords(Vec<String>),
    /// Fires on any message from a specific agent.
    MessageFrom(AgentID),
    /// Fires when a meeting invite is received.
    MeetingInvite,
    /// Fires when the named state var changes.
    StateChange(String),
}

/// A compiled trigger: which playbook it invokes, its kind, and a
/// specificity used for tie-breaking against other matching triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    pub descriptor: String,
    pub playbook_name: String,
    pub kind: TriggerKind,
    /// Source order among this agent's triggers; used as the tie-break
    /// ("textual order among equal specificity", §4.12).
    pub source_order: usize,
}

impl TriggerSpec {
    /// Specificity score: more keywords / more specific kinds outrank
    /// broader ones. `ProgramStart` and `MeetingInvite` are structural
    /// (score 0, evaluated once/rarely); keyword triggers score by keyword
    /// count so a longer, more specific phrase wins over a shorter one.
    pub fn specificity(&self) -> usize {
        match &self.kind {
            TriggerKind::ProgramStart | TriggerKind::MeetingInvite => 0,
            TriggerKind::MessageFrom(_) => 1,
            TriggerKind::StateChange(_) => 1,
            TriggerKind::MessageKeywords(keywords) => keywords.len(),
        }
    }
}

/// Compiles a natural-language trigger descriptor into a [`TriggerSpec`].
/// This is a small heuristic compiler, not a general NLU system: it
/// recognizes a handful of literal phrasings the playbook-source dialect
/// uses and otherwise falls back to keyword extraction.
///
/// Fails with [`crate::error::BuilderError::TriggerParseError`] only when
/// the descriptor is empty after trimming.
pub fn compile_trigger(
    descriptor: &str,
    playbook_name: &str,
    source_order: usize,
) -> Result<TriggerSpec, crate::error::BuilderError> {
    let trimmed = descriptor.trim();
    if trimmed.is_empty() {
        return Err(crate::error::BuilderError::TriggerParseError(
            descriptor.to_string(),
        ));
    }
    let lower = trimmed.to_lowercase();

    let kind = if lower.contains("at program start") || lower.contains("on program start") {
        TriggerKind::ProgramStart
    } else if lower.contains("meeting invite") {
        TriggerKind::MeetingInvite
    } else if let Some(rest) = lower.strip_prefix("when agent ") {
        let id = rest.split_whitespace().next().unwrap_or("").to_string();
        TriggerKind::MessageFrom(AgentID::new(id))
    } else if let Some(rest) = lower.strip_prefix("when $") {
        let name = rest.split_whitespace().next().unwrap_or("").to_string();
        TriggerKind::StateChange(format!("${}", name))
    } else {
        let keywords: Vec<String> = lower
            .split_whitespace()
            .filter(|w| !STOPWORDS.contains(w))
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|w| !w.is_empty())
            .collect();
        TriggerKind::MessageKeywords(keywords)
    };

    Ok(TriggerSpec {
        descriptor: trimmed.to_string(),
        playbook_name: playbook_name.to_string(),
        kind,
        source_order,
    })
}

const STOPWORDS: &[&str] = &[
    "when", "the", "a", "an", "on", "to", "is", "of", "says", "receives", "and",
];

/// An event the trigger engine evaluates against a catalog (§4.12): an
/// incoming message, a timer firing, or a state-var change.
#[derive(Debug, Clone)]
pub enum IncomingEvent<'a> {
    Message(&'a Message),
    Timer,
    StateChange { name: &'a str },
}

fn matches(trigger: &TriggerSpec, event: &IncomingEvent<'_>, is_program_start: bool) -> bool {
    match (&trigger.kind, event) {
        (TriggerKind::ProgramStart, _) => is_program_start,
        (TriggerKind::MeetingInvite, IncomingEvent::Message(m)) => {
            m.message_type == MessageType::MeetingInvite
        }
        (TriggerKind::MessageFrom(id), IncomingEvent::Message(m)) => &m.sender_id == id,
        (TriggerKind::StateChange(name), IncomingEvent::StateChange { name: changed }) => {
            name == changed
        }
        (TriggerKind::MessageKeywords(keywords), IncomingEvent::Message(m)) => {
            if keywords.is_empty() {
                return false;
            }
            let content = m.content.to_lowercase();
            keywords.iter().all(|k| content.contains(k.as_str()))
        }
        _ => false,
    }
}

/// Evaluates `catalog` against `event`, returning the single best match per
/// §4.12's tie-break: most-specific trigger wins; ties broken by source
/// (textual) order.
pub fn best_match<'a>(
    catalog: &'a [TriggerSpec],
    event: &IncomingEvent<'_>,
    is_program_start: bool,
) -> Option<&'a TriggerSpec> {
    catalog
        .iter()
        .filter(|t| matches(t, event, is_program_start))
        .max_by_key(|t| (t.specificity(), std::cmp::Reverse(t.source_order)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(content: &str) -> Message {
        Message::new(
            AgentID::new("human"),
            "Human",
            None,
            None,
            None,
            content,
            MessageType::Direct,
            Utc::now(),
        )
    }

    #[test]
    fn program_start_fires_only_at_start() {
        let t = compile_trigger("at program start", "Init", 0).unwrap();
        assert!(matches(&t, &IncomingEvent::Timer, true));
        assert!(!matches(&t, &IncomingEvent::Timer, false));
    }

    #[test]
    fn keyword_trigger_matches_content() {
        let t = compile_trigger("when user says hello there", "Greet", 0).unwrap();
        let m = msg("well hello there friend");
        assert!(matches(&t, &IncomingEvent::Message(&m), false));
        let m2 = msg("goodbye");
        assert!(!matches(&t, &IncomingEvent::Message(&m2), false));
    }

    #[test]
    fn most_specific_trigger_wins_ties_broken_by_order() {
        let broad = compile_trigger("when user says hello", "Broad", 0).unwrap();
        let narrow = compile_trigger("when user says hello urgent now", "Narrow", 1).unwrap();
        let catalog = vec![broad, narrow];
        let m = msg("hello urgent now please");
        let winner = best_match(&catalog, &IncomingEvent::Message(&m), false).unwrap();
        assert_eq!(winner.playbook_name, "Narrow");
    }

    #[test]
    fn empty_descriptor_is_trigger_parse_error() {
        assert!(compile_trigger("   ", "X", 0).is_err());
    }
}
