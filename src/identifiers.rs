//! Typed identifiers for agents and meetings (C1).
//!
//! Parse-once-at-boundary is an invariant of the whole runtime: every
//! internal API takes an [`AgentID`], [`MeetingID`], or [`EntityID`], never a
//! bare string. The only place a raw spec string is accepted is [`parse`] /
//! [`EntityID::parse`].

use crate::error::IdentifierError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed, immutable agent identifier.
///
/// Renders as `agent <id>`; equality and hashing are by the inner id only,
/// so `AgentID::new("human")` compares equal to a value parsed from any of
/// `"agent human"`, `"human"`, or `"user"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentID(String);

/// A typed, immutable meeting identifier. Renders as `meeting <id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeetingID(String);

impl AgentID {
    /// The canonical id of the built-in human participant.
    pub const HUMAN: &'static str = "human";

    pub fn new(id: impl Into<String>) -> Self {
        AgentID(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_human(&self) -> bool {
        self.0 == Self::HUMAN
    }

    pub fn render(&self) -> String {
        format!("agent {}", self.0)
    }
}

impl MeetingID {
    pub fn new(id: impl Into<String>) -> Self {
        MeetingID(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn render(&self) -> String {
        format!("meeting {}", self.0)
    }
}

impl fmt::Display for AgentID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl fmt::Display for MeetingID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// The sum of [`AgentID`] and [`MeetingID`]: the type of a message recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityID {
    Agent(AgentID),
    Meeting(MeetingID),
}

impl EntityID {
    pub fn parse(spec: &str) -> Result<EntityID, IdentifierError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::MalformedSpec(spec.to_string()));
        }
        if let Some(rest) = trimmed.strip_prefix("meeting ") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Err(IdentifierError::MalformedSpec(spec.to_string()));
            }
            return Ok(EntityID::Meeting(MeetingID::new(rest)));
        }
        Ok(EntityID::Agent(parse_agent(trimmed)?))
    }

    pub fn render(&self) -> String {
        match self {
            EntityID::Agent(a) => a.render(),
            EntityID::Meeting(m) => m.render(),
        }
    }

    pub fn as_agent(&self) -> Option<&AgentID> {
        match self {
            EntityID::Agent(a) => Some(a),
            EntityID::Meeting(_) => None,
        }
    }

    pub fn as_meeting(&self) -> Option<&MeetingID> {
        match self {
            EntityID::Meeting(m) => Some(m),
            EntityID::Agent(_) => None,
        }
    }
}

impl From<AgentID> for EntityID {
    fn from(a: AgentID) -> Self {
        EntityID::Agent(a)
    }
}

impl From<MeetingID> for EntityID {
    fn from(m: MeetingID) -> Self {
        EntityID::Meeting(m)
    }
}

/// Parses `"agent X"`, a bare id (interpreted as an agent), or the human
/// aliases `"human"`/`"user"` into an [`AgentID`].
pub fn parse_agent(spec: &str) -> Result<AgentID, IdentifierError> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(IdentifierError::MalformedSpec(spec.to_string()));
    }
    let inner = trimmed.strip_prefix("agent ").unwrap_or(trimmed).trim();
    if inner.is_empty() {
        return Err(IdentifierError::MalformedSpec(spec.to_string()));
    }
    match inner {
        "human" | "user" => Ok(AgentID::new(AgentID::HUMAN)),
        other => Ok(AgentID::new(other)),
    }
}

/// Parses any entity spec form. Convenience free function mirroring
/// [`EntityID::parse`] for callers that only import the module function.
pub fn parse(spec: &str) -> Result<EntityID, IdentifierError> {
    EntityID::parse(spec)
}

/// Deterministic, order-independent channel id for a direct (pair) channel.
/// Symmetric in its two arguments, per the C4 invariant.
pub fn direct_channel_id(a: &AgentID, b: &AgentID) -> String {
    let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
    format!("direct:{}|{}", lo.as_str(), hi.as_str())
}

/// Deterministic channel id for a meeting channel.
pub fn meeting_channel_id(meeting_id: &MeetingID) -> String {
    format!("meeting:{}", meeting_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_aliases_are_equal() {
        let a = parse_agent("agent X").unwrap();
        let b = parse_agent("X").unwrap();
        let c = parse_agent(" agent X ").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.render(), "agent X");
    }

    #[test]
    fn human_aliases_canonicalize() {
        assert_eq!(parse_agent("human").unwrap(), AgentID::new("human"));
        assert_eq!(parse_agent("user").unwrap(), AgentID::new("human"));
        assert_eq!(parse_agent("agent user").unwrap(), AgentID::new("human"));
    }

    #[test]
    fn empty_spec_is_malformed() {
        assert!(matches!(
            parse_agent(""),
            Err(IdentifierError::MalformedSpec(_))
        ));
        assert!(matches!(
            EntityID::parse("   "),
            Err(IdentifierError::MalformedSpec(_))
        ));
    }

    #[test]
    fn meeting_parses_and_renders() {
        let e = EntityID::parse("meeting m1").unwrap();
        assert_eq!(e.render(), "meeting m1");
        assert_eq!(e.as_meeting().unwrap().as_str(), "m1");
    }

    #[test]
    fn parse_render_round_trip() {
        for spec in ["agent a1", "meeting m1", "human"] {
            let id = EntityID::parse(spec).unwrap();
            let rendered = id.render();
            let reparsed = EntityID::parse(&rendered).unwrap();
            assert_eq!(id, reparsed);
        }
    }

    #[test]
    fn direct_channel_id_is_symmetric() {
        let a1 = AgentID::new("a1");
        let a2 = AgentID::new("a2");
        assert_eq!(direct_channel_id(&a1, &a2), direct_channel_id(&a2, &a1));
    }
}
