//! Agent classes, runtime agent variants, and the declarative [`Playbook`]
//! unit of behavior (§3 Data Model).
//!
//! The `*Class` types are what C6 (the parser/builder) produces from
//! playbook source; [`Agent`] is what C10 (the scheduler) instantiates from
//! a class at program start, splitting the AI/Human/Remote variants the
//! data model calls for instead of one concrete struct.

use crate::callstack::ExecutionState;
use crate::identifiers::AgentID;
use crate::triggers::TriggerSpec;
use std::collections::HashMap;
use std::sync::Arc;

/// The kind of a declared agent/playbook source section (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentType {
    Ai,
    Human,
    Remote,
}

impl AgentType {
    pub fn parse(spec: &str) -> Option<AgentType> {
        match spec {
            "AI" => Some(AgentType::Ai),
            "Human" => Some(AgentType::Human),
            "Remote" => Some(AgentType::Remote),
            _ => None,
        }
    }
}

/// A parameter in a playbook signature, with an optional default literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<String>,
}

/// Whether a playbook's body is LLM-interpreted markdown steps or native
/// code executed directly by C8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybookKind {
    Markdown,
    EmbeddedCode,
}

/// A named, parameterized unit of agent behavior (§3, §4.6).
#[derive(Debug, Clone)]
pub struct Playbook {
    pub name: String,
    pub params: Vec<Param>,
    pub kind: PlaybookKind,
    pub body: String,
    /// Public playbooks are callable cross-agent (data model invariant).
    pub is_public: bool,
    pub is_meeting: bool,
    pub required_attendees: Vec<AgentID>,
    pub optional_attendees: Vec<AgentID>,
    pub triggers: Vec<TriggerSpec>,
    /// One-line description shown when this playbook is summarized (not the
    /// currently active one) in the interpreter prompt (§4.7).
    pub description: String,
}

impl Playbook {
    pub fn signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| match &p.default {
                Some(d) => format!("{}={}", p.name, d),
                None => p.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.name, params)
    }
}

/// Delivery channel selection for a Human agent (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryChannel {
    Streaming,
    Buffered,
    Custom,
}

/// Meeting notification breadth for a Human agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingNotifications {
    All,
    Targeted,
    None,
}

/// A custom synchronous delivery handler for a Human agent (§9 Open
/// Question; resolved in `DESIGN.md` — invoked synchronously under the
/// agent loop, matching the single-threaded-cooperative-per-agent model).
pub trait CustomDeliveryHandler: Send + Sync {
    fn deliver(&self, content: &str);
}

/// Delivery preferences for a Human agent (§3).
#[derive(Clone)]
pub struct DeliveryPreferences {
    pub channel: DeliveryChannel,
    pub streaming_enabled: bool,
    pub streaming_chunk_size: usize,
    pub buffer_messages: bool,
    pub buffer_timeout_ms: u64,
    pub meeting_notifications: MeetingNotifications,
    pub custom_handler: Option<Arc<dyn CustomDeliveryHandler>>,
}

impl std::fmt::Debug for DeliveryPreferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPreferences")
            .field("channel", &self.channel)
            .field("streaming_enabled", &self.streaming_enabled)
            .field("streaming_chunk_size", &self.streaming_chunk_size)
            .field("buffer_messages", &self.buffer_messages)
            .field("buffer_timeout_ms", &self.buffer_timeout_ms)
            .field("meeting_notifications", &self.meeting_notifications)
            .field("custom_handler", &self.custom_handler.is_some())
            .finish()
    }
}

impl Default for DeliveryPreferences {
    fn default() -> Self {
        DeliveryPreferences {
            channel: DeliveryChannel::Streaming,
            streaming_enabled: true,
            streaming_chunk_size: 64,
            buffer_messages: false,
            buffer_timeout_ms: 0,
            meeting_notifications: MeetingNotifications::All,
            custom_handler: None,
        }
    }
}

impl DeliveryPreferences {
    /// Enforces the data-model invariant `channel=buffered => streaming_enabled=false`.
    pub fn normalized(mut self) -> Self {
        if self.channel == DeliveryChannel::Buffered {
            self.streaming_enabled = false;
        }
        self
    }
}

/// Minimal Human runtime state (§3: "minimal: joined meetings only").
#[derive(Debug, Clone, Default)]
pub struct HumanState {
    pub joined_meetings: Vec<crate::identifiers::MeetingID>,
}

/// A remote agent's transport descriptor, parsed from the `remote: {...}`
/// metadata block (§4.6). Kept as an opaque key/value bag: the concrete
/// transport (HTTP, websocket, ...) is an external collaborator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteTransport {
    pub fields: HashMap<String, String>,
}

/// Common attributes shared by every declared agent class (§3).
#[derive(Debug, Clone)]
pub struct AgentClassHeader {
    pub id: AgentID,
    pub klass: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

/// An AI agent class: playbooks, its compiled trigger catalog, and whether
/// any of its playbooks must be instantiated at program start.
#[derive(Debug, Clone)]
pub struct AiAgentClass {
    pub header: AgentClassHeader,
    pub playbooks: HashMap<String, Playbook>,
    pub triggers: Vec<TriggerSpec>,
    pub start_at_init_playbooks: Vec<String>,
}

/// A Human agent class.
#[derive(Clone)]
pub struct HumanAgentClass {
    pub header: AgentClassHeader,
    pub name: String,
    pub delivery_preferences: DeliveryPreferences,
}

impl std::fmt::Debug for HumanAgentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HumanAgentClass")
            .field("header", &self.header)
            .field("name", &self.name)
            .finish()
    }
}

/// A Remote agent class.
#[derive(Debug, Clone)]
pub struct RemoteAgentClass {
    pub header: AgentClassHeader,
    pub transport: RemoteTransport,
}

/// A declarative agent class, as produced by C6 from playbook source.
#[derive(Debug, Clone)]
pub enum AgentClass {
    Ai(AiAgentClass),
    Human(HumanAgentClass),
    Remote(RemoteAgentClass),
}

impl AgentClass {
    pub fn header(&self) -> &AgentClassHeader {
        match self {
            AgentClass::Ai(c) => &c.header,
            AgentClass::Human(c) => &c.header,
            AgentClass::Remote(c) => &c.header,
        }
    }

    pub fn agent_type(&self) -> AgentType {
        match self {
            AgentClass::Ai(_) => AgentType::Ai,
            AgentClass::Human(_) => AgentType::Human,
            AgentClass::Remote(_) => AgentType::Remote,
        }
    }
}

/// A live, program-managed agent instance (§3). Created by C10 from an
/// [`AgentClass`]; destroyed on program shutdown or explicit terminate.
#[derive(Clone)]
pub enum Agent {
    Ai {
        header: AgentClassHeader,
        playbooks: HashMap<String, Playbook>,
        triggers: Vec<TriggerSpec>,
        execution_state: ExecutionState,
    },
    Human {
        header: AgentClassHeader,
        name: String,
        delivery_preferences: DeliveryPreferences,
        state: HumanState,
    },
    Remote {
        header: AgentClassHeader,
        transport: RemoteTransport,
    },
}

impl Agent {
    pub fn from_class(class: &AgentClass) -> Self {
        match class {
            AgentClass::Ai(c) => Agent::Ai {
                header: c.header.clone(),
                playbooks: c.playbooks.clone(),
                triggers: c.triggers.clone(),
                execution_state: ExecutionState::new(),
            },
            AgentClass::Human(c) => Agent::Human {
                header: c.header.clone(),
                name: c.name.clone(),
                delivery_preferences: c.delivery_preferences.clone(),
                state: HumanState::default(),
            },
            AgentClass::Remote(c) => Agent::Remote {
                header: c.header.clone(),
                transport: c.transport.clone(),
            },
        }
    }

    pub fn header(&self) -> &AgentClassHeader {
        match self {
            Agent::Ai { header, .. } => header,
            Agent::Human { header, .. } => header,
            Agent::Remote { header, .. } => header,
        }
    }

    pub fn id(&self) -> &AgentID {
        &self.header().id
    }

    pub fn agent_type(&self) -> AgentType {
        match self {
            Agent::Ai { .. } => AgentType::Ai,
            Agent::Human { .. } => AgentType::Human,
            Agent::Remote { .. } => AgentType::Remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_forces_streaming_off() {
        let prefs = DeliveryPreferences {
            channel: DeliveryChannel::Buffered,
            streaming_enabled: true,
            ..DeliveryPreferences::default()
        }
        .normalized();
        assert!(!prefs.streaming_enabled);
    }

    #[test]
    fn playbook_signature_renders_defaults() {
        let pb = Playbook {
            name: "Greet".into(),
            params: vec![
                Param { name: "name".into(), default: None },
                Param { name: "loud".into(), default: Some("false".into()) },
            ],
            kind: PlaybookKind::Markdown,
            body: String::new(),
            is_public: true,
            is_meeting: false,
            required_attendees: vec![],
            optional_attendees: vec![],
            triggers: vec![],
            description: String::new(),
        };
        assert_eq!(pb.signature(), "Greet(name, loud=false)");
    }
}
