//! The immutable [`Message`] record and stream-event types (C1, §6).

use crate::identifiers::{AgentID, EntityID, MeetingID};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// The kind of a routed message, used both for channel delivery semantics and
/// for priority derivation in the per-agent intake queue (C3/C4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Direct,
    MeetingBroadcast,
    MeetingInvite,
    MeetingJoin,
    MeetingLeave,
    System,
}

impl MessageType {
    /// True for the three `meeting_*` variants, which require `meeting_id`
    /// to be set (data-model invariant).
    pub fn is_meeting_kind(self) -> bool {
        matches!(
            self,
            MessageType::MeetingBroadcast
                | MessageType::MeetingInvite
                | MessageType::MeetingJoin
                | MessageType::MeetingLeave
        )
    }

    /// Priority used by the intake queue: invites/system rank above direct,
    /// which ranks above broadcast (§5 ordering guarantees). Lower value is
    /// higher priority.
    pub fn default_priority(self) -> u8 {
        match self {
            MessageType::System | MessageType::MeetingInvite => 0,
            MessageType::Direct | MessageType::MeetingJoin | MessageType::MeetingLeave => 1,
            MessageType::MeetingBroadcast => 2,
        }
    }
}

/// An immutable, value-equal, freely shareable message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender_id: AgentID,
    pub sender_klass: String,
    pub recipient_id: Option<EntityID>,
    pub recipient_klass: Option<String>,
    pub meeting_id: Option<MeetingID>,
    pub target_agent_ids: HashSet<AgentID>,
    pub content: String,
    pub message_type: MessageType,
    pub stream_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Builds a message, enforcing the "meeting_* implies meeting_id" data
    /// model invariant via a panic in debug builds used only from within the
    /// crate's own constructors (callers go through [`crate::channel`] /
    /// [`crate::program`] which always supply a meeting id for meeting
    /// kinds).
    pub fn new(
        sender_id: AgentID,
        sender_klass: impl Into<String>,
        recipient_id: Option<EntityID>,
        recipient_klass: Option<String>,
        meeting_id: Option<MeetingID>,
        content: impl Into<String>,
        message_type: MessageType,
        created_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(
            !message_type.is_meeting_kind() || meeting_id.is_some(),
            "meeting_* message types require meeting_id"
        );
        Message {
            sender_id,
            sender_klass: sender_klass.into(),
            recipient_id,
            recipient_klass,
            meeting_id,
            target_agent_ids: HashSet::new(),
            content: content.into(),
            message_type,
            stream_id: None,
            created_at,
        }
    }

    pub fn with_target_agent_ids(mut self, ids: HashSet<AgentID>) -> Self {
        self.target_agent_ids = ids;
        self
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }
}

/// Produced by [`crate::channel::Channel::start_stream`]: `should_stream` is
/// false when there is no streaming-enabled human recipient, in which case
/// the caller must deliver the final content as a single unit instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamResult {
    pub should_stream: bool,
    pub stream_id: Option<String>,
}

impl StreamResult {
    pub fn start(stream_id: impl Into<String>) -> Self {
        StreamResult {
            should_stream: true,
            stream_id: Some(stream_id.into()),
        }
    }

    pub fn skip() -> Self {
        StreamResult {
            should_stream: false,
            stream_id: None,
        }
    }
}

/// Stream events delivered to [`crate::channel::StreamObserver`]s (§6).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        stream_id: String,
        sender_id: AgentID,
        sender_klass: String,
        recipient_id: Option<EntityID>,
        meeting_id: Option<MeetingID>,
    },
    Chunk {
        stream_id: String,
        chunk: String,
        chunk_index: usize,
        recipient_id: Option<EntityID>,
        meeting_id: Option<MeetingID>,
        is_final: bool,
    },
    Complete {
        stream_id: String,
        recipient_id: Option<EntityID>,
        meeting_id: Option<MeetingID>,
        cancelled: bool,
    },
}

impl StreamEvent {
    /// The `recipient_id` carried by this event, used by the observer filter
    /// policy (§4.4).
    pub fn recipient_id(&self) -> Option<&EntityID> {
        match self {
            StreamEvent::Start { recipient_id, .. } => recipient_id.as_ref(),
            StreamEvent::Chunk { recipient_id, .. } => recipient_id.as_ref(),
            StreamEvent::Complete { recipient_id, .. } => recipient_id.as_ref(),
        }
    }
}
