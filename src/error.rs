//! Crate-wide error enums.
//!
//! Each component owns a small error type implementing `Display` and
//! `std::error::Error`, in the style this codebase has always used for
//! domain errors (see `CouncilError`, `CalculatorError` in the modules they
//! originated from) rather than a single error enum behind `thiserror`.
//! Fallible public APIs return `Result<T, Box<dyn std::error::Error + Send +
//! Sync>>` so callers can `?` across component boundaries without caring
//! about the concrete type.

use std::fmt;

/// Boxed error type used at component boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while parsing or rendering [`crate::identifiers`] types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// The id spec was empty or structurally invalid.
    MalformedSpec(String),
}

impl fmt::Display for IdentifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierError::MalformedSpec(s) => write!(f, "malformed identifier spec: {:?}", s),
        }
    }
}

impl std::error::Error for IdentifierError {}

/// Errors raised by [`crate::queue::AgentQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// `put` was called after `close`.
    QueueClosed,
    /// `find`/`get` timed out before a matching message arrived.
    Timeout,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::QueueClosed => write!(f, "queue is closed"),
            QueueError::Timeout => write!(f, "timed out waiting for a message"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors raised by [`crate::channel`] routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel (or the meeting it belongs to) has been closed.
    MeetingClosed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::MeetingClosed => write!(f, "meeting channel is closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Errors raised while building agent classes from playbook source (C6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderError {
    UnknownAgentType(String),
    DuplicateAgentName(String),
    InvalidMetadata(String),
    TriggerParseError(String),
    ParseError(String),
}

impl fmt::Display for BuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderError::UnknownAgentType(t) => write!(f, "unknown agent type: {}", t),
            BuilderError::DuplicateAgentName(n) => write!(f, "duplicate agent name: {}", n),
            BuilderError::InvalidMetadata(m) => write!(f, "invalid metadata: {}", m),
            BuilderError::TriggerParseError(t) => write!(f, "could not parse trigger: {}", t),
            BuilderError::ParseError(e) => write!(f, "parse error: {}", e),
        }
    }
}

impl std::error::Error for BuilderError {}

/// Errors raised by the streaming embedded executor (C8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The LLM emitted a statement outside the directive contract.
    LLMOutputInvalid(String),
    /// The bounded retry budget for a single interpreter invocation was exhausted.
    InterpreterStalled,
    /// An `EXT` directive targeting native code raised.
    ToolError(String),
    UnknownPlaybook(String),
    UnknownAgent(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::LLMOutputInvalid(m) => write!(f, "invalid LLM output: {}", m),
            ExecutorError::InterpreterStalled => {
                write!(f, "interpreter stalled after exhausting retry budget")
            }
            ExecutorError::ToolError(m) => write!(f, "tool error: {}", m),
            ExecutorError::UnknownPlaybook(n) => write!(f, "unknown playbook: {}", n),
            ExecutorError::UnknownAgent(n) => write!(f, "unknown agent: {}", n),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// Errors raised by [`crate::meeting`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingError {
    MeetingClosed,
    UnknownMeeting(String),
}

impl fmt::Display for MeetingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeetingError::MeetingClosed => write!(f, "meeting is closed"),
            MeetingError::UnknownMeeting(id) => write!(f, "unknown meeting: {}", id),
        }
    }
}

impl std::error::Error for MeetingError {}

/// Errors raised by [`crate::checkpoint`] providers.
#[derive(Debug)]
pub enum CheckpointError {
    CheckpointTooLarge { limit_bytes: usize, actual_bytes: usize },
    RecoveryFailed(String),
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::CheckpointTooLarge { limit_bytes, actual_bytes } => write!(
                f,
                "checkpoint record of {} bytes exceeds limit of {} bytes",
                actual_bytes, limit_bytes
            ),
            CheckpointError::RecoveryFailed(m) => write!(f, "recovery failed: {}", m),
            CheckpointError::Io(e) => write!(f, "checkpoint io error: {}", e),
            CheckpointError::Serialization(e) => write!(f, "checkpoint serialization error: {}", e),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::Io(e) => Some(e),
            CheckpointError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Io(e)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Serialization(e)
    }
}

/// Top-level error raised by [`crate::program::Program`].
#[derive(Debug)]
pub enum ProgramError {
    Builder(BuilderError),
    Executor(ExecutorError),
    Checkpoint(CheckpointError),
    Meeting(MeetingError),
    Queue(QueueError),
    /// Program shutdown cancelled an outstanding wait.
    Cancelled,
    /// An internal invariant was violated; the affected agent was terminated.
    Fatal(String),
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramError::Builder(e) => write!(f, "{}", e),
            ProgramError::Executor(e) => write!(f, "{}", e),
            ProgramError::Checkpoint(e) => write!(f, "{}", e),
            ProgramError::Meeting(e) => write!(f, "{}", e),
            ProgramError::Queue(e) => write!(f, "{}", e),
            ProgramError::Cancelled => write!(f, "cancelled"),
            ProgramError::Fatal(m) => write!(f, "fatal: {}", m),
        }
    }
}

impl std::error::Error for ProgramError {}

impl From<BuilderError> for ProgramError {
    fn from(e: BuilderError) -> Self {
        ProgramError::Builder(e)
    }
}
impl From<ExecutorError> for ProgramError {
    fn from(e: ExecutorError) -> Self {
        ProgramError::Executor(e)
    }
}
impl From<CheckpointError> for ProgramError {
    fn from(e: CheckpointError) -> Self {
        ProgramError::Checkpoint(e)
    }
}
impl From<MeetingError> for ProgramError {
    fn from(e: MeetingError) -> Self {
        ProgramError::Meeting(e)
    }
}
impl From<QueueError> for ProgramError {
    fn from(e: QueueError) -> Self {
        ProgramError::Queue(e)
    }
}
