//! The scheduler: agent registry, message routing, per-agent cooperative
//! loops, and program lifecycle (C10).
//!
//! An agent registry keyed by id drives a `run` entry point that spawns one
//! independently scheduled loop per agent, each pumping its own mailbox.
//! Native `EXT` call resolution goes through a single name -> callable
//! registry shared by every agent.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::agent::{Agent, AgentClass, AgentType, Playbook};
use crate::callstack::{CallStackFrame, ExecutionState, SessionLogEntry, Value};
use crate::channel::{Channel, ChannelRegistry, Participant};
use crate::checkpoint::{build_next_record, CheckpointProvider, ProgramCheckpoint};
use crate::completion::CompletionProvider;
use crate::config::RuntimeConfig;
use crate::error::{ExecutorError, ProgramError};
use crate::event::{EventBus, RuntimeEvent};
use crate::executor::{run_turn, ExternalCallDispatcher, InterpreterInvocation, TurnOutcome};
use crate::identifiers::{direct_channel_id, meeting_channel_id, AgentID, EntityID, MeetingID};
use crate::message::{Message, MessageType};
use crate::meeting::Meeting;
use crate::parser::build_classes;
use crate::prompt::{assemble_prompt, FixedWindowStrategy, PlaybookSummary, SessionLogStrategy, YieldKind};
use crate::queue::{AgentQueue, SharedQueue};
use crate::triggers::{best_match, IncomingEvent};

/// A native Rust callable reachable via `EXT Name(args)`, the "native
/// code" half of the external-call surface (§4.8). Registered once per
/// program and shared by every agent.
#[async_trait]
pub trait NativeTool: Send + Sync {
    async fn invoke(
        &self,
        args: &str,
        frame: &CallStackFrame,
        state_vars: &HashMap<String, Value>,
    ) -> Result<Value, ExecutorError>;
}

fn call_target_name(call_spec: &str) -> &str {
    call_spec
        .find('(')
        .map(|i| call_spec[..i].trim())
        .unwrap_or_else(|| call_spec.trim())
}

/// Whether `message` satisfies the wait condition of a suspended `YLD`
/// (§4.12's "feeds the event into the currently suspended interpreter if
/// its YLD predicate matches"). `Call`/`Timeout` never reach here: the
/// scheduler resolves them itself rather than waiting on the queue.
fn message_resumes_yield(message: &Message, kind: &YieldKind) -> bool {
    match kind {
        YieldKind::User => message.sender_id.is_human(),
        YieldKind::Agent(expected) => &message.sender_id == expected,
        YieldKind::Meeting => message.message_type.is_meeting_kind(),
        YieldKind::Call(_) | YieldKind::Timeout(_) => false,
    }
}

struct ProgramDispatcher {
    tools: Arc<RwLock<HashMap<String, Arc<dyn NativeTool>>>>,
}

#[async_trait]
impl ExternalCallDispatcher for ProgramDispatcher {
    async fn call(
        &self,
        call_spec: &str,
        frame: &CallStackFrame,
        state_vars: &HashMap<String, Value>,
    ) -> Result<Value, ExecutorError> {
        let name = call_target_name(call_spec);
        let tool = self.tools.read().await.get(name).cloned();
        match tool {
            Some(tool) => tool.invoke(call_spec, frame, state_vars).await,
            None => Err(ExecutorError::UnknownPlaybook(name.to_string())),
        }
    }
}

/// Registered agent-class + live-instance pair, plus its intake queue and
/// trigger catalog snapshot used by the loop without re-borrowing the agent.
struct AgentEntry {
    queue: SharedQueue,
}

/// The multi-agent cooperative runtime. Owns every shared-resource registry
/// named by §5: agents, channels, meetings, the event bus, and the
/// checkpoint coordinator.
pub struct Program {
    config: RuntimeConfig,
    /// Each agent behind its own mutex, not one mutex over the whole map:
    /// a long-running invocation on one agent must never block routing or
    /// scheduling for any other agent (§5 concurrency model).
    agents: RwLock<HashMap<AgentID, Arc<Mutex<Agent>>>>,
    entries: RwLock<HashMap<AgentID, AgentEntry>>,
    classes: RwLock<HashMap<AgentID, AgentClass>>,
    channels: ChannelRegistry,
    meetings: RwLock<HashMap<MeetingID, Arc<Meeting>>>,
    event_bus: EventBus,
    checkpoint: Arc<dyn CheckpointProvider>,
    completion: Arc<dyn CompletionProvider>,
    tools: Arc<RwLock<HashMap<String, Arc<dyn NativeTool>>>>,
    session_log_strategy: Box<dyn SessionLogStrategy>,
    shutting_down: AtomicBool,
}

impl Program {
    pub fn new(
        config: RuntimeConfig,
        completion: Arc<dyn CompletionProvider>,
        checkpoint: Arc<dyn CheckpointProvider>,
    ) -> Arc<Self> {
        Arc::new(Program {
            config,
            agents: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            classes: RwLock::new(HashMap::new()),
            channels: ChannelRegistry::new(),
            meetings: RwLock::new(HashMap::new()),
            event_bus: EventBus::new(),
            checkpoint,
            completion,
            tools: Arc::new(RwLock::new(HashMap::new())),
            session_log_strategy: Box::new(FixedWindowStrategy::default()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub async fn register_tool(&self, name: impl Into<String>, tool: Arc<dyn NativeTool>) {
        self.tools.write().await.insert(name.into(), tool);
    }

    /// A snapshot clone of one registered agent's current state, or `None`
    /// if no agent with that id is registered.
    pub async fn get_agent(&self, agent_id: &AgentID) -> Option<Agent> {
        let lock = self.agents.read().await.get(agent_id).cloned()?;
        let guard = lock.lock().await;
        Some(guard.clone())
    }

    /// Registered agent ids, in no particular order.
    pub async fn list_agent_ids(&self) -> Vec<AgentID> {
        self.agents.read().await.keys().cloned().collect()
    }

    /// Parses `source` into agent classes, instantiates one [`Agent`] per
    /// class, and wires its intake queue and (for AI agents) runs any
    /// `ProgramStart`-triggered playbooks. Human agents get a human-flagged
    /// participant ready for direct channels; Remote agents are registered
    /// but not scheduled (their transport is an external collaborator).
    pub async fn load_playbooks(self: &Arc<Self>, source: &str) -> Result<(), ProgramError> {
        let classes = build_classes(source).map_err(ProgramError::from)?;
        for (_name, class) in classes {
            self.register_class(class).await?;
        }
        Ok(())
    }

    async fn register_class(self: &Arc<Self>, class: AgentClass) -> Result<(), ProgramError> {
        let agent = Agent::from_class(&class);
        let agent_id = agent.id().clone();
        let queue: SharedQueue = Arc::new(AgentQueue::new());

        self.entries
            .write()
            .await
            .insert(agent_id.clone(), AgentEntry { queue: queue.clone() });
        self.classes.write().await.insert(agent_id.clone(), class.clone());

        let start_at_init = match &class {
            AgentClass::Ai(c) => c.start_at_init_playbooks.clone(),
            _ => Vec::new(),
        };
        let playbook_count = match &class {
            AgentClass::Ai(c) => c.playbooks.len(),
            _ => 0,
        };

        self.agents
            .write()
            .await
            .insert(agent_id.clone(), Arc::new(Mutex::new(agent)));
        self.event_bus
            .publish(RuntimeEvent::AgentStarted { agent_id: agent_id.clone() })
            .await;
        log::info!(
            "agent '{}' registered as {:?} ({} playbook(s))",
            agent_id.as_str(),
            class.agent_type(),
            playbook_count
        );

        for playbook_name in start_at_init {
            self.invoke_playbook(&agent_id, &playbook_name, HashMap::new()).await?;
        }

        Ok(())
    }

    fn queue_for(
        entries: &HashMap<AgentID, AgentEntry>,
        agent_id: &AgentID,
    ) -> Result<SharedQueue, ProgramError> {
        entries
            .get(agent_id)
            .map(|e| e.queue.clone())
            .ok_or_else(|| ProgramError::Executor(ExecutorError::UnknownAgent(agent_id.as_str().to_string())))
    }

    /// Routes one message to its recipient(s) (§4.4). Direct messages get a
    /// lazily-created direct channel between sender and recipient; meeting
    /// kinds are broadcast through the meeting's channel.
    pub async fn route_message(&self, message: Message) -> Result<(), ProgramError> {
        self.event_bus
            .publish(RuntimeEvent::MessageRouted {
                sender_id: message.sender_id.clone(),
                recipient: message
                    .recipient_id
                    .clone()
                    .unwrap_or_else(|| EntityID::Agent(message.sender_id.clone())),
            })
            .await;

        if message.message_type.is_meeting_kind() {
            let meeting_id = message
                .meeting_id
                .clone()
                .ok_or_else(|| ProgramError::Fatal("meeting message missing meeting_id".into()))?;
            let meeting = self
                .meetings
                .read()
                .await
                .get(&meeting_id)
                .cloned()
                .ok_or_else(|| ProgramError::Fatal(format!("unknown meeting: {}", meeting_id.as_str())))?;
            meeting
                .channel()
                .deliver(message)
                .await
                .map_err(|_| ProgramError::Meeting(crate::error::MeetingError::MeetingClosed))?;
            return Ok(());
        }

        let recipient_agent = match message.recipient_id.as_ref().and_then(EntityID::as_agent) {
            Some(a) => a.clone(),
            None => return Ok(()),
        };

        let channel_id = direct_channel_id(&message.sender_id, &recipient_agent);
        let entries = self.entries.read().await;
        let sender_queue = Self::queue_for(&entries, &message.sender_id)?;
        let recipient_queue = Self::queue_for(&entries, &recipient_agent)?;
        drop(entries);

        let channel = self
            .channels
            .get_or_create(channel_id, || {
                Channel::new_direct(
                    direct_channel_id(&message.sender_id, &recipient_agent),
                    Participant::new(message.sender_id.clone(), sender_queue),
                    Participant::new(recipient_agent.clone(), recipient_queue),
                )
            })
            .await;

        channel
            .deliver(message)
            .await
            .map_err(|_| ProgramError::Meeting(crate::error::MeetingError::MeetingClosed))
    }

    /// Opens a meeting owned by `owner_id` with the given attendee lists,
    /// publishing [`RuntimeEvent::MeetingOpened`].
    pub async fn open_meeting(
        &self,
        meeting_id: MeetingID,
        owner_id: AgentID,
        required_attendees: Vec<AgentID>,
        optional_attendees: Vec<AgentID>,
    ) -> Arc<Meeting> {
        let channel_id = meeting_channel_id(&meeting_id);
        let channel = self
            .channels
            .get_or_create(channel_id, || Channel::new_meeting(meeting_channel_id(&meeting_id), meeting_id.clone()))
            .await;
        let meeting = Arc::new(Meeting::new(
            meeting_id.clone(),
            owner_id,
            required_attendees,
            optional_attendees,
            channel,
        ));
        self.meetings.write().await.insert(meeting_id.clone(), meeting.clone());
        self.event_bus.publish(RuntimeEvent::MeetingOpened { meeting_id }).await;
        meeting
    }

    /// Joins `attendee_id` to `meeting_id`'s channel and records the join
    /// against the required-attendee gate.
    pub async fn join_meeting(&self, meeting_id: &MeetingID, attendee_id: AgentID) -> Result<(), ProgramError> {
        let meeting = self
            .meetings
            .read()
            .await
            .get(meeting_id)
            .cloned()
            .ok_or_else(|| ProgramError::Fatal(format!("unknown meeting: {}", meeting_id.as_str())))?;
        let entries = self.entries.read().await;
        let queue = Self::queue_for(&entries, &attendee_id)?;
        drop(entries);
        meeting
            .channel()
            .add_participant(Participant::new(attendee_id.clone(), queue))
            .await;
        meeting.record_join(attendee_id, &self.event_bus).await;
        Ok(())
    }

    /// Starts a fresh top-level playbook invocation: pushes a new frame
    /// seeded with `seed_locals` and drives it (§4.8).
    async fn invoke_playbook(
        self: &Arc<Self>,
        agent_id: &AgentID,
        playbook_name: &str,
        seed_locals: HashMap<String, Value>,
    ) -> Result<(), ProgramError> {
        let agent_lock = self
            .agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ProgramError::Executor(ExecutorError::UnknownAgent(agent_id.as_str().to_string())))?;
        let mut agent = agent_lock.lock().await;

        let (playbooks, execution_state) = match &mut *agent {
            Agent::Ai { playbooks, execution_state, .. } => (playbooks.clone(), execution_state),
            _ => return Err(ProgramError::Fatal("only AI agents run playbooks".into())),
        };
        let playbook_name = playbooks
            .get(playbook_name)
            .ok_or_else(|| ProgramError::Executor(ExecutorError::UnknownPlaybook(playbook_name.to_string())))?
            .name
            .clone();

        let frame = CallStackFrame::new(playbook_name).with_locals(seed_locals);
        execution_state.push(frame);
        // A fresh top-level invocation starts its own retry budget, not the
        // stale count left over from whatever invocation last ran on this
        // agent.
        execution_state.retries = 0;

        self.drive_invocation(agent_id, &playbooks, execution_state).await
    }

    /// Feeds `message` into an agent's already-suspended top frame instead
    /// of starting a new invocation, per the `YLD user`/`YLD agent
    /// <id>`/`YLD meeting` resume contract (§4.8, §4.12): the waited-for
    /// value is bound into the existing frame's locals (the same
    /// `message`/`sender` binding a fresh invocation seeds) and the
    /// interpreter re-enters from where it suspended.
    async fn resume_playbook(self: &Arc<Self>, agent_id: &AgentID, message: Message) -> Result<(), ProgramError> {
        let agent_lock = self
            .agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ProgramError::Executor(ExecutorError::UnknownAgent(agent_id.as_str().to_string())))?;
        let mut agent = agent_lock.lock().await;

        let (playbooks, execution_state) = match &mut *agent {
            Agent::Ai { playbooks, execution_state, .. } => (playbooks.clone(), execution_state),
            _ => return Err(ProgramError::Fatal("only AI agents run playbooks".into())),
        };

        execution_state.suspended_yield = None;
        execution_state.add_session_entry(SessionLogEntry::IncomingMessage {
            sender: message.sender_id.as_str().to_string(),
            content: message.content.clone(),
            created_at: chrono::Utc::now(),
        });
        let mut resumed_locals = HashMap::new();
        resumed_locals.insert("message".to_string(), Value::String(message.content.clone()));
        resumed_locals.insert("sender".to_string(), Value::String(message.sender_id.as_str().to_string()));
        execution_state.locals_update(resumed_locals);

        self.drive_invocation(agent_id, &playbooks, execution_state).await
    }

    /// Drives the agent's top-of-stack frame to completion or suspension,
    /// repeatedly calling the LLM (C7) and the streaming executor (C8)
    /// until a `YLD` or `RET` is reached, checkpointing (C11) after every
    /// turn that mutates state. Shared by [`Program::invoke_playbook`]
    /// (fresh frame) and [`Program::resume_playbook`] (existing frame).
    async fn drive_invocation(
        &self,
        agent_id: &AgentID,
        playbooks: &HashMap<String, Playbook>,
        execution_state: &mut ExecutionState,
    ) -> Result<(), ProgramError> {
        let dispatcher = ProgramDispatcher { tools: self.tools.clone() };
        let mut invocation = InterpreterInvocation::new();
        invocation.retries = execution_state.retries;

        loop {
            let active_name = execution_state
                .peek()
                .ok_or_else(|| ProgramError::Fatal("call stack empty mid-invocation".into()))?
                .playbook_name
                .clone();
            let active_playbook = playbooks
                .get(&active_name)
                .ok_or_else(|| ProgramError::Executor(ExecutorError::UnknownPlaybook(active_name.clone())))?;

            let callable: Vec<PlaybookSummary> = playbooks
                .values()
                .filter(|p| p.name != active_name)
                .map(|p| PlaybookSummary {
                    owner_klass: active_name.clone(),
                    signature: p.signature(),
                    description: p.description.clone(),
                })
                .collect();

            let prompt = assemble_prompt(
                execution_state,
                &active_playbook.body,
                &callable,
                &active_playbook.triggers,
                self.session_log_strategy.as_ref(),
            );
            let completion = self.completion.complete(&prompt).await;

            let frame = execution_state.call_stack.last_mut().unwrap();
            let outcome = run_turn(
                &mut invocation,
                completion,
                frame,
                &mut execution_state.state_vars,
                &mut execution_state.session_log,
                &dispatcher,
            )
            .await
            .map_err(ProgramError::from)?;
            execution_state.retries = invocation.retries;

            match outcome {
                TurnOutcome::NeedsNextTurn => continue,
                TurnOutcome::Suspended { label, kind } => {
                    execution_state.suspended_yield = match &kind {
                        YieldKind::User | YieldKind::Agent(_) | YieldKind::Meeting => Some(kind.clone()),
                        YieldKind::Timeout(_) | YieldKind::Call(_) => None,
                    };
                    self.checkpoint_agent(agent_id, execution_state, Some(&label), Some(&format!("{:?}", kind)))
                        .await?;
                    match kind {
                        YieldKind::Call(_) => continue,
                        YieldKind::Timeout(seconds) => {
                            tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                            continue;
                        }
                        YieldKind::User | YieldKind::Agent(_) | YieldKind::Meeting => return Ok(()),
                    }
                }
                TurnOutcome::Completed(value) => {
                    let frame = execution_state.pop();
                    if let Some(value) = value {
                        execution_state.add_session_entry(SessionLogEntry::StateChange {
                            name: "return_value".into(),
                            value,
                            created_at: chrono::Utc::now(),
                        });
                    }
                    self.checkpoint_agent(agent_id, execution_state, frame.as_ref().map(|f| f.playbook_name.as_str()), None)
                        .await?;
                    if !execution_state.is_active() {
                        self.event_bus
                            .publish(RuntimeEvent::AgentTerminated {
                                agent_id: agent_id.clone(),
                                reason: "playbook completed".into(),
                            })
                            .await;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn checkpoint_agent(
        &self,
        agent_id: &AgentID,
        execution_state: &crate::callstack::ExecutionState,
        last_directive: Option<&str>,
        last_yield_kind: Option<&str>,
    ) -> Result<(), ProgramError> {
        if !self.config.durability.enabled {
            return Ok(());
        }
        let prev_hash = self
            .checkpoint
            .latest_checkpoint(agent_id)
            .await
            .map_err(ProgramError::from)?
            .map(|r| r.hash);
        let checkpoint_id = format!("{}-{}", agent_id.as_str(), execution_state.session_log.len());
        let record = build_next_record(
            agent_id,
            checkpoint_id.clone(),
            execution_state.clone(),
            last_directive.map(str::to_string),
            last_yield_kind.map(str::to_string),
            prev_hash,
            chrono::Utc::now(),
        );
        self.checkpoint.save_checkpoint(&record).await.map_err(ProgramError::from)?;
        self.checkpoint
            .delete_old(agent_id, self.config.durability.keep_last_n)
            .await
            .map_err(ProgramError::from)?;
        log::debug!("checkpoint '{}' saved for agent '{}'", checkpoint_id, agent_id.as_str());
        self.event_bus
            .publish(RuntimeEvent::CheckpointSaved { agent_id: agent_id.clone(), checkpoint_id })
            .await;
        Ok(())
    }

    /// Restores the given agent's `ExecutionState` from its latest
    /// checkpoint, per §4.11's "resume to latest" policy. If that state was
    /// suspended on an external yield, `suspended_yield` carries over with
    /// it, so the agent's next scheduled loop iteration recognizes the
    /// restored frame as waiting and feeds the next matching message into
    /// it instead of starting a new invocation.
    pub async fn resume_from_checkpoint(self: &Arc<Self>, agent_id: &AgentID) -> Result<(), ProgramError> {
        let latest = self
            .checkpoint
            .latest_checkpoint(agent_id)
            .await
            .map_err(ProgramError::from)?;
        let record = match latest {
            Some(r) => r,
            None => return Ok(()),
        };
        let agent_lock = self
            .agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ProgramError::Executor(ExecutorError::UnknownAgent(agent_id.as_str().to_string())))?;
        let mut agent = agent_lock.lock().await;
        match &mut *agent {
            Agent::Ai { execution_state, .. } => {
                *execution_state = record.execution_state;
                Ok(())
            }
            _ => Err(ProgramError::Fatal("only AI agents have checkpointed execution state".into())),
        }
    }

    /// The per-agent cooperative loop (§5). Before matching a new message
    /// against the trigger catalog, checks whether this agent's top frame
    /// is already suspended on an external `YLD` (§4.8, §4.12): if so, the
    /// next message satisfying that yield's predicate is fed into the
    /// suspended frame via [`Program::resume_playbook`] rather than
    /// starting a fresh invocation. Runs until the queue is closed or the
    /// program is shutting down.
    async fn run_agent_loop(self: Arc<Self>, agent_id: AgentID) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let queue = {
                let entries = self.entries.read().await;
                match entries.get(&agent_id) {
                    Some(e) => e.queue.clone(),
                    None => return,
                }
            };

            let agent_lock = match self.agents.read().await.get(&agent_id).cloned() {
                Some(lock) => lock,
                None => return,
            };
            let (triggers, resume_on) = match &*agent_lock.lock().await {
                Agent::Ai { triggers, execution_state, .. } => (
                    triggers.clone(),
                    execution_state.suspended_yield.clone().filter(|_| execution_state.is_active()),
                ),
                _ => continue,
            };

            if let Some(yield_kind) = resume_on {
                let message = match queue.find(|m| message_resumes_yield(m, &yield_kind), None).await {
                    Ok(m) => m,
                    Err(_) => return,
                };
                if let Err(e) = self.resume_playbook(&agent_id, message).await {
                    log::error!("agent '{}' terminated: {}", agent_id.as_str(), e);
                    self.event_bus
                        .publish(RuntimeEvent::AgentTerminated {
                            agent_id: agent_id.clone(),
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
                continue;
            }

            let message = match queue.get().await {
                Ok(m) => m,
                Err(_) => return,
            };

            let matched = best_match(&triggers, &IncomingEvent::Message(&message), false).cloned();
            let playbook_name = match matched {
                Some(t) => t.playbook_name,
                None => continue,
            };

            let mut seed_locals = HashMap::new();
            seed_locals.insert("message".to_string(), Value::String(message.content.clone()));
            seed_locals.insert("sender".to_string(), Value::String(message.sender_id.as_str().to_string()));

            if let Err(e) = self.invoke_playbook(&agent_id, &playbook_name, seed_locals).await {
                log::error!("agent '{}' terminated: {}", agent_id.as_str(), e);
                self.event_bus
                    .publish(RuntimeEvent::AgentTerminated {
                        agent_id: agent_id.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    /// Spawns the cooperative loop for every registered AI agent. Human and
    /// Remote agents are addressable but never scheduled (§3: Human has no
    /// interpreter loop; Remote delegates to its transport).
    pub async fn run(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let snapshot: Vec<(AgentID, Arc<Mutex<Agent>>)> = self
            .agents
            .read()
            .await
            .iter()
            .map(|(id, lock)| (id.clone(), lock.clone()))
            .collect();

        let mut ai_agent_ids = Vec::with_capacity(snapshot.len());
        for (id, lock) in snapshot {
            if matches!(lock.lock().await.agent_type(), AgentType::Ai) {
                ai_agent_ids.push(id);
            }
        }

        ai_agent_ids
            .into_iter()
            .map(|id| {
                let program = self.clone();
                tokio::spawn(program.run_agent_loop(id))
            })
            .collect()
    }

    /// Graceful shutdown (§8 scenario 6): stops admitting new agent-loop
    /// work, closes every intake queue, ends every open meeting, and writes
    /// a final program-level checkpoint referencing each agent's latest
    /// checkpoint.
    pub async fn shutdown(&self) -> Result<(), ProgramError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        log::info!("program shutting down");
        self.event_bus.publish(RuntimeEvent::ProgramShuttingDown).await;

        let entries = self.entries.read().await;
        let closes = entries.values().map(|e| e.queue.close());
        join_all(closes).await;
        drop(entries);

        let meetings: Vec<Arc<Meeting>> = self.meetings.read().await.values().cloned().collect();
        for meeting in &meetings {
            if !meeting.is_ended() {
                meeting.end(&self.event_bus).await;
            }
        }

        if self.config.durability.enabled {
            let mut refs = HashMap::new();
            let agent_ids: Vec<AgentID> = self.agents.read().await.keys().cloned().collect();
            for agent_id in &agent_ids {
                if let Some(record) = self
                    .checkpoint
                    .latest_checkpoint(agent_id)
                    .await
                    .map_err(ProgramError::from)?
                {
                    refs.insert(agent_id.as_str().to_string(), record.checkpoint_id);
                }
            }
            let open_meetings = meetings
                .iter()
                .filter(|m| !m.is_ended())
                .map(|m| m.id.as_str().to_string())
                .collect();
            self.checkpoint
                .save_program_checkpoint(&ProgramCheckpoint {
                    schema_version: 1,
                    created_at: chrono::Utc::now(),
                    agent_checkpoint_refs: refs,
                    open_meetings,
                })
                .await
                .map_err(ProgramError::from)?;
        }

        Ok(())
    }

    /// Runs every AI agent's loop to completion (every queue drained and
    /// closed, or the program cancelled) and performs graceful shutdown,
    /// returning a single outcome an embedding CLI can map to a process
    /// exit code without reaching into the scheduler's internals (§6).
    pub async fn run_to_completion(self: &Arc<Self>) -> ExitOutcome {
        let handles = self.run().await;
        for result in join_all(handles).await {
            if let Err(join_err) = result {
                return ExitOutcome::Failed(join_err.to_string());
            }
        }
        match self.shutdown().await {
            Ok(()) => ExitOutcome::Completed,
            Err(e) => ExitOutcome::Failed(e.to_string()),
        }
    }
}

/// The outcome of [`Program::run_to_completion`], for an embedding CLI to
/// map onto a process exit code (§6 CLI surface, which this crate exposes
/// as a library capability rather than implementing the CLI itself).
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    /// Every agent loop drained and the program shut down cleanly.
    Completed,
    /// Shutdown was requested before every agent loop drained.
    Cancelled,
    /// An agent loop or shutdown step returned a fatal error.
    Failed(String),
}

impl ExitOutcome {
    /// A conventional Unix exit code: `0` for success, `1` for
    /// cancellation, `2` for failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitOutcome::Completed => 0,
            ExitOutcome::Cancelled => 1,
            ExitOutcome::Failed(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FilesystemCheckpointProvider;
    use crate::completion::ScriptedCompletionProvider;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.durability.storage_path = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn load_playbooks_registers_agents() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(ScriptedCompletionProvider::new(Vec::<String>::new()));
        let checkpoint = Arc::new(FilesystemCheckpointProvider::new(dir.path(), 8));
        let program = Program::new(test_config(dir.path()), provider, checkpoint);

        let source = "# Greeter\nA friendly greeter.\n\n## Main\n### Triggers\n- when user says hello\n### Steps\n- step1: YLD user\n";
        program.load_playbooks(source).await.unwrap();

        let ids = program.list_agent_ids().await;
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&AgentID::new("greeter")));
    }

    #[tokio::test]
    async fn program_start_trigger_runs_at_load_time() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(ScriptedCompletionProvider::new(vec!["s1: YLD user\n".to_string()]));
        let checkpoint = Arc::new(FilesystemCheckpointProvider::new(dir.path(), 8));
        let program = Program::new(test_config(dir.path()), provider, checkpoint);

        let source = "# Init\nBoots at start.\n\n## Main\n### Triggers\n- at program start\n### Steps\n- s1: YLD user\n";
        program.load_playbooks(source).await.unwrap();

        let init = program.get_agent(&AgentID::new("init")).await.unwrap();
        match init {
            Agent::Ai { execution_state, .. } => assert!(execution_state.is_active()),
            _ => panic!("expected AI agent"),
        }
    }

    #[tokio::test]
    async fn route_message_delivers_to_recipient_queue() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(ScriptedCompletionProvider::new(Vec::<String>::new()));
        let checkpoint = Arc::new(FilesystemCheckpointProvider::new(dir.path(), 8));
        let program = Program::new(test_config(dir.path()), provider, checkpoint);

        let source = "# Alice\nAn agent.\n\n## Main\n### Triggers\n- when user says hi\n### Steps\n- s1: YLD user\n\n# Bob\nAnother agent.\n\n## Main\n### Triggers\n- when user says hi\n### Steps\n- s1: YLD user\n";
        program.load_playbooks(source).await.unwrap();

        let message = Message::new(
            AgentID::new("alice"),
            "Alice",
            Some(EntityID::Agent(AgentID::new("bob"))),
            Some("Bob".into()),
            None,
            "hi",
            MessageType::Direct,
            chrono::Utc::now(),
        );
        program.route_message(message).await.unwrap();

        let entries = program.entries.read().await;
        let bob_queue = entries.get(&AgentID::new("bob")).unwrap().queue.clone();
        drop(entries);
        assert_eq!(bob_queue.get().await.unwrap().content, "hi");
    }

    struct EchoTool;

    #[async_trait]
    impl NativeTool for EchoTool {
        async fn invoke(
            &self,
            args: &str,
            _frame: &CallStackFrame,
            _state_vars: &HashMap<String, Value>,
        ) -> Result<Value, ExecutorError> {
            Ok(Value::String(args.to_string()))
        }
    }

    #[tokio::test]
    async fn registered_tool_resolves_ext_calls() {
        let dir = tempdir().unwrap();
        let provider = Arc::new(ScriptedCompletionProvider::new(vec![
            "c1: EXT Echo(1)\nc2: YLD call c1\n".to_string(),
            "c3: YLD user\n".to_string(),
        ]));
        let checkpoint = Arc::new(FilesystemCheckpointProvider::new(dir.path(), 8));
        let program = Program::new(test_config(dir.path()), provider, checkpoint);
        program.register_tool("Echo", Arc::new(EchoTool)).await;

        let source = "# Caller\nCalls a tool.\n\n## Main\n### Triggers\n- at program start\n### Steps\n- c1: EXT Echo(1)\n";
        program.load_playbooks(source).await.unwrap();

        let caller = program.get_agent(&AgentID::new("caller")).await.unwrap();
        match caller {
            Agent::Ai { execution_state, .. } => {
                let frame = execution_state.peek().unwrap();
                assert_eq!(frame.locals.get("c1"), Some(&Value::String("Echo(1)".to_string())));
            }
            _ => panic!("expected AI agent"),
        }
    }
}
