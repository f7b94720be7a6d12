//! In-process typed pub/sub event bus with error isolation (C2).
//!
//! An explicit subscribe/unsubscribe/publish registry rather than a single
//! owner-held callback, since the runtime needs arbitrary components (C9
//! meetings, C10 scheduler, C11 checkpoint coordinator) to subscribe to the
//! same topic independently.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::identifiers::{AgentID, EntityID, MeetingID};

/// Runtime-visible events published by the scheduler, channels, and meeting
/// manager. Every inter-agent visible event flows through this bus (§2).
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    MessageRouted {
        sender_id: AgentID,
        recipient: EntityID,
    },
    AgentStarted {
        agent_id: AgentID,
    },
    AgentTerminated {
        agent_id: AgentID,
        reason: String,
    },
    MeetingOpened {
        meeting_id: MeetingID,
    },
    MeetingAllRequiredJoined {
        meeting_id: MeetingID,
    },
    MeetingEnded {
        meeting_id: MeetingID,
    },
    CheckpointSaved {
        agent_id: AgentID,
        checkpoint_id: String,
    },
    ProgramShuttingDown,
}

/// A subscriber. Implementors should be cheap and non-blocking; long work
/// should be spawned off rather than performed inline, since a slow handler
/// delays delivery to handlers registered after it (ordering guarantee,
/// §4.2).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &RuntimeEvent);
}

/// An ergonomic alternative to [`EventHandler`] for consumers that only
/// care about a handful of event kinds (§11 supplemented feature): every
/// method has a no-op default, so an embedding CLI can override just
/// `on_checkpoint_saved` to log durability activity without writing a
/// `match` over the full [`RuntimeEvent`] enum. Any `T: RuntimeEventHandler`
/// is usable wherever an `Arc<dyn EventHandler>` is expected via
/// [`AsEventHandler`].
#[async_trait]
pub trait RuntimeEventHandler: Send + Sync {
    async fn on_message_routed(&self, _sender_id: &AgentID, _recipient: &EntityID) {}
    async fn on_agent_started(&self, _agent_id: &AgentID) {}
    async fn on_agent_terminated(&self, _agent_id: &AgentID, _reason: &str) {}
    async fn on_meeting_opened(&self, _meeting_id: &MeetingID) {}
    async fn on_meeting_all_required_joined(&self, _meeting_id: &MeetingID) {}
    async fn on_meeting_ended(&self, _meeting_id: &MeetingID) {}
    async fn on_checkpoint_saved(&self, _agent_id: &AgentID, _checkpoint_id: &str) {}
    async fn on_program_shutting_down(&self) {}
}

/// Adapts a [`RuntimeEventHandler`] into an [`EventHandler`] so it can be
/// registered with [`EventBus::subscribe`].
pub struct AsEventHandler<T>(pub T);

#[async_trait]
impl<T: RuntimeEventHandler> EventHandler for AsEventHandler<T> {
    async fn handle(&self, event: &RuntimeEvent) {
        match event {
            RuntimeEvent::MessageRouted { sender_id, recipient } => {
                self.0.on_message_routed(sender_id, recipient).await
            }
            RuntimeEvent::AgentStarted { agent_id } => self.0.on_agent_started(agent_id).await,
            RuntimeEvent::AgentTerminated { agent_id, reason } => {
                self.0.on_agent_terminated(agent_id, reason).await
            }
            RuntimeEvent::MeetingOpened { meeting_id } => self.0.on_meeting_opened(meeting_id).await,
            RuntimeEvent::MeetingAllRequiredJoined { meeting_id } => {
                self.0.on_meeting_all_required_joined(meeting_id).await
            }
            RuntimeEvent::MeetingEnded { meeting_id } => self.0.on_meeting_ended(meeting_id).await,
            RuntimeEvent::CheckpointSaved { agent_id, checkpoint_id } => {
                self.0.on_checkpoint_saved(agent_id, checkpoint_id).await
            }
            RuntimeEvent::ProgramShuttingDown => self.0.on_program_shutting_down().await,
        }
    }
}

struct Subscription {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

/// Opaque handle returned by [`EventBus::subscribe`], passed to
/// [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Inner {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    /// Serializes re-entrant publishes: an event published from inside a
    /// handler is queued here rather than recursed into, and drained
    /// front-to-back by the outermost `publish` call once it finishes the
    /// current event, so multiple re-entrant publishes from one dispatch
    /// are delivered in the order they were published (§4.2).
    pending: Mutex<VecDeque<RuntimeEvent>>,
    publishing: Mutex<bool>,
}

/// Typed, topic-less pub/sub bus: all subscribers see every [`RuntimeEvent`]
/// variant, and filtering by variant is the handler's responsibility.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                pending: Mutex::new(VecDeque::new()),
                publishing: Mutex::new(false),
            }),
        }
    }

    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscriptions
            .lock()
            .await
            .push(Subscription { id, handler });
        SubscriptionId(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .subscriptions
            .lock()
            .await
            .retain(|s| s.id != id.0);
    }

    /// Publishes `event` to every current subscriber in subscription order.
    /// A handler's panic/error is isolated: `handle` is `async` and
    /// infallible by contract, but if a handler implementation wants to
    /// report its own failures it should log them itself rather than
    /// unwind, since this bus does not catch panics across an await point.
    ///
    /// If called re-entrantly (from within a handler that is itself being
    /// invoked by an in-flight `publish`), the event is queued and delivered
    /// after the current publish completes, per the re-entrance-serialized
    /// ordering guarantee.
    pub async fn publish(&self, event: RuntimeEvent) {
        {
            let mut publishing = self.inner.publishing.lock().await;
            if *publishing {
                self.inner.pending.lock().await.push_back(event);
                return;
            }
            *publishing = true;
        }

        self.dispatch(event).await;

        loop {
            let next = self.inner.pending.lock().await.pop_front();
            match next {
                Some(ev) => self.dispatch(ev).await,
                None => break,
            }
        }

        *self.inner.publishing.lock().await = false;
    }

    async fn dispatch(&self, event: RuntimeEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .inner
            .subscriptions
            .lock()
            .await
            .iter()
            .map(|s| s.handler.clone())
            .collect();
        for handler in handlers {
            handler.handle(&event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &RuntimeEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(CountingHandler { count: count.clone() }))
            .await;
        bus.subscribe(Arc::new(CountingHandler { count: count.clone() }))
            .await;

        bus.publish(RuntimeEvent::ProgramShuttingDown).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus
            .subscribe(Arc::new(CountingHandler { count: count.clone() }))
            .await;
        bus.unsubscribe(id).await;

        bus.publish(RuntimeEvent::ProgramShuttingDown).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    struct ReentrantHandler {
        bus: EventBus,
        log: Arc<Mutex<Vec<&'static str>>>,
        fired: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl EventHandler for ReentrantHandler {
        async fn handle(&self, _event: &RuntimeEvent) {
            self.log.lock().await.push("outer");
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.bus.publish(RuntimeEvent::ProgramShuttingDown).await;
            }
        }
    }

    #[tokio::test]
    async fn reentrant_publish_is_queued_not_recursed() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        bus.subscribe(Arc::new(ReentrantHandler {
            bus: bus.clone(),
            log: log.clone(),
            fired,
        }))
        .await;

        bus.publish(RuntimeEvent::ProgramShuttingDown).await;

        // The inner publish happened after the outer dispatch returned, not
        // recursively inside it: two "outer" entries, no stack overflow.
        assert_eq!(log.lock().await.len(), 2);
    }

    struct OrderRecordingHandler {
        bus: EventBus,
        log: Arc<Mutex<Vec<String>>>,
        queued: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl EventHandler for OrderRecordingHandler {
        async fn handle(&self, event: &RuntimeEvent) {
            let label = match event {
                RuntimeEvent::AgentStarted { agent_id } => agent_id.as_str().to_string(),
                _ => "other".to_string(),
            };
            self.log.lock().await.push(label.clone());
            if label == "first" && !self.queued.swap(true, Ordering::SeqCst) {
                self.bus
                    .publish(RuntimeEvent::AgentStarted { agent_id: AgentID::new("second") })
                    .await;
                self.bus
                    .publish(RuntimeEvent::AgentStarted { agent_id: AgentID::new("third") })
                    .await;
            }
        }
    }

    #[tokio::test]
    async fn multiple_reentrant_publishes_are_delivered_in_publish_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let queued = Arc::new(std::sync::atomic::AtomicBool::new(false));
        bus.subscribe(Arc::new(OrderRecordingHandler {
            bus: bus.clone(),
            log: log.clone(),
            queued,
        }))
        .await;

        bus.publish(RuntimeEvent::AgentStarted { agent_id: AgentID::new("first") })
            .await;

        assert_eq!(
            *log.lock().await,
            vec!["first".to_string(), "second".to_string(), "third".to_string()]
        );
    }

    struct CheckpointLogger {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RuntimeEventHandler for CheckpointLogger {
        async fn on_checkpoint_saved(&self, agent_id: &AgentID, checkpoint_id: &str) {
            self.seen
                .lock()
                .await
                .push(format!("{}/{}", agent_id.as_str(), checkpoint_id));
        }
    }

    #[tokio::test]
    async fn runtime_event_handler_ignores_unrelated_events_by_default() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Arc::new(AsEventHandler(CheckpointLogger { seen: seen.clone() })))
            .await;

        bus.publish(RuntimeEvent::AgentStarted {
            agent_id: AgentID::new("a1"),
        })
        .await;
        bus.publish(RuntimeEvent::CheckpointSaved {
            agent_id: AgentID::new("a1"),
            checkpoint_id: "cp1".into(),
        })
        .await;

        assert_eq!(*seen.lock().await, vec!["a1/cp1".to_string()]);
    }
}
