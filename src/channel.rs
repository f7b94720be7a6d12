//! Direct and meeting channels, participants, and stream observers (C4).
//!
//! A channel owns a participant set and fans a message out to all of them;
//! observers subscribe independently for the stream-chunk fan-out, with
//! per-recipient filtering applied at delivery time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::QueueError;
use crate::identifiers::{AgentID, EntityID, MeetingID};
use crate::message::{Message, MessageType, StreamEvent, StreamResult};
use crate::queue::SharedQueue;

/// An adapter delivering a [`Message`] to one concrete agent. Direct
/// delivery enqueues onto the agent's intake queue (C3); a human participant
/// may additionally expose a custom synchronous delivery handler (§9 Open
/// Question — resolved in `DESIGN.md` as "synchronous, under the agent
/// loop").
#[derive(Clone)]
pub struct Participant {
    pub id: AgentID,
    pub queue: SharedQueue,
    pub is_human: bool,
    pub streaming_enabled: bool,
}

impl Participant {
    pub fn new(id: AgentID, queue: SharedQueue) -> Self {
        Participant {
            id,
            queue,
            is_human: false,
            streaming_enabled: false,
        }
    }

    pub fn human(id: AgentID, queue: SharedQueue, streaming_enabled: bool) -> Self {
        Participant {
            id,
            queue,
            is_human: true,
            streaming_enabled,
        }
    }
}

/// Observes [`StreamEvent`]s flowing through a channel. `target_human_id`
/// implements the observer filter policy from §4.4: `Some(h)` receives
/// events whose `recipient_id` is `None` or equals `h`; `None` receives all
/// events.
#[async_trait]
pub trait StreamObserver: Send + Sync {
    fn target_human_id(&self) -> Option<&AgentID>;
    async fn on_event(&self, event: StreamEvent);
}

fn observer_matches(target: Option<&AgentID>, recipient_id: Option<&EntityID>) -> bool {
    match target {
        None => true,
        Some(h) => match recipient_id {
            None => true,
            Some(EntityID::Agent(a)) => a == h,
            Some(EntityID::Meeting(_)) => false,
        },
    }
}

/// A channel connecting a stable participant set: either a direct (pair)
/// channel or a meeting channel.
pub struct Channel {
    id: String,
    meeting_id: Option<MeetingID>,
    participants: RwLock<HashMap<AgentID, Participant>>,
    observers: Mutex<Vec<Arc<dyn StreamObserver>>>,
    stream_seq: AtomicU64,
    next_chunk_index: Mutex<HashMap<String, usize>>,
}

impl Channel {
    pub fn new_direct(id: String, a: Participant, b: Participant) -> Self {
        let mut map = HashMap::new();
        map.insert(a.id.clone(), a);
        map.insert(b.id.clone(), b);
        Channel {
            id,
            meeting_id: None,
            participants: RwLock::new(map),
            observers: Mutex::new(Vec::new()),
            stream_seq: AtomicU64::new(0),
            next_chunk_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn new_meeting(id: String, meeting_id: MeetingID) -> Self {
        Channel {
            id,
            meeting_id: Some(meeting_id),
            participants: RwLock::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            stream_seq: AtomicU64::new(0),
            next_chunk_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn add_participant(&self, participant: Participant) {
        self.participants
            .write()
            .await
            .insert(participant.id.clone(), participant);
    }

    pub async fn remove_participant(&self, id: &AgentID) {
        self.participants.write().await.remove(id);
    }

    pub async fn add_observer(&self, observer: Arc<dyn StreamObserver>) {
        self.observers.lock().await.push(observer);
    }

    /// For each participant other than the sender, enqueues `message` with
    /// priority derived from its [`MessageType`] (§4.4).
    pub async fn deliver(&self, message: Message) -> Result<(), QueueError> {
        let participants = self.participants.read().await;
        let priority = message.message_type.default_priority();
        for (id, participant) in participants.iter() {
            if *id == message.sender_id {
                continue;
            }
            participant.queue.put(message.clone(), priority).await?;
        }
        Ok(())
    }

    /// If at least one participant is a human with streaming enabled and the
    /// recipient predicate matches them, allocates a stream id and notifies
    /// matching observers of the start. Otherwise returns `skip()`.
    pub async fn start_stream(
        &self,
        sender_id: &AgentID,
        sender_klass: &str,
        recipient_id: Option<EntityID>,
    ) -> StreamResult {
        let has_streaming_human = {
            let participants = self.participants.read().await;
            participants.values().any(|p| {
                p.is_human
                    && p.streaming_enabled
                    && recipient_matches_participant(recipient_id.as_ref(), &p.id)
            })
        };

        if !has_streaming_human {
            return StreamResult::skip();
        }

        let stream_id = format!(
            "stream-{}-{}",
            self.id,
            self.stream_seq.fetch_add(1, Ordering::SeqCst)
        );
        self.next_chunk_index
            .lock()
            .await
            .insert(stream_id.clone(), 0);

        self.notify_observers(StreamEvent::Start {
            stream_id: stream_id.clone(),
            sender_id: sender_id.clone(),
            sender_klass: sender_klass.to_string(),
            recipient_id,
            meeting_id: self.meeting_id.clone(),
        })
        .await;

        StreamResult::start(stream_id)
    }

    pub async fn stream_chunk(
        &self,
        stream_id: &str,
        chunk: impl Into<String>,
        recipient_id: Option<EntityID>,
        is_final: bool,
    ) {
        let chunk_index = {
            let mut indices = self.next_chunk_index.lock().await;
            let entry = indices.entry(stream_id.to_string()).or_insert(0);
            let current = *entry;
            *entry += 1;
            current
        };
        self.notify_observers(StreamEvent::Chunk {
            stream_id: stream_id.to_string(),
            chunk: chunk.into(),
            chunk_index,
            recipient_id,
            meeting_id: self.meeting_id.clone(),
            is_final,
        })
        .await;
    }

    pub async fn complete_stream(
        &self,
        stream_id: &str,
        recipient_id: Option<EntityID>,
        cancelled: bool,
    ) {
        self.next_chunk_index.lock().await.remove(stream_id);
        self.notify_observers(StreamEvent::Complete {
            stream_id: stream_id.to_string(),
            recipient_id,
            meeting_id: self.meeting_id.clone(),
            cancelled,
        })
        .await;
    }

    async fn notify_observers(&self, event: StreamEvent) {
        let observers = self.observers.lock().await.clone();
        for observer in observers {
            if observer_matches(observer.target_human_id(), event.recipient_id()) {
                observer.on_event(event.clone()).await;
            }
        }
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }
}

fn recipient_matches_participant(recipient_id: Option<&EntityID>, participant: &AgentID) -> bool {
    match recipient_id {
        None => true,
        Some(EntityID::Agent(a)) => a == participant,
        Some(EntityID::Meeting(_)) => true,
    }
}

/// Registry of channels keyed by canonical channel id, with atomic
/// insert-if-absent so concurrent creation requests for the same
/// participant set (or meeting) converge on one [`Channel`] (§8 scenario 2).
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<HashMap<String, Arc<Channel>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the existing channel for `id`, or inserts and returns
    /// `build()`'s result if absent. `build` only runs when there truly is
    /// no existing entry, because the whole operation holds the registry
    /// lock for its duration.
    pub async fn get_or_create<F>(&self, id: String, build: F) -> Arc<Channel>
    where
        F: FnOnce() -> Channel,
    {
        let mut channels = self.channels.lock().await;
        channels
            .entry(id)
            .or_insert_with(|| Arc::new(build()))
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.lock().await.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::direct_channel_id;
    use crate::queue::AgentQueue;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    struct RecordingObserver {
        target: Option<AgentID>,
        events: Arc<StdMutex<Vec<StreamEvent>>>,
    }

    #[async_trait]
    impl StreamObserver for RecordingObserver {
        fn target_human_id(&self) -> Option<&AgentID> {
            self.target.as_ref()
        }
        async fn on_event(&self, event: StreamEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn deliver_skips_sender_and_reaches_others() {
        let a1 = AgentID::new("a1");
        let a2 = AgentID::new("a2");
        let qa = Arc::new(AgentQueue::new());
        let qb = Arc::new(AgentQueue::new());
        let channel = Channel::new_direct(
            direct_channel_id(&a1, &a2),
            Participant::new(a1.clone(), qa.clone()),
            Participant::new(a2.clone(), qb.clone()),
        );

        let msg = Message::new(
            a1.clone(),
            "A",
            Some(EntityID::Agent(a2.clone())),
            Some("B".into()),
            None,
            "hi",
            MessageType::Direct,
            Utc::now(),
        );
        channel.deliver(msg).await.unwrap();

        assert!(qa.is_empty().await);
        assert_eq!(qb.get().await.unwrap().content, "hi");
    }

    #[tokio::test]
    async fn non_human_only_channel_skips_stream() {
        let a1 = AgentID::new("a1");
        let a2 = AgentID::new("a2");
        let channel = Channel::new_direct(
            direct_channel_id(&a1, &a2),
            Participant::new(a1.clone(), Arc::new(AgentQueue::new())),
            Participant::new(a2.clone(), Arc::new(AgentQueue::new())),
        );
        let result = channel.start_stream(&a1, "A", None).await;
        assert!(!result.should_stream);
    }

    #[tokio::test]
    async fn targeted_observer_only_sees_matching_recipient() {
        let alice = AgentID::new("alice");
        let bob = AgentID::new("bob");
        let channel = Channel::new_meeting("meeting:m1".into(), MeetingID::new("m1"));
        let alice_events = Arc::new(StdMutex::new(Vec::new()));
        let bob_events = Arc::new(StdMutex::new(Vec::new()));
        channel
            .add_observer(Arc::new(RecordingObserver {
                target: None,
                events: alice_events.clone(),
            }))
            .await;
        channel
            .add_observer(Arc::new(RecordingObserver {
                target: Some(bob.clone()),
                events: bob_events.clone(),
            }))
            .await;

        channel.start_stream(&alice, "Host", None).await;
        channel
            .start_stream(&alice, "Host", Some(EntityID::Agent(bob.clone())))
            .await;

        assert_eq!(alice_events.lock().unwrap().len(), 2);
        assert_eq!(bob_events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn registry_get_or_create_converges_under_concurrency() {
        let registry = ChannelRegistry::new();
        let a1 = AgentID::new("a1");
        let a2 = AgentID::new("a2");
        let id = direct_channel_id(&a1, &a2);

        let r1 = registry.clone();
        let r2 = registry.clone();
        let id1 = id.clone();
        let id2 = id.clone();
        let a1c = a1.clone();
        let a2c = a2.clone();
        let (c1, c2) = tokio::join!(
            async move {
                r1.get_or_create(id1, || {
                    Channel::new_direct(
                        "x".into(),
                        Participant::new(a1c.clone(), Arc::new(AgentQueue::new())),
                        Participant::new(a2c.clone(), Arc::new(AgentQueue::new())),
                    )
                })
                .await
            },
            async move {
                r2.get_or_create(id2, || {
                    Channel::new_direct(
                        "y".into(),
                        Participant::new(a1.clone(), Arc::new(AgentQueue::new())),
                        Participant::new(a2.clone(), Arc::new(AgentQueue::new())),
                    )
                })
                .await
            },
        );
        assert!(Arc::ptr_eq(&c1, &c2));
    }
}
