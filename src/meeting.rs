//! Meeting lifecycle and event-driven attendee coordination (C9).
//!
//! An owner-governed lifecycle with an event-driven "all required
//! attendees joined" gate: waiters block on a `Notify` rather than polling,
//! and the gate fires exactly once per meeting.

use crate::channel::Channel;
use crate::error::MeetingError;
use crate::event::{EventBus, RuntimeEvent};
use crate::identifiers::{AgentID, MeetingID};
use crate::message::{Message, MessageType};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// A named multi-party channel with owner-governed lifecycle (§3).
pub struct Meeting {
    pub id: MeetingID,
    pub owner_id: AgentID,
    pub required_attendees: Vec<AgentID>,
    pub optional_attendees: Vec<AgentID>,
    joined_attendees: RwLock<HashSet<AgentID>>,
    all_required_joined: Notify,
    ended: std::sync::atomic::AtomicBool,
    channel: Arc<Channel>,
}

impl Meeting {
    pub fn new(
        id: MeetingID,
        owner_id: AgentID,
        required_attendees: Vec<AgentID>,
        optional_attendees: Vec<AgentID>,
        channel: Arc<Channel>,
    ) -> Self {
        Meeting {
            id,
            owner_id,
            required_attendees,
            optional_attendees,
            joined_attendees: RwLock::new(HashSet::new()),
            all_required_joined: Notify::new(),
            ended: std::sync::atomic::AtomicBool::new(false),
            channel,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Registers `attendee_id` as joined and, if that completes the
    /// required set, wakes every `wait_all_required_joined` waiter.
    pub async fn record_join(&self, attendee_id: AgentID, event_bus: &EventBus) {
        let mut joined = self.joined_attendees.write().await;
        joined.insert(attendee_id);
        let all_joined = self
            .required_attendees
            .iter()
            .all(|a| joined.contains(a));
        drop(joined);
        if all_joined {
            self.all_required_joined.notify_waiters();
            log::info!("meeting '{}' has all required attendees", self.id.as_str());
            event_bus
                .publish(RuntimeEvent::MeetingAllRequiredJoined {
                    meeting_id: self.id.clone(),
                })
                .await;
        }
    }

    /// Suspends until every required attendee has joined. Returns
    /// immediately if `required_attendees` is empty (§8 boundary
    /// condition).
    pub async fn wait_all_required_joined(&self) -> Result<(), MeetingError> {
        if self.required_attendees.is_empty() {
            return Ok(());
        }
        loop {
            if self.is_ended() {
                return Err(MeetingError::MeetingClosed);
            }
            {
                let joined = self.joined_attendees.read().await;
                if self.required_attendees.iter().all(|a| joined.contains(a)) {
                    return Ok(());
                }
            }
            self.all_required_joined.notified().await;
        }
    }

    /// Broadcasts `content` to the meeting channel, in the owner's emission
    /// order (callers are expected to serialize their own `broadcast`
    /// calls; the channel itself preserves per-sender FIFO, §5).
    pub async fn broadcast(
        &self,
        content: impl Into<String>,
        target_agent_ids: HashSet<AgentID>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), MeetingError> {
        if self.is_ended() {
            return Err(MeetingError::MeetingClosed);
        }
        let message = Message::new(
            self.owner_id.clone(),
            "meeting-owner",
            Some(crate::identifiers::EntityID::Meeting(self.id.clone())),
            None,
            Some(self.id.clone()),
            content,
            MessageType::MeetingBroadcast,
            created_at,
        )
        .with_target_agent_ids(target_agent_ids);
        self.channel
            .deliver(message)
            .await
            .map_err(|_| MeetingError::MeetingClosed)?;
        Ok(())
    }

    /// Ends the meeting: closes the channel to new traffic and wakes any
    /// pending `wait_all_required_joined` so it can fail with
    /// [`MeetingError::MeetingClosed`].
    pub async fn end(&self, event_bus: &EventBus) {
        self.ended.store(true, std::sync::atomic::Ordering::SeqCst);
        log::info!("meeting '{}' ended", self.id.as_str());
        self.all_required_joined.notify_waiters();
        event_bus
            .publish(RuntimeEvent::MeetingEnded {
                meeting_id: self.id.clone(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    #[tokio::test]
    async fn empty_required_attendees_returns_immediately() {
        let channel = Arc::new(Channel::new_meeting("meeting:m1".into(), MeetingID::new("m1")));
        let meeting = Meeting::new(MeetingID::new("m1"), AgentID::new("host"), vec![], vec![], channel);
        meeting.wait_all_required_joined().await.unwrap();
    }

    #[tokio::test]
    async fn wait_unblocks_when_all_required_join() {
        let channel = Arc::new(Channel::new_meeting("meeting:m1".into(), MeetingID::new("m1")));
        let meeting = Arc::new(Meeting::new(
            MeetingID::new("m1"),
            AgentID::new("host"),
            vec![AgentID::new("a1"), AgentID::new("a2")],
            vec![],
            channel,
        ));
        let bus = EventBus::new();
        let m2 = meeting.clone();
        let bus2 = bus.clone();
        let waiter = tokio::spawn(async move { m2.wait_all_required_joined().await });

        meeting.record_join(AgentID::new("a1"), &bus).await;
        meeting.record_join(AgentID::new("a2"), &bus2).await;

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ended_meeting_fails_pending_waits() {
        let channel = Arc::new(Channel::new_meeting("meeting:m1".into(), MeetingID::new("m1")));
        let meeting = Arc::new(Meeting::new(
            MeetingID::new("m1"),
            AgentID::new("host"),
            vec![AgentID::new("a1")],
            vec![],
            channel,
        ));
        let bus = EventBus::new();
        let m2 = meeting.clone();
        let waiter = tokio::spawn(async move { m2.wait_all_required_joined().await });
        tokio::task::yield_now().await;
        meeting.end(&bus).await;
        assert_eq!(waiter.await.unwrap(), Err(MeetingError::MeetingClosed));
    }
}
