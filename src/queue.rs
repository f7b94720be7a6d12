//! Per-agent async priority message intake (C3).
//!
//! Built from the concurrency primitives this codebase already leans on for
//! shared mutable state elsewhere (`Arc<tokio::sync::RwLock<_>>` around a
//! registry) generalized here to `tokio::sync::Mutex` guarding a
//! priority-ordered buffer plus a `tokio::sync::Notify` to wake waiters, the
//! idiomatic tokio equivalent of a condition-variable-backed queue.

use crate::error::QueueError;
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

struct Entry {
    priority: u8,
    seq: u64,
    message: Message,
}

struct State {
    entries: VecDeque<Entry>,
    closed: bool,
}

/// An async, priority-ordered, per-agent message queue.
///
/// `put`/`get`/`find` form the primitives the per-agent loop (C10) and the
/// `WaitForMessage` directive (C8) are built from. Each message is delivered
/// at most once to exactly one consumer: `get`/`find` remove the entry they
/// return.
pub struct AgentQueue {
    state: Mutex<State>,
    notify: Notify,
    seq: AtomicU64,
}

impl Default for AgentQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentQueue {
    pub fn new() -> Self {
        AgentQueue {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueues `message` at `priority` (lower = higher priority). FIFO
    /// among equal priorities. Fails with [`QueueError::QueueClosed`] if
    /// `close` was already called.
    pub async fn put(&self, message: Message, priority: u8) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::QueueClosed);
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let pos = state
            .entries
            .iter()
            .position(|e| e.priority > priority)
            .unwrap_or(state.entries.len());
        state.entries.insert(pos, Entry { priority, seq, message });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Awaits and removes the highest-priority, earliest-enqueued message.
    pub async fn get(&self) -> Result<Message, QueueError> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.entries.pop_front() {
                    return Ok(entry.message);
                }
                if state.closed {
                    return Err(QueueError::QueueClosed);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Awaits and removes the first queued message matching `predicate`,
    /// scanning in priority/FIFO order. With `timeout_duration` set, returns
    /// [`QueueError::Timeout`] if no match arrives in time — including
    /// synchronously for a zero duration when nothing already queued
    /// matches (§8 boundary condition).
    pub async fn find<F>(
        &self,
        mut predicate: F,
        timeout_duration: Option<Duration>,
    ) -> Result<Message, QueueError>
    where
        F: FnMut(&Message) -> bool,
    {
        let scan = async {
            loop {
                {
                    let mut state = self.state.lock().await;
                    if let Some(pos) = state.entries.iter().position(|e| predicate(&e.message)) {
                        let entry = state.entries.remove(pos).expect("position just found");
                        return Ok(entry.message);
                    }
                    if state.closed {
                        return Err(QueueError::QueueClosed);
                    }
                }
                self.notify.notified().await;
            }
        };

        match timeout_duration {
            None => scan.await,
            Some(d) => match timeout(d, scan).await {
                Ok(result) => result,
                Err(_) => Err(QueueError::Timeout),
            },
        }
    }

    /// Marks the queue closed: further `put`s fail, and outstanding/future
    /// `get`/`find` calls fail once the buffer drains, per the "drains and
    /// refuses further puts" contract.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Shareable handle, since C10 hands the same queue to both the producer
/// (routing) and consumer (agent loop) sides.
pub type SharedQueue = Arc<AgentQueue>;
