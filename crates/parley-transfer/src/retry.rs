//! Deadline scheduling for retransmission checks.
//!
//! Each armed key fires at most once; the owner decides whether to re-arm it.
//! Dropping or clearing the scheduler cancels every pending deadline.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio_util::time::{DelayQueue, delay_queue};

use parley_types::ClientId;

/// Deadlines a client session keeps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Inbound file: is chunk `seq` still missing? `seq == total` stands for DONE.
    Chunk {
        peer: ClientId,
        transfer: String,
        seq: u32,
    },
    /// Outbound file: the ACK should have arrived by now.
    Ack { transfer: String },
}

impl TimerKey {
    pub fn transfer(&self) -> &str {
        match self {
            Self::Chunk { transfer, .. } | Self::Ack { transfer } => transfer,
        }
    }
}

/// Keyed one-shot timers backed by a `DelayQueue`.
pub struct RetryScheduler<K> {
    queue: DelayQueue<K>,
    armed: HashMap<K, delay_queue::Key>,
}

impl<K> RetryScheduler<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            armed: HashMap::new(),
        }
    }

    /// Arm `key` to fire after `after`, replacing any pending deadline.
    pub fn schedule(&mut self, key: K, after: Duration) {
        match self.armed.get(&key) {
            Some(slot) => self.queue.reset(slot, after),
            None => {
                let slot = self.queue.insert(key.clone(), after);
                self.armed.insert(key, slot);
            }
        }
    }

    /// Arm `key` only if it has no pending deadline. Returns true if armed.
    pub fn schedule_if_idle(&mut self, key: K, after: Duration) -> bool {
        if self.armed.contains_key(&key) {
            return false;
        }
        self.schedule(key, after);
        true
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// Cancel every deadline matching `pred`. Returns how many were cancelled.
    pub fn cancel_where(&mut self, pred: impl Fn(&K) -> bool) -> usize {
        let doomed: Vec<K> = self.armed.keys().filter(|k| pred(k)).cloned().collect();
        for key in &doomed {
            self.cancel(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.armed.clear();
    }

    /// Wait for the next deadline. Resolves to `None` immediately when nothing
    /// is armed, so callers should guard on `is_empty`.
    pub async fn expired(&mut self) -> Option<K> {
        let expired = std::future::poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let key = expired.into_inner();
        self.armed.remove(&key);
        Some(key)
    }
}

impl<K> Default for RetryScheduler<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
