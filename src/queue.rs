//! Offline message queue.
//!
//! Application messages bound for the uplink wait here while no bridge is
//! reachable. The queue is bounded; when it fills up it makes room by
//! evicting the oldest LOW entry, then the oldest NORMAL entry. HIGH and
//! CRITICAL entries are never evicted for capacity, and an incoming
//! message never evicts anything more important than itself.
//!
//! CRITICAL entries (and HIGH ones when configured) are mirrored to a
//! [`QueueStore`] and replayed when the queue is rebuilt after a restart.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use treemesh::{MessagePriority, MessageQueue, QueueConfig, Timestamp};
//!
//! let mut queue = MessageQueue::new(QueueConfig::default().with_capacity(2));
//! let now = Timestamp::ZERO;
//! queue.enqueue(Bytes::from_static(b"t=21.5"), "telemetry", MessagePriority::Low, now).unwrap();
//! queue.enqueue(Bytes::from_static(b"smoke"), "alarms", MessagePriority::Critical, now).unwrap();
//!
//! let drained = queue.flush();
//! assert_eq!(drained[0].priority, MessagePriority::Critical);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::priority::MessagePriority;
use crate::storage::{QueueStore, StoredMessage};
use crate::types::Timestamp;

/// A message waiting for a path to the uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Queue id, unique per node.
    pub id: u32,
    /// Priority class.
    pub priority: MessagePriority,
    /// Opaque payload.
    pub payload: Bytes,
    /// Destination outside the mesh (topic, URL, ...).
    pub destination: String,
    /// When the message was queued.
    pub created_at: Timestamp,
    /// Failed delivery attempts.
    pub attempts: u32,
}

impl QueuedMessage {
    fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            id: self.id,
            priority: self.priority,
            payload: self.payload.clone(),
            destination: self.destination.clone(),
            attempts: self.attempts,
            timestamp: self.created_at.as_micros(),
        }
    }

    fn from_stored(stored: StoredMessage) -> Self {
        Self {
            id: stored.id,
            priority: stored.priority,
            payload: stored.payload,
            destination: stored.destination,
            created_at: Timestamp::from_micros(stored.timestamp),
            attempts: stored.attempts,
        }
    }
}

/// Fill level of the queue, reported when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueState {
    /// Nothing queued.
    Empty,
    /// Below 75% of capacity.
    Normal,
    /// At or above 75% of capacity.
    NearlyFull,
    /// At capacity.
    Full,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages accepted.
    pub total_queued: u64,
    /// Messages handed out for delivery.
    pub total_sent: u64,
    /// Messages refused because the queue was full.
    pub total_dropped: u64,
    /// Messages evicted to make room.
    pub total_evicted: u64,
    /// Messages given up after too many attempts, or pruned.
    pub total_failed: u64,
    /// Largest size seen.
    pub peak_size: usize,
}

/// Result of one [`MessageQueue::flush_with`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Messages the callback accepted.
    pub sent: usize,
    /// Messages that stay queued for another attempt.
    pub retained: usize,
    /// Messages dropped after reaching the attempt ceiling.
    pub dropped: usize,
}

/// Bounded, priority-ordered message queue.
pub struct MessageQueue {
    config: QueueConfig,
    levels: [VecDeque<QueuedMessage>; 4],
    next_id: u32,
    state: QueueState,
    events: Vec<QueueState>,
    stats: QueueStats,
    store: Option<Arc<dyn QueueStore>>,
}

impl MessageQueue {
    /// Create an empty queue without persistence.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            levels: Default::default(),
            next_id: 1,
            state: QueueState::Empty,
            events: Vec::new(),
            stats: QueueStats::default(),
            store: None,
        }
    }

    /// Create a queue mirrored to `store`, replaying what it holds.
    ///
    /// Restored entries keep their ids; new ids continue after the
    /// largest restored one.
    pub fn with_store(config: QueueConfig, store: Arc<dyn QueueStore>) -> Result<Self> {
        let mut queue = Self::new(config);
        queue.store = Some(store);
        queue.restore()?;
        Ok(queue)
    }

    fn restore(&mut self) -> Result<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let mut records = store.load_all()?;
        records.sort_by_key(|r| (r.priority, r.id));
        let mut count = 0;
        let mut overflow = 0;
        for record in records {
            self.next_id = self.next_id.max(record.id.wrapping_add(1)).max(1);
            // Capacity may have shrunk since the records were written. The
            // most important and oldest entries come back first.
            if self.len() >= self.config.capacity {
                overflow += 1;
                if let Err(err) = store.remove(record.id) {
                    tracing::warn!(id = record.id, error = %err, "failed to remove persisted message");
                }
                continue;
            }
            let msg = QueuedMessage::from_stored(record);
            self.levels[msg.priority.index()].push_back(msg);
            count += 1;
        }
        if overflow > 0 {
            self.stats.total_dropped += overflow as u64;
            tracing::warn!(
                dropped = overflow,
                capacity = self.config.capacity,
                "persisted queue exceeds capacity"
            );
        }
        if count > 0 {
            tracing::info!(restored = count, "replayed persisted queue entries");
        }
        self.stats.peak_size = self.stats.peak_size.max(self.len());
        self.update_state();
        Ok(count)
    }

    fn is_persisted(&self, priority: MessagePriority) -> bool {
        self.store.is_some()
            && self.config.persist
            && (priority == MessagePriority::Critical
                || (priority == MessagePriority::High && self.config.persist_high))
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Queue a message.
    ///
    /// Fails with [`Error::QueueFull`] when the queue is at capacity and
    /// holds no LOW or NORMAL entry the new message may displace.
    pub fn enqueue(
        &mut self,
        payload: Bytes,
        destination: impl Into<String>,
        priority: MessagePriority,
        now: Timestamp,
    ) -> Result<u32> {
        if self.len() >= self.config.capacity && !self.make_room(priority) {
            self.stats.total_dropped += 1;
            tracing::warn!(
                priority = priority.name(),
                capacity = self.config.capacity,
                "message queue full"
            );
            return Err(Error::QueueFull {
                priority,
                capacity: self.config.capacity,
            });
        }

        let msg = QueuedMessage {
            id: self.allocate_id(),
            priority,
            payload,
            destination: destination.into(),
            created_at: now,
            attempts: 0,
        };
        if self.is_persisted(priority) {
            if let Some(store) = &self.store {
                store.save(&msg.to_stored())?;
            }
        }
        let id = msg.id;
        self.levels[priority.index()].push_back(msg);
        self.stats.total_queued += 1;
        self.stats.peak_size = self.stats.peak_size.max(self.len());
        self.update_state();
        Ok(id)
    }

    /// Evict one entry no more important than `incoming`, LOW first.
    fn make_room(&mut self, incoming: MessagePriority) -> bool {
        for victim in [MessagePriority::Low, MessagePriority::Normal] {
            if victim < incoming {
                continue;
            }
            if let Some(evicted) = self.levels[victim.index()].pop_front() {
                self.stats.total_evicted += 1;
                tracing::debug!(
                    id = evicted.id,
                    evicted = victim.name(),
                    incoming = incoming.name(),
                    "evicted queued message to make room"
                );
                return true;
            }
        }
        false
    }

    /// Remove and return every message, CRITICAL first, FIFO per level.
    pub fn flush(&mut self) -> Vec<QueuedMessage> {
        let mut out = Vec::with_capacity(self.len());
        for priority in MessagePriority::ALL {
            out.extend(self.levels[priority.index()].drain(..));
        }
        for msg in &out {
            self.unpersist(msg);
        }
        self.stats.total_sent += out.len() as u64;
        self.update_state();
        out
    }

    /// Offer each message to `deliver` in priority order.
    ///
    /// Accepted messages are removed. Refused ones count an attempt and
    /// are dropped once they reach the attempt ceiling.
    pub fn flush_with<F>(&mut self, mut deliver: F) -> FlushReport
    where
        F: FnMut(&QueuedMessage) -> bool,
    {
        let mut report = FlushReport::default();
        for priority in MessagePriority::ALL {
            let level = std::mem::take(&mut self.levels[priority.index()]);
            let mut kept = VecDeque::with_capacity(level.len());
            for mut msg in level {
                if deliver(&msg) {
                    report.sent += 1;
                    self.stats.total_sent += 1;
                    self.unpersist(&msg);
                    continue;
                }
                msg.attempts += 1;
                if msg.attempts >= self.config.max_attempts {
                    report.dropped += 1;
                    self.stats.total_failed += 1;
                    tracing::warn!(
                        id = msg.id,
                        attempts = msg.attempts,
                        "dropping message after repeated delivery failures"
                    );
                    self.unpersist(&msg);
                } else {
                    report.retained += 1;
                    self.persist_update(&msg);
                    kept.push_back(msg);
                }
            }
            self.levels[priority.index()] = kept;
        }
        self.update_state();
        report
    }

    /// Put back a message whose delivery failed.
    ///
    /// Returns `Ok(false)` when the message reached its attempt ceiling
    /// and was dropped instead.
    pub fn retry(&mut self, mut msg: QueuedMessage) -> Result<bool> {
        msg.attempts += 1;
        if msg.attempts >= self.config.max_attempts {
            self.stats.total_failed += 1;
            self.unpersist(&msg);
            return Ok(false);
        }
        if self.len() >= self.config.capacity && !self.make_room(msg.priority) {
            self.stats.total_dropped += 1;
            self.unpersist(&msg);
            return Err(Error::QueueFull {
                priority: msg.priority,
                capacity: self.config.capacity,
            });
        }
        if self.is_persisted(msg.priority) {
            if let Some(store) = &self.store {
                store.save(&msg.to_stored())?;
            }
        }
        let level = &mut self.levels[msg.priority.index()];
        let pos = level.iter().position(|m| m.id > msg.id).unwrap_or(level.len());
        level.insert(pos, msg);
        self.update_state();
        Ok(true)
    }

    /// Drop messages older than `max_age`, whatever their priority.
    pub fn prune(&mut self, now: Timestamp, max_age: Duration) -> usize {
        let mut pruned = Vec::new();
        for level in &mut self.levels {
            level.retain(|m| {
                let stale = now.saturating_duration_since(m.created_at) > max_age;
                if stale {
                    pruned.push(m.clone());
                }
                !stale
            });
        }
        for msg in &pruned {
            self.unpersist(msg);
        }
        self.stats.total_failed += pruned.len() as u64;
        if !pruned.is_empty() {
            tracing::debug!(pruned = pruned.len(), "pruned stale queued messages");
        }
        self.update_state();
        pruned.len()
    }

    /// Remove one message by id.
    pub fn remove(&mut self, id: u32) -> Option<QueuedMessage> {
        for level in &mut self.levels {
            if let Some(pos) = level.iter().position(|m| m.id == id) {
                let msg = level.remove(pos);
                if let Some(msg) = &msg {
                    self.unpersist(msg);
                }
                self.update_state();
                return msg;
            }
        }
        None
    }

    /// Look up one message by id.
    pub fn get(&self, id: u32) -> Option<&QueuedMessage> {
        self.levels.iter().flatten().find(|m| m.id == id)
    }

    /// Next message that [`flush`](Self::flush) would return.
    pub fn peek(&self) -> Option<&QueuedMessage> {
        self.levels.iter().find_map(|l| l.front())
    }

    /// Drop everything, including persisted copies.
    pub fn clear(&mut self) -> usize {
        let n = self.len();
        for level in &mut self.levels {
            level.clear();
        }
        if let Some(store) = &self.store {
            if let Err(err) = store.clear() {
                tracing::warn!(error = %err, "failed to clear queue store");
            }
        }
        self.update_state();
        n
    }

    /// Total queued messages.
    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    /// Messages queued at one priority.
    pub fn len_priority(&self, priority: MessagePriority) -> usize {
        self.levels[priority.index()].len()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Current fill level.
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Counters.
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Fill level changes since the last call.
    pub fn take_events(&mut self) -> Vec<QueueState> {
        std::mem::take(&mut self.events)
    }

    fn unpersist(&self, msg: &QueuedMessage) {
        if !self.is_persisted(msg.priority) {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(err) = store.remove(msg.id) {
                tracing::warn!(id = msg.id, error = %err, "failed to remove persisted message");
            }
        }
    }

    fn persist_update(&self, msg: &QueuedMessage) {
        if !self.is_persisted(msg.priority) {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(err) = store.save(&msg.to_stored()) {
                tracing::warn!(id = msg.id, error = %err, "failed to update persisted message");
            }
        }
    }

    fn update_state(&mut self) {
        let len = self.len();
        let capacity = self.config.capacity;
        let state = if len == 0 {
            QueueState::Empty
        } else if len >= capacity {
            QueueState::Full
        } else if len * 4 >= capacity * 3 {
            QueueState::NearlyFull
        } else {
            QueueState::Normal
        };
        if state != self.state {
            tracing::debug!(from = ?self.state, to = ?state, len, "queue state changed");
            self.state = state;
            self.events.push(state);
        }
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len())
            .field("capacity", &self.config.capacity)
            .field("state", &self.state)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
