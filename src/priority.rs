//! Message priorities and the per-link outbound lanes.
//!
//! Every frame leaving a node carries one of four priorities. A connection
//! keeps one bounded FIFO lane per priority and drains the lanes by
//! deficit round robin, so a burst of telemetry never blocks topology or
//! election frames and telemetry still gets a turn.
//!
//! | Priority | Typical traffic                          | Evictable |
//! |----------|------------------------------------------|-----------|
//! | Critical | alarms, must survive capacity pressure    | no        |
//! | High     | node sync, elections, time sync           | no        |
//! | Normal   | application data                          | yes       |
//! | Low      | telemetry                                 | yes       |

use std::collections::VecDeque;

/// How urgent a message is. `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MessagePriority {
    /// Alarms and other messages that must get through.
    Critical = 0,
    /// Mesh control traffic.
    High = 1,
    /// Application data.
    #[default]
    Normal = 2,
    /// Telemetry.
    Low = 3,
}

impl MessagePriority {
    /// Most urgent first.
    pub const ALL: [MessagePriority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Position in [`Self::ALL`], equal to the wire value.
    #[inline]
    pub fn index(self) -> usize {
        usize::from(self as u8)
    }

    /// Inverse of [`Self::index`].
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Lowercase label for logs and metrics.
    pub fn name(self) -> &'static str {
        ["critical", "high", "normal", "low"][self.index()]
    }

    /// A full offline queue may throw this message away for a newer one.
    pub fn is_evictable(self) -> bool {
        self >= Self::Normal
    }
}

impl TryFrom<u8> for MessagePriority {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, u8> {
        Self::from_index(usize::from(raw)).ok_or(raw)
    }
}

/// Lane sizes and drain weights, indexed by [`MessagePriority::index`].
#[derive(Debug, Clone)]
pub struct PriorityConfig {
    /// Frames a lane holds before refusing more.
    pub lane_depths: [usize; 4],
    /// Frames a lane may send per drain round. Zero parks the lane until
    /// every weighted lane is empty.
    pub weights: [u32; 4],
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            lane_depths: [32, 64, 64, 32],
            weights: [8, 4, 2, 1],
        }
    }
}

impl PriorityConfig {
    /// Sets how many frames the lane for `priority` holds.
    pub fn with_depth(mut self, priority: MessagePriority, depth: usize) -> Self {
        self.lane_depths[priority.index()] = depth;
        self
    }

    /// Sets the per-round send quota of the lane for `priority`.
    pub fn with_weight(mut self, priority: MessagePriority, weight: u32) -> Self {
        self.weights[priority.index()] = weight;
        self
    }

    /// Lane depth for `priority`.
    pub fn depth(&self, priority: MessagePriority) -> usize {
        self.lane_depths[priority.index()]
    }
}

#[derive(Debug)]
struct Lane<T> {
    frames: VecDeque<T>,
    depth: usize,
    weight: usize,
}

impl<T> Lane<T> {
    fn is_full(&self) -> bool {
        self.frames.len() >= self.depth
    }
}

/// Bounded four-lane queue drained by deficit round robin.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    lanes: [Lane<T>; 4],
    stats: PriorityQueueStats,
}

impl<T> PriorityQueue<T> {
    /// Creates empty lanes sized by `config`.
    pub fn new(config: PriorityConfig) -> Self {
        let lane = |i: usize| Lane {
            frames: VecDeque::new(),
            depth: config.lane_depths[i],
            weight: config.weights[i] as usize,
        };
        Self {
            lanes: [lane(0), lane(1), lane(2), lane(3)],
            stats: PriorityQueueStats::default(),
        }
    }

    /// Appends `item` to its lane. A full lane hands the item back.
    pub fn push(&mut self, item: T, priority: MessagePriority) -> Result<(), T> {
        let i = priority.index();
        let lane = &mut self.lanes[i];
        if lane.is_full() {
            self.stats.dropped[i] += 1;
            return Err(item);
        }
        lane.frames.push_back(item);
        self.stats.enqueued[i] += 1;
        Ok(())
    }

    /// Takes the oldest frame of the most urgent non-empty lane.
    pub fn pop(&mut self) -> Option<(T, MessagePriority)> {
        let priority = MessagePriority::ALL
            .into_iter()
            .find(|p| !self.lanes[p.index()].frames.is_empty())?;
        self.take(priority)
    }

    /// Takes up to `count` frames.
    ///
    /// Each round visits the lanes most urgent first and lets every lane
    /// send up to its weight. Rounds repeat until `count` frames are out or
    /// the weighted lanes run dry; zero-weight lanes then fill what is left.
    pub fn pop_batch(&mut self, count: usize) -> Vec<(T, MessagePriority)> {
        let mut out = Vec::with_capacity(count.min(self.len()));
        loop {
            let before = out.len();
            for priority in MessagePriority::ALL {
                let quota = self.lanes[priority.index()].weight;
                for _ in 0..quota {
                    if out.len() == count {
                        return out;
                    }
                    match self.take(priority) {
                        Some(entry) => out.push(entry),
                        None => break,
                    }
                }
            }
            if out.len() == before {
                break;
            }
        }
        while out.len() < count {
            match self.pop() {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        out
    }

    fn take(&mut self, priority: MessagePriority) -> Option<(T, MessagePriority)> {
        let i = priority.index();
        let item = self.lanes[i].frames.pop_front()?;
        self.stats.dequeued[i] += 1;
        Some((item, priority))
    }

    /// Empties every lane and returns how many frames were discarded.
    pub fn clear(&mut self) -> usize {
        self.lanes.iter_mut().map(|lane| lane.frames.drain(..).count()).sum()
    }

    /// True when no lane holds a frame.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.frames.is_empty())
    }

    /// Frames across all lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.frames.len()).sum()
    }

    /// Frames waiting in one lane.
    pub fn len_priority(&self, priority: MessagePriority) -> usize {
        self.lanes[priority.index()].frames.len()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> &PriorityQueueStats {
        &self.stats
    }
}

/// Lifetime counters per lane.
#[derive(Debug, Default, Clone)]
pub struct PriorityQueueStats {
    /// Frames accepted.
    pub enqueued: [u64; 4],
    /// Frames handed out.
    pub dequeued: [u64; 4],
    /// Pushes refused by a full lane.
    pub dropped: [u64; 4],
}

impl PriorityQueueStats {
    /// Accepted frames for one priority.
    pub fn enqueued(&self, priority: MessagePriority) -> u64 {
        self.enqueued[priority.index()]
    }

    /// Handed-out frames for one priority.
    pub fn dequeued(&self, priority: MessagePriority) -> u64 {
        self.dequeued[priority.index()]
    }

    /// Refused frames for one priority.
    pub fn dropped(&self, priority: MessagePriority) -> u64 {
        self.dropped[priority.index()]
    }

    /// Refused frames across all priorities.
    pub fn total_dropped(&self) -> u64 {
        self.dropped.iter().sum()
    }
}
