//! Clock synchronisation.
//!
//! Each node keeps a signed offset that turns its local clock into mesh
//! time. Offsets are refined through NTP-style exchanges with neighbours:
//!
//! ```text
//!   requester                 responder
//!   t0 ──── Request{t0} ────▶ t1
//!   t3 ◀── Reply{t0,t1,t2} ── t2
//!
//!   offset = ((t1 - t0) + (t2 - t3)) / 2
//! ```
//!
//! Only the side that should follow the other one adopts. Rooted sides
//! never adopt from unrooted ones, so corrections flow outward from the
//! root and offsets compose along the tree.

use std::time::Duration;

use crate::types::{NodeId, Timestamp};

/// Adjustments larger than this trigger a fast resync.
pub const FAST_RESYNC_THRESHOLD_US: i64 = 10_000;

/// One side of a link, as seen by the adoption rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideInfo {
    /// Node at this end of the link.
    pub node_id: NodeId,
    /// Nodes on this side, link excluded.
    pub size: usize,
    /// Whether this side contains the mesh root.
    pub rooted: bool,
}

/// Whether `ours` should adopt the time of `theirs`.
///
/// The side containing the root is authoritative. Otherwise the smaller
/// side adopts; equal sizes are settled in favour of the higher node id.
pub fn should_adopt(ours: SideInfo, theirs: SideInfo) -> bool {
    if ours.rooted != theirs.rooted {
        return theirs.rooted;
    }
    if ours.size != theirs.size {
        return ours.size < theirs.size;
    }
    theirs.node_id > ours.node_id
}

/// Offset sample from one exchange, in microseconds.
pub fn offset_sample(t0: u64, t1: u64, t2: u64, t3: u64) -> i64 {
    let a = t1 as i64 - t0 as i64;
    let b = t2 as i64 - t3 as i64;
    (a + b) / 2
}

/// One-way delay estimate from one exchange, in microseconds.
pub fn delay_sample(t0: u64, t1: u64, t2: u64, t3: u64) -> u64 {
    let round_trip = t3.saturating_sub(t0);
    let processing = t2.saturating_sub(t1);
    round_trip.saturating_sub(processing) / 2
}

/// Per-connection exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// Nothing outstanding.
    #[default]
    Idle,
    /// We asked the peer to run an exchange from its side.
    RequestSent {
        /// When the ask went out.
        at: Timestamp,
    },
    /// Our request is out; waiting for the reply.
    AwaitingResponse {
        /// Mesh time stamped into the request.
        t0: u64,
    },
    /// The last exchange finished and its sample was applied.
    Applied {
        /// Adjustment that was applied, microseconds.
        adjustment: i64,
    },
}

/// Exchange bookkeeping for one connection.
#[derive(Debug, Clone, Default)]
pub struct SyncSession {
    phase: SyncPhase,
    next_sync: Timestamp,
    rounds: u32,
}

impl SyncSession {
    /// A session whose first exchange is due at `first`.
    pub fn new(first: Timestamp) -> Self {
        Self {
            phase: SyncPhase::Idle,
            next_sync: first,
            rounds: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Whether an exchange should start now.
    ///
    /// Outstanding exchanges older than `timeout` are abandoned.
    pub fn is_due(&self, now: Timestamp, timeout: Duration) -> bool {
        match self.phase {
            SyncPhase::RequestSent { at } => now.saturating_duration_since(at) >= timeout,
            SyncPhase::AwaitingResponse { .. } => now >= self.next_sync + timeout,
            _ => now >= self.next_sync,
        }
    }

    /// Record that we asked the peer to start.
    pub fn mark_start_sent(&mut self, now: Timestamp) {
        self.phase = SyncPhase::RequestSent { at: now };
    }

    /// Record our request; returns nothing, the caller sends `t0`.
    pub fn mark_request_sent(&mut self, t0: u64) {
        self.phase = SyncPhase::AwaitingResponse { t0 };
    }

    /// Whether a reply echoing `t0` matches our outstanding request.
    pub fn accepts_reply(&self, t0: u64) -> bool {
        matches!(self.phase, SyncPhase::AwaitingResponse { t0: pending } if pending == t0)
    }

    /// The peer took over the exchange; we are the responder now.
    pub fn mark_responding(&mut self, now: Timestamp, interval: Duration) {
        self.phase = SyncPhase::Idle;
        self.next_sync = now + interval;
    }

    /// Finish the round and schedule the next one.
    pub fn complete(&mut self, now: Timestamp, adjustment: i64, interval: Duration) {
        self.phase = SyncPhase::Applied { adjustment };
        self.rounds += 1;
        self.next_sync = now + interval;
    }

    /// Time the next exchange is due.
    pub fn next_sync(&self) -> Timestamp {
        self.next_sync
    }

    /// Completed rounds.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}

/// The node's mesh clock.
#[derive(Debug, Clone)]
pub struct TimeSynchronizer {
    offset: i64,
    alpha: f64,
    samples: u64,
}

impl TimeSynchronizer {
    /// Create a synchroniser with smoothing weight `alpha`.
    pub fn new(alpha: f64) -> Self {
        Self {
            offset: 0,
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            samples: 0,
        }
    }

    /// Current offset in microseconds.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Samples applied so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Mesh time for a local clock reading.
    pub fn mesh_time(&self, local: Timestamp) -> u64 {
        (local.as_micros() as i64).saturating_add(self.offset).max(0) as u64
    }

    /// Blend a correction `sample` (relative to the current offset) in.
    ///
    /// The first sample is taken as is. Later samples move the offset by
    /// `alpha * sample`, so the result always lies between the old offset
    /// and `old + sample`. Returns the applied adjustment.
    pub fn apply(&mut self, sample: i64) -> i64 {
        let adjustment = if self.samples == 0 {
            sample
        } else {
            (sample as f64 * self.alpha).round() as i64
        };
        self.offset = self.offset.saturating_add(adjustment);
        self.samples += 1;
        tracing::trace!(
            sample,
            adjustment,
            offset = self.offset,
            "applied time offset sample"
        );
        adjustment
    }

    /// Interval until the next exchange given the last adjustment.
    pub fn next_interval(adjustment: i64, regular: Duration, fast: Duration) -> Duration {
        if adjustment.abs() > FAST_RESYNC_THRESHOLD_US {
            fast
        } else {
            regular
        }
    }
}
