//! Distributed bridge election.
//!
//! When the primary bridge has been unhealthy for longer than the grace
//! period, every node holding uplink credentials announces itself and
//! collects the announcements of the others for a fixed window. All
//! participants then rank the same pool with [`select_winner`] and agree
//! on a winner without another round of messages.
//!
//! ```text
//! Idle ─▶ Candidacy ─▶ Collecting ─▶ Selecting ─▶ Promoting ─▶ Idle
//!  ▲  (grace+jitter)    (window)        │ lost          │ uplink result
//!  └────────────────────────────────────┴───────────────┘
//! ```
//!
//! The winner never reconfigures itself from inside the election step.
//! It returns [`ElectionAction::Promote`] and the mesh defers the actual
//! role switch to the next scheduler turn.

use std::cmp::{Ordering, Reverse};
use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;

use crate::config::ElectionConfig;
use crate::types::{NodeId, Timestamp};

/// Rounds kept in the election history.
pub const ELECTION_HISTORY_LEN: usize = 10;

/// One node's bid for the bridge role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionCandidate {
    /// Candidate node.
    pub node_id: NodeId,
    /// Measured signal to the router, dBm.
    pub router_rssi: i8,
    /// Candidate uptime in milliseconds.
    pub uptime_ms: u64,
    /// Free memory estimate in bytes.
    pub free_memory: u32,
}

impl ElectionCandidate {
    fn rank(&self) -> (i8, u64, u32, Reverse<NodeId>) {
        (
            self.router_rssi,
            self.uptime_ms,
            self.free_memory,
            Reverse(self.node_id),
        )
    }
}

/// Order candidates from worst to best.
///
/// Signal strength first, then uptime, then free memory, then the lower
/// node id.
pub fn compare_candidates(a: &ElectionCandidate, b: &ElectionCandidate) -> Ordering {
    a.rank().cmp(&b.rank())
}

/// Pick the winner of a candidate pool.
///
/// Depends only on the set of candidates, not on their order.
pub fn select_winner(candidates: &[ElectionCandidate]) -> Option<ElectionCandidate> {
    candidates.iter().copied().max_by(compare_candidates)
}

/// Election phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// No election running.
    Idle,
    /// Waiting for the random delay before announcing.
    Candidacy {
        /// When the announcement goes out.
        announce_at: Timestamp,
    },
    /// Gathering announcements.
    Collecting {
        /// End of the collection window.
        until: Timestamp,
    },
    /// Ranking the pool. Transient.
    Selecting,
    /// This node won and is bringing up its uplink.
    Promoting,
}

impl ElectionState {
    /// Whether an election is in progress.
    pub fn is_running(&self) -> bool {
        !matches!(self, ElectionState::Idle)
    }
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node won.
    Won,
    /// Another node won.
    Lost,
    /// The only candidate had too weak a signal.
    Rejected,
    /// A takeover announcement ended the round.
    Superseded,
    /// Isolated node promoting itself without an election.
    Isolated,
    /// The round ran without this node, which was off the mesh, and the
    /// winner became known from its takeover announcement.
    Observed,
}

/// One finished round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionRecord {
    /// Round counter.
    pub round: u32,
    /// When the local candidacy went out.
    pub started_at: Timestamp,
    /// When the round ended.
    pub finished_at: Timestamp,
    /// Pool size at selection.
    pub candidates: usize,
    /// Selected node, if any.
    pub winner: Option<NodeId>,
    /// How it ended.
    pub outcome: ElectionOutcome,
}

/// Snapshot of node state the coordinator decides on.
#[derive(Debug, Clone, Copy)]
pub struct ElectionInputs {
    /// Current time.
    pub now: Timestamp,
    /// A healthy, internet-connected bridge is known.
    pub bridge_healthy: bool,
    /// This node currently acts as bridge.
    pub is_bridge: bool,
    /// Established mesh connections.
    pub established: usize,
    /// Consecutive scans that did not see the mesh.
    pub empty_scans: u16,
    /// Current signal to the router; `0` when the router is not visible.
    pub router_rssi: i8,
    /// Local uptime, milliseconds.
    pub uptime_ms: u64,
    /// Free memory estimate.
    pub free_memory: u32,
}

/// What the mesh should do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionAction {
    /// Broadcast our candidacy.
    Announce(ElectionCandidate),
    /// Become the bridge. Must be deferred to the next turn.
    Promote {
        /// Why.
        reason: &'static str,
    },
    /// This node was the only candidate but its signal is too weak. It
    /// stays a regular node.
    Decline {
        /// Why.
        reason: &'static str,
    },
}

/// Reason reported when a lone candidate is too weak to promote.
pub const WEAK_SIGNAL_REASON: &str = "insufficient signal quality for isolated bridge";

#[derive(Debug, Default, Clone, Copy)]
struct IsolatedRetry {
    attempts: u8,
    last_attempt: Option<Timestamp>,
    first_attempt: Option<Timestamp>,
}

/// Runs the election state machine for one node.
#[derive(Debug)]
pub struct ElectionCoordinator {
    local: NodeId,
    config: ElectionConfig,
    has_credentials: bool,
    state: ElectionState,
    pool: Vec<ElectionCandidate>,
    early: Vec<(Timestamp, ElectionCandidate)>,
    absent_since: Option<Timestamp>,
    started_at: Timestamp,
    last_role_change: Option<Timestamp>,
    winner_hold_until: Option<Timestamp>,
    round: u32,
    history: VecDeque<ElectionRecord>,
    isolated: IsolatedRetry,
}

impl ElectionCoordinator {
    /// Create a coordinator. Nodes without uplink credentials never run.
    pub fn new(local: NodeId, config: ElectionConfig, has_credentials: bool) -> Self {
        Self {
            local,
            config,
            has_credentials,
            state: ElectionState::Idle,
            pool: Vec::new(),
            early: Vec::new(),
            absent_since: None,
            started_at: Timestamp::ZERO,
            last_role_change: None,
            winner_hold_until: None,
            round: 0,
            history: VecDeque::with_capacity(ELECTION_HISTORY_LEN),
            isolated: IsolatedRetry::default(),
        }
    }

    /// Current phase.
    pub fn state(&self) -> ElectionState {
        self.state
    }

    /// Finished rounds, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ElectionRecord> {
        self.history.iter()
    }

    /// Candidates gathered in the running round.
    pub fn pool(&self) -> &[ElectionCandidate] {
        &self.pool
    }

    /// Whether this node takes part at all.
    pub fn participates(&self) -> bool {
        self.config.enabled && self.has_credentials
    }

    fn within_promotion_cooldown(&self, now: Timestamp) -> bool {
        self.last_role_change
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.min_promotion_interval)
    }

    fn local_candidate(&self, inputs: &ElectionInputs) -> ElectionCandidate {
        ElectionCandidate {
            node_id: self.local,
            router_rssi: inputs.router_rssi,
            uptime_ms: inputs.uptime_ms,
            free_memory: inputs.free_memory,
        }
    }

    /// Advance the state machine. Called every monitor interval and
    /// whenever a deadline may have passed.
    pub fn tick<R: Rng + ?Sized>(
        &mut self,
        inputs: ElectionInputs,
        rng: &mut R,
    ) -> Vec<ElectionAction> {
        let now = inputs.now;
        self.prune_early(now);

        if !self.participates() || inputs.is_bridge {
            self.absent_since = None;
            return Vec::new();
        }
        if now.saturating_duration_since(Timestamp::ZERO) < self.config.startup_delay {
            return Vec::new();
        }

        match self.state {
            ElectionState::Idle => self.tick_idle(&inputs, rng),
            ElectionState::Candidacy { announce_at } => {
                if inputs.bridge_healthy {
                    tracing::debug!(node = %self.local, "bridge recovered, dropping candidacy");
                    self.reset();
                    return Vec::new();
                }
                if now < announce_at {
                    return Vec::new();
                }
                let me = self.local_candidate(&inputs);
                self.round += 1;
                self.started_at = now;
                self.pool = self.early.drain(..).map(|(_, c)| c).collect();
                self.add_to_pool(me);
                self.state = ElectionState::Collecting {
                    until: now + self.config.collection_window,
                };
                tracing::info!(
                    node = %self.local,
                    round = self.round,
                    rssi = me.router_rssi,
                    seeded = self.pool.len() - 1,
                    "election started"
                );
                vec![ElectionAction::Announce(me)]
            }
            ElectionState::Collecting { until } => {
                if now < until {
                    return Vec::new();
                }
                self.state = ElectionState::Selecting;
                self.select(now)
            }
            ElectionState::Selecting | ElectionState::Promoting => Vec::new(),
        }
    }

    fn tick_idle<R: Rng + ?Sized>(
        &mut self,
        inputs: &ElectionInputs,
        rng: &mut R,
    ) -> Vec<ElectionAction> {
        let now = inputs.now;

        if inputs.established == 0 {
            self.absent_since = None;
            return self.try_isolated(inputs);
        }
        self.isolated = IsolatedRetry::default();

        if inputs.bridge_healthy {
            self.absent_since = None;
            return Vec::new();
        }
        let absent_since = *self.absent_since.get_or_insert(now);

        if inputs.empty_scans >= self.config.empty_scan_defer_threshold {
            tracing::debug!(
                empty_scans = inputs.empty_scans,
                "election deferred until the channel is re-acquired"
            );
            return Vec::new();
        }
        if inputs.router_rssi == 0 {
            tracing::trace!(node = %self.local, "router not visible, cannot stand");
            return Vec::new();
        }
        if self.within_promotion_cooldown(now) {
            return Vec::new();
        }
        if self.winner_hold_until.is_some_and(|until| now < until) {
            return Vec::new();
        }
        if now.saturating_duration_since(absent_since) < self.config.grace_period {
            return Vec::new();
        }

        let jitter = random_between(
            rng,
            self.config.random_delay_min,
            self.config.random_delay_max,
        );
        self.state = ElectionState::Candidacy {
            announce_at: now + jitter,
        };
        tracing::debug!(
            node = %self.local,
            jitter_ms = jitter.as_millis() as u64,
            "bridge absent past grace period, preparing candidacy"
        );
        Vec::new()
    }

    fn try_isolated(&mut self, inputs: &ElectionInputs) -> Vec<ElectionAction> {
        let now = inputs.now;
        if inputs.bridge_healthy
            || inputs.empty_scans < self.config.isolated_scan_threshold
            || inputs.router_rssi == 0
            || inputs.router_rssi < self.config.minimum_bridge_rssi
            || self.within_promotion_cooldown(now)
        {
            return Vec::new();
        }

        let retry = &mut self.isolated;
        if retry.attempts >= self.config.isolated_retry_max_attempts {
            let since_first = retry
                .first_attempt
                .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
            if since_first < self.config.isolated_retry_reset {
                return Vec::new();
            }
            *retry = IsolatedRetry::default();
        }
        if retry
            .last_attempt
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.isolated_retry_interval)
        {
            return Vec::new();
        }
        retry.attempts += 1;
        retry.last_attempt = Some(now);
        retry.first_attempt.get_or_insert(now);

        tracing::info!(
            node = %self.local,
            attempt = retry.attempts,
            rssi = inputs.router_rssi,
            "isolated node attempting bridge promotion"
        );
        self.round += 1;
        self.started_at = now;
        self.record(now, 1, Some(self.local), ElectionOutcome::Isolated);
        self.state = ElectionState::Promoting;
        vec![ElectionAction::Promote {
            reason: "isolated node with router access",
        }]
    }

    fn select(&mut self, now: Timestamp) -> Vec<ElectionAction> {
        let pool_size = self.pool.len();
        let winner = select_winner(&self.pool);

        let rejected = pool_size == 1
            && winner.is_some_and(|w| w.router_rssi < self.config.minimum_bridge_rssi);
        if rejected {
            tracing::warn!(
                node = %self.local,
                min_rssi = self.config.minimum_bridge_rssi,
                "sole candidate below signal threshold, no promotion"
            );
            self.record(now, pool_size, None, ElectionOutcome::Rejected);
            self.reset_after_round(now);
            return vec![ElectionAction::Decline {
                reason: WEAK_SIGNAL_REASON,
            }];
        }

        let Some(winner) = winner else {
            self.reset_after_round(now);
            return Vec::new();
        };

        if winner.node_id == self.local {
            tracing::info!(node = %self.local, candidates = pool_size, "won bridge election");
            self.record(now, pool_size, Some(winner.node_id), ElectionOutcome::Won);
            self.pool.clear();
            self.state = ElectionState::Promoting;
            vec![ElectionAction::Promote {
                reason: "won bridge election",
            }]
        } else {
            tracing::info!(
                node = %self.local,
                winner = %winner.node_id,
                candidates = pool_size,
                "lost bridge election"
            );
            self.record(now, pool_size, Some(winner.node_id), ElectionOutcome::Lost);
            self.reset_after_round(now);
            // The winner gets one promotion interval to bring its uplink up
            // and reach us before another round may start.
            self.winner_hold_until = Some(now + self.config.min_promotion_interval);
            Vec::new()
        }
    }

    /// A candidacy arrived from the mesh.
    ///
    /// Only the first announcement of each node per round counts.
    /// Announcements arriving before our own round starts are kept for one
    /// collection window and seed the pool.
    pub fn on_candidacy(&mut self, candidate: ElectionCandidate, now: Timestamp) {
        if candidate.node_id == self.local {
            return;
        }
        match self.state {
            ElectionState::Collecting { .. } => self.add_to_pool(candidate),
            ElectionState::Idle | ElectionState::Candidacy { .. } => {
                self.prune_early(now);
                if !self.early.iter().any(|(_, c)| c.node_id == candidate.node_id) {
                    self.early.push((now, candidate));
                }
            }
            ElectionState::Selecting | ElectionState::Promoting => {}
        }
    }

    /// Another node announced it took over.
    pub fn on_takeover(&mut self, new_bridge: NodeId, now: Timestamp) {
        if new_bridge == self.local {
            return;
        }
        match self.state {
            ElectionState::Candidacy { .. } | ElectionState::Collecting { .. } => {
                tracing::info!(node = %self.local, bridge = %new_bridge, "election superseded by takeover");
                let pool = self.pool.len();
                self.record(now, pool, Some(new_bridge), ElectionOutcome::Superseded);
            }
            ElectionState::Idle => self.on_bridge_replaced(new_bridge, now),
            _ => {}
        }
        if self.state != ElectionState::Promoting {
            self.reset();
        }
        self.early.clear();
    }

    /// A bridge that was lost has been replaced by `new_bridge`, learned
    /// from a takeover or from its first status report. Records the round
    /// this node missed.
    pub fn on_bridge_replaced(&mut self, new_bridge: NodeId, now: Timestamp) {
        if new_bridge == self.local || !self.participates() {
            return;
        }
        match self.state {
            ElectionState::Idle => {}
            ElectionState::Candidacy { .. } => {
                tracing::debug!(node = %self.local, bridge = %new_bridge, "bridge replaced, dropping candidacy");
                self.reset();
            }
            _ => return,
        }
        let known = self
            .history
            .back()
            .is_some_and(|r| r.winner == Some(new_bridge));
        if known {
            return;
        }
        tracing::info!(node = %self.local, bridge = %new_bridge, "missed election, adopting its winner");
        self.started_at = now;
        self.record(now, 0, Some(new_bridge), ElectionOutcome::Observed);
    }

    /// Outcome of the uplink bring-up that followed a promotion.
    pub fn on_promotion_result(&mut self, success: bool, now: Timestamp) {
        self.last_role_change = Some(now);
        self.reset();
        if success {
            self.isolated = IsolatedRetry::default();
        } else {
            self.absent_since = Some(now);
        }
    }

    /// Record a role change made outside the election.
    pub fn note_role_change(&mut self, now: Timestamp) {
        self.last_role_change = Some(now);
    }

    fn add_to_pool(&mut self, candidate: ElectionCandidate) {
        if !self.pool.iter().any(|c| c.node_id == candidate.node_id) {
            self.pool.push(candidate);
        }
    }

    fn prune_early(&mut self, now: Timestamp) {
        let window = self.config.collection_window;
        self.early
            .retain(|(at, _)| now.saturating_duration_since(*at) < window);
    }

    fn reset(&mut self) {
        self.state = ElectionState::Idle;
        self.pool.clear();
        self.absent_since = None;
    }

    fn reset_after_round(&mut self, now: Timestamp) {
        self.reset();
        self.absent_since = Some(now);
    }

    fn record(
        &mut self,
        now: Timestamp,
        candidates: usize,
        winner: Option<NodeId>,
        outcome: ElectionOutcome,
    ) {
        if self.history.len() == ELECTION_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(ElectionRecord {
            round: self.round,
            started_at: self.started_at,
            finished_at: now,
            candidates,
            winner,
            outcome,
        });
    }
}

fn random_between<R: Rng + ?Sized>(rng: &mut R, min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rng.random_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cand(id: u32, rssi: i8, uptime: u64, mem: u32) -> ElectionCandidate {
        ElectionCandidate {
            node_id: NodeId::new(id),
            router_rssi: rssi,
            uptime_ms: uptime,
            free_memory: mem,
        }
    }

    fn config() -> ElectionConfig {
        ElectionConfig::default()
            .with_startup_delay(Duration::ZERO)
            .with_grace_period(Duration::from_secs(2))
            .with_collection_window(Duration::from_secs(5))
    }

    fn inputs(now: Timestamp, healthy: bool) -> ElectionInputs {
        ElectionInputs {
            now,
            bridge_healthy: healthy,
            is_bridge: false,
            established: 1,
            empty_scans: 0,
            router_rssi: -50,
            uptime_ms: 10_000,
            free_memory: 50_000,
        }
    }

    /// Tick every 100ms until `until`, collecting actions.
    fn run(
        coord: &mut ElectionCoordinator,
        from: Timestamp,
        until: Timestamp,
        healthy: bool,
        rng: &mut StdRng,
    ) -> Vec<ElectionAction> {
        let mut out = Vec::new();
        let mut now = from;
        while now <= until {
            out.extend(coord.tick(inputs(now, healthy), rng));
            now += Duration::from_millis(100);
        }
        out
    }

    #[test]
    fn test_tiebreak_order() {
        let a = cand(5, -50, 100, 10);
        assert_eq!(select_winner(&[a, cand(1, -60, 999, 999)]), Some(a));
        let longer = cand(6, -50, 200, 0);
        assert_eq!(select_winner(&[a, longer]), Some(longer));
        let roomier = cand(7, -50, 100, 20);
        assert_eq!(select_winner(&[a, roomier]), Some(roomier));
        let lower_id = cand(2, -50, 100, 10);
        assert_eq!(select_winner(&[a, lower_id]), Some(lower_id));
        assert_eq!(select_winner(&[]), None);
    }

    #[test]
    fn test_selection_ignores_order() {
        let pool = vec![
            cand(3, -55, 10, 10),
            cand(8, -40, 5, 5),
            cand(1, -40, 5, 5),
            cand(9, -70, 99, 99),
        ];
        let expected = select_winner(&pool);
        let mut reversed = pool.clone();
        reversed.reverse();
        assert_eq!(select_winner(&reversed), expected);
        assert_eq!(expected.map(|c| c.node_id), Some(NodeId::new(1)));
    }

    #[test]
    fn test_no_credentials_never_runs() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), false);
        let mut rng = StdRng::seed_from_u64(1);
        let actions = run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(20), false, &mut rng);
        assert!(actions.is_empty());
        assert_eq!(coord.state(), ElectionState::Idle);
    }

    #[test]
    fn test_lone_candidate_wins_after_grace_and_window() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        let actions = run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(12), false, &mut rng);
        assert!(matches!(actions[0], ElectionAction::Announce(c) if c.node_id == NodeId::new(1)));
        assert!(matches!(actions[1], ElectionAction::Promote { .. }));
        assert_eq!(coord.state(), ElectionState::Promoting);
        let record = coord.history().last().unwrap();
        assert_eq!(record.outcome, ElectionOutcome::Won);
    }

    #[test]
    fn test_stronger_remote_candidate_wins() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        // Arrives before our own round: seeds the pool.
        coord.on_candidacy(cand(2, -30, 1, 1), Timestamp::from_secs(1));
        let actions = run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(12), false, &mut rng);
        assert!(matches!(actions[0], ElectionAction::Announce(_)));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ElectionAction::Promote { .. })));
        let record = coord.history().next().unwrap();
        assert_eq!(record.winner, Some(NodeId::new(2)));
        assert_eq!(record.candidates, 2);
        assert_eq!(record.outcome, ElectionOutcome::Lost);
    }

    #[test]
    fn test_lost_round_waits_for_winner() {
        let cfg = config().with_min_promotion_interval(Duration::from_secs(30));
        let mut coord = ElectionCoordinator::new(NodeId::new(1), cfg, true);
        let mut rng = StdRng::seed_from_u64(1);
        coord.on_candidacy(cand(2, -30, 1, 1), Timestamp::from_secs(1));
        run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(12), false, &mut rng);
        assert_eq!(coord.history().count(), 1);

        // The winner never reports; no new round until the hold expires.
        let quiet = run(
            &mut coord,
            Timestamp::from_secs(13),
            Timestamp::from_secs(30),
            false,
            &mut rng,
        );
        assert!(quiet.is_empty());
        assert_eq!(coord.state(), ElectionState::Idle);

        let later = run(
            &mut coord,
            Timestamp::from_secs(45),
            Timestamp::from_secs(60),
            false,
            &mut rng,
        );
        assert!(matches!(later.first(), Some(ElectionAction::Announce(_))));
    }

    #[test]
    fn test_first_candidacy_per_node_counts() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(2);
        run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(6), false, &mut rng);
        assert!(matches!(coord.state(), ElectionState::Collecting { .. }));
        coord.on_candidacy(cand(2, -90, 1, 1), Timestamp::from_secs(6));
        coord.on_candidacy(cand(2, -10, 1, 1), Timestamp::from_secs(6));
        assert_eq!(coord.pool().len(), 2);
        assert!(coord.pool().iter().any(|c| c.router_rssi == -90));
    }

    #[test]
    fn test_weak_sole_candidate_rejected() {
        let cfg = config().with_minimum_bridge_rssi(-40);
        let mut coord = ElectionCoordinator::new(NodeId::new(1), cfg, true);
        let mut rng = StdRng::seed_from_u64(1);
        let actions = run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(12), false, &mut rng);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ElectionAction::Promote { .. })));
        assert_eq!(
            coord.history().next().map(|r| r.outcome),
            Some(ElectionOutcome::Rejected)
        );
        assert!(actions.contains(&ElectionAction::Decline {
            reason: WEAK_SIGNAL_REASON
        }));
    }

    #[test]
    fn test_healthy_bridge_prevents_election() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        let actions = run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(30), true, &mut rng);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_startup_delay() {
        let cfg = config().with_startup_delay(Duration::from_secs(60));
        let mut coord = ElectionCoordinator::new(NodeId::new(1), cfg, true);
        let mut rng = StdRng::seed_from_u64(1);
        let actions = run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(30), false, &mut rng);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_takeover_ends_round() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(6), false, &mut rng);
        assert!(coord.state().is_running());
        coord.on_takeover(NodeId::new(4), Timestamp::from_secs(6));
        assert_eq!(coord.state(), ElectionState::Idle);
        assert_eq!(
            coord.history().last().map(|r| r.outcome),
            Some(ElectionOutcome::Superseded)
        );
    }

    #[test]
    fn test_idle_node_learns_winner_from_takeover() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        coord.on_takeover(NodeId::new(4), Timestamp::from_secs(9));
        coord.on_takeover(NodeId::new(4), Timestamp::from_secs(10));
        let records: Vec<_> = coord.history().cloned().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, ElectionOutcome::Observed);
        assert_eq!(records[0].winner, Some(NodeId::new(4)));
        assert_eq!(records[0].candidates, 0);
        assert_eq!(coord.state(), ElectionState::Idle);

        let mut bystander = ElectionCoordinator::new(NodeId::new(2), config(), false);
        bystander.on_takeover(NodeId::new(4), Timestamp::from_secs(9));
        assert!(bystander.history().next().is_none());
    }

    #[test]
    fn test_replacement_bridge_ends_pending_candidacy() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        // Grace period passed, announcement not yet sent.
        run(&mut coord, Timestamp::ZERO, Timestamp::from_millis(2_000), false, &mut rng);
        assert!(matches!(coord.state(), ElectionState::Candidacy { .. }));

        coord.on_bridge_replaced(NodeId::new(3), Timestamp::from_millis(2_100));
        assert_eq!(coord.state(), ElectionState::Idle);
        let record = coord.history().last().cloned().unwrap();
        assert_eq!(record.outcome, ElectionOutcome::Observed);
        assert_eq!(record.winner, Some(NodeId::new(3)));
    }

    #[test]
    fn test_loser_does_not_record_takeover_twice() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        coord.on_candidacy(cand(2, -30, 1, 1), Timestamp::from_secs(1));
        run(&mut coord, Timestamp::ZERO, Timestamp::from_secs(12), false, &mut rng);
        coord.on_takeover(NodeId::new(2), Timestamp::from_secs(13));
        assert_eq!(coord.history().count(), 1);
        assert_eq!(
            coord.history().last().map(|r| r.outcome),
            Some(ElectionOutcome::Lost)
        );
    }

    #[test]
    fn test_promotion_cooldown() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        coord.on_promotion_result(false, Timestamp::from_secs(1));
        let actions = run(
            &mut coord,
            Timestamp::from_secs(1),
            Timestamp::from_secs(50),
            false,
            &mut rng,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn test_deferred_while_scans_empty() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        for i in 0..100u64 {
            let mut input = inputs(Timestamp::from_millis(i * 100), false);
            input.empty_scans = 3;
            assert!(coord.tick(input, &mut rng).is_empty());
        }
        assert_eq!(coord.state(), ElectionState::Idle);
    }

    #[test]
    fn test_isolated_retry_budget() {
        let mut cfg = config();
        cfg.isolated_retry_reset = Duration::from_secs(500);
        let mut coord = ElectionCoordinator::new(NodeId::new(1), cfg, true);
        let mut rng = StdRng::seed_from_u64(1);
        let mut attempts = Vec::new();
        let mut now = Timestamp::ZERO;
        while now <= Timestamp::from_secs(600) {
            let mut input = inputs(now, false);
            input.established = 0;
            input.empty_scans = 6;
            for action in coord.tick(input, &mut rng) {
                if matches!(action, ElectionAction::Promote { .. }) {
                    attempts.push(now.as_millis() / 1_000);
                    coord.on_promotion_result(false, now);
                }
            }
            now += Duration::from_secs(10);
        }
        // Five attempts a minute apart, then quiet until the budget resets.
        assert_eq!(attempts[..6], [0, 60, 120, 180, 240, 500]);
    }

    #[test]
    fn test_isolated_needs_empty_scans() {
        let mut coord = ElectionCoordinator::new(NodeId::new(1), config(), true);
        let mut rng = StdRng::seed_from_u64(1);
        let mut input = inputs(Timestamp::from_secs(1), false);
        input.established = 0;
        input.empty_scans = 5;
        assert!(coord.tick(input, &mut rng).is_empty());
    }
}
