//! The topology coordinator state machine.

use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use replicore_config::ReplicaSetConfig;
use replicore_types::{
    Date, Error, HostAndPort, MemberState, OpTime, Result, Timestamp,
};

use crate::heartbeat_data::MemberHeartbeatData;
use crate::messages::{HeartbeatRequest, HeartbeatResponse};

// ============================================================================
// Outputs
// ============================================================================

/// What the caller must do after a heartbeat response is processed.
///
/// The topology coordinator never performs these itself; it only decides.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatResponseAction {
    NoAction,
    /// The peer carries a newer configuration; install it.
    Reconfig(ReplicaSetConfig),
    /// We are primary but can no longer see a majority of voters; step down.
    StepDownSelf,
}

/// Result of [`TopologyCoordinator::set_follower_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetFollowerModeResult {
    /// False when the request was ignored as a state change (sticky
    /// rollback).
    pub changed: bool,
    /// True when an in-progress election was cancelled by the transition.
    pub canceled_election: bool,
}

/// Result of [`TopologyCoordinator::update_term`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTermResult {
    /// The proposed term was not newer; nothing changed.
    Unchanged,
    /// The term advanced. `was_primary` tells the caller to initiate
    /// stepdown.
    Updated { was_primary: bool },
}

/// Phase of an in-progress election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    /// Probing for votes without incrementing the term.
    DryRun,
    /// The real ballot; the term has been incremented.
    Real,
}

// ============================================================================
// Topology Coordinator
// ============================================================================

/// Pure decision engine for membership, heartbeats, and election timing.
///
/// All methods take explicit `now` values; the struct never reads a clock,
/// performs I/O, or takes a lock. The replication coordinator serializes
/// access and executes the returned actions.
#[derive(Debug, Clone)]
pub struct TopologyCoordinator {
    self_host: HostAndPort,
    rng: SmallRng,

    term: i64,
    config: Option<ReplicaSetConfig>,
    self_index: Option<usize>,
    member_data: Vec<MemberHeartbeatData>,

    /// Unmasked member state; observers see it through
    /// [`TopologyCoordinator::member_state`].
    base_state: MemberState,
    maintenance_count: u32,

    election_timeout_at: Date,
    step_down_until: Date,
    freeze_until: Date,

    /// Index of the member we believe is primary, -1 when unknown.
    current_primary_index: i64,

    election_phase: Option<ElectionPhase>,
    drain_pending: bool,

    /// When we last won an election, as a log timestamp.
    election_time: Timestamp,
}

impl TopologyCoordinator {
    /// Creates a coordinator in `Startup` with no configuration.
    ///
    /// `seed` feeds the election-offset PRNG; production callers derive it
    /// from entropy, tests pin it for determinism.
    pub fn new(self_host: HostAndPort, seed: u64) -> Self {
        Self {
            self_host,
            rng: SmallRng::seed_from_u64(seed),
            term: 0,
            config: None,
            self_index: None,
            member_data: Vec::new(),
            base_state: MemberState::Startup,
            maintenance_count: 0,
            election_timeout_at: Date::ZERO,
            step_down_until: Date::ZERO,
            freeze_until: Date::ZERO,
            current_primary_index: -1,
            election_phase: None,
            drain_pending: false,
            election_time: Timestamp::ZERO,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn self_host(&self) -> &HostAndPort {
        &self.self_host
    }

    pub fn term(&self) -> i64 {
        self.term
    }

    /// The externally observable member state.
    ///
    /// Rollback masks maintenance; a maintenance counter above zero masks
    /// `Secondary` as `Recovering`.
    pub fn member_state(&self) -> MemberState {
        match self.base_state {
            MemberState::Secondary if self.maintenance_count > 0 => MemberState::Recovering,
            state => state,
        }
    }

    pub fn config(&self) -> Option<&ReplicaSetConfig> {
        self.config.as_ref()
    }

    pub fn self_index(&self) -> Option<usize> {
        self.self_index
    }

    pub fn member_data(&self) -> &[MemberHeartbeatData] {
        &self.member_data
    }

    pub fn election_timeout_at(&self) -> Date {
        self.election_timeout_at
    }

    pub fn step_down_until(&self) -> Date {
        self.step_down_until
    }

    pub fn freeze_until(&self) -> Date {
        self.freeze_until
    }

    pub fn current_primary_index(&self) -> i64 {
        self.current_primary_index
    }

    pub fn election_phase(&self) -> Option<ElectionPhase> {
        self.election_phase
    }

    pub fn drain_pending(&self) -> bool {
        self.drain_pending
    }

    pub fn maintenance_count(&self) -> u32 {
        self.maintenance_count
    }

    /// True when writes may be accepted: primary and done draining.
    pub fn can_accept_writes(&self) -> bool {
        self.base_state == MemberState::Primary && !self.drain_pending
    }

    /// True when this node may stand for election under the installed
    /// configuration.
    pub fn is_electable_self(&self) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        if config.protocol_version != 1 {
            return false;
        }
        let Some(self_index) = self.self_index else {
            return false;
        };
        config.members[self_index].is_electable()
    }

    // ========================================================================
    // Configuration Install
    // ========================================================================

    /// Installs a configuration and re-derives member state.
    ///
    /// `self_index` is `None` when no host in the new configuration maps to
    /// this node, which forces `Removed`. All heartbeat bookkeeping is reset;
    /// the caller schedules a fresh heartbeat round.
    pub fn install_config(
        &mut self,
        config: ReplicaSetConfig,
        self_index: Option<usize>,
        now: Date,
    ) {
        let member_count = config.member_count();
        self.member_data = (0..member_count)
            .map(|_| MemberHeartbeatData::new())
            .collect();
        self.current_primary_index = -1;

        let new_state = match self_index {
            None => MemberState::Removed,
            Some(index) if config.members[index].arbiter_only => MemberState::Arbiter,
            Some(_) => match self.base_state {
                // A reconfig under a live primary keeps leadership.
                MemberState::Primary => {
                    self.current_primary_index = self_index.map_or(-1, |i| i as i64);
                    MemberState::Primary
                }
                // Rollback survives reconfig; everything else re-enters
                // steady-state as a secondary.
                MemberState::Rollback => MemberState::Rollback,
                _ => MemberState::Secondary,
            },
        };

        tracing::info!(
            set = %config.name,
            version = config.version,
            members = member_count,
            state = %new_state,
            "installed replica set config"
        );

        self.config = Some(config);
        self.self_index = self_index;
        self.base_state = new_state;
        if new_state == MemberState::Removed {
            self.maintenance_count = 0;
        }
        self.update_election_timeout(now);
    }

    // ========================================================================
    // Heartbeats
    // ========================================================================

    /// Prepares the outbound heartbeat for `target_index` and records the
    /// send time.
    pub fn prepare_heartbeat_request(&mut self, now: Date, target_index: usize) -> HeartbeatRequest {
        let config = self
            .config
            .as_ref()
            .expect("heartbeats require an installed config");
        debug_assert!(target_index < self.member_data.len());
        debug_assert!(Some(target_index) != self.self_index, "no self heartbeats");

        self.member_data[target_index].record_sent(now);
        HeartbeatRequest {
            set_name: config.name.clone(),
            protocol_version: config.protocol_version,
            config_version: config.version,
            sender_host: self.self_host.clone(),
            sender_id: self
                .self_index
                .map_or(replicore_types::MemberId::new(-1), |i| {
                    config.members[i].id
                }),
            check_empty: false,
        }
    }

    /// Processes a heartbeat response (or failure) from the member at
    /// `from_index`.
    ///
    /// Returns when the next heartbeat to that member is due, plus any action
    /// the caller must take.
    pub fn process_heartbeat_response(
        &mut self,
        now: Date,
        from_index: usize,
        response: Result<HeartbeatResponse>,
    ) -> (Date, HeartbeatResponseAction) {
        let config = self
            .config
            .as_ref()
            .expect("heartbeats require an installed config");
        let heartbeat_interval = config.settings.heartbeat_interval;
        let our_version = config.version;
        debug_assert!(from_index < self.member_data.len());

        let mut action = HeartbeatResponseAction::NoAction;
        match response {
            Ok(response) => {
                self.member_data[from_index].record_success(
                    now,
                    response.state,
                    response.op_time,
                    response.config_version,
                    response.election_time.unwrap_or(Timestamp::ZERO),
                );

                if response.state == MemberState::Primary {
                    self.note_remote_primary(now, from_index, response.term);
                }

                // Any peer heartbeat defers our own candidacy.
                self.cancel_and_reschedule_election_timeout(now);

                if response.config_version > our_version {
                    if let Some(new_config) = response.config {
                        action = HeartbeatResponseAction::Reconfig(new_config);
                    }
                }
            }
            Err(error) => {
                let auth_issue = matches!(error, Error::OperationFailed(ref m) if m.contains("auth"));
                tracing::debug!(
                    member = from_index,
                    error = %error,
                    "heartbeat to member failed"
                );
                self.member_data[from_index].record_failure(now, auth_issue);
                if self.current_primary_index == from_index as i64 {
                    self.current_primary_index = -1;
                }
            }
        }

        // A primary that lost sight of a majority of voters abdicates.
        if action == HeartbeatResponseAction::NoAction
            && self.base_state == MemberState::Primary
            && !self.has_live_majority(now)
        {
            tracing::warn!("can't see a majority of the set, relinquishing primary");
            action = HeartbeatResponseAction::StepDownSelf;
        }

        let next_at = self.member_data[from_index].last_heartbeat_recv + heartbeat_interval;
        (next_at, action)
    }

    /// Records that a peer claims to be primary.
    fn note_remote_primary(&mut self, now: Date, member_index: usize, term: i64) {
        if Some(member_index) == self.self_index {
            return;
        }
        self.current_primary_index = member_index as i64;

        // A live primary at our term or later pushes the election timer a
        // full period past the response receipt.
        let Some(config) = &self.config else { return };
        if config.protocol_version == 1 && term >= self.term && self.is_election_timer_active() {
            let period = config.settings.election_timeout;
            let jitter = self.election_jitter(period);
            self.election_timeout_at = now + period + jitter;
        }
    }

    /// Builds the response this node gives to an inbound heartbeat.
    pub fn prepare_heartbeat_response(
        &self,
        request: &HeartbeatRequest,
        my_applied: OpTime,
    ) -> HeartbeatResponse {
        let (set_name, config_version, config) = match &self.config {
            Some(config) => {
                // Ship our config along when the sender is behind.
                let ship = request.config_version < config.version;
                (
                    config.name.clone(),
                    config.version,
                    ship.then(|| config.clone()),
                )
            }
            None => (String::new(), -1, None),
        };
        let ok = self.config.is_none() || set_name == request.set_name;
        HeartbeatResponse {
            ok,
            set_name,
            state: self.member_state(),
            config_version,
            op_time: my_applied,
            election_time: (self.base_state == MemberState::Primary).then_some(self.election_time),
            config,
            syncing_to: None,
            term: self.term,
        }
    }

    // ========================================================================
    // Election Timer
    // ========================================================================

    /// True when the election timer should be running at all.
    fn is_election_timer_active(&self) -> bool {
        self.member_state() == MemberState::Secondary
            && self.is_electable_self()
            && self.election_phase.is_none()
    }

    fn election_jitter(&mut self, period: Duration) -> Duration {
        let max_offset_ms = (period.as_millis() as u64 / 10).max(1);
        Duration::from_millis(self.rng.gen_range(0..max_offset_ms))
    }

    /// Clears or (re)schedules the election timer per the standing rules.
    ///
    /// The timer is the zero date whenever protocol version is not 1, the
    /// observed state is not `Secondary`, or self is not electable.
    pub fn update_election_timeout(&mut self, now: Date) {
        if !self.is_election_timer_active() {
            self.election_timeout_at = Date::ZERO;
            return;
        }
        if self.election_timeout_at.is_zero() {
            self.cancel_and_reschedule_election_timeout(now);
        }
    }

    /// Unconditionally pushes the election timer out by one period (plus a
    /// small random offset), or clears it when ineligible.
    pub fn cancel_and_reschedule_election_timeout(&mut self, now: Date) {
        if !self.is_election_timer_active() {
            self.election_timeout_at = Date::ZERO;
            return;
        }
        let period = self
            .config
            .as_ref()
            .expect("electable implies config")
            .settings
            .election_timeout;
        let jitter = self.election_jitter(period);
        self.election_timeout_at = now + period + jitter;
    }

    /// True when the timer has fired and nothing forbids standing.
    pub fn should_start_election(&self, now: Date) -> bool {
        self.is_election_timer_active()
            && !self.election_timeout_at.is_zero()
            && now >= self.election_timeout_at
            && now >= self.freeze_until
            && now >= self.step_down_until
    }

    // ========================================================================
    // Elections
    // ========================================================================

    /// Enters a candidate phase. The real ballot increments the term.
    ///
    /// The only legal phase change while a ballot runs is dry-run → real.
    pub fn begin_election(&mut self, phase: ElectionPhase) {
        debug_assert!(
            self.election_phase.is_none()
                || (phase == ElectionPhase::Real
                    && self.election_phase == Some(ElectionPhase::DryRun)),
            "election already running"
        );
        debug_assert!(self.base_state == MemberState::Secondary);
        if phase == ElectionPhase::Real {
            self.term += 1;
            tracing::info!(term = self.term, "starting election");
        } else {
            tracing::info!(term = self.term, "conducting a dry run election");
        }
        self.election_phase = Some(phase);
        self.election_timeout_at = Date::ZERO;
    }

    /// Concludes a won election: primary with drain pending.
    pub fn process_win_election(&mut self, now: Date) {
        debug_assert!(self.election_phase == Some(ElectionPhase::Real));
        self.election_phase = None;
        self.base_state = MemberState::Primary;
        self.drain_pending = true;
        self.election_time = Timestamp::new((now.as_millis() / 1000) as u32, 0);
        self.current_primary_index = self.self_index.map_or(-1, |i| i as i64);
        self.update_election_timeout(now);
        tracing::info!(term = self.term, "election succeeded, assuming primary role");
    }

    /// Concludes a lost or cancelled election.
    pub fn process_lose_election(&mut self, now: Date) {
        self.election_phase = None;
        self.update_election_timeout(now);
    }

    /// Clears drain mode after the applier signals completion.
    ///
    /// Returns false when there was no drain pending.
    pub fn signal_drain_complete(&mut self) -> bool {
        if self.base_state == MemberState::Primary && self.drain_pending {
            self.drain_pending = false;
            tracing::info!(term = self.term, "transition to primary complete");
            true
        } else {
            false
        }
    }

    // ========================================================================
    // Term Management
    // ========================================================================

    /// Adopts `term` if strictly newer.
    ///
    /// Any term advance forgets the current primary; the caller must
    /// initiate stepdown when `was_primary` is set.
    pub fn update_term(&mut self, term: i64) -> UpdateTermResult {
        if term <= self.term {
            return UpdateTermResult::Unchanged;
        }
        tracing::debug!(from = self.term, to = term, "updating term");
        self.term = term;
        self.current_primary_index = -1;
        let was_primary = self.base_state == MemberState::Primary;
        if self.election_phase.is_some() {
            // A newer term invalidates any ballot in flight.
            self.election_phase = None;
        }
        UpdateTermResult::Updated { was_primary }
    }

    // ========================================================================
    // Follower Modes & Maintenance
    // ========================================================================

    /// Explicitly sets a follower state.
    ///
    /// Only follower states are valid targets; leadership is entered through
    /// elections and left through stepdown. While in `Rollback`, a transition
    /// to `Secondary` is ignored as a state change (rollback is sticky); a
    /// transition to `Rollback` while a candidate cancels the election.
    pub fn set_follower_mode(
        &mut self,
        new_state: MemberState,
        now: Date,
    ) -> Result<SetFollowerModeResult> {
        if !matches!(
            new_state,
            MemberState::Startup2
                | MemberState::Secondary
                | MemberState::Recovering
                | MemberState::Rollback
        ) {
            return Err(Error::BadValue(format!(
                "cannot set follower mode to {new_state}"
            )));
        }
        if self.base_state == MemberState::Primary {
            return Err(Error::NotSecondary(
                "cannot set follower mode while primary; use replSetStepDown".into(),
            ));
        }

        let mut canceled_election = false;
        if self.election_phase.is_some() {
            if new_state == MemberState::Rollback {
                tracing::info!("canceling election due to transition to rollback");
                self.election_phase = None;
                canceled_election = true;
            } else {
                return Err(Error::OperationFailed(
                    "cannot change follower mode while an election is in progress".into(),
                ));
            }
        }

        // Sticky rollback: leaving directly for Secondary is deferred until
        // an explicit transition out through another follower state.
        if self.base_state == MemberState::Rollback && new_state == MemberState::Secondary {
            return Ok(SetFollowerModeResult {
                changed: false,
                canceled_election,
            });
        }

        let changed = self.base_state != new_state;
        if changed {
            tracing::info!(from = %self.base_state, to = %new_state, "changing follower mode");
        }
        self.base_state = new_state;
        self.update_election_timeout(now);
        Ok(SetFollowerModeResult {
            changed,
            canceled_election,
        })
    }

    /// Adjusts the maintenance-mode counter.
    ///
    /// Allowed only in `Secondary`/`Recovering`/`Rollback` and never while an
    /// election is running. The first unmatched `false` fails with
    /// `OperationFailed`.
    pub fn set_maintenance_mode(&mut self, enable: bool, now: Date) -> Result<()> {
        if self.election_phase.is_some() {
            return Err(Error::NotSecondary(
                "can not enter maintenance mode when the node is running for election".into(),
            ));
        }
        if !self.member_state().is_maintenance_mutable() {
            return Err(Error::NotSecondary(format!(
                "currently running for election or not a secondary; state is {}",
                self.member_state()
            )));
        }

        if enable {
            self.maintenance_count += 1;
            tracing::info!(
                count = self.maintenance_count,
                "going into maintenance mode"
            );
        } else {
            if self.maintenance_count == 0 {
                return Err(Error::OperationFailed(
                    "already out of maintenance mode".into(),
                ));
            }
            self.maintenance_count -= 1;
            tracing::info!(
                count = self.maintenance_count,
                "leaving maintenance mode"
            );
        }
        self.update_election_timeout(now);
        Ok(())
    }

    // ========================================================================
    // Stepdown & Freeze
    // ========================================================================

    /// Relinquishes leadership until `until`.
    pub fn step_down(&mut self, now: Date, until: Date) {
        debug_assert!(self.base_state == MemberState::Primary);
        self.base_state = MemberState::Secondary;
        self.drain_pending = false;
        self.step_down_until = until;
        if self.current_primary_index == self.self_index.map_or(-1, |i| i as i64) {
            self.current_primary_index = -1;
        }
        self.update_election_timeout(now);
        tracing::info!(until = %until, "stepped down from primary");
    }

    /// Applies `replSetFreeze`.
    ///
    /// Returns true when clearing a freeze in a single-node electable config,
    /// meaning the caller should immediately consider standing for election.
    pub fn freeze(&mut self, now: Date, duration: Duration) -> Result<bool> {
        if self.base_state == MemberState::Primary {
            return Err(Error::NotSecondary("cannot freeze a primary".into()));
        }
        if duration.is_zero() {
            self.freeze_until = Date::ZERO;
            let single_node = self
                .config
                .as_ref()
                .is_some_and(|c| c.member_count() == 1)
                && self.is_electable_self();
            return Ok(single_node);
        }
        self.freeze_until = now + duration;
        tracing::info!(until = %self.freeze_until, "frozen; will not stand for election");
        Ok(false)
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Marks a member down when it has been silent for a full liveness
    /// window; called as each new heartbeat to it goes out.
    pub fn mark_down_if_silent(&mut self, member_index: usize, now: Date) {
        if Some(member_index) == self.self_index {
            return;
        }
        if self.is_member_live(member_index, now) {
            return;
        }
        if let Some(data) = self.member_data.get_mut(member_index) {
            if data.up {
                tracing::info!(member = member_index, "member is down, no reply in a full liveness window");
                data.state = MemberState::Down;
                data.up = false;
            }
        }
        if self.current_primary_index == member_index as i64 {
            self.current_primary_index = -1;
        }
    }

    /// Records liveness proven by a relayed position update.
    pub fn record_member_liveness(&mut self, member_index: usize, now: Date) {
        if Some(member_index) == self.self_index {
            return;
        }
        if let Some(data) = self.member_data.get_mut(member_index) {
            data.record_liveness(now);
        }
    }

    /// True when the member has proven liveness within one election timeout.
    pub fn is_member_live(&self, member_index: usize, now: Date) -> bool {
        if Some(member_index) == self.self_index {
            return true;
        }
        let Some(config) = &self.config else {
            return false;
        };
        self.member_data
            .get(member_index)
            .is_some_and(|d| d.is_live(now, config.settings.election_timeout))
    }

    /// True when a strict majority of voting members (self included) is live.
    pub fn has_live_majority(&self, now: Date) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        let live_voters = config
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_voter())
            .filter(|(index, _)| self.is_member_live(*index, now))
            .count();
        live_voters >= ReplicaSetConfig::majority_of(config.voting_member_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three_node_config() -> ReplicaSetConfig {
        ReplicaSetConfig::from_document(&json!({
            "_id": "mySet",
            "version": 2,
            "members": [
                {"_id": 0, "host": "node1:12345"},
                {"_id": 1, "host": "node2:12345"},
                {"_id": 2, "host": "node3:12345"},
            ],
            "settings": {"electionTimeoutMillis": 10_000, "heartbeatIntervalMillis": 2000}
        }))
        .expect("config")
    }

    fn secondary_at(now: Date) -> TopologyCoordinator {
        let mut tc = TopologyCoordinator::new(HostAndPort::new("node1", 12345), 42);
        tc.install_config(three_node_config(), Some(0), now);
        tc
    }

    #[test]
    fn install_makes_secondary_with_timer() {
        let now = Date::from_millis(1_000);
        let tc = secondary_at(now);
        assert_eq!(tc.member_state(), MemberState::Secondary);
        assert!(!tc.election_timeout_at().is_zero());
        assert!(tc.election_timeout_at() >= now + Duration::from_millis(10_000));
    }

    #[test]
    fn install_without_self_is_removed() {
        let now = Date::from_millis(1_000);
        let mut tc = TopologyCoordinator::new(HostAndPort::new("elsewhere", 1), 42);
        tc.install_config(three_node_config(), None, now);
        assert_eq!(tc.member_state(), MemberState::Removed);
        assert!(tc.election_timeout_at().is_zero());
    }

    #[test]
    fn arbiter_state_from_config() {
        let config = ReplicaSetConfig::from_document(&json!({
            "_id": "mySet",
            "members": [
                {"_id": 0, "host": "node1:1"},
                {"_id": 1, "host": "arb:1", "arbiterOnly": true},
            ]
        }))
        .expect("config");
        let mut tc = TopologyCoordinator::new(HostAndPort::new("arb", 1), 42);
        tc.install_config(config, Some(1), Date::from_millis(5));
        assert_eq!(tc.member_state(), MemberState::Arbiter);
        assert!(tc.election_timeout_at().is_zero());
    }

    #[test]
    fn maintenance_masks_secondary_as_recovering() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.set_maintenance_mode(true, now).expect("enter");
        assert_eq!(tc.member_state(), MemberState::Recovering);
        assert!(tc.election_timeout_at().is_zero());
        tc.set_maintenance_mode(false, now).expect("leave");
        assert_eq!(tc.member_state(), MemberState::Secondary);
        assert!(!tc.election_timeout_at().is_zero());
    }

    #[test]
    fn maintenance_counter_parity() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.set_maintenance_mode(true, now).expect("first");
        tc.set_maintenance_mode(true, now).expect("second");
        tc.set_maintenance_mode(false, now).expect("match first");
        assert_eq!(tc.member_state(), MemberState::Recovering);
        tc.set_maintenance_mode(false, now).expect("match second");
        assert_eq!(tc.member_state(), MemberState::Secondary);
        let err = tc.set_maintenance_mode(false, now).unwrap_err();
        assert_eq!(err.code(), replicore_types::ErrorCode::OperationFailed);
    }

    #[test]
    fn rollback_masks_maintenance() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.set_follower_mode(MemberState::Rollback, now).expect("rollback");
        tc.set_maintenance_mode(true, now).expect("counter still adjusts");
        assert_eq!(tc.member_state(), MemberState::Rollback);
    }

    #[test]
    fn rollback_is_sticky_against_secondary() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.set_follower_mode(MemberState::Rollback, now).expect("rollback");
        let result = tc
            .set_follower_mode(MemberState::Secondary, now)
            .expect("ignored");
        assert!(!result.changed);
        assert_eq!(tc.member_state(), MemberState::Rollback);

        // An explicit transition out re-enables Secondary.
        tc.set_follower_mode(MemberState::Recovering, now).expect("out");
        let result = tc
            .set_follower_mode(MemberState::Secondary, now)
            .expect("now honored");
        assert!(result.changed);
        assert_eq!(tc.member_state(), MemberState::Secondary);
    }

    #[test]
    fn rollback_cancels_election() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.begin_election(ElectionPhase::DryRun);
        let result = tc
            .set_follower_mode(MemberState::Rollback, now)
            .expect("rollback during ballot");
        assert!(result.canceled_election);
        assert_eq!(tc.election_phase(), None);
        assert_eq!(tc.member_state(), MemberState::Rollback);
    }

    #[test]
    fn maintenance_rejected_during_election() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.begin_election(ElectionPhase::DryRun);
        let err = tc.set_maintenance_mode(true, now).unwrap_err();
        assert_eq!(err.code(), replicore_types::ErrorCode::NotSecondary);
    }

    #[test]
    fn update_term_semantics() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        assert_eq!(tc.update_term(0), UpdateTermResult::Unchanged);
        assert_eq!(
            tc.update_term(3),
            UpdateTermResult::Updated { was_primary: false }
        );
        assert_eq!(tc.term(), 3);
        assert_eq!(tc.current_primary_index(), -1);
        assert_eq!(tc.update_term(2), UpdateTermResult::Unchanged);
        assert_eq!(tc.term(), 3);
    }

    #[test]
    fn win_election_enters_drain() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.begin_election(ElectionPhase::Real);
        assert_eq!(tc.term(), 1);
        tc.process_win_election(now);
        assert_eq!(tc.member_state(), MemberState::Primary);
        assert!(tc.drain_pending());
        assert!(!tc.can_accept_writes());
        assert!(tc.signal_drain_complete());
        assert!(tc.can_accept_writes());
        assert!(!tc.signal_drain_complete());
    }

    #[test]
    fn election_timer_cleared_while_primary() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.begin_election(ElectionPhase::Real);
        tc.process_win_election(now);
        assert!(tc.election_timeout_at().is_zero());
        tc.step_down(now, now + Duration::from_secs(60));
        assert!(!tc.election_timeout_at().is_zero());
        assert_eq!(tc.member_state(), MemberState::Secondary);
    }

    #[test]
    fn heartbeat_from_primary_pushes_timer() {
        let start = Date::from_millis(1_000);
        let mut tc = secondary_at(start);
        let initial = tc.election_timeout_at();

        let response_at = Date::from_millis(4_000);
        let response = HeartbeatResponse {
            ok: true,
            set_name: "mySet".into(),
            state: MemberState::Primary,
            config_version: 2,
            op_time: OpTime::ZERO,
            election_time: Some(Timestamp::new(1, 1)),
            config: None,
            syncing_to: None,
            term: 0,
        };
        let (next_at, action) = tc.process_heartbeat_response(response_at, 1, Ok(response));
        assert_eq!(action, HeartbeatResponseAction::NoAction);
        assert_eq!(next_at, response_at + Duration::from_millis(2_000));
        assert!(tc.election_timeout_at() >= response_at + Duration::from_millis(10_000));
        assert!(tc.election_timeout_at() >= initial);
        assert_eq!(tc.current_primary_index(), 1);
    }

    #[test]
    fn heartbeat_failure_marks_down() {
        let start = Date::from_millis(1_000);
        let mut tc = secondary_at(start);
        let (next_at, action) = tc.process_heartbeat_response(
            Date::from_millis(3_000),
            2,
            Err(Error::NodeNotFound("no such host".into())),
        );
        assert_eq!(action, HeartbeatResponseAction::NoAction);
        assert_eq!(next_at, Date::from_millis(5_000));
        assert_eq!(tc.member_data()[2].state, MemberState::Down);
    }

    #[test]
    fn newer_config_triggers_reconfig_action() {
        let start = Date::from_millis(1_000);
        let mut tc = secondary_at(start);
        let mut newer = three_node_config();
        newer.version = 5;
        let response = HeartbeatResponse {
            ok: true,
            set_name: "mySet".into(),
            state: MemberState::Secondary,
            config_version: 5,
            op_time: OpTime::ZERO,
            election_time: None,
            config: Some(newer.clone()),
            syncing_to: None,
            term: 0,
        };
        let (_, action) = tc.process_heartbeat_response(Date::from_millis(2_000), 1, Ok(response));
        assert_eq!(action, HeartbeatResponseAction::Reconfig(newer));
    }

    #[test]
    fn primary_without_live_majority_steps_down() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.begin_election(ElectionPhase::Real);
        tc.process_win_election(now);
        tc.signal_drain_complete();

        // Only one failing heartbeat so far; the other member has never been
        // live, so the primary sees 1 of 3 voters.
        let (_, action) = tc.process_heartbeat_response(
            Date::from_millis(50_000),
            1,
            Err(Error::NodeNotFound("down".into())),
        );
        assert_eq!(action, HeartbeatResponseAction::StepDownSelf);
    }

    #[test]
    fn liveness_window_tracks_updates() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        assert!(tc.is_member_live(0, now), "self always live");
        assert!(!tc.is_member_live(1, now));
        tc.record_member_liveness(1, now);
        assert!(tc.is_member_live(1, Date::from_millis(5_000)));
        assert!(!tc.is_member_live(1, Date::from_millis(20_000)));
    }

    #[test]
    fn freeze_blocks_standing() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.freeze(now, Duration::from_secs(600)).expect("freeze");
        let fired_at = tc.election_timeout_at();
        assert!(!tc.should_start_election(fired_at));
        tc.freeze(fired_at, Duration::ZERO).expect("unfreeze");
        assert!(tc.should_start_election(fired_at));
    }

    #[test]
    fn freeze_rejected_for_primary() {
        let now = Date::from_millis(1_000);
        let mut tc = secondary_at(now);
        tc.begin_election(ElectionPhase::Real);
        tc.process_win_election(now);
        let err = tc.freeze(now, Duration::from_secs(60)).unwrap_err();
        assert_eq!(err.code(), replicore_types::ErrorCode::NotSecondary);
    }
}
