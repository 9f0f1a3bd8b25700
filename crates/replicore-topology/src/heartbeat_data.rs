//! Per-remote heartbeat bookkeeping.

use replicore_types::{Date, MemberState, OpTime, Timestamp};
use serde::{Deserialize, Serialize};

/// Everything the topology coordinator remembers about one remote member.
///
/// One instance exists per slot in the installed configuration (the self slot
/// included, though only remotes receive heartbeats). All fields are updated
/// exclusively by the topology coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberHeartbeatData {
    /// Last state the member reported.
    pub state: MemberState,

    /// True while heartbeats are being answered.
    pub up: bool,

    /// The member's last reported applied position.
    pub last_applied_op_time: OpTime,

    /// When we last received any heartbeat response from this member.
    pub last_heartbeat_recv: Date,

    /// When we last sent a heartbeat to this member.
    pub last_heartbeat_sent: Date,

    /// Config version the member reported.
    pub config_version: i64,

    /// Election time the member reported, if it claimed to be primary.
    pub election_time: Timestamp,

    /// True if the last response failed authentication.
    pub auth_issue: bool,

    /// Last time this member proved liveness (heartbeat response or a
    /// position update naming it).
    pub last_update_liveness: Date,
}

impl Default for MemberHeartbeatData {
    fn default() -> Self {
        Self {
            state: MemberState::Unknown,
            up: false,
            last_applied_op_time: OpTime::ZERO,
            last_heartbeat_recv: Date::ZERO,
            last_heartbeat_sent: Date::ZERO,
            config_version: -1,
            election_time: Timestamp::ZERO,
            auth_issue: false,
            last_update_liveness: Date::ZERO,
        }
    }
}

impl MemberHeartbeatData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful heartbeat response.
    pub fn record_success(
        &mut self,
        now: Date,
        state: MemberState,
        op_time: OpTime,
        config_version: i64,
        election_time: Timestamp,
    ) {
        self.state = state;
        self.up = true;
        self.auth_issue = false;
        self.last_heartbeat_recv = now;
        self.config_version = config_version;
        self.election_time = election_time;
        self.last_update_liveness = now;
        // Positions only move forward; a lagging report never regresses them.
        if op_time > self.last_applied_op_time {
            self.last_applied_op_time = op_time;
        }
    }

    /// Records a failed heartbeat attempt.
    pub fn record_failure(&mut self, now: Date, auth_issue: bool) {
        self.state = MemberState::Down;
        self.up = false;
        self.auth_issue = auth_issue;
        self.last_heartbeat_recv = now;
    }

    /// Records the send time of an outbound heartbeat.
    pub fn record_sent(&mut self, now: Date) {
        self.last_heartbeat_sent = now;
    }

    /// Records liveness proven by a relayed position update.
    pub fn record_liveness(&mut self, now: Date) {
        self.last_update_liveness = now;
    }

    /// True if the member has proven liveness within `window` of `now`.
    pub fn is_live(&self, now: Date, window: std::time::Duration) -> bool {
        !self.last_update_liveness.is_zero() && now.since(self.last_update_liveness) <= window
    }
}
