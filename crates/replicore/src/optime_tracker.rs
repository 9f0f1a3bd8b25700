//! Per-member operation-time bookkeeping.
//!
//! One row per config slot holds the member's last-applied position (the
//! self slot mirrors `my_last_applied`). The tracker answers write-concern
//! satisfaction questions and computes the commit point; it knows nothing of
//! waiters or the network.

use std::collections::{BTreeMap, BTreeSet};

use replicore_config::ReplicaSetConfig;
use replicore_types::OpTime;

/// Tracks applied positions and the commit point.
#[derive(Debug, Clone, Default)]
pub struct OpTimeTracker {
    /// Last-applied position per config slot.
    rows: Vec<OpTime>,
    self_index: Option<usize>,
    my_last_applied: OpTime,
    last_committed: OpTime,
}

impl OpTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the rows for a freshly installed configuration.
    ///
    /// Our own applied position and the commit point survive reconfigs;
    /// remote rows restart at zero and are refilled by heartbeats and
    /// position updates.
    pub fn install_config(&mut self, member_count: usize, self_index: Option<usize>) {
        self.rows = vec![OpTime::ZERO; member_count];
        self.self_index = self_index;
        if let Some(index) = self_index {
            self.rows[index] = self.my_last_applied;
        }
    }

    pub fn my_last_applied(&self) -> OpTime {
        self.my_last_applied
    }

    pub fn last_committed(&self) -> OpTime {
        self.last_committed
    }

    pub fn member_last_applied(&self, index: usize) -> OpTime {
        self.rows.get(index).copied().unwrap_or(OpTime::ZERO)
    }

    /// Sets our applied position; never regresses. Returns true on change.
    pub fn set_my_last_applied(&mut self, op_time: OpTime) -> bool {
        if op_time <= self.my_last_applied {
            return false;
        }
        self.my_last_applied = op_time;
        if let Some(index) = self.self_index {
            self.rows[index] = op_time;
        }
        true
    }

    /// Forward-only variant: equal or smaller values are silently ignored.
    pub fn set_my_last_applied_forward(&mut self, op_time: OpTime) -> bool {
        self.set_my_last_applied(op_time)
    }

    /// Moves a remote member's position forward; never regresses.
    pub fn update_member(&mut self, index: usize, op_time: OpTime) -> bool {
        let Some(row) = self.rows.get_mut(index) else {
            return false;
        };
        if op_time <= *row {
            return false;
        }
        *row = op_time;
        true
    }

    // ========================================================================
    // Write-Concern Satisfaction
    // ========================================================================

    /// Numeric `w`: at least `w` members (self included) at or past `target`.
    pub fn nodes_satisfied(&self, target: OpTime, w: u32) -> bool {
        let count = self.rows.iter().filter(|row| **row >= target).count();
        count >= w as usize
    }

    /// Named mode: for every tag key, the members at or past `target` must
    /// cover the required number of distinct tag values.
    pub fn mode_satisfied(
        &self,
        config: &ReplicaSetConfig,
        target: OpTime,
        constraints: &BTreeMap<String, u32>,
    ) -> bool {
        for (tag_key, required) in constraints {
            let covered: BTreeSet<&String> = config
                .members
                .iter()
                .enumerate()
                .filter(|(index, _)| self.member_last_applied(*index) >= target)
                .filter_map(|(_, member)| member.tags.get(tag_key))
                .collect();
            if (covered.len() as u32) < *required {
                return false;
            }
        }
        true
    }

    /// Majority count: a strict majority of voting members, counted only
    /// among data-bearing voters, at or past `target`. Arbiters and
    /// non-voters never count.
    pub fn majority_count_satisfied(&self, config: &ReplicaSetConfig, target: OpTime) -> bool {
        let satisfied = config
            .members
            .iter()
            .enumerate()
            .filter(|(_, member)| member.is_writable_voter())
            .filter(|(index, _)| self.member_last_applied(*index) >= target)
            .count();
        satisfied >= ReplicaSetConfig::majority_of(config.voting_member_count())
    }

    // ========================================================================
    // Commit Point
    // ========================================================================

    /// Recomputes the commit point from member positions.
    ///
    /// The commit point is the greatest position a strict majority of voting
    /// members has reached, and it only advances on positions written in
    /// `current_term`. When `clamp_to` is given (the primary's own applied
    /// position) the commit point never passes it. Returns true on advance.
    pub fn recompute_commit_point(
        &mut self,
        config: &ReplicaSetConfig,
        current_term: i64,
        clamp_to: Option<OpTime>,
    ) -> bool {
        let mut voter_positions: Vec<OpTime> = config
            .members
            .iter()
            .enumerate()
            .filter(|(_, member)| member.is_writable_voter())
            .map(|(index, _)| self.member_last_applied(index))
            .collect();
        voter_positions.sort_unstable_by(|a, b| b.cmp(a));

        let majority = ReplicaSetConfig::majority_of(config.voting_member_count());
        let Some(candidate) = voter_positions.get(majority - 1).copied() else {
            return false;
        };

        let candidate = match clamp_to {
            Some(limit) => candidate.min(limit),
            None => candidate,
        };

        // Positions from earlier terms never advance the commit point.
        if candidate.term != current_term || candidate <= self.last_committed {
            return false;
        }
        self.last_committed = candidate;
        true
    }

    /// Raises the commit point from trusted peer metadata; never regresses.
    pub fn advance_commit_from_metadata(&mut self, committed: OpTime) -> bool {
        if committed <= self.last_committed {
            return false;
        }
        self.last_committed = committed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicore_types::Timestamp;
    use serde_json::json;

    fn op(secs: u32, inc: u32, term: i64) -> OpTime {
        OpTime::new(Timestamp::new(secs, inc), term)
    }

    fn three_node_config() -> ReplicaSetConfig {
        ReplicaSetConfig::from_document(&json!({
            "_id": "mySet",
            "members": [
                {"_id": 0, "host": "node1:1"},
                {"_id": 1, "host": "node2:1"},
                {"_id": 2, "host": "node3:1"},
            ]
        }))
        .expect("config")
    }

    fn tracker_for(config: &ReplicaSetConfig, self_index: usize) -> OpTimeTracker {
        let mut tracker = OpTimeTracker::new();
        tracker.install_config(config.member_count(), Some(self_index));
        tracker
    }

    #[test]
    fn my_applied_is_monotone() {
        let config = three_node_config();
        let mut tracker = tracker_for(&config, 0);
        assert!(tracker.set_my_last_applied(op(100, 1, 1)));
        assert!(!tracker.set_my_last_applied(op(100, 0, 1)));
        assert!(!tracker.set_my_last_applied_forward(op(100, 1, 1)));
        assert_eq!(tracker.my_last_applied(), op(100, 1, 1));
        assert_eq!(tracker.member_last_applied(0), op(100, 1, 1));
    }

    #[test]
    fn numeric_write_concern() {
        let config = three_node_config();
        let mut tracker = tracker_for(&config, 0);
        tracker.set_my_last_applied(op(100, 2, 1));
        tracker.update_member(1, op(100, 1, 1));

        assert!(tracker.nodes_satisfied(op(100, 1, 1), 2));
        assert!(!tracker.nodes_satisfied(op(100, 2, 1), 2));
        tracker.update_member(1, op(100, 2, 1));
        assert!(tracker.nodes_satisfied(op(100, 2, 1), 2));
    }

    #[test]
    fn majority_ignores_nonvoters_and_arbiters() {
        let config = ReplicaSetConfig::from_document(&json!({
            "_id": "mySet",
            "members": [
                {"_id": 0, "host": "node1:1"},
                {"_id": 1, "host": "node2:1"},
                {"_id": 2, "host": "node3:1", "votes": 0, "priority": 0.0},
                {"_id": 3, "host": "arb:1", "arbiterOnly": true},
            ]
        }))
        .expect("config");
        let mut tracker = tracker_for(&config, 0);
        let target = op(10, 0, 1);
        tracker.set_my_last_applied(target);
        // The non-voter being caught up contributes nothing.
        tracker.update_member(2, target);
        assert!(!tracker.majority_count_satisfied(&config, target));
        // Voting members: 3 (two data + one arbiter); majority 2 requires a
        // second data voter.
        tracker.update_member(1, target);
        assert!(tracker.majority_count_satisfied(&config, target));
    }

    #[test]
    fn tagged_mode_counts_distinct_values() {
        let config = ReplicaSetConfig::from_document(&json!({
            "_id": "mySet",
            "members": [
                {"_id": 0, "host": "node1:1", "tags": {"dc": "NA", "rack": "na1"}},
                {"_id": 1, "host": "node2:1", "tags": {"dc": "NA", "rack": "na2"}},
                {"_id": 2, "host": "node3:1", "tags": {"dc": "NA", "rack": "na3"}},
                {"_id": 3, "host": "node4:1", "tags": {"dc": "EU", "rack": "eu1"}},
                {"_id": 4, "host": "node5:1", "tags": {"dc": "EU", "rack": "eu2"}},
            ],
            "settings": {"getLastErrorModes": {
                "multiDC": {"dc": 2},
                "multiDCAndRack": {"dc": 2, "rack": 3},
            }}
        }))
        .expect("config");
        let multi_dc = config.get_last_error_mode("multiDC").expect("mode").clone();
        let multi_rack = config
            .get_last_error_mode("multiDCAndRack")
            .expect("mode")
            .clone();

        let mut tracker = tracker_for(&config, 0);
        let target = op(100, 1, 1);
        tracker.set_my_last_applied(target);

        // Only the primary: everything fails.
        assert!(!tracker.majority_count_satisfied(&config, target));
        assert!(!tracker.mode_satisfied(&config, target, &multi_dc));
        assert!(!tracker.mode_satisfied(&config, target, &multi_rack));

        // Two more NA members: a majority, but one datacenter.
        tracker.update_member(1, target);
        tracker.update_member(2, target);
        assert!(tracker.majority_count_satisfied(&config, target));
        assert!(!tracker.mode_satisfied(&config, target, &multi_dc));
        assert!(!tracker.mode_satisfied(&config, target, &multi_rack));

        // An EU member: both custom modes pass (2 DCs, 4 racks).
        tracker.update_member(3, target);
        assert!(tracker.mode_satisfied(&config, target, &multi_dc));
        assert!(tracker.mode_satisfied(&config, target, &multi_rack));
    }

    #[test]
    fn commit_point_requires_current_term_majority() {
        let config = three_node_config();
        let mut tracker = tracker_for(&config, 0);
        tracker.set_my_last_applied(op(100, 2, 1));
        assert!(!tracker.recompute_commit_point(&config, 1, Some(tracker.my_last_applied())));

        // A majority at an old-term position never advances commit.
        tracker.update_member(1, op(90, 0, 0));
        tracker.update_member(2, op(90, 0, 0));
        assert!(!tracker.recompute_commit_point(&config, 1, Some(tracker.my_last_applied())));

        // A majority in the current term does.
        tracker.update_member(1, op(100, 1, 1));
        assert!(tracker.recompute_commit_point(&config, 1, Some(tracker.my_last_applied())));
        assert_eq!(tracker.last_committed(), op(100, 1, 1));
    }

    #[test]
    fn commit_point_clamped_to_own_applied() {
        let config = three_node_config();
        let mut tracker = tracker_for(&config, 0);
        tracker.set_my_last_applied(op(100, 0, 1));
        tracker.update_member(1, op(200, 0, 1));
        tracker.update_member(2, op(200, 0, 1));
        assert!(tracker.recompute_commit_point(&config, 1, Some(tracker.my_last_applied())));
        assert_eq!(tracker.last_committed(), op(100, 0, 1));
    }

    #[test]
    fn metadata_commit_is_monotone() {
        let config = three_node_config();
        let mut tracker = tracker_for(&config, 0);
        assert!(tracker.advance_commit_from_metadata(op(10, 0, 1)));
        assert!(!tracker.advance_commit_from_metadata(op(5, 0, 1)));
        assert_eq!(tracker.last_committed(), op(10, 0, 1));
    }

    #[test]
    fn reconfig_preserves_self_and_commit() {
        let config = three_node_config();
        let mut tracker = tracker_for(&config, 0);
        tracker.set_my_last_applied(op(50, 0, 1));
        tracker.update_member(1, op(50, 0, 1));
        tracker.advance_commit_from_metadata(op(50, 0, 1));

        tracker.install_config(5, Some(2));
        assert_eq!(tracker.my_last_applied(), op(50, 0, 1));
        assert_eq!(tracker.member_last_applied(2), op(50, 0, 1));
        assert_eq!(tracker.member_last_applied(1), OpTime::ZERO);
        assert_eq!(tracker.last_committed(), op(50, 0, 1));
    }
}
