//! Committed-snapshot tracking.
//!
//! The storage engine registers snapshots as `(op-time, name)` pairs; the
//! tracker selects the current committed snapshot: the greatest pair whose
//! op-time is at or below the commit point. Names are reserved through
//! [`SnapshotTracker::reserve_name`] and strictly increase across a run.

use replicore_types::{OpTime, SnapshotName};

/// Ordered set of snapshots plus the committed-snapshot selection.
#[derive(Debug, Clone, Default)]
pub struct SnapshotTracker {
    /// Tracked snapshots, sorted ascending by `(op_time, name)`.
    snapshots: Vec<(OpTime, SnapshotName)>,
    current_committed: Option<(OpTime, SnapshotName)>,
    last_reserved: u64,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh snapshot name; each reservation strictly exceeds all
    /// prior ones.
    pub fn reserve_name(&mut self) -> SnapshotName {
        self.last_reserved += 1;
        SnapshotName::new(self.last_reserved)
    }

    /// The most recently reserved name.
    pub fn last_reserved_name(&self) -> SnapshotName {
        SnapshotName::new(self.last_reserved)
    }

    /// Registers a snapshot created by the storage engine.
    ///
    /// Returns true when the committed-snapshot selection changed (a new
    /// snapshot at or below the commit point advances it immediately).
    pub fn on_snapshot_create(
        &mut self,
        op_time: OpTime,
        name: SnapshotName,
        commit_point: OpTime,
    ) -> bool {
        let entry = (op_time, name);
        let position = self.snapshots.partition_point(|existing| *existing < entry);
        if self.snapshots.get(position) == Some(&entry) {
            return false;
        }
        self.snapshots.insert(position, entry);
        self.update_committed(commit_point)
    }

    /// Re-selects the committed snapshot for a (possibly advanced) commit
    /// point. Returns true on change.
    pub fn update_committed(&mut self, commit_point: OpTime) -> bool {
        let best = self
            .snapshots
            .iter()
            .rev()
            .find(|(op_time, _)| *op_time <= commit_point)
            .copied();
        // The selection is monotone: a smaller candidate never replaces the
        // current committed snapshot.
        let advanced = match (self.current_committed, best) {
            (None, Some(_)) => true,
            (Some(current), Some(candidate)) => candidate > current,
            _ => false,
        };
        if advanced {
            self.current_committed = best;
        }
        advanced
    }

    /// The current committed snapshot, if one exists.
    pub fn current_committed(&self) -> Option<(OpTime, SnapshotName)> {
        self.current_committed
    }

    /// Drops every tracked snapshot and clears the committed selection.
    pub fn drop_all(&mut self) {
        self.snapshots.clear();
        self.current_committed = None;
    }

    /// Number of tracked snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicore_types::Timestamp;

    fn op(secs: u32, inc: u32) -> OpTime {
        OpTime::new(Timestamp::new(secs, inc), 1)
    }

    #[test]
    fn names_strictly_increase() {
        let mut tracker = SnapshotTracker::new();
        let first = tracker.reserve_name();
        let second = tracker.reserve_name();
        let third = tracker.reserve_name();
        assert!(first < second);
        assert!(second < third);
    }

    #[test]
    fn committed_selection_picks_greatest_at_or_below_commit() {
        let mut tracker = SnapshotTracker::new();
        let n1 = tracker.reserve_name();
        let n2 = tracker.reserve_name();
        let n3 = tracker.reserve_name();
        tracker.on_snapshot_create(op(10, 0), n1, OpTime::ZERO);
        tracker.on_snapshot_create(op(20, 0), n2, OpTime::ZERO);
        tracker.on_snapshot_create(op(30, 0), n3, OpTime::ZERO);
        assert_eq!(tracker.current_committed(), None);

        assert!(tracker.update_committed(op(25, 0)));
        assert_eq!(tracker.current_committed(), Some((op(20, 0), n2)));

        assert!(tracker.update_committed(op(30, 0)));
        assert_eq!(tracker.current_committed(), Some((op(30, 0), n3)));
    }

    #[test]
    fn create_below_commit_advances_immediately() {
        let mut tracker = SnapshotTracker::new();
        let name = tracker.reserve_name();
        assert!(tracker.on_snapshot_create(op(10, 0), name, op(15, 0)));
        assert_eq!(tracker.current_committed(), Some((op(10, 0), name)));
    }

    #[test]
    fn selection_never_regresses() {
        let mut tracker = SnapshotTracker::new();
        let n1 = tracker.reserve_name();
        let n2 = tracker.reserve_name();
        tracker.on_snapshot_create(op(20, 0), n2, op(20, 0));
        assert_eq!(tracker.current_committed(), Some((op(20, 0), n2)));
        // A late-arriving older snapshot does not displace the selection.
        assert!(!tracker.on_snapshot_create(op(10, 0), n1, op(20, 0)));
        assert_eq!(tracker.current_committed(), Some((op(20, 0), n2)));
    }

    #[test]
    fn tie_on_op_time_breaks_by_name() {
        let mut tracker = SnapshotTracker::new();
        let n1 = tracker.reserve_name();
        let n2 = tracker.reserve_name();
        tracker.on_snapshot_create(op(10, 0), n1, op(10, 0));
        assert!(tracker.on_snapshot_create(op(10, 0), n2, op(10, 0)));
        assert_eq!(tracker.current_committed(), Some((op(10, 0), n2)));
    }

    #[test]
    fn drop_all_resets_selection() {
        let mut tracker = SnapshotTracker::new();
        let name = tracker.reserve_name();
        tracker.on_snapshot_create(op(10, 0), name, op(10, 0));
        assert!(tracker.current_committed().is_some());
        tracker.drop_all();
        assert_eq!(tracker.current_committed(), None);
        assert!(tracker.is_empty());
        // Name reservations keep increasing after a drop.
        assert!(tracker.reserve_name() > name);
    }
}
