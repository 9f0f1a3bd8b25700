//! Registry of sleeping client operations.
//!
//! A waiter is created for every blocking call (`await_replication`,
//! `wait_until_op_time`), lives inside the coordinator's mutex, and is
//! resolved by whichever event satisfies, times out, or cancels it. The
//! blocked thread sleeps on the coordinator's condvar and collects its
//! result by id.

use replicore_config::{ReadConcernLevel, WriteConcern};
use replicore_types::{Date, Error, OpId, OpTime, Result, SnapshotName};

/// What a waiter is waiting for.
#[derive(Debug, Clone)]
pub enum WaiterCondition {
    /// Replication of `target` under a write concern. For majority concerns,
    /// `min_snapshot_name` is the name reserved when the wait began; the
    /// committed snapshot must reach it.
    Write {
        concern: WriteConcern,
        min_snapshot_name: Option<SnapshotName>,
    },
    /// Our applied position (`Local`) or the committed snapshot (`Majority`)
    /// reaching `target`.
    Read { level: ReadConcernLevel },
}

/// A sleeping operation.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub id: u64,
    pub target: OpTime,
    pub condition: WaiterCondition,
    pub op_id: OpId,
    pub started_at: Date,
    /// Set once; the blocked thread takes it and wakes.
    pub result: Option<Result<()>>,
}

impl Waiter {
    pub fn is_write(&self) -> bool {
        matches!(self.condition, WaiterCondition::Write { .. })
    }
}

/// The set of currently sleeping operations.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    waiters: Vec<Waiter>,
    next_id: u64,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new waiter and returns its id.
    pub fn register(
        &mut self,
        target: OpTime,
        condition: WaiterCondition,
        op_id: OpId,
        started_at: Date,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.waiters.push(Waiter {
            id,
            target,
            condition,
            op_id,
            started_at,
            result: None,
        });
        id
    }

    /// Takes the result for `id` if one was delivered, removing the waiter.
    pub fn take_result(&mut self, id: u64) -> Option<Result<()>> {
        let index = self.waiters.iter().position(|w| w.id == id)?;
        if self.waiters[index].result.is_some() {
            return self.waiters.swap_remove(index).result;
        }
        None
    }

    /// Removes a waiter that gave up on its own (timeout), if unresolved.
    pub fn abandon(&mut self, id: u64) {
        self.waiters.retain(|w| w.id != id || w.result.is_some());
    }

    /// Delivers a result to a single waiter.
    pub fn resolve(&mut self, id: u64, result: Result<()>) {
        if let Some(waiter) = self.waiters.iter_mut().find(|w| w.id == id) {
            if waiter.result.is_none() {
                waiter.result = Some(result);
            }
        }
    }

    /// Delivers `error` to every unresolved waiter matching `filter`.
    ///
    /// Returns how many waiters were resolved.
    pub fn resolve_where(&mut self, mut filter: impl FnMut(&Waiter) -> bool, error: Error) -> usize {
        let mut resolved = 0;
        for waiter in &mut self.waiters {
            if waiter.result.is_none() && filter(waiter) {
                waiter.result = Some(Err(error.clone()));
                resolved += 1;
            }
        }
        resolved
    }

    /// Delivers `Interrupted` to every unresolved waiter of `op_id`.
    pub fn interrupt(&mut self, op_id: OpId) -> usize {
        self.resolve_where(|w| w.op_id == op_id, Error::Interrupted)
    }

    /// Delivers `ShutdownInProgress` to every unresolved waiter.
    pub fn shutdown_all(&mut self) -> usize {
        self.resolve_where(|_| true, Error::ShutdownInProgress)
    }

    /// Visits every unresolved waiter, resolving those for which `evaluate`
    /// returns a result. Used by the coordinator's wake pass.
    pub fn resolve_ready(
        &mut self,
        mut evaluate: impl FnMut(&Waiter) -> Option<Result<()>>,
    ) -> usize {
        let mut resolved = 0;
        for waiter in &mut self.waiters {
            if waiter.result.is_none() {
                if let Some(result) = evaluate(waiter) {
                    waiter.result = Some(result);
                    resolved += 1;
                }
            }
        }
        resolved
    }

    /// Number of unresolved waiters.
    pub fn unresolved_count(&self) -> usize {
        self.waiters.iter().filter(|w| w.result.is_none()).count()
    }

    /// Clones of every unresolved waiter, for a read-only evaluation pass.
    pub fn unresolved(&self) -> Vec<Waiter> {
        self.waiters
            .iter()
            .filter(|w| w.result.is_none())
            .cloned()
            .collect()
    }
}
