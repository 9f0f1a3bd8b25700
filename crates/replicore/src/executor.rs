//! Clock and deferred-event scheduling.
//!
//! The coordinator never reads wall time directly; it asks a [`Clock`].
//! Production uses [`SystemClock`]; tests drive a [`VirtualClock`] so every
//! timing-dependent path is deterministic.
//!
//! Deferred work lives in a [`TaskExecutor`]: a min-heap of `(when, seq)`
//! keyed events. Events are popped in deadline order (ties broken by
//! scheduling order) and are cancellable by handle.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use replicore_types::Date;

// ============================================================================
// Clock
// ============================================================================

/// A monotonic clock, virtualizable for tests.
pub trait Clock: Send + Sync {
    /// Current scheduler time.
    fn now(&self) -> Date;

    /// How long a blocked thread should sleep before re-checking its
    /// condition, given the scheduler-time remaining.
    ///
    /// The system clock sleeps the full remainder; the virtual clock returns
    /// a short real-time slice because scheduler time only moves when a test
    /// advances it.
    fn wait_hint(&self, remaining: Duration) -> Duration;
}

/// Wall-clock time, measured from process start.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Date {
        // Offset by 1ms so the zero date stays reserved for cleared timers.
        Date::from_millis(self.start.elapsed().as_millis() as u64 + 1)
    }

    fn wait_hint(&self, remaining: Duration) -> Duration {
        remaining
    }
}

/// Test clock advanced explicitly.
#[derive(Debug)]
pub struct VirtualClock {
    now: Mutex<Date>,
}

impl VirtualClock {
    /// Starts at the given time. Tests usually start past zero so cleared
    /// timers stay distinguishable.
    pub fn starting_at(now: Date) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves time forward; never backward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now = *now + by;
    }

    /// Jumps to an absolute time, if later than the current one.
    pub fn advance_to(&self, to: Date) {
        let mut now = self.now.lock().expect("clock poisoned");
        if to > *now {
            *now = to;
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Date {
        *self.now.lock().expect("clock poisoned")
    }

    fn wait_hint(&self, _remaining: Duration) -> Duration {
        Duration::from_millis(1)
    }
}

// ============================================================================
// Task Executor
// ============================================================================

/// Handle for cancelling a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

/// Deferred work the coordinator schedules for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledEvent {
    /// Send the next heartbeat to the member at this config index.
    HeartbeatDue(usize),
    /// The election timer fired.
    ElectionTimeout,
}

/// A cancellable deadline queue.
///
/// Events fire in `(when, seq)` order: deadline first, scheduling order as
/// the tie-break. Cancellation removes the payload; the heap entry becomes a
/// tombstone skipped at pop time.
#[derive(Debug, Default)]
pub struct TaskExecutor {
    heap: BinaryHeap<Reverse<(Date, u64)>>,
    pending: HashMap<u64, ScheduledEvent>,
    next_seq: u64,
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `event` to fire at `when`.
    pub fn schedule_at(&mut self, when: Date, event: ScheduledEvent) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((when, seq)));
        self.pending.insert(seq, event);
        EventHandle(seq)
    }

    /// Cancels an event if it has not fired.
    pub fn cancel(&mut self, handle: EventHandle) {
        self.pending.remove(&handle.0);
    }

    /// Cancels every pending heartbeat event.
    pub fn cancel_heartbeats(&mut self) {
        self.pending
            .retain(|_, event| !matches!(event, ScheduledEvent::HeartbeatDue(_)));
    }

    /// Cancels every pending event.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.heap.clear();
    }

    /// Pops the next event due at or before `now`, skipping tombstones.
    pub fn pop_due(&mut self, now: Date) -> Option<(EventHandle, ScheduledEvent)> {
        while let Some(Reverse((when, seq))) = self.heap.peek().copied() {
            if when > now {
                return None;
            }
            self.heap.pop();
            if let Some(event) = self.pending.remove(&seq) {
                return Some((EventHandle(seq), event));
            }
            // Cancelled; keep draining.
        }
        None
    }

    /// The earliest pending (non-cancelled) deadline.
    pub fn next_deadline(&self) -> Option<Date> {
        self.heap
            .iter()
            .filter(|Reverse((_, seq))| self.pending.contains_key(seq))
            .map(|Reverse((when, _))| *when)
            .min()
    }

    /// Number of live scheduled events.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_deadline_order() {
        let mut executor = TaskExecutor::new();
        executor.schedule_at(Date::from_millis(300), ScheduledEvent::HeartbeatDue(2));
        executor.schedule_at(Date::from_millis(100), ScheduledEvent::HeartbeatDue(0));
        executor.schedule_at(Date::from_millis(200), ScheduledEvent::HeartbeatDue(1));

        let now = Date::from_millis(1_000);
        let order: Vec<_> = std::iter::from_fn(|| executor.pop_due(now))
            .map(|(_, event)| event)
            .collect();
        assert_eq!(
            order,
            vec![
                ScheduledEvent::HeartbeatDue(0),
                ScheduledEvent::HeartbeatDue(1),
                ScheduledEvent::HeartbeatDue(2),
            ]
        );
    }

    #[test]
    fn ties_fire_in_scheduling_order() {
        let mut executor = TaskExecutor::new();
        let when = Date::from_millis(100);
        executor.schedule_at(when, ScheduledEvent::HeartbeatDue(7));
        executor.schedule_at(when, ScheduledEvent::ElectionTimeout);
        assert_eq!(
            executor.pop_due(when).map(|(_, e)| e),
            Some(ScheduledEvent::HeartbeatDue(7))
        );
        assert_eq!(
            executor.pop_due(when).map(|(_, e)| e),
            Some(ScheduledEvent::ElectionTimeout)
        );
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut executor = TaskExecutor::new();
        executor.schedule_at(Date::from_millis(500), ScheduledEvent::ElectionTimeout);
        assert_eq!(executor.pop_due(Date::from_millis(499)), None);
        assert!(executor.pop_due(Date::from_millis(500)).is_some());
    }

    #[test]
    fn cancellation_tombstones() {
        let mut executor = TaskExecutor::new();
        let handle = executor.schedule_at(Date::from_millis(100), ScheduledEvent::ElectionTimeout);
        executor.schedule_at(Date::from_millis(200), ScheduledEvent::HeartbeatDue(0));
        executor.cancel(handle);
        assert_eq!(
            executor.pop_due(Date::from_millis(1_000)).map(|(_, e)| e),
            Some(ScheduledEvent::HeartbeatDue(0))
        );
        assert_eq!(executor.pop_due(Date::from_millis(1_000)), None);
    }

    #[test]
    fn cancel_heartbeats_spares_other_events() {
        let mut executor = TaskExecutor::new();
        executor.schedule_at(Date::from_millis(100), ScheduledEvent::HeartbeatDue(0));
        executor.schedule_at(Date::from_millis(100), ScheduledEvent::HeartbeatDue(1));
        executor.schedule_at(Date::from_millis(100), ScheduledEvent::ElectionTimeout);
        executor.cancel_heartbeats();
        assert_eq!(executor.pending_count(), 1);
        assert_eq!(
            executor.pop_due(Date::from_millis(100)).map(|(_, e)| e),
            Some(ScheduledEvent::ElectionTimeout)
        );
    }

    #[test]
    fn next_deadline_skips_cancelled() {
        let mut executor = TaskExecutor::new();
        let early = executor.schedule_at(Date::from_millis(100), ScheduledEvent::ElectionTimeout);
        executor.schedule_at(Date::from_millis(400), ScheduledEvent::HeartbeatDue(0));
        assert_eq!(executor.next_deadline(), Some(Date::from_millis(100)));
        executor.cancel(early);
        assert_eq!(executor.next_deadline(), Some(Date::from_millis(400)));
    }

    #[test]
    fn virtual_clock_never_goes_backward() {
        let clock = VirtualClock::starting_at(Date::from_millis(1_000));
        clock.advance_to(Date::from_millis(500));
        assert_eq!(clock.now(), Date::from_millis(1_000));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Date::from_millis(1_250));
    }

    proptest::proptest! {
        #[test]
        fn pops_are_sorted_by_deadline_then_seq(deadlines in proptest::collection::vec(0u64..1_000, 0..50)) {
            let mut executor = TaskExecutor::new();
            for (index, deadline) in deadlines.iter().enumerate() {
                executor.schedule_at(
                    Date::from_millis(*deadline),
                    ScheduledEvent::HeartbeatDue(index),
                );
            }
            let popped: Vec<(Date, usize)> = std::iter::from_fn(|| {
                executor.pop_due(Date::from_millis(1_000)).map(|(handle, event)| {
                    let ScheduledEvent::HeartbeatDue(index) = event else {
                        unreachable!("only heartbeats were scheduled");
                    };
                    let _ = handle;
                    (Date::from_millis(deadlines[index]), index)
                })
            })
            .collect();

            proptest::prop_assert_eq!(popped.len(), deadlines.len());
            for window in popped.windows(2) {
                // Deadline order, scheduling order as the tie-break.
                proptest::prop_assert!(window[0].0 < window[1].0
                    || (window[0].0 == window[1].0 && window[0].1 < window[1].1));
            }
        }
    }
}
