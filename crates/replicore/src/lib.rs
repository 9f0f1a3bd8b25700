//! Replication coordinator for a replicated state-machine cluster.
//!
//! This crate is the per-node component that owns membership, leader
//! election, heartbeating, write-acknowledgement tracking, commit-point
//! computation, read-concern waiting, and orderly leadership transfer.
//!
//! # Architecture
//!
//! The decision core lives in `replicore-topology` and is pure: it takes
//! heartbeat replies, clock readings, and configurations, and produces state
//! transitions and value-typed actions. [`ReplicationCoordinator`] is the
//! side-effectful façade around it. It serializes every mutation behind one
//! mutex, executes topology actions against the scheduler and the network
//! dispatcher, and wakes sleeping client operations.
//!
//! ```text
//! clients ──await/wait──► ReplicationCoordinator ◄──pump── timers, network
//!                            │           ▲
//!                       actions│           │decisions
//!                            ▼           │
//!                      TopologyCoordinator (pure)
//! ```
//!
//! Everything timing-dependent runs against a [`Clock`], so tests drive a
//! [`VirtualClock`] plus a [`MockNetwork`] for full determinism.

mod coordinator;
mod executor;
mod external_state;
mod lock;
mod network;
mod optime_tracker;
mod settings;
mod snapshots;
mod update_position;
mod waiters;


pub use coordinator::{ReplicationCoordinator, StepDownTicket};
pub use executor::{Clock, EventHandle, ScheduledEvent, SystemClock, TaskExecutor, VirtualClock};
pub use external_state::{ExternalState, InMemoryExternalState};
pub use lock::{GlobalLock, GlobalLockGuard, NoopGlobalLock, TestGlobalLock};
pub use network::{MockNetwork, NetworkDispatcher, RemoteCommandRequest, RequestToken};
pub use optime_tracker::OpTimeTracker;
pub use settings::{ReplSettings, ReplicationMode};
pub use snapshots::SnapshotTracker;
pub use update_position::{UpdatePositionArgs, UpdatePositionEntry};
pub use waiters::{Waiter, WaiterCondition, WaiterRegistry};
