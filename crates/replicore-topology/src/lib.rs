//! Topology coordination for a replica set.
//!
//! This crate implements the topology coordinator: the pure decision engine
//! behind the replication coordinator. Given inputs (heartbeat replies, the
//! current scheduler time, a configuration) it produces state transitions and
//! value-typed actions. It performs no I/O, takes no locks, and never reads a
//! wall clock; the replication coordinator owns all side effects and feeds
//! time in explicitly.
//!
//! # Responsibilities
//!
//! - The member-state machine: startup, follower modes, maintenance masking,
//!   sticky rollback, removal on reconfig
//! - Heartbeat request preparation and response processing, including the
//!   next-send schedule for each remote
//! - Election timer bookkeeping and the decision to stand for election
//! - Term management ([`TopologyCoordinator::update_term`])
//! - Per-member liveness and the primary's majority-visibility check
//!
//! # Key Types
//!
//! - [`TopologyCoordinator`]: the state machine
//! - [`HeartbeatResponseAction`]: what the caller must do after a response
//! - [`MemberHeartbeatData`]: per-remote bookkeeping

mod coordinator;
mod heartbeat_data;
mod messages;


pub use coordinator::{
    ElectionPhase, HeartbeatResponseAction, SetFollowerModeResult, TopologyCoordinator,
    UpdateTermResult,
};
pub use heartbeat_data::MemberHeartbeatData;
pub use messages::{HeartbeatRequest, HeartbeatResponse, ReplicaSetMetadata};
