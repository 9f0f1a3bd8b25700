//! Replica-set configuration model.
//!
//! A configuration arrives as a document (`serde_json::Value`) through
//! `replSetInitiate` or `replSetReconfig`, is parsed into
//! [`ReplicaSetConfig`], and is validated once at that boundary. Validation
//! failures surface as `InvalidReplicaSetConfig` with a diagnostic string and
//! never mutate coordinator state.
//!
//! The crate also defines the durability and freshness predicates attached to
//! client operations: [`WriteConcern`] and [`ReadConcern`].

mod concern;
mod member;
mod set_config;

pub use concern::{ReadConcern, ReadConcernLevel, WMode, WTimeout, WriteConcern};
pub use member::MemberConfig;
pub use set_config::{ReplicaSetConfig, ReplicaSetSettings};
