//! # replicore-types: Core types for `replicore`
//!
//! This crate contains shared types used across the replication coordinator:
//! - Log positions ([`Timestamp`], [`OpTime`])
//! - Member identity ([`MemberId`], [`HostAndPort`])
//! - Member states ([`MemberState`])
//! - Scheduler time ([`Date`])
//! - Snapshot naming ([`SnapshotName`])
//! - Operation identity for interruption ([`OpId`])
//! - The error taxonomy ([`Error`], [`ErrorCode`])

use std::{
    fmt::{self, Display},
    ops::Add,
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Timestamp
// ============================================================================

/// A position in the operation log, as assigned by the log writer.
///
/// Ordered by `(secs, inc)`. The `inc` counter disambiguates operations
/// logged within the same second.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp {
    /// Seconds component.
    pub secs: u32,
    /// Counter within the second.
    pub inc: u32,
}

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Timestamp = Timestamp { secs: 0, inc: 0 };

    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Returns true if this is the zero timestamp.
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.secs, self.inc)
    }
}

// ============================================================================
// OpTime
// ============================================================================

/// A `(timestamp, term)` pair naming a position in the replicated log.
///
/// The total order is lexicographic on `(term, timestamp)`: an operation from
/// a later term always sorts after every operation of an earlier term,
/// regardless of timestamps. Term 0 denotes pre-election (protocol version 0)
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct OpTime {
    /// Position in the log.
    pub timestamp: Timestamp,
    /// Election term in which the operation was written.
    pub term: i64,
}

impl OpTime {
    /// The zero op-time: `((0,0), 0)`.
    pub const ZERO: OpTime = OpTime {
        timestamp: Timestamp::ZERO,
        term: 0,
    };

    pub fn new(timestamp: Timestamp, term: i64) -> Self {
        Self { timestamp, term }
    }

    /// Returns true if this is the zero op-time.
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.term, self.timestamp).cmp(&(other.term, other.timestamp))
    }
}

impl Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.timestamp, self.term)
    }
}

// ============================================================================
// Member Identity
// ============================================================================

/// Unique identifier for a member within a replica-set configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(i32);

impl MemberId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for MemberId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// A network address of a member, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::BadValue(format!("missing port in host string \"{s}\"")))?;
        if host.is_empty() {
            return Err(Error::BadValue(format!("empty host in \"{s}\"")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::BadValue(format!("invalid port in \"{s}\"")))?;
        Ok(Self::new(host, port))
    }
}

// ============================================================================
// Member State
// ============================================================================

/// The externally observable state of a replica-set member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    /// Initial state before any configuration is loaded.
    Startup,
    /// Configuration installed, initial sync in progress.
    Startup2,
    /// Replicating from a sync source; eligible to stand for election.
    Secondary,
    /// Secondary masked by maintenance mode, or resyncing.
    Recovering,
    /// Truncating a divergent log tail.
    Rollback,
    /// The elected leader.
    Primary,
    /// Voting member with no data.
    Arbiter,
    /// Unreachable (derived from absence of heartbeat replies).
    Down,
    /// No longer present in the installed configuration.
    Removed,
    /// No information yet.
    Unknown,
}

impl MemberState {
    /// Returns true for the states in which the maintenance-mode counter may
    /// be manipulated.
    pub fn is_maintenance_mutable(self) -> bool {
        matches!(
            self,
            MemberState::Secondary | MemberState::Recovering | MemberState::Rollback
        )
    }

    /// Returns true if the member can serve reads.
    pub fn is_readable(self) -> bool {
        matches!(self, MemberState::Primary | MemberState::Secondary)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Startup => "STARTUP",
            MemberState::Startup2 => "STARTUP2",
            MemberState::Secondary => "SECONDARY",
            MemberState::Recovering => "RECOVERING",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Primary => "PRIMARY",
            MemberState::Arbiter => "ARBITER",
            MemberState::Down => "DOWN",
            MemberState::Removed => "REMOVED",
            MemberState::Unknown => "UNKNOWN",
        }
    }
}

impl Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Scheduler Time
// ============================================================================

/// A point in scheduler time, in milliseconds since an arbitrary epoch.
///
/// `Date::ZERO` doubles as the "cleared" value for timers (an election
/// timeout at the zero date is not scheduled). This is why scheduler time is
/// not `std::time::Instant`: `Instant` has no zero value and cannot be driven
/// by a virtual clock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Date(u64);

impl Date {
    /// The zero date; used for cleared timers.
    pub const ZERO: Date = Date(0);

    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns true if this is the zero (cleared) date.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Duration elapsed since `earlier`, saturating at zero.
    pub fn since(self, earlier: Date) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Date {
    type Output = Date;

    fn add(self, rhs: Duration) -> Date {
        Date(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ============================================================================
// Snapshot Name
// ============================================================================

/// An opaque, monotonically increasing name for a storage-engine snapshot.
///
/// Names are reserved through the coordinator and strictly exceed all prior
/// reservations within a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SnapshotName(u64);

impl SnapshotName {
    pub const ZERO: SnapshotName = SnapshotName(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Operation Identity
// ============================================================================

/// Identifies a client operation for targeted interruption.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpId(u64);

impl OpId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Stable error codes for coordinator results.
///
/// Callers (and tests) match on codes; the [`Error`] variants carry the
/// human-readable diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    NoReplicationEnabled,
    NotYetInitialized,
    AlreadyInitialized,
    InvalidReplicaSetConfig,
    NodeNotFound,
    NotMaster,
    NotSecondary,
    OperationFailed,
    WriteConcernFailed,
    UnknownReplWriteConcern,
    CannotSatisfyWriteConcern,
    ExceededTimeLimit,
    ShutdownInProgress,
    Interrupted,
    NotAReplicaSet,
    ReadConcernMajorityNotEnabled,
    StaleTerm,
    BadValue,
    OutOfDiskSpace,
}

/// Coordinator errors.
///
/// Configuration errors are synchronous and never mutate state; liveness
/// errors are delivered on waiter wake and carry the elapsed duration;
/// lifecycle errors (`ShutdownInProgress`, `Interrupted`) are delivered to all
/// relevant waiters on the triggering event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no replication enabled: {0}")]
    NoReplicationEnabled(String),

    #[error("not yet initialized: {0}")]
    NotYetInitialized(String),

    #[error("already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("invalid replica set config: {0}")]
    InvalidReplicaSetConfig(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("not master: {0}")]
    NotMaster(String),

    #[error("not secondary: {0}")]
    NotSecondary(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("waiting for replication timed out after {waited:?}")]
    WriteConcernFailed {
        /// How long the waiter slept before the deadline.
        waited: Duration,
    },

    #[error("unknown replica set write concern mode \"{0}\"")]
    UnknownReplWriteConcern(String),

    #[error("cannot satisfy write concern: {0}")]
    CannotSatisfyWriteConcern(String),

    #[error("operation exceeded time limit after {waited:?}")]
    ExceededTimeLimit {
        /// How long the operation waited before giving up.
        waited: Duration,
    },

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("operation was interrupted")]
    Interrupted,

    #[error("node is not a member of a replica set: {0}")]
    NotAReplicaSet(String),

    #[error("majority read concern requested, but server was not started with --enableMajorityReadConcern")]
    ReadConcernMajorityNotEnabled,

    #[error("term out of date: {0}")]
    StaleTerm(String),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("out of disk space: {0}")]
    OutOfDiskSpace(String),
}

impl Error {
    /// Returns the stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NoReplicationEnabled(_) => ErrorCode::NoReplicationEnabled,
            Error::NotYetInitialized(_) => ErrorCode::NotYetInitialized,
            Error::AlreadyInitialized(_) => ErrorCode::AlreadyInitialized,
            Error::InvalidReplicaSetConfig(_) => ErrorCode::InvalidReplicaSetConfig,
            Error::NodeNotFound(_) => ErrorCode::NodeNotFound,
            Error::NotMaster(_) => ErrorCode::NotMaster,
            Error::NotSecondary(_) => ErrorCode::NotSecondary,
            Error::OperationFailed(_) => ErrorCode::OperationFailed,
            Error::WriteConcernFailed { .. } => ErrorCode::WriteConcernFailed,
            Error::UnknownReplWriteConcern(_) => ErrorCode::UnknownReplWriteConcern,
            Error::CannotSatisfyWriteConcern(_) => ErrorCode::CannotSatisfyWriteConcern,
            Error::ExceededTimeLimit { .. } => ErrorCode::ExceededTimeLimit,
            Error::ShutdownInProgress => ErrorCode::ShutdownInProgress,
            Error::Interrupted => ErrorCode::Interrupted,
            Error::NotAReplicaSet(_) => ErrorCode::NotAReplicaSet,
            Error::ReadConcernMajorityNotEnabled => ErrorCode::ReadConcernMajorityNotEnabled,
            Error::StaleTerm(_) => ErrorCode::StaleTerm,
            Error::BadValue(_) => ErrorCode::BadValue,
            Error::OutOfDiskSpace(_) => ErrorCode::OutOfDiskSpace,
        }
    }
}

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn optime_orders_by_term_first() {
        let early_term = OpTime::new(Timestamp::new(100, 5), 1);
        let late_term = OpTime::new(Timestamp::new(1, 0), 2);
        assert!(late_term > early_term);
    }

    #[test]
    fn optime_orders_by_timestamp_within_term() {
        let a = OpTime::new(Timestamp::new(100, 1), 1);
        let b = OpTime::new(Timestamp::new(100, 2), 1);
        let c = OpTime::new(Timestamp::new(101, 0), 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn zero_optime() {
        assert!(OpTime::ZERO.is_zero());
        assert!(OpTime::default().is_zero());
        assert!(OpTime::new(Timestamp::new(0, 1), 0) > OpTime::ZERO);
    }

    #[test]
    fn host_and_port_round_trip() {
        let hp: HostAndPort = "node1:12345".parse().expect("parse");
        assert_eq!(hp, HostAndPort::new("node1", 12345));
        assert_eq!(hp.to_string(), "node1:12345");
    }

    #[test]
    fn host_and_port_rejects_garbage() {
        assert_eq!(
            "node1".parse::<HostAndPort>().unwrap_err().code(),
            ErrorCode::BadValue
        );
        assert_eq!(
            "node1:notaport".parse::<HostAndPort>().unwrap_err().code(),
            ErrorCode::BadValue
        );
        assert_eq!(
            ":123".parse::<HostAndPort>().unwrap_err().code(),
            ErrorCode::BadValue
        );
    }

    #[test]
    fn date_zero_is_cleared() {
        assert!(Date::ZERO.is_zero());
        assert!(!(Date::ZERO + Duration::from_millis(1)).is_zero());
    }

    #[test]
    fn date_since_saturates() {
        let a = Date::from_millis(100);
        let b = Date::from_millis(250);
        assert_eq!(b.since(a), Duration::from_millis(150));
        assert_eq!(a.since(b), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn optime_order_is_total_and_consistent(
            t1 in 0i64..10, s1 in 0u32..1000, i1 in 0u32..100,
            t2 in 0i64..10, s2 in 0u32..1000, i2 in 0u32..100,
        ) {
            let a = OpTime::new(Timestamp::new(s1, i1), t1);
            let b = OpTime::new(Timestamp::new(s2, i2), t2);
            // Lexicographic (term, timestamp) order
            let expected = (t1, s1, i1).cmp(&(t2, s2, i2));
            prop_assert_eq!(a.cmp(&b), expected);
        }

        #[test]
        fn timestamp_order_matches_pairs(
            s1 in 0u32..1000, i1 in 0u32..100,
            s2 in 0u32..1000, i2 in 0u32..100,
        ) {
            let a = Timestamp::new(s1, i1);
            let b = Timestamp::new(s2, i2);
            prop_assert_eq!(a.cmp(&b), (s1, i1).cmp(&(s2, i2)));
        }
    }
}
