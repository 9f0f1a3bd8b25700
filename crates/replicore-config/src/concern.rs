//! Write- and read-concern predicates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The `w` component of a write concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WMode {
    /// Count of members (including self) that must have applied the write.
    Nodes(u32),
    /// A strict majority of writable voting members, gated on the committed
    /// snapshot.
    Majority,
    /// A named mode from the config's `getLastErrorModes`.
    Custom(String),
}

/// How long a replication waiter may sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WTimeout {
    /// Evaluate once and return immediately.
    NoWaiting,
    /// Sleep until satisfied or cancelled.
    NoTimeout,
    /// Sleep at most this long.
    Millis(Duration),
}

/// Durability predicate attached to a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: WMode,
    pub w_timeout: WTimeout,
}

impl WriteConcern {
    pub fn nodes(w: u32, w_timeout: WTimeout) -> Self {
        Self {
            w: WMode::Nodes(w),
            w_timeout,
        }
    }

    pub fn majority(w_timeout: WTimeout) -> Self {
        Self {
            w: WMode::Majority,
            w_timeout,
        }
    }

    pub fn custom(mode: impl Into<String>, w_timeout: WTimeout) -> Self {
        Self {
            w: WMode::Custom(mode.into()),
            w_timeout,
        }
    }

    /// Returns true for majority or named-mode concerns, which stepdown must
    /// fail over to the new primary.
    pub fn is_majority_or_custom(&self) -> bool {
        matches!(self.w, WMode::Majority | WMode::Custom(_))
    }
}

/// Freshness level attached to a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConcernLevel {
    /// Wake when our own applied position reaches the target.
    Local,
    /// Wake when the committed snapshot reaches the target.
    Majority,
}

/// Freshness predicate attached to a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConcern {
    pub level: ReadConcernLevel,
}

impl ReadConcern {
    pub fn local() -> Self {
        Self {
            level: ReadConcernLevel::Local,
        }
    }

    pub fn majority() -> Self {
        Self {
            level: ReadConcernLevel::Majority,
        }
    }
}
