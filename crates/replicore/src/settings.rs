//! Server-level replication options.
//!
//! These are the flags the server passes at construction; nothing here is
//! process-global.

use serde::{Deserialize, Serialize};

/// How this node replicates, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Standalone; replication commands fail with `NoReplicationEnabled`.
    None,
    /// Legacy master/slave replication.
    MasterSlave,
    /// Replica-set member.
    ReplSet,
}

/// Replication options supplied by the server at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplSettings {
    /// Value of the `--replSet` flag, when given.
    pub replset_name: Option<String>,
    /// Legacy master/slave master flag.
    pub master: bool,
    /// Legacy master/slave slave flag.
    pub slave: bool,
    /// Whether majority read concern is available.
    pub majority_read_concern_enabled: bool,
}

impl ReplSettings {
    /// The replication mode these settings imply.
    pub fn initial_mode(&self) -> ReplicationMode {
        if self.replset_name.is_some() {
            ReplicationMode::ReplSet
        } else if self.master || self.slave {
            ReplicationMode::MasterSlave
        } else {
            ReplicationMode::None
        }
    }

    /// Settings for a replica-set member named `name`.
    pub fn repl_set(name: impl Into<String>) -> Self {
        Self {
            replset_name: Some(name.into()),
            majority_read_concern_enabled: true,
            ..Self::default()
        }
    }
}
