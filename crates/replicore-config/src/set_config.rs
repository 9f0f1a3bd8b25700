//! The replica-set configuration document.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use replicore_types::{Error, HostAndPort, MemberId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::member::MemberConfig;

/// Default election timeout when the document does not override it.
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default interval between heartbeats to each remote member.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2_000);

/// Timing and mode settings shared by all members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSetSettings {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Named write-concern modes: mode name → (tag key → required distinct
    /// tag values).
    pub get_last_error_modes: BTreeMap<String, BTreeMap<String, u32>>,
}

impl Default for ReplicaSetSettings {
    fn default() -> Self {
        Self {
            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            get_last_error_modes: BTreeMap::new(),
        }
    }
}

/// A parsed, validated replica-set configuration.
///
/// Created at initiate or installed from a heartbeat; replaced atomically by
/// reconfig. Instances are immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSetConfig {
    pub name: String,
    pub version: i64,
    pub protocol_version: i64,
    pub members: Vec<MemberConfig>,
    pub settings: ReplicaSetSettings,
}

impl ReplicaSetConfig {
    /// Parses a full config document and checks all invariants.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let obj = doc.as_object().ok_or_else(|| {
            Error::InvalidReplicaSetConfig("replica set config must be an object".into())
        })?;

        let name = obj
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidReplicaSetConfig("Missing expected field \"_id\"".into()))?
            .to_string();

        let version = obj.get("version").and_then(Value::as_i64).unwrap_or(1);
        if version < 1 {
            return Err(Error::InvalidReplicaSetConfig(format!(
                "version must be at least 1, but found {version}"
            )));
        }

        let protocol_version = obj
            .get("protocolVersion")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        if !(0..=1).contains(&protocol_version) {
            return Err(Error::InvalidReplicaSetConfig(format!(
                "protocolVersion must be 0 or 1, but found {protocol_version}"
            )));
        }

        let member_docs = obj
            .get("members")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::InvalidReplicaSetConfig("Missing expected field \"members\"".into())
            })?;
        let members = member_docs
            .iter()
            .map(MemberConfig::from_document)
            .collect::<Result<Vec<_>>>()?;

        let mut settings = ReplicaSetSettings::default();
        if let Some(settings_obj) = obj.get("settings").and_then(Value::as_object) {
            if let Some(ms) = settings_obj
                .get("electionTimeoutMillis")
                .and_then(Value::as_u64)
            {
                settings.election_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = settings_obj
                .get("heartbeatIntervalMillis")
                .and_then(Value::as_u64)
            {
                settings.heartbeat_interval = Duration::from_millis(ms);
            }
            if let Some(modes) = settings_obj
                .get("getLastErrorModes")
                .and_then(Value::as_object)
            {
                for (mode_name, constraints) in modes {
                    let constraints_obj = constraints.as_object().ok_or_else(|| {
                        Error::InvalidReplicaSetConfig(format!(
                            "getLastErrorModes.{mode_name} must be an object"
                        ))
                    })?;
                    let mut parsed = BTreeMap::new();
                    for (tag_key, count) in constraints_obj {
                        let count = count.as_u64().ok_or_else(|| {
                            Error::InvalidReplicaSetConfig(format!(
                                "getLastErrorModes.{mode_name}.{tag_key} must be a positive integer"
                            ))
                        })?;
                        parsed.insert(tag_key.clone(), count as u32);
                    }
                    settings
                        .get_last_error_modes
                        .insert(mode_name.clone(), parsed);
                }
            }
        }

        let config = Self {
            name,
            version,
            protocol_version,
            members,
            settings,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration-wide invariants.
    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(Error::InvalidReplicaSetConfig(
                "replica set config must have at least one member".into(),
            ));
        }

        let mut ids = BTreeSet::new();
        let mut hosts = BTreeSet::new();
        for member in &self.members {
            member.validate()?;
            if !ids.insert(member.id) {
                return Err(Error::InvalidReplicaSetConfig(format!(
                    "found two member configurations with same _id field, {}",
                    member.id
                )));
            }
            if !hosts.insert(&member.host) {
                return Err(Error::InvalidReplicaSetConfig(format!(
                    "found two member configurations with same host field, {}",
                    member.host
                )));
            }
        }

        if !self.members.iter().any(MemberConfig::is_writable_voter) {
            return Err(Error::InvalidReplicaSetConfig(
                "must contain at least one non-arbiter member".into(),
            ));
        }

        // Named modes must reference tags that at least one member carries,
        // and must be satisfiable by the configured member set.
        for (mode_name, constraints) in &self.settings.get_last_error_modes {
            for (tag_key, required) in constraints {
                let distinct: BTreeSet<&String> = self
                    .members
                    .iter()
                    .filter_map(|m| m.tags.get(tag_key))
                    .collect();
                if (distinct.len() as u32) < *required {
                    return Err(Error::InvalidReplicaSetConfig(format!(
                        "mode \"{mode_name}\" requires {required} distinct values of tag \
                         \"{tag_key}\", but only {} exist in the config",
                        distinct.len()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Index of the member whose host equals `self_host`, if any.
    pub fn find_self_index(&self, self_host: &HostAndPort) -> Option<usize> {
        self.members.iter().position(|m| &m.host == self_host)
    }

    /// Looks up a member by id.
    pub fn find_member(&self, id: MemberId) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Index of a member by id.
    pub fn find_member_index(&self, id: MemberId) -> Option<usize> {
        self.members.iter().position(|m| m.id == id)
    }

    /// Hosts of every configured member except the one at `self_index`.
    pub fn other_member_hosts(&self, self_index: usize) -> Vec<HostAndPort> {
        self.members
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != self_index)
            .map(|(_, m)| m.host.clone())
            .collect()
    }

    /// Number of members that vote in elections (arbiters included).
    pub fn voting_member_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_voter()).count()
    }

    /// Number of voting members that bear data.
    pub fn writable_voting_member_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_writable_voter()).count()
    }

    /// Strict majority for a group of `n`.
    pub fn majority_of(n: usize) -> usize {
        n / 2 + 1
    }

    /// Looks up a named write-concern mode.
    pub fn get_last_error_mode(&self, name: &str) -> Option<&BTreeMap<String, u32>> {
        self.settings.get_last_error_modes.get(name)
    }

    /// Total number of members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Serializes back into a config document.
    pub fn to_document(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("_id".into(), Value::from(self.name.clone()));
        doc.insert("version".into(), Value::from(self.version));
        doc.insert("protocolVersion".into(), Value::from(self.protocol_version));
        doc.insert(
            "members".into(),
            Value::Array(self.members.iter().map(MemberConfig::to_document).collect()),
        );

        let mut settings = serde_json::Map::new();
        settings.insert(
            "electionTimeoutMillis".into(),
            Value::from(self.settings.election_timeout.as_millis() as u64),
        );
        settings.insert(
            "heartbeatIntervalMillis".into(),
            Value::from(self.settings.heartbeat_interval.as_millis() as u64),
        );
        if !self.settings.get_last_error_modes.is_empty() {
            let modes: serde_json::Map<String, Value> = self
                .settings
                .get_last_error_modes
                .iter()
                .map(|(name, constraints)| {
                    let c: serde_json::Map<String, Value> = constraints
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(*v)))
                        .collect();
                    (name.clone(), Value::Object(c))
                })
                .collect();
            settings.insert("getLastErrorModes".into(), Value::Object(modes));
        }
        doc.insert("settings".into(), Value::Object(settings));

        Value::Object(doc)
    }
}
