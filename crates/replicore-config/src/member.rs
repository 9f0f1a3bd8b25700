//! Per-member configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use replicore_types::{Error, HostAndPort, MemberId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration of a single replica-set member.
///
/// Invariants (enforced by [`MemberConfig::validate`]):
/// - `arbiter_only` implies `votes == 1` and `priority == 0`
/// - `hidden` implies `priority == 0`
/// - `votes == 0` implies `priority == 0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: MemberId,
    pub host: HostAndPort,
    pub priority: f64,
    pub votes: u32,
    pub arbiter_only: bool,
    pub hidden: bool,
    pub build_indexes: bool,
    pub slave_delay: Duration,
    pub tags: BTreeMap<String, String>,
}

impl MemberConfig {
    /// Parses a member sub-document.
    ///
    /// Field defaults match the wire protocol: `priority` 1 (0 for arbiters),
    /// `votes` 1, `buildIndexes` true, everything else off/empty.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let obj = doc.as_object().ok_or_else(|| {
            Error::InvalidReplicaSetConfig("replica set members must be objects".into())
        })?;

        let id = obj
            .get("_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::InvalidReplicaSetConfig("Missing expected field \"_id\"".into()))?;

        let host = obj
            .get("host")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::InvalidReplicaSetConfig("Missing expected field \"host\"".into())
            })?
            .parse::<HostAndPort>()
            .map_err(|e| Error::InvalidReplicaSetConfig(e.to_string()))?;

        let arbiter_only = obj
            .get("arbiterOnly")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let priority = obj
            .get("priority")
            .and_then(Value::as_f64)
            .unwrap_or(if arbiter_only { 0.0 } else { 1.0 });

        #[allow(clippy::cast_sign_loss)]
        let votes = obj.get("votes").and_then(Value::as_i64).unwrap_or(1);
        if !(0..=1).contains(&votes) {
            return Err(Error::InvalidReplicaSetConfig(format!(
                "votes must be 0 or 1, but found {votes}"
            )));
        }

        let hidden = obj.get("hidden").and_then(Value::as_bool).unwrap_or(false);
        let build_indexes = obj
            .get("buildIndexes")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        #[allow(clippy::cast_sign_loss)]
        let slave_delay = Duration::from_secs(
            obj.get("slaveDelay")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );

        let mut tags = BTreeMap::new();
        if let Some(tag_obj) = obj.get("tags").and_then(Value::as_object) {
            for (key, value) in tag_obj {
                let value = value.as_str().ok_or_else(|| {
                    Error::InvalidReplicaSetConfig(format!(
                        "tag \"{key}\" must map to a string value"
                    ))
                })?;
                tags.insert(key.clone(), value.to_string());
            }
        }

        let member = Self {
            id: MemberId::new(id as i32),
            host,
            priority,
            votes: votes as u32,
            arbiter_only,
            hidden,
            build_indexes,
            slave_delay,
            tags,
        };
        member.validate()?;
        Ok(member)
    }

    /// Checks the per-member invariants.
    pub fn validate(&self) -> Result<()> {
        if self.priority < 0.0 {
            return Err(Error::InvalidReplicaSetConfig(format!(
                "priority must be non-negative, but found {}",
                self.priority
            )));
        }
        if self.votes == 0 && self.priority > 0.0 {
            return Err(Error::InvalidReplicaSetConfig(
                "priority must be 0 when non-voting (votes:0)".into(),
            ));
        }
        if self.hidden && self.priority > 0.0 {
            return Err(Error::InvalidReplicaSetConfig(
                "priority must be 0 when hidden=true".into(),
            ));
        }
        if self.arbiter_only && self.votes != 1 {
            return Err(Error::InvalidReplicaSetConfig(format!(
                "arbiter must vote, but found votes:{}",
                self.votes
            )));
        }
        if self.arbiter_only && self.priority > 0.0 {
            return Err(Error::InvalidReplicaSetConfig(
                "priority must be 0 for arbiters".into(),
            ));
        }
        Ok(())
    }

    /// Returns true if this member votes in elections.
    pub fn is_voter(&self) -> bool {
        self.votes > 0
    }

    /// Returns true if this member counts toward data-durability majorities
    /// (a voter that bears data).
    pub fn is_writable_voter(&self) -> bool {
        self.is_voter() && !self.arbiter_only
    }

    /// Returns true if this member may stand for election.
    pub fn is_electable(&self) -> bool {
        !self.arbiter_only && !self.hidden && self.priority > 0.0
    }

    /// Serializes back into a member sub-document.
    pub fn to_document(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("_id".into(), Value::from(self.id.as_i32()));
        doc.insert("host".into(), Value::from(self.host.to_string()));
        doc.insert("priority".into(), Value::from(self.priority));
        doc.insert("votes".into(), Value::from(self.votes));
        if self.arbiter_only {
            doc.insert("arbiterOnly".into(), Value::from(true));
        }
        if self.hidden {
            doc.insert("hidden".into(), Value::from(true));
        }
        if !self.build_indexes {
            doc.insert("buildIndexes".into(), Value::from(false));
        }
        if !self.slave_delay.is_zero() {
            doc.insert("slaveDelay".into(), Value::from(self.slave_delay.as_secs()));
        }
        if !self.tags.is_empty() {
            let tags: serde_json::Map<String, Value> = self
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect();
            doc.insert("tags".into(), Value::Object(tags));
        }
        Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicore_types::ErrorCode;
    use serde_json::json;

    #[test]
    fn parses_minimal_member() {
        let m = MemberConfig::from_document(&json!({"_id": 0, "host": "node1:12345"}))
            .expect("minimal member");
        assert_eq!(m.id, MemberId::new(0));
        assert_eq!(m.host, HostAndPort::new("node1", 12345));
        assert_eq!(m.priority, 1.0);
        assert_eq!(m.votes, 1);
        assert!(m.build_indexes);
        assert!(m.is_electable());
        assert!(m.is_writable_voter());
    }

    #[test]
    fn arbiter_defaults_priority_zero() {
        let m = MemberConfig::from_document(
            &json!({"_id": 2, "host": "arb:1", "arbiterOnly": true}),
        )
        .expect("arbiter");
        assert_eq!(m.priority, 0.0);
        assert!(m.is_voter());
        assert!(!m.is_writable_voter());
        assert!(!m.is_electable());
    }

    #[test]
    fn nonvoter_with_priority_rejected() {
        let err = MemberConfig::from_document(
            &json!({"_id": 1, "host": "node2:1", "votes": 0, "priority": 1}),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidReplicaSetConfig);
        assert!(err
            .to_string()
            .contains("priority must be 0 when non-voting (votes:0)"));
    }

    #[test]
    fn hidden_with_priority_rejected() {
        let err = MemberConfig::from_document(
            &json!({"_id": 1, "host": "node2:1", "hidden": true, "priority": 2}),
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("priority must be 0 when hidden=true"));
    }

    #[test]
    fn votes_out_of_range_rejected() {
        let err =
            MemberConfig::from_document(&json!({"_id": 1, "host": "node2:1", "votes": 3}))
                .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidReplicaSetConfig);
    }

    #[test]
    fn missing_id_rejected() {
        let err = MemberConfig::from_document(&json!({"host": "node2:1"})).unwrap_err();
        assert!(err.to_string().contains("Missing expected field \"_id\""));
    }

    #[test]
    fn tags_parsed() {
        let m = MemberConfig::from_document(
            &json!({"_id": 0, "host": "h:1", "tags": {"dc": "NA", "rack": "rk1"}}),
        )
        .expect("tagged member");
        assert_eq!(m.tags.get("dc").map(String::as_str), Some("NA"));
        assert_eq!(m.tags.get("rack").map(String::as_str), Some("rk1"));
    }

    #[test]
    fn document_round_trip() {
        let doc = json!({
            "_id": 3,
            "host": "node4:27017",
            "priority": 0.0,
            "votes": 0,
            "hidden": true,
            "slaveDelay": 3600,
            "tags": {"dc": "EU"}
        });
        let m = MemberConfig::from_document(&doc).expect("member");
        let back = MemberConfig::from_document(&m.to_document()).expect("round trip");
        assert_eq!(m, back);
    }
}
