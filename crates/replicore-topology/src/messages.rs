//! Wire documents exchanged between members.
//!
//! Documents are `serde_json::Value` objects on the wire; the typed structs
//! here are the parsed forms the topology coordinator reasons about. Key
//! names follow the command protocol exactly (`replSetHeartbeat`,
//! `configVersion`, `$replData`, ...).

use replicore_config::ReplicaSetConfig;
use replicore_types::{Error, HostAndPort, MemberId, MemberState, OpTime, Result, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Serializes an op-time as its wire sub-document.
fn op_time_to_document(op_time: OpTime) -> Value {
    json!({
        "ts": {"secs": op_time.timestamp.secs, "inc": op_time.timestamp.inc},
        "t": op_time.term,
    })
}

/// Parses an op-time sub-document.
fn op_time_from_document(doc: &Value) -> Option<OpTime> {
    let ts = doc.get("ts")?;
    let secs = ts.get("secs")?.as_u64()? as u32;
    let inc = ts.get("inc")?.as_u64()? as u32;
    let term = doc.get("t")?.as_i64()?;
    Some(OpTime::new(Timestamp::new(secs, inc), term))
}

// ============================================================================
// Heartbeat Request
// ============================================================================

/// An outbound `replSetHeartbeat` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// The set name (the value of the `replSetHeartbeat` key).
    pub set_name: String,
    pub protocol_version: i64,
    pub config_version: i64,
    pub sender_host: HostAndPort,
    pub sender_id: MemberId,
    /// Set during the initiate quorum round: the target must have no data
    /// and no config.
    pub check_empty: bool,
}

impl HeartbeatRequest {
    pub fn to_document(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("replSetHeartbeat".into(), Value::from(self.set_name.clone()));
        doc.insert("protocolVersion".into(), Value::from(self.protocol_version));
        doc.insert("configVersion".into(), Value::from(self.config_version));
        doc.insert(
            "senderHost".into(),
            Value::from(self.sender_host.to_string()),
        );
        doc.insert("senderId".into(), Value::from(self.sender_id.as_i32()));
        if self.check_empty {
            doc.insert("checkEmpty".into(), Value::from(true));
        }
        Value::Object(doc)
    }

    pub fn from_document(doc: &Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::BadValue("heartbeat request must be an object".into()))?;
        let set_name = obj
            .get("replSetHeartbeat")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadValue("Missing expected field \"replSetHeartbeat\"".into()))?
            .to_string();
        let sender_host = obj
            .get("senderHost")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadValue("Missing expected field \"senderHost\"".into()))?
            .parse::<HostAndPort>()?;
        Ok(Self {
            set_name,
            protocol_version: obj
                .get("protocolVersion")
                .and_then(Value::as_i64)
                .unwrap_or(1),
            config_version: obj.get("configVersion").and_then(Value::as_i64).unwrap_or(-1),
            sender_host,
            sender_id: MemberId::new(
                obj.get("senderId").and_then(Value::as_i64).unwrap_or(-1) as i32,
            ),
            check_empty: obj.get("checkEmpty").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

// ============================================================================
// Heartbeat Response
// ============================================================================

/// A parsed `replSetHeartbeat` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub set_name: String,
    pub state: MemberState,
    pub config_version: i64,
    pub op_time: OpTime,
    /// Present when the responder believes it is primary.
    pub election_time: Option<Timestamp>,
    /// Present when the responder holds a newer config than the requester.
    pub config: Option<ReplicaSetConfig>,
    /// Reported sync source, if any.
    pub syncing_to: Option<HostAndPort>,
    /// The responder's term (protocol version 1).
    pub term: i64,
}

impl HeartbeatResponse {
    pub fn to_document(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("ok".into(), Value::from(if self.ok { 1 } else { 0 }));
        doc.insert("setName".into(), Value::from(self.set_name.clone()));
        doc.insert("state".into(), Value::from(self.state.as_str()));
        doc.insert("configVersion".into(), Value::from(self.config_version));
        doc.insert("opTime".into(), op_time_to_document(self.op_time));
        doc.insert("term".into(), Value::from(self.term));
        if let Some(election_time) = self.election_time {
            doc.insert(
                "electionTime".into(),
                json!({"secs": election_time.secs, "inc": election_time.inc}),
            );
        }
        if let Some(config) = &self.config {
            doc.insert("config".into(), config.to_document());
        }
        if let Some(syncing_to) = &self.syncing_to {
            doc.insert("syncingTo".into(), Value::from(syncing_to.to_string()));
        }
        Value::Object(doc)
    }

    pub fn from_document(doc: &Value) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::BadValue("heartbeat response must be an object".into()))?;
        let ok = obj.get("ok").and_then(Value::as_i64).unwrap_or(0) == 1;
        let state = obj
            .get("state")
            .and_then(Value::as_str)
            .map_or(MemberState::Unknown, |s| match s {
                "STARTUP" => MemberState::Startup,
                "STARTUP2" => MemberState::Startup2,
                "SECONDARY" => MemberState::Secondary,
                "RECOVERING" => MemberState::Recovering,
                "ROLLBACK" => MemberState::Rollback,
                "PRIMARY" => MemberState::Primary,
                "ARBITER" => MemberState::Arbiter,
                "DOWN" => MemberState::Down,
                "REMOVED" => MemberState::Removed,
                _ => MemberState::Unknown,
            });
        let election_time = obj.get("electionTime").and_then(|v| {
            Some(Timestamp::new(
                v.get("secs")?.as_u64()? as u32,
                v.get("inc")?.as_u64()? as u32,
            ))
        });
        let config = match obj.get("config") {
            Some(config_doc) => Some(ReplicaSetConfig::from_document(config_doc)?),
            None => None,
        };
        let syncing_to = obj
            .get("syncingTo")
            .and_then(Value::as_str)
            .map(str::parse)
            .transpose()?;
        Ok(Self {
            ok,
            set_name: obj
                .get("setName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            state,
            config_version: obj.get("configVersion").and_then(Value::as_i64).unwrap_or(-1),
            op_time: obj
                .get("opTime")
                .and_then(op_time_from_document)
                .unwrap_or(OpTime::ZERO),
            election_time,
            config,
            syncing_to,
            term: obj.get("term").and_then(Value::as_i64).unwrap_or(-1),
        })
    }
}

// ============================================================================
// Replica-Set Metadata
// ============================================================================

/// The `$replData` metadata block attached to command replies.
///
/// `primary_index` is carried on the wire but never trusted by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetMetadata {
    pub last_op_committed: OpTime,
    pub last_op_visible: OpTime,
    pub config_version: i64,
    pub primary_index: i64,
    pub term: i64,
    pub sync_source_index: i64,
}

impl ReplicaSetMetadata {
    pub fn to_document(&self) -> Value {
        json!({
            "$replData": {
                "lastOpCommitted": op_time_to_document(self.last_op_committed),
                "lastOpVisible": op_time_to_document(self.last_op_visible),
                "configVersion": self.config_version,
                "primaryIndex": self.primary_index,
                "term": self.term,
                "syncSourceIndex": self.sync_source_index,
            }
        })
    }

    pub fn from_document(doc: &Value) -> Result<Self> {
        let data = doc
            .get("$replData")
            .ok_or_else(|| Error::BadValue("Missing expected field \"$replData\"".into()))?;
        let last_op_committed = data
            .get("lastOpCommitted")
            .and_then(op_time_from_document)
            .ok_or_else(|| Error::BadValue("Missing expected field \"lastOpCommitted\"".into()))?;
        let last_op_visible = data
            .get("lastOpVisible")
            .and_then(op_time_from_document)
            .unwrap_or(last_op_committed);
        Ok(Self {
            last_op_committed,
            last_op_visible,
            config_version: data
                .get("configVersion")
                .and_then(Value::as_i64)
                .unwrap_or(-1),
            primary_index: data.get("primaryIndex").and_then(Value::as_i64).unwrap_or(-1),
            term: data.get("term").and_then(Value::as_i64).unwrap_or(-1),
            sync_source_index: data
                .get("syncSourceIndex")
                .and_then(Value::as_i64)
                .unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_request_round_trip() {
        let request = HeartbeatRequest {
            set_name: "mySet".into(),
            protocol_version: 1,
            config_version: 3,
            sender_host: HostAndPort::new("node1", 12345),
            sender_id: MemberId::new(0),
            check_empty: true,
        };
        let doc = request.to_document();
        assert_eq!(doc.get("replSetHeartbeat"), Some(&Value::from("mySet")));
        assert_eq!(doc.get("checkEmpty"), Some(&Value::from(true)));
        let back = HeartbeatRequest::from_document(&doc).expect("round trip");
        assert_eq!(request, back);
    }

    #[test]
    fn check_empty_omitted_when_false() {
        let request = HeartbeatRequest {
            set_name: "mySet".into(),
            protocol_version: 1,
            config_version: 3,
            sender_host: HostAndPort::new("node1", 12345),
            sender_id: MemberId::new(0),
            check_empty: false,
        };
        assert!(request.to_document().get("checkEmpty").is_none());
    }

    #[test]
    fn heartbeat_response_round_trip() {
        let response = HeartbeatResponse {
            ok: true,
            set_name: "mySet".into(),
            state: MemberState::Primary,
            config_version: 2,
            op_time: OpTime::new(Timestamp::new(100, 1), 1),
            election_time: Some(Timestamp::new(90, 0)),
            config: None,
            syncing_to: Some(HostAndPort::new("node2", 12345)),
            term: 1,
        };
        let back = HeartbeatResponse::from_document(&response.to_document()).expect("round trip");
        assert_eq!(response, back);
    }

    #[test]
    fn metadata_round_trip() {
        let metadata = ReplicaSetMetadata {
            last_op_committed: OpTime::new(Timestamp::new(10, 0), 1),
            last_op_visible: OpTime::new(Timestamp::new(10, 0), 1),
            config_version: 2,
            primary_index: 0,
            term: 1,
            sync_source_index: -1,
        };
        let doc = metadata.to_document();
        assert!(doc.get("$replData").is_some());
        let back = ReplicaSetMetadata::from_document(&doc).expect("round trip");
        assert_eq!(metadata, back);
    }

    #[test]
    fn metadata_requires_repl_data_key() {
        let err = ReplicaSetMetadata::from_document(&json!({"other": 1})).unwrap_err();
        assert!(err.to_string().contains("$replData"));
    }
}
