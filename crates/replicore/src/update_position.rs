//! The `replSetUpdatePosition` payload.
//!
//! Secondaries report their own applied position and every position they
//! have learned from live downstream members, so the primary's liveness view
//! is transitive.

use replicore_types::{Error, MemberId, OpTime, Result, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// One `optimes` array entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePositionEntry {
    pub config_version: i64,
    pub member_id: MemberId,
    pub op_time: OpTime,
}

impl UpdatePositionEntry {
    pub fn to_document(&self) -> Value {
        json!({
            "cfgver": self.config_version,
            "memberId": self.member_id.as_i32(),
            "optime": {
                "ts": {"secs": self.op_time.timestamp.secs, "inc": self.op_time.timestamp.inc},
                "t": self.op_time.term,
            },
        })
    }

    pub fn from_document(doc: &Value) -> Result<Self> {
        let config_version = doc
            .get("cfgver")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::BadValue("Missing expected field \"cfgver\"".into()))?;
        let member_id = doc
            .get("memberId")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::BadValue("Missing expected field \"memberId\"".into()))?;
        let op_time = doc
            .get("optime")
            .and_then(|optime| {
                let ts = optime.get("ts")?;
                Some(OpTime::new(
                    Timestamp::new(
                        ts.get("secs")?.as_u64()? as u32,
                        ts.get("inc")?.as_u64()? as u32,
                    ),
                    optime.get("t")?.as_i64()?,
                ))
            })
            .ok_or_else(|| Error::BadValue("Missing expected field \"optime\"".into()))?;
        Ok(Self {
            config_version,
            member_id: MemberId::new(member_id as i32),
            op_time,
        })
    }
}

/// The parsed command arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePositionArgs {
    pub entries: Vec<UpdatePositionEntry>,
}

impl UpdatePositionArgs {
    pub fn to_document(&self) -> Value {
        json!({
            "replSetUpdatePosition": 1,
            "optimes": self
                .entries
                .iter()
                .map(UpdatePositionEntry::to_document)
                .collect::<Vec<_>>(),
        })
    }

    pub fn from_document(doc: &Value) -> Result<Self> {
        if doc.get("replSetUpdatePosition").is_none() {
            return Err(Error::BadValue(
                "Missing expected field \"replSetUpdatePosition\"".into(),
            ));
        }
        let entries = doc
            .get("optimes")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::BadValue("Missing expected field \"optimes\"".into()))?
            .iter()
            .map(UpdatePositionEntry::from_document)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }
}
