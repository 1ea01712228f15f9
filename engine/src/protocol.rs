//! Wire format of the pull/push endpoints.
//!
//! ```text
//! POST {base}/sync/pull  {lastPulledAt, schemaVersion, migration}
//!   -> {changes: {<table>: {created: [...], updated: [...], deleted: [id...]}}, timestamp}
//!
//! POST {base}/sync/push  {changes: {<table>: {created, updated, deleted: [{id, status}]}}, lastPulledAt}
//!   -> {conflicts: [...], rejected: [...], timestamp}
//! ```
//!
//! Records travel as flat JSON objects: the business fields plus `id` and a
//! `_status` marker. Keys starting with `_` are protocol metadata and never
//! reach the local store.

use crate::{
    error::Result, Error, Fields, OperationType, RecordId, SchemaVersion, SyncOperation,
    TableName, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const PULL_PATH: &str = "/sync/pull";
pub const PUSH_PATH: &str = "/sync/push";

/// Request body of a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Cursor returned by the previous pull; `None` fetches everything.
    pub last_pulled_at: Option<Timestamp>,
    pub schema_version: SchemaVersion,
    #[serde(default)]
    pub migration: Option<Value>,
}

/// Changes of one table in a pull response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullTableChanges {
    #[serde(default)]
    pub created: Vec<Value>,
    #[serde(default)]
    pub updated: Vec<Value>,
    #[serde(default)]
    pub deleted: Vec<RecordId>,
}

impl PullTableChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Response body of a pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub changes: BTreeMap<TableName, PullTableChanges>,
    /// Server time of this pull; the next cursor.
    pub timestamp: Timestamp,
}

impl PullResponse {
    pub fn change_count(&self) -> usize {
        self.changes.values().map(PullTableChanges::len).sum()
    }
}

/// A deletion in a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRecord {
    pub id: RecordId,
    pub status: String,
}

/// Changes of one table in a push request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushTableChanges {
    #[serde(default)]
    pub created: Vec<Value>,
    #[serde(default)]
    pub updated: Vec<Value>,
    #[serde(default)]
    pub deleted: Vec<DeletedRecord>,
    /// Ids whose change must bypass the server's concurrency check.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub force: Vec<RecordId>,
}

/// Request body of a push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: BTreeMap<TableName, PushTableChanges>,
    pub last_pulled_at: Option<Timestamp>,
}

impl PushRequest {
    /// Group a batch of operations into a push body.
    pub fn from_operations<'a>(
        operations: impl IntoIterator<Item = &'a SyncOperation>,
        last_pulled_at: Option<Timestamp>,
    ) -> Self {
        let mut changes: BTreeMap<TableName, PushTableChanges> = BTreeMap::new();
        for op in operations {
            let table = changes.entry(op.table_name.clone()).or_default();
            match op.operation_type {
                OperationType::Create => table
                    .created
                    .push(encode_record(&op.record_id, &op.payload, "created")),
                OperationType::Update => table
                    .updated
                    .push(encode_record(&op.record_id, &op.payload, "updated")),
                OperationType::Delete => table.deleted.push(DeletedRecord {
                    id: op.record_id.clone(),
                    status: "deleted".into(),
                }),
            }
            if op.force_overwrite {
                table.force.push(op.record_id.clone());
            }
        }
        Self {
            changes,
            last_pulled_at,
        }
    }

    pub fn change_count(&self) -> usize {
        self.changes
            .values()
            .map(|t| t.created.len() + t.updated.len() + t.deleted.len())
            .sum()
    }
}

/// A change the server refused because its copy moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConflict {
    #[serde(alias = "type")]
    pub table: TableName,
    pub id: RecordId,
    #[serde(default)]
    pub reason: Option<String>,
    /// Server version; `None` if the server deleted the record.
    #[serde(default, alias = "server_data")]
    pub server_record: Option<Fields>,
}

/// A change the server refused as invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    #[serde(alias = "type")]
    pub table: TableName,
    pub id: RecordId,
    pub reason: String,
}

/// Response body of a push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    #[serde(default)]
    pub conflicts: Vec<PushConflict>,
    #[serde(default)]
    pub rejected: Vec<RejectedRecord>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// Flatten a record for the wire.
pub fn encode_record(id: &str, fields: &Fields, status: &str) -> Value {
    let mut obj = fields.clone();
    obj.insert("id".into(), Value::String(id.to_string()));
    obj.insert("_status".into(), Value::String(status.to_string()));
    Value::Object(obj)
}

/// Split a wire record into its id and business fields.
pub fn decode_record(value: &Value) -> Result<(RecordId, Fields)> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidPayload("record must be an object".into()))?;
    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(Error::InvalidPayload("record without id".into())),
    };
    let fields = obj
        .iter()
        .filter(|(k, _)| k.as_str() != "id" && !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok((id, fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EnqueueOptions;
    use serde_json::json;

    fn op(kind: OperationType, id: &str, force: bool) -> SyncOperation {
        let mut op = SyncOperation::new(
            kind,
            "parcelas",
            id,
            json!({"nombre": "A", "superficie": 1.5})
                .as_object()
                .cloned()
                .unwrap(),
            None,
            EnqueueOptions::default(),
            3,
            0,
            1_000,
        );
        op.force_overwrite = force;
        op
    }

    #[test]
    fn pull_request_shape() {
        let request = PullRequest {
            last_pulled_at: None,
            schema_version: 1,
            migration: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"lastPulledAt": null, "schemaVersion": 1, "migration": null})
        );
    }

    #[test]
    fn pull_response_tolerates_missing_lists() {
        let response: PullResponse = serde_json::from_value(json!({
            "changes": {"parcelas": {"deleted": ["p9"]}},
            "timestamp": 1706745600000u64
        }))
        .unwrap();

        let parcelas = &response.changes["parcelas"];
        assert!(parcelas.created.is_empty());
        assert_eq!(parcelas.deleted, vec!["p9".to_string()]);
        assert_eq!(response.change_count(), 1);
    }

    #[test]
    fn push_request_groups_by_kind() {
        let ops = [
            op(OperationType::Create, "p1", false),
            op(OperationType::Update, "p2", true),
            op(OperationType::Delete, "p3", false),
        ];
        let request = PushRequest::from_operations(&ops, Some(77));
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["lastPulledAt"], 77);
        let parcelas = &value["changes"]["parcelas"];
        assert_eq!(parcelas["created"][0]["id"], "p1");
        assert_eq!(parcelas["created"][0]["_status"], "created");
        assert_eq!(parcelas["updated"][0]["superficie"], 1.5);
        assert_eq!(parcelas["deleted"][0], json!({"id": "p3", "status": "deleted"}));
        assert_eq!(parcelas["force"], json!(["p2"]));
        assert_eq!(request.change_count(), 3);
    }

    #[test]
    fn force_omitted_when_empty() {
        let request = PushRequest::from_operations(&[op(OperationType::Create, "p1", false)], None);
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["changes"]["parcelas"].get("force").is_none());
    }

    #[test]
    fn push_response_accepts_legacy_conflict_keys() {
        let response: PushResponse = serde_json::from_value(json!({
            "conflicts": [{
                "type": "parcelas",
                "id": "p1",
                "reason": "server_newer",
                "server_data": {"nombre": "Servidor"}
            }]
        }))
        .unwrap();

        assert_eq!(response.conflicts[0].table, "parcelas");
        assert_eq!(
            response.conflicts[0].server_record.as_ref().unwrap()["nombre"],
            "Servidor"
        );
        assert!(response.rejected.is_empty());
        assert_eq!(response.timestamp, None);
    }

    #[test]
    fn decode_strips_metadata() {
        let (id, fields) = decode_record(&json!({
            "id": "p1",
            "_status": "synced",
            "_changed": "",
            "nombre": "Finca"
        }))
        .unwrap();

        assert_eq!(id, "p1");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["nombre"], "Finca");
    }

    #[test]
    fn decode_requires_id() {
        assert!(decode_record(&json!({"nombre": "x"})).is_err());
        assert!(decode_record(&json!({"id": ""})).is_err());
        assert!(decode_record(&json!("p1")).is_err());
        assert_eq!(decode_record(&json!({"id": 42})).unwrap().0, "42");
    }
}
