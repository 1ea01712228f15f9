//! Push handler - applies client changes under optimistic concurrency.

use crate::db::{self, StoredRecord};
use crate::error::{AppError, Result};
use crate::handlers::now_ms;
use cuaderno_engine::protocol::decode_record;
use cuaderno_engine::{
    Fields, PushConflict, PushRequest, PushResponse, PushTableChanges, RecordId, RejectedRecord,
};
use sqlx::PgPool;
use std::collections::HashSet;

/// Longest table name accepted, matching PostgreSQL identifiers.
const MAX_TABLE_NAME_LEN: usize = 63;

/// One decoded change from a push body.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingChange {
    pub id: RecordId,
    pub fields: Fields,
    pub deleted: bool,
}

/// What to do with an incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecision {
    Apply,
    Conflict,
}

/// Process a push request from a client.
pub async fn handle_push(pool: &PgPool, request: PushRequest) -> Result<PushResponse> {
    for table in request.changes.keys() {
        validate_table_name(table)?;
    }

    let now = now_ms();
    let mut conflicts = Vec::new();
    let mut rejected = Vec::new();
    let mut applied = 0usize;

    for (table, changes) in &request.changes {
        let forced: HashSet<&str> = changes.force.iter().map(String::as_str).collect();

        for change in decode_changes(table, changes, &mut rejected) {
            let existing = db::get_record(pool, table, &change.id).await?;
            let decision = decide(
                existing.as_ref(),
                request.last_pulled_at,
                forced.contains(change.id.as_str()),
            );

            match decision {
                PushDecision::Apply => {
                    db::upsert_record(pool, table, &change.id, &change.fields, change.deleted, now)
                        .await?;
                    applied += 1;
                }
                PushDecision::Conflict => {
                    tracing::info!(table = %table, record_id = %change.id, "Push conflict");
                    if let Some(row) = existing {
                        conflicts.push(conflict_for(row)?);
                    }
                }
            }
        }
    }

    tracing::debug!(
        applied,
        conflicts = conflicts.len(),
        rejected = rejected.len(),
        "Processed push"
    );

    Ok(PushResponse {
        conflicts,
        rejected,
        timestamp: Some(now as u64),
    })
}

/// Concurrency check for one change.
///
/// The change loses when the server copy moved after the client's cursor,
/// unless the client resolved that conflict already and forces it.
pub fn decide(existing: Option<&StoredRecord>, cursor: Option<u64>, forced: bool) -> PushDecision {
    match existing {
        Some(row) if !forced && row.changed_since(cursor) => PushDecision::Conflict,
        _ => PushDecision::Apply,
    }
}

/// Decode a table's changes, moving malformed entries into `rejected`.
pub fn decode_changes(
    table: &str,
    changes: &PushTableChanges,
    rejected: &mut Vec<RejectedRecord>,
) -> Vec<IncomingChange> {
    let mut incoming = Vec::with_capacity(changes.created.len() + changes.updated.len());

    for value in changes.created.iter().chain(&changes.updated) {
        match decode_record(value) {
            Ok((id, fields)) => incoming.push(IncomingChange {
                id,
                fields,
                deleted: false,
            }),
            Err(e) => rejected.push(RejectedRecord {
                table: table.to_string(),
                id: value
                    .get("id")
                    .and_then(|id| id.as_str())
                    .unwrap_or_default()
                    .to_string(),
                reason: e.to_string(),
            }),
        }
    }

    for deleted in &changes.deleted {
        if deleted.id.is_empty() {
            rejected.push(RejectedRecord {
                table: table.to_string(),
                id: String::new(),
                reason: "deletion without id".to_string(),
            });
            continue;
        }
        incoming.push(IncomingChange {
            id: deleted.id.clone(),
            fields: Fields::new(),
            deleted: true,
        });
    }

    incoming
}

fn conflict_for(row: StoredRecord) -> Result<PushConflict> {
    let server_record = if row.deleted {
        None
    } else {
        Some(row.field_map().ok_or_else(|| {
            AppError::Internal(format!(
                "stored fields of {}/{} are not an object",
                row.table_name, row.record_id
            ))
        })?)
    };

    Ok(PushConflict {
        table: row.table_name,
        id: row.record_id,
        reason: Some("record changed on the server after lastPulledAt".to_string()),
        server_record,
    })
}

/// Table names become part of the stored key; keep them identifier-shaped.
pub fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.len() <= MAX_TABLE_NAME_LEN
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("invalid table name: {table:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuaderno_engine::protocol::DeletedRecord;
    use serde_json::json;

    fn stored(server_ts: i64, deleted: bool) -> StoredRecord {
        StoredRecord {
            table_name: "parcelas".into(),
            record_id: "p1".into(),
            fields: json!({"nombre": "Servidor"}),
            deleted,
            created_ts: 10,
            server_ts,
        }
    }

    #[test]
    fn new_record_is_applied() {
        assert_eq!(decide(None, Some(100), false), PushDecision::Apply);
        assert_eq!(decide(None, None, false), PushDecision::Apply);
    }

    #[test]
    fn stale_client_conflicts() {
        let row = stored(150, false);
        assert_eq!(decide(Some(&row), Some(100), false), PushDecision::Conflict);
        assert_eq!(decide(Some(&row), None, false), PushDecision::Conflict);
        assert_eq!(decide(Some(&row), Some(150), false), PushDecision::Apply);
    }

    #[test]
    fn forced_change_skips_the_check() {
        let row = stored(150, false);
        assert_eq!(decide(Some(&row), Some(100), true), PushDecision::Apply);
    }

    #[test]
    fn conflict_carries_server_copy() {
        let conflict = conflict_for(stored(150, false)).unwrap();
        assert_eq!(conflict.id, "p1");
        assert_eq!(conflict.server_record.unwrap()["nombre"], "Servidor");

        let deleted = conflict_for(stored(150, true)).unwrap();
        assert_eq!(deleted.server_record, None);
    }

    #[test]
    fn malformed_changes_are_rejected() {
        let changes = PushTableChanges {
            created: vec![
                json!({"id": "p1", "nombre": "Bien", "_status": "created"}),
                json!({"nombre": "Sin id"}),
            ],
            updated: vec![json!("no es un objeto")],
            deleted: vec![
                DeletedRecord {
                    id: "p9".into(),
                    status: "deleted".into(),
                },
                DeletedRecord {
                    id: String::new(),
                    status: "deleted".into(),
                },
            ],
            force: vec![],
        };
        let mut rejected = Vec::new();
        let incoming = decode_changes("parcelas", &changes, &mut rejected);

        assert_eq!(incoming.len(), 2);
        assert_eq!(incoming[0].id, "p1");
        assert!(!incoming[0].fields.contains_key("_status"));
        assert!(incoming[1].deleted);
        assert_eq!(rejected.len(), 3);
        assert!(rejected.iter().all(|r| r.table == "parcelas"));
    }

    #[test]
    fn table_names() {
        assert!(validate_table_name("parcelas").is_ok());
        assert!(validate_table_name("tabla_2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("drop table;").is_err());
        assert!(validate_table_name(&"x".repeat(64)).is_err());
    }
}
