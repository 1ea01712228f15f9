//! Pull handler - serves every change after the client's cursor.

use crate::db::{self, StoredRecord};
use crate::error::{AppError, Result};
use crate::handlers::now_ms;
use cuaderno_engine::protocol::encode_record;
use cuaderno_engine::{PullRequest, PullResponse, PullTableChanges, TableName};
use sqlx::PgPool;
use std::collections::BTreeMap;

/// Process a pull request from a client.
pub async fn handle_pull(pool: &PgPool, request: PullRequest) -> Result<PullResponse> {
    if request.schema_version == 0 {
        return Err(AppError::BadRequest(
            "schemaVersion must be at least 1".to_string(),
        ));
    }

    let now = now_ms();
    let rows = db::get_records_since(pool, request.last_pulled_at).await?;
    let changes = group_changes(&rows, request.last_pulled_at)?;

    // The cursor must cover every row handed out, even one stamped by a
    // clock that ran ahead of ours.
    let newest = rows.iter().map(|r| r.server_ts).max().unwrap_or(now);
    let timestamp = now.max(newest) as u64;

    tracing::debug!(
        since = ?request.last_pulled_at,
        rows = rows.len(),
        timestamp,
        "Served pull"
    );

    Ok(PullResponse { changes, timestamp })
}

/// Sort rows into per-table `created`, `updated` and `deleted` lists.
///
/// A row counts as created when it first appeared after the cursor; a
/// first pull (no cursor) sees every live row as created.
pub fn group_changes(
    rows: &[StoredRecord],
    cursor: Option<u64>,
) -> Result<BTreeMap<TableName, PullTableChanges>> {
    let mut changes: BTreeMap<TableName, PullTableChanges> = BTreeMap::new();

    for row in rows.iter().filter(|r| r.changed_since(cursor)) {
        let table = changes.entry(row.table_name.clone()).or_default();
        if row.deleted {
            table.deleted.push(row.record_id.clone());
            continue;
        }

        let fields = row.field_map().ok_or_else(|| {
            AppError::Internal(format!(
                "stored fields of {}/{} are not an object",
                row.table_name, row.record_id
            ))
        })?;
        let created = cursor.map_or(true, |c| row.created_ts as u64 > c);
        if created {
            table
                .created
                .push(encode_record(&row.record_id, &fields, "created"));
        } else {
            table
                .updated
                .push(encode_record(&row.record_id, &fields, "updated"));
        }
    }

    Ok(changes)
}
