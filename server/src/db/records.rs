//! Database operations for the sync_records table.

use cuaderno_engine::Fields;
use sqlx::{PgPool, Row};

/// A stored record row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub table_name: String,
    pub record_id: String,
    pub fields: serde_json::Value,
    pub deleted: bool,
    pub created_ts: i64,
    pub server_ts: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            fields: row.try_get("fields")?,
            deleted: row.try_get("deleted")?,
            created_ts: row.try_get("created_ts")?,
            server_ts: row.try_get("server_ts")?,
        })
    }
}

impl StoredRecord {
    /// Business fields of the row, `None` if the column does not hold an object.
    pub fn field_map(&self) -> Option<Fields> {
        self.fields.as_object().cloned()
    }

    /// Whether the row changed after the client's pull cursor.
    pub fn changed_since(&self, cursor: Option<u64>) -> bool {
        match cursor {
            None => true,
            Some(cursor) => self.server_ts as u64 > cursor,
        }
    }
}

/// Insert or replace a record. `created_ts` is kept from the first write.
pub async fn upsert_record(
    pool: &PgPool,
    table_name: &str,
    record_id: &str,
    fields: &Fields,
    deleted: bool,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sync_records (
            table_name, record_id, fields, deleted, created_ts, server_ts
        )
        VALUES ($1, $2, $3, $4, $5, $5)
        ON CONFLICT (table_name, record_id) DO UPDATE SET
            fields = CASE WHEN EXCLUDED.deleted THEN sync_records.fields ELSE EXCLUDED.fields END,
            deleted = EXCLUDED.deleted,
            server_ts = EXCLUDED.server_ts
        "#,
    )
    .bind(table_name)
    .bind(record_id)
    .bind(serde_json::Value::Object(fields.clone()))
    .bind(deleted)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a record, tombstones included.
pub async fn get_record(
    pool: &PgPool,
    table_name: &str,
    record_id: &str,
) -> Result<Option<StoredRecord>, sqlx::Error> {
    sqlx::query_as::<_, StoredRecord>(
        r#"
        SELECT table_name, record_id, fields, deleted, created_ts, server_ts
        FROM sync_records
        WHERE table_name = $1 AND record_id = $2
        "#,
    )
    .bind(table_name)
    .bind(record_id)
    .fetch_optional(pool)
    .await
}

/// All rows written after `cursor`, oldest first. `None` returns everything.
pub async fn get_records_since(
    pool: &PgPool,
    cursor: Option<u64>,
) -> Result<Vec<StoredRecord>, sqlx::Error> {
    let cursor = cursor.map(|c| c as i64).unwrap_or(-1);
    sqlx::query_as::<_, StoredRecord>(
        r#"
        SELECT table_name, record_id, fields, deleted, created_ts, server_ts
        FROM sync_records
        WHERE server_ts > $1
        ORDER BY server_ts, table_name, record_id
        "#,
    )
    .bind(cursor)
    .fetch_all(pool)
    .await
}
