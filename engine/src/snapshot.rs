//! On-disk form of the local store.
//!
//! A snapshot holds everything the store must not lose across a restart:
//! records, the operation log and the pull cursor. It is written as one JSON
//! document after every committed transaction.

use crate::{
    error::Result, store::StoreState, Error, Record, RecordId, Schema, SchemaVersion,
    SyncOperation, TableName, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the store state.
///
/// BTreeMaps and a sequence-ordered operation list keep the serialized form
/// deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub tables: BTreeMap<TableName, BTreeMap<RecordId, Record>>,
    /// Operation log, ordered by sequence
    pub operations: Vec<SyncOperation>,
    #[serde(default)]
    pub last_pulled_at: Option<Timestamp>,
    #[serde(default)]
    pub next_sequence: u64,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            tables: BTreeMap::new(),
            operations: Vec::new(),
            last_pulled_at: None,
            next_sequence: 0,
        }
    }

    pub(crate) fn from_state(state: &StoreState, schema_version: SchemaVersion) -> Self {
        let mut operations: Vec<SyncOperation> = state.operations.values().cloned().collect();
        operations.sort_by_key(|op| op.sequence);

        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            tables: state.tables.clone(),
            operations,
            last_pulled_at: state.last_pulled_at,
            next_sequence: state.next_sequence,
        }
    }

    pub(crate) fn into_state(self) -> StoreState {
        StoreState {
            tables: self.tables,
            operations: self
                .operations
                .into_iter()
                .map(|op| (op.operation_id.clone(), op))
                .collect(),
            last_pulled_at: self.last_pulled_at,
            next_sequence: self.next_sequence,
        }
    }

    /// Count total records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Validate the snapshot against a schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }

        for (table_name, records) in &self.tables {
            let table = schema
                .get_table(table_name)
                .ok_or_else(|| Error::TableNotFound(table_name.clone()))?;
            for (id, record) in records {
                if id != &record.id || table_name != &record.table {
                    return Err(Error::InvalidSnapshot(format!(
                        "record {table_name}/{id} filed under the wrong key"
                    )));
                }
                if !record.is_deleted() {
                    table.validate_fields(&record.fields)?;
                }
            }
        }

        for op in &self.operations {
            if !schema.contains(&op.table_name) {
                return Err(Error::TableNotFound(op.table_name.clone()));
            }
            if op.sequence >= self.next_sequence {
                return Err(Error::InvalidSnapshot(format!(
                    "operation {} has sequence {} beyond next_sequence {}",
                    op.operation_id, op.sequence, self.next_sequence
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}
