//! Domain records as the engine sees them.
//!
//! Business fields are carried in [`Record::fields`]; the engine only owns
//! the sync attributes next to them.

use crate::{Fields, RecordId, TableName, Timestamp};
use serde::{Deserialize, Serialize};

/// Sync state of a record in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Synced,
    Pending,
    Conflict,
    Error,
}

/// A record of any synced table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub table: TableName,
    pub fields: Fields,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub offline_created: bool,
    #[serde(default)]
    pub offline_updated: bool,
    #[serde(default)]
    pub offline_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Record {
    /// A record created on this device, waiting to be pushed.
    pub fn new_local(
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
        fields: Fields,
        now: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            fields,
            sync_status: SyncStatus::Pending,
            offline_created: true,
            offline_updated: false,
            offline_deleted: false,
            last_sync_at: None,
            sync_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A record as received from the server.
    pub fn from_remote(
        table: impl Into<TableName>,
        id: impl Into<RecordId>,
        fields: Fields,
        now: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            fields,
            sync_status: SyncStatus::Synced,
            offline_created: false,
            offline_updated: false,
            offline_deleted: false,
            last_sync_at: Some(now),
            sync_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record carries local changes the server has not seen.
    pub fn needs_sync(&self) -> bool {
        self.sync_status != SyncStatus::Synced
    }

    /// Local edit.
    pub fn apply_local_update(&mut self, fields: Fields, now: Timestamp) {
        self.fields = fields;
        self.sync_status = SyncStatus::Pending;
        if !self.offline_created {
            self.offline_updated = true;
        }
        self.updated_at = now;
    }

    /// Local delete. The record stays as a tombstone until the delete is pushed.
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.offline_deleted = true;
        self.sync_status = SyncStatus::Pending;
        self.updated_at = now;
    }

    pub fn is_deleted(&self) -> bool {
        self.offline_deleted
    }

    /// Overwrite with the server's version.
    pub fn apply_remote(&mut self, fields: Fields, now: Timestamp) {
        self.fields = fields;
        self.updated_at = now;
        self.mark_synced(now);
    }

    pub fn mark_synced(&mut self, now: Timestamp) {
        self.sync_status = SyncStatus::Synced;
        self.offline_created = false;
        self.offline_updated = false;
        self.offline_deleted = false;
        self.sync_error = None;
        self.last_sync_at = Some(now);
    }

    pub fn mark_sync_error(&mut self, message: impl Into<String>) {
        self.sync_status = SyncStatus::Error;
        self.sync_error = Some(message.into());
    }

    pub fn mark_conflict(&mut self) {
        self.sync_status = SyncStatus::Conflict;
    }

    pub fn mark_pending(&mut self) {
        self.sync_status = SyncStatus::Pending;
        self.sync_error = None;
    }
}
