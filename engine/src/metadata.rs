//! Process-wide sync bookkeeping and the derived health signal.

use crate::{
    config::HealthThresholds,
    error::Result,
    storage::{Storage, SYNC_METADATA_KEY},
    Error, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Sync bookkeeping, one per device.
///
/// Written by the coordinator only; survives restarts under
/// [`SYNC_METADATA_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncMetadata {
    pub last_sync_at: Option<Timestamp>,
    pub last_pull_at: Option<Timestamp>,
    pub last_push_at: Option<Timestamp>,
    pub sync_in_progress: bool,
    pub pending_operations: usize,
    /// Consecutive failed cycles.
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl SyncMetadata {
    pub fn record_success(&mut self, now: Timestamp, pending_operations: usize) {
        self.last_sync_at = Some(now);
        self.last_pull_at = Some(now);
        self.last_push_at = Some(now);
        self.sync_in_progress = false;
        self.pending_operations = pending_operations;
        self.error_count = 0;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>, pending_operations: usize) {
        self.sync_in_progress = false;
        self.pending_operations = pending_operations;
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(error.into());
    }

    /// Health as shown to the user.
    pub fn health(&self, now: Timestamp, thresholds: &HealthThresholds) -> SyncHealth {
        if self.error_count >= thresholds.error_count {
            return SyncHealth::Error;
        }
        let stale_after_ms = thresholds.stale_after_hours.saturating_mul(3_600_000);
        let stale = match self.last_sync_at {
            None => true,
            Some(at) => now.saturating_sub(at) > stale_after_ms,
        };
        if self.error_count > 0 || stale {
            SyncHealth::Warning
        } else {
            SyncHealth::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncHealth {
    Healthy,
    Warning,
    Error,
}

/// Loads and saves [`SyncMetadata`].
#[derive(Debug, Clone)]
pub struct MetadataStore {
    storage: Arc<dyn Storage>,
}

impl MetadataStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Load, creating defaults on first run.
    ///
    /// A stored `syncInProgress` flag means the process died mid-cycle; it
    /// is cleared since no cycle can be running yet.
    pub fn load(&self) -> Result<SyncMetadata> {
        let Some(bytes) = self.storage.read(SYNC_METADATA_KEY)? else {
            return Ok(SyncMetadata::default());
        };
        let mut metadata: SyncMetadata = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("corrupt sync metadata: {e}")))?;
        if metadata.sync_in_progress {
            warn!("Previous sync did not finish, clearing in-progress flag");
            metadata.sync_in_progress = false;
        }
        Ok(metadata)
    }

    pub fn save(&self, metadata: &SyncMetadata) -> Result<()> {
        let bytes =
            serde_json::to_vec(metadata).map_err(|e| Error::Storage(e.to_string()))?;
        self.storage.write(SYNC_METADATA_KEY, &bytes)
    }
}
