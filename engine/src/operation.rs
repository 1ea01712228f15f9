//! Queued mutations and their state machine.
//!
//! A [`SyncOperation`] is a durable intent to create, update or delete one
//! record on the server. It moves through
//!
//! ```text
//! pending ──> synced
//!    │  ^
//!    v  │ (retry eligible / resolved)
//!  error | conflict
//! ```
//!
//! `synced` is terminal. Transitions that need the rest of the log (the
//! dependency check before `synced`) are enforced by
//! [`OperationLog`](crate::OperationLog); everything local to one operation
//! lives here.

use crate::{
    config::RetryPolicy,
    error::{FailureKind, Result},
    Error, Fields, RecordId, TableName, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Unique identifier for an operation.
pub type OperationId = String;

/// Operations keyed by id, as held in the log.
pub type OperationMap = BTreeMap<OperationId, SyncOperation>;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Generate a fresh operation id.
pub fn new_operation_id() -> OperationId {
    format!("op_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Synced,
    Error,
    Conflict,
}

/// How a conflict between the local and server version is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Take the server version, drop the local change.
    ServerWins,
    /// Keep the local change and force it on the next push.
    ClientWins,
    /// Block until someone calls `resolve_conflict`.
    #[default]
    Manual,
    /// Combine both versions with a per-table merge function.
    Merge,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::ServerWins => write!(f, "server_wins"),
            ConflictStrategy::ClientWins => write!(f, "client_wins"),
            ConflictStrategy::Manual => write!(f, "manual"),
            ConflictStrategy::Merge => write!(f, "merge"),
        }
    }
}

/// Where a conflict was noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSource {
    /// A pulled change touched a record with a local unsynced operation.
    Pull,
    /// The server refused the push with a concurrency mismatch.
    Push,
}

/// The divergence captured when a conflict is detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    pub source: ConflictSource,
    /// Server version of the record; `None` when the server deleted it.
    #[serde(default)]
    pub server_record: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// How (and whether) a conflict was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<Timestamp>,
    #[serde(default)]
    pub resolution_data: Option<serde_json::Value>,
    pub detected_at: Timestamp,
    pub conflict: ConflictData,
}

/// Summary of an operation's conflict state, for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub has_conflict: bool,
    pub strategy: Option<ConflictStrategy>,
    pub requires_manual_resolution: bool,
}

/// Per-operation knobs supplied at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// 1 (lowest) to 10 (highest); out-of-range values are clamped.
    pub priority: u8,
    /// Falls back to the configured retry policy when `None`. At least one
    /// attempt is always allowed.
    pub max_retries: Option<u32>,
    pub depends_on: BTreeSet<OperationId>,
    pub requires_online: bool,
    pub can_rollback: bool,
    pub auto_retry: bool,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            max_retries: None,
            depends_on: BTreeSet::new(),
            requires_online: true,
            can_rollback: true,
            auto_retry: true,
            user_id: None,
            device_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn depends_on(mut self, operation_id: impl Into<OperationId>) -> Self {
        self.depends_on.insert(operation_id.into());
        self
    }

    pub fn with_requires_online(mut self, requires_online: bool) -> Self {
        self.requires_online = requires_online;
        self
    }

    pub fn with_can_rollback(mut self, can_rollback: bool) -> Self {
        self.can_rollback = can_rollback;
        self
    }

    pub fn with_auto_retry(mut self, auto_retry: bool) -> Self {
        self.auto_retry = auto_retry;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// A durable intent to mutate one record on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub table_name: TableName,
    pub record_id: RecordId,
    /// Record fields at enqueue time.
    pub payload: Fields,
    /// Record fields before this change, for rollback.
    #[serde(default)]
    pub previous_payload: Option<Fields>,
    pub status: OperationStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: u8,
    #[serde(default)]
    pub depends_on: BTreeSet<OperationId>,
    pub requires_online: bool,
    pub can_rollback: bool,
    pub auto_retry: bool,
    /// Position in the log; breaks ordering ties.
    pub sequence: u64,
    pub created_at: Timestamp,
    #[serde(default)]
    pub last_attempt_at: Option<Timestamp>,
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
    #[serde(default)]
    pub server_timestamp: Option<Timestamp>,
    #[serde(default)]
    pub conflict_resolution: Option<ConflictResolution>,
    /// Push this payload past the server's concurrency check once.
    #[serde(default)]
    pub force_overwrite: bool,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl SyncOperation {
    /// Build a fresh `pending` operation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        operation_type: OperationType,
        table_name: impl Into<TableName>,
        record_id: impl Into<RecordId>,
        payload: Fields,
        previous_payload: Option<Fields>,
        opts: EnqueueOptions,
        default_max_retries: u32,
        sequence: u64,
        now: Timestamp,
    ) -> Self {
        Self {
            operation_id: new_operation_id(),
            operation_type,
            table_name: table_name.into(),
            record_id: record_id.into(),
            payload,
            previous_payload,
            status: OperationStatus::Pending,
            error_message: None,
            failure: None,
            retry_count: 0,
            max_retries: opts.max_retries.unwrap_or(default_max_retries).max(1),
            priority: opts.priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            depends_on: opts.depends_on,
            requires_online: opts.requires_online,
            can_rollback: opts.can_rollback,
            auto_retry: opts.auto_retry,
            sequence,
            created_at: now,
            last_attempt_at: None,
            synced_at: None,
            server_timestamp: None,
            conflict_resolution: None,
            force_overwrite: false,
            batch_id: None,
            user_id: opts.user_id,
            device_id: opts.device_id,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidTransition {
            operation_id: self.operation_id.clone(),
            reason: reason.into(),
        }
    }

    /// Record a transmission attempt. Must be called right before sending.
    pub fn mark_as_started(&mut self, now: Timestamp) -> Result<()> {
        if self.status != OperationStatus::Pending {
            return Err(self.invalid(format!("cannot start from {:?}", self.status)));
        }
        if !self.has_retry_budget() {
            return Err(self.invalid("retry budget exhausted"));
        }
        self.last_attempt_at = Some(now);
        self.retry_count += 1;
        Ok(())
    }

    /// Acknowledge the server accepted the change. Repeat calls are no-ops.
    pub fn mark_as_synced(&mut self, server_timestamp: Option<Timestamp>, now: Timestamp) {
        if self.status == OperationStatus::Synced {
            return;
        }
        self.status = OperationStatus::Synced;
        self.synced_at = Some(now);
        self.server_timestamp = server_timestamp;
        self.error_message = None;
        self.failure = None;
        self.force_overwrite = false;
    }

    /// Record a failed attempt.
    ///
    /// A retryable failure that leaves no retry budget becomes
    /// [`FailureKind::ExhaustedRetries`].
    pub fn mark_as_error(&mut self, message: impl Into<String>, kind: FailureKind, now: Timestamp) {
        self.status = OperationStatus::Error;
        self.error_message = Some(message.into());
        self.last_attempt_at = Some(now);
        self.failure = if kind.is_retryable() && self.auto_retry && !self.can_retry() {
            Some(FailureKind::ExhaustedRetries)
        } else {
            Some(kind)
        };
    }

    /// Park the operation until the conflict is resolved.
    pub fn mark_as_conflict(&mut self, conflict: ConflictData, now: Timestamp) {
        self.status = OperationStatus::Conflict;
        self.error_message = None;
        self.failure = Some(FailureKind::Conflict);
        self.force_overwrite = false;
        self.conflict_resolution = Some(ConflictResolution {
            strategy: ConflictStrategy::Manual,
            resolved_by: None,
            resolved_at: None,
            resolution_data: None,
            detected_at: now,
            conflict,
        });
    }

    /// Settle a conflict and send the operation back to `pending`.
    ///
    /// The retry budget restarts and the operation is eligible on the very
    /// next push.
    pub fn resolve_conflict(
        &mut self,
        strategy: ConflictStrategy,
        data: Option<serde_json::Value>,
        resolved_by: Option<String>,
        now: Timestamp,
    ) -> Result<()> {
        if self.status != OperationStatus::Conflict {
            return Err(self.invalid("operation is not in conflict"));
        }
        let conflict = self
            .conflict_resolution
            .take()
            .map(|r| (r.detected_at, r.conflict))
            .unwrap_or((
                now,
                ConflictData {
                    source: ConflictSource::Push,
                    server_record: None,
                    reason: None,
                },
            ));

        self.conflict_resolution = Some(ConflictResolution {
            strategy,
            resolved_by,
            resolved_at: Some(now),
            resolution_data: data,
            detected_at: conflict.0,
            conflict: conflict.1,
        });
        self.status = OperationStatus::Pending;
        self.failure = None;
        self.error_message = None;
        self.retry_count = 0;
        self.last_attempt_at = None;
        self.force_overwrite = matches!(
            strategy,
            ConflictStrategy::ClientWins | ConflictStrategy::Merge
        );
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.has_retry_budget() && self.auto_retry
    }

    /// Attempts left, regardless of `auto_retry`.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Backoff before the next attempt, given the attempts made so far.
    pub fn next_retry_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.delay_for_attempt(self.retry_count)
    }

    /// Whether the scheduler may transmit this operation again at `now`.
    pub fn is_ready_for_retry(&self, now: Timestamp, online: bool, policy: &RetryPolicy) -> bool {
        if !self.can_retry() || (self.requires_online && !online) {
            return false;
        }
        match self.last_attempt_at {
            None => true,
            Some(last) => {
                let elapsed = now.saturating_sub(last);
                elapsed as u128 >= self.next_retry_delay(policy).as_millis()
            }
        }
    }

    /// An `error` the scheduler will not pick up again on its own.
    pub fn is_terminal_error(&self) -> bool {
        self.status == OperationStatus::Error
            && (!self.can_retry() || !self.failure.is_some_and(FailureKind::is_retryable))
    }

    /// Whether any dependency exists in `log` and is not yet `synced`.
    ///
    /// Dependencies already pruned from the log were synced, since only
    /// synced operations are ever cleaned up.
    pub fn has_unresolved_dependencies(&self, log: &OperationMap) -> bool {
        self.depends_on.iter().any(|id| {
            log.get(id)
                .is_some_and(|dep| dep.status != OperationStatus::Synced)
        })
    }

    /// Older than the retention window.
    pub fn is_expired(&self, now: Timestamp, retention: Duration) -> bool {
        now.saturating_sub(self.created_at) as u128 > retention.as_millis()
    }

    /// `error` back to `pending`, keeping the retry count.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if self.status != OperationStatus::Error {
            return Err(self.invalid("only failed operations can be retried"));
        }
        self.status = OperationStatus::Pending;
        self.error_message = None;
        self.failure = None;
        Ok(())
    }

    pub fn add_dependency(&mut self, operation_id: impl Into<OperationId>) {
        self.depends_on.insert(operation_id.into());
    }

    pub fn remove_dependency(&mut self, operation_id: &str) -> bool {
        self.depends_on.remove(operation_id)
    }

    pub fn conflict_info(&self) -> ConflictInfo {
        let has_conflict = self.status == OperationStatus::Conflict;
        let strategy = self.conflict_resolution.as_ref().map(|r| r.strategy);
        ConflictInfo {
            has_conflict,
            strategy,
            requires_manual_resolution: has_conflict
                && strategy.map_or(true, |s| s == ConflictStrategy::Manual),
        }
    }

    /// Transmission order: higher priority first, then oldest first.
    pub fn cmp_transmit_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.created_at.cmp(&other.created_at))
            .then(self.sequence.cmp(&other.sequence))
    }
}
