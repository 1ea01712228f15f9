//! The operation log: a durable queue of mutations waiting for the server.
//!
//! The transition logic lives on [`StoreState`] so the sync coordinator can
//! combine several steps (apply a pull, mark operations, move the cursor) in
//! one store transaction. [`OperationLog`] wraps each step in its own
//! transaction for callers outside a sync cycle.

use crate::{
    clock::Clock,
    config::RetryPolicy,
    error::{FailureKind, Result},
    store::{LocalStore, StoreState},
    ConflictData, EnqueueOptions, Error, Fields, OperationId, OperationStatus, OperationType,
    Schema, SyncOperation, Timestamp,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl StoreState {
    /// Append a `pending` operation.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn enqueue_operation(
        &mut self,
        schema: &Schema,
        operation_type: OperationType,
        table: &str,
        record_id: &str,
        payload: Fields,
        previous_payload: Option<Fields>,
        opts: EnqueueOptions,
        default_max_retries: u32,
        now: Timestamp,
    ) -> Result<OperationId> {
        match operation_type {
            OperationType::Create | OperationType::Update => schema.validate(table, &payload)?,
            OperationType::Delete if !schema.contains(table) => {
                return Err(Error::TableNotFound(table.to_string()))
            }
            OperationType::Delete => {}
        }

        let sequence = self.take_sequence();
        let op = SyncOperation::new(
            operation_type,
            table,
            record_id,
            payload,
            previous_payload,
            opts,
            default_max_retries,
            sequence,
            now,
        );
        let id = op.operation_id.clone();
        debug!(
            operation_id = %id,
            %operation_type,
            table,
            record_id,
            priority = op.priority,
            "Enqueued operation"
        );
        self.insert_operation(op);
        Ok(id)
    }

    /// Move failed operations whose backoff has elapsed back to `pending`.
    pub(crate) fn promote_retryable(
        &mut self,
        now: Timestamp,
        online: bool,
        policy: &RetryPolicy,
    ) -> Vec<OperationId> {
        let ready: Vec<OperationId> = self
            .operations
            .values()
            .filter(|op| {
                op.status == OperationStatus::Error
                    && op.failure.is_some_and(FailureKind::is_retryable)
                    && op.is_ready_for_retry(now, online, policy)
            })
            .map(|op| op.operation_id.clone())
            .collect();

        for id in &ready {
            if let Some(op) = self.operations.get_mut(id) {
                if op.reset_for_retry().is_ok() {
                    let (table, record_id) = (op.table_name.clone(), op.record_id.clone());
                    self.settle_record(&table, &record_id, now);
                }
            }
        }
        ready
    }

    /// Pick the next batch to transmit.
    ///
    /// Eligible: `pending`, dependencies synced, never attempted or past its
    /// backoff, and no earlier unsynced operation on the same record. Ordered
    /// by priority (high first), then age.
    pub(crate) fn select_for_push(
        &self,
        now: Timestamp,
        online: bool,
        policy: &RetryPolicy,
        exclude: &HashSet<OperationId>,
        limit: usize,
    ) -> Vec<OperationId> {
        let mut candidates: Vec<&SyncOperation> = self
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Pending && !exclude.contains(&op.operation_id))
            .filter(|op| !op.has_unresolved_dependencies(&self.operations))
            .filter(|op| match op.last_attempt_at {
                None => !op.requires_online || online,
                Some(_) => op.is_ready_for_retry(now, online, policy),
            })
            .filter(|op| !self.has_earlier_unsynced(op))
            .collect();

        candidates.sort_by(|a, b| a.cmp_transmit_order(b));
        candidates
            .into_iter()
            .take(limit)
            .map(|op| op.operation_id.clone())
            .collect()
    }

    fn has_earlier_unsynced(&self, op: &SyncOperation) -> bool {
        self.operations.values().any(|other| {
            other.sequence < op.sequence
                && other.status != OperationStatus::Synced
                && other.table_name == op.table_name
                && other.record_id == op.record_id
        })
    }

    pub(crate) fn mark_operations_started(
        &mut self,
        ids: &[OperationId],
        batch_id: &str,
        now: Timestamp,
    ) -> Result<Vec<OperationId>> {
        let mut started = Vec::with_capacity(ids.len());
        for id in ids {
            let op = self.operation_mut_or_err(id)?;
            if !op.has_retry_budget() {
                self.mark_operation_error(
                    id,
                    "retry budget exhausted before first attempt",
                    FailureKind::ExhaustedRetries,
                    now,
                )?;
                continue;
            }
            op.mark_as_started(now)?;
            op.batch_id = Some(batch_id.to_string());
            started.push(id.clone());
        }
        Ok(started)
    }

    /// Acknowledge an operation. Refused while a dependency is unsynced.
    pub(crate) fn mark_operation_synced(
        &mut self,
        id: &str,
        server_timestamp: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<()> {
        let op = self
            .operations
            .get(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        if op.has_unresolved_dependencies(&self.operations) {
            return Err(Error::InvalidTransition {
                operation_id: id.to_string(),
                reason: "dependencies not yet synced".into(),
            });
        }

        let op = self.operation_mut_or_err(id)?;
        op.mark_as_synced(server_timestamp, now);
        let (table, record_id) = (op.table_name.clone(), op.record_id.clone());
        self.settle_record(&table, &record_id, now);
        Ok(())
    }

    pub(crate) fn mark_operation_error(
        &mut self,
        id: &str,
        message: &str,
        kind: FailureKind,
        now: Timestamp,
    ) -> Result<()> {
        let op = self.operation_mut_or_err(id)?;
        op.mark_as_error(message, kind, now);
        if op.is_terminal_error() {
            warn!(operation_id = %id, failure = ?op.failure, message, "Operation failed terminally");
        } else {
            debug!(operation_id = %id, retry_count = op.retry_count, message, "Operation failed");
        }
        let (table, record_id) = (op.table_name.clone(), op.record_id.clone());
        self.settle_record(&table, &record_id, now);
        Ok(())
    }

    pub(crate) fn mark_operation_conflict(
        &mut self,
        id: &str,
        conflict: ConflictData,
        now: Timestamp,
    ) -> Result<()> {
        let op = self.operation_mut_or_err(id)?;
        op.mark_as_conflict(conflict, now);
        let (table, record_id) = (op.table_name.clone(), op.record_id.clone());
        self.settle_record(&table, &record_id, now);
        Ok(())
    }

    /// Manual retry of a failed operation with a fresh retry budget.
    pub(crate) fn retry_operation(&mut self, id: &str, now: Timestamp) -> Result<()> {
        let op = self.operation_mut_or_err(id)?;
        op.reset_for_retry()?;
        op.retry_count = 0;
        op.last_attempt_at = None;
        let (table, record_id) = (op.table_name.clone(), op.record_id.clone());
        self.settle_record(&table, &record_id, now);
        Ok(())
    }

    /// Undo a terminally failed operation locally.
    ///
    /// Operations that depended on it, explicitly or by touching the same
    /// record later, fail terminally.
    pub(crate) fn rollback_operation(&mut self, id: &str, now: Timestamp) -> Result<()> {
        let op = self
            .operations
            .get(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?
            .clone();
        if !op.is_terminal_error() || !op.can_rollback {
            return Err(Error::InvalidTransition {
                operation_id: id.to_string(),
                reason: "only terminal failures with can_rollback may be rolled back".into(),
            });
        }

        match (&op.operation_type, &op.previous_payload) {
            (OperationType::Create, _) => {
                self.remove_record(&op.table_name, &op.record_id);
            }
            (_, Some(previous)) => match self.record_mut(&op.table_name, &op.record_id) {
                Some(record) => record.apply_remote(previous.clone(), now),
                None => self.upsert_record(crate::Record::from_remote(
                    op.table_name.clone(),
                    op.record_id.clone(),
                    previous.clone(),
                    now,
                )),
            },
            (_, None) => {
                warn!(operation_id = %id, "No previous payload to restore");
            }
        }
        self.operations.remove(id);

        let dependents: Vec<OperationId> = self
            .operations
            .values()
            .filter(|other| other.status != OperationStatus::Synced)
            .filter(|other| {
                other.depends_on.contains(id)
                    || (other.sequence > op.sequence
                        && other.table_name == op.table_name
                        && other.record_id == op.record_id)
            })
            .map(|other| other.operation_id.clone())
            .collect();
        for dependent in &dependents {
            let message = format!("dependency {id} was rolled back");
            self.mark_operation_error(dependent, &message, FailureKind::Validation, now)?;
        }

        self.settle_record(&op.table_name, &op.record_id, now);
        info!(operation_id = %id, dependents = dependents.len(), "Rolled back operation");
        Ok(())
    }

    /// Delete `synced` operations older than the retention window.
    pub(crate) fn cleanup_operations(&mut self, now: Timestamp, retention: Duration) -> usize {
        let before = self.operations.len();
        self.operations.retain(|_, op| {
            !(op.status == OperationStatus::Synced && op.is_expired(now, retention))
        });
        before - self.operations.len()
    }

    pub fn conflicts(&self) -> Vec<&SyncOperation> {
        let mut conflicts: Vec<&SyncOperation> = self
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Conflict)
            .collect();
        conflicts.sort_by_key(|op| op.sequence);
        conflicts
    }

    /// Derive a record's sync status from its unsynced operations.
    ///
    /// With none left the record is synced, or purged if it was a local
    /// tombstone.
    pub(crate) fn settle_record(&mut self, table: &str, record_id: &str, now: Timestamp) {
        let open = self.unsynced_operations_for(table, record_id);
        let statuses: Vec<(OperationStatus, Option<String>)> = open
            .iter()
            .filter_map(|id| self.operations.get(id))
            .map(|op| (op.status, op.error_message.clone()))
            .collect();

        let Some(record) = self.record_mut(table, record_id) else {
            return;
        };

        if statuses.is_empty() {
            if record.is_deleted() {
                self.remove_record(table, record_id);
            } else {
                record.mark_synced(now);
            }
        } else if statuses.iter().any(|(s, _)| *s == OperationStatus::Conflict) {
            record.mark_conflict();
        } else if let Some((_, message)) = statuses.iter().find(|(s, _)| *s == OperationStatus::Error)
        {
            record.mark_sync_error(message.clone().unwrap_or_default());
        } else {
            record.mark_pending();
        }
    }
}

/// Transactional access to the operation log.
#[derive(Debug, Clone)]
pub struct OperationLog {
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl OperationLog {
    pub fn new(store: Arc<LocalStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Append an operation without touching the record itself.
    pub fn enqueue(
        &self,
        operation_type: OperationType,
        table: &str,
        record_id: &str,
        payload: Fields,
        opts: EnqueueOptions,
    ) -> Result<OperationId> {
        let now = self.clock.now();
        let schema = self.store.schema();
        self.store.write(|s| {
            s.enqueue_operation(
                schema,
                operation_type,
                table,
                record_id,
                payload,
                None,
                opts,
                self.retry.max_attempts,
                now,
            )
        })
    }

    /// Create a record locally and queue its `create`.
    pub fn create(
        &self,
        table: &str,
        record_id: &str,
        fields: Fields,
        opts: EnqueueOptions,
    ) -> Result<OperationId> {
        let now = self.clock.now();
        let schema = self.store.schema();
        self.store.write(|s| {
            s.create_local(schema, table, record_id, fields.clone(), now)?;
            s.enqueue_operation(
                schema,
                OperationType::Create,
                table,
                record_id,
                fields,
                None,
                opts,
                self.retry.max_attempts,
                now,
            )
        })
    }

    /// Update a record locally and queue its `update`.
    pub fn update(
        &self,
        table: &str,
        record_id: &str,
        fields: Fields,
        opts: EnqueueOptions,
    ) -> Result<OperationId> {
        let now = self.clock.now();
        let schema = self.store.schema();
        self.store.write(|s| {
            let previous = s.update_local(schema, table, record_id, fields.clone(), now)?;
            s.enqueue_operation(
                schema,
                OperationType::Update,
                table,
                record_id,
                fields,
                Some(previous),
                opts,
                self.retry.max_attempts,
                now,
            )
        })
    }

    /// Delete a record locally and queue its `delete`.
    pub fn delete(&self, table: &str, record_id: &str, opts: EnqueueOptions) -> Result<OperationId> {
        let now = self.clock.now();
        let schema = self.store.schema();
        self.store.write(|s| {
            let previous = s.delete_local(table, record_id, now)?;
            s.enqueue_operation(
                schema,
                OperationType::Delete,
                table,
                record_id,
                previous.clone(),
                Some(previous),
                opts,
                self.retry.max_attempts,
                now,
            )
        })
    }

    pub fn get(&self, id: &str) -> Option<SyncOperation> {
        self.store.read(|s| s.operation(id).cloned())
    }

    /// All operations in log order.
    pub fn operations(&self) -> Vec<SyncOperation> {
        self.store.read(|s| {
            let mut ops: Vec<SyncOperation> = s.operations().values().cloned().collect();
            ops.sort_by_key(|op| op.sequence);
            ops
        })
    }

    pub fn pending_count(&self) -> usize {
        self.store.read(|s| s.pending_operation_count())
    }

    /// Operations that would be transmitted now, without changing anything.
    pub fn ready_for_push(&self, online: bool) -> Vec<SyncOperation> {
        let now = self.clock.now();
        self.store.read(|s| {
            let ready = |op: &SyncOperation| {
                op.status == OperationStatus::Pending
                    || (op.status == OperationStatus::Error
                        && op.failure.is_some_and(FailureKind::is_retryable)
                        && op.is_ready_for_retry(now, online, &self.retry))
            };
            let mut preview = s.clone();
            for op in preview.operations.values_mut().filter(|op| ready(op)) {
                op.status = OperationStatus::Pending;
            }
            preview
                .select_for_push(now, online, &self.retry, &HashSet::new(), usize::MAX)
                .into_iter()
                .filter_map(|id| s.operation(&id).cloned())
                .collect()
        })
    }

    pub fn mark_as_started(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        self.store.write(|s| s.operation_mut_or_err(id)?.mark_as_started(now))
    }

    pub fn mark_as_synced(&self, id: &str, server_timestamp: Option<Timestamp>) -> Result<()> {
        let now = self.clock.now();
        self.store
            .write(|s| s.mark_operation_synced(id, server_timestamp, now))
    }

    pub fn mark_as_error(&self, id: &str, message: &str, kind: FailureKind) -> Result<()> {
        let now = self.clock.now();
        self.store
            .write(|s| s.mark_operation_error(id, message, kind, now))
    }

    pub fn mark_as_conflict(&self, id: &str, conflict: ConflictData) -> Result<()> {
        let now = self.clock.now();
        self.store
            .write(|s| s.mark_operation_conflict(id, conflict, now))
    }

    pub fn add_dependency(&self, id: &str, depends_on: &str) -> Result<()> {
        if id == depends_on {
            return Err(Error::InvalidTransition {
                operation_id: id.to_string(),
                reason: "an operation cannot depend on itself".into(),
            });
        }
        self.store.write(|s| {
            s.operation_mut_or_err(id)?.add_dependency(depends_on);
            Ok(())
        })
    }

    pub fn remove_dependency(&self, id: &str, depends_on: &str) -> Result<bool> {
        self.store
            .write(|s| Ok(s.operation_mut_or_err(id)?.remove_dependency(depends_on)))
    }

    /// Give a failed operation a fresh retry budget.
    pub fn retry(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        self.store.write(|s| s.retry_operation(id, now))
    }

    /// Restore the record as it was before a terminally failed operation.
    pub fn rollback(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        self.store.write(|s| s.rollback_operation(id, now))
    }

    /// Remove `synced` operations past the retention window.
    pub fn cleanup(&self, retention: Duration) -> Result<usize> {
        let now = self.clock.now();
        let removed = self.store.write(|s| Ok(s.cleanup_operations(now, retention)))?;
        if removed > 0 {
            info!(removed, "Cleaned up synced operations");
        }
        Ok(removed)
    }

    /// Operations waiting for conflict resolution.
    pub fn conflicts(&self) -> Vec<SyncOperation> {
        self.store
            .read(|s| s.conflicts().into_iter().cloned().collect())
    }
}
