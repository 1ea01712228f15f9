//! Conflict detection and resolution.
//!
//! Conflicts surface in two places:
//!
//! 1. **Pull**: a remote change arrives for a record that still has an
//!    unsynced local operation.
//! 2. **Push**: the server reports that its copy changed since our cursor.
//!
//! Either way the operation is first marked `conflict`, then the configured
//! [`ConflictStrategy`] for the table is applied. `manual` stops there;
//! the other strategies resolve immediately, exactly as a later
//! `resolve_conflict` call would.

use crate::{
    error::Result,
    protocol::{decode_record, PullResponse},
    store::StoreState,
    ConflictData, ConflictSource, ConflictStrategy, Error, Fields, OperationId, OperationStatus,
    OperationType, Record, RecordId, Schema, TableName, Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Inputs of a table-specific merge.
#[derive(Debug)]
pub struct MergeContext<'a> {
    pub table: &'a str,
    pub record_id: &'a str,
    pub local: &'a Fields,
    pub server: &'a Fields,
}

/// Combines the local and server versions of a record.
pub type MergeFn = Arc<dyn Fn(&MergeContext<'_>) -> Fields + Send + Sync>;

/// What happened to a conflicted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Waiting for `resolve_conflict`.
    Parked,
    /// Server version applied, operation synced.
    ServerApplied,
    /// Local payload kept and forced on the next push.
    ClientKept,
    /// Merged payload queued and forced on the next push.
    Merged,
}

/// Strategy-driven conflict resolution.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    default_strategy: ConflictStrategy,
    table_strategies: HashMap<TableName, ConflictStrategy>,
    merge_fns: HashMap<TableName, MergeFn>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("default_strategy", &self.default_strategy)
            .field("table_strategies", &self.table_strategies)
            .field("merge_tables", &self.merge_fns.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self {
            default_strategy,
            ..Self::default()
        }
    }

    /// Use a different strategy for one table.
    pub fn with_table_strategy(
        mut self,
        table: impl Into<TableName>,
        strategy: ConflictStrategy,
    ) -> Self {
        self.table_strategies.insert(table.into(), strategy);
        self
    }

    /// Register the merge function of a table.
    pub fn with_merge<F>(mut self, table: impl Into<TableName>, merge: F) -> Self
    where
        F: Fn(&MergeContext<'_>) -> Fields + Send + Sync + 'static,
    {
        self.merge_fns.insert(table.into(), Arc::new(merge));
        self
    }

    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    pub fn strategy_for(&self, table: &str) -> ConflictStrategy {
        self.table_strategies
            .get(table)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Record a detected conflict and apply the table's strategy.
    pub(crate) fn handle_conflict(
        &self,
        state: &mut StoreState,
        schema: &Schema,
        operation_id: &str,
        conflict: ConflictData,
        now: Timestamp,
    ) -> Result<ConflictOutcome> {
        state.mark_operation_conflict(operation_id, conflict, now)?;
        let table = match state.operation(operation_id) {
            Some(op) => op.table_name.clone(),
            None => return Err(Error::OperationNotFound(operation_id.to_string())),
        };

        let strategy = self.strategy_for(&table);
        warn!(operation_id, table = %table, %strategy, "Conflict detected");
        if strategy == ConflictStrategy::Manual {
            return Ok(ConflictOutcome::Parked);
        }

        // Try the automatic strategy on a scratch copy so a failure leaves the
        // operation parked instead of aborting the caller's transaction.
        let mut attempt = state.clone();
        match self.resolve(
            &mut attempt,
            schema,
            operation_id,
            strategy,
            None,
            Some("auto".into()),
            now,
        ) {
            Ok(outcome) => {
                *state = attempt;
                Ok(outcome)
            }
            Err(e) => {
                warn!(operation_id, error = %e, "Automatic resolution failed, parking conflict");
                Ok(ConflictOutcome::Parked)
            }
        }
    }

    /// Settle a conflicted operation with `strategy`.
    ///
    /// `data` overrides the inputs of the strategy: the server version for
    /// `server_wins`, the merged payload for `merge`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn resolve(
        &self,
        state: &mut StoreState,
        schema: &Schema,
        operation_id: &str,
        strategy: ConflictStrategy,
        data: Option<serde_json::Value>,
        resolved_by: Option<String>,
        now: Timestamp,
    ) -> Result<ConflictOutcome> {
        let op = state
            .operation(operation_id)
            .ok_or_else(|| Error::OperationNotFound(operation_id.to_string()))?;
        if op.status != OperationStatus::Conflict {
            return Err(Error::InvalidTransition {
                operation_id: operation_id.to_string(),
                reason: "operation is not in conflict".into(),
            });
        }
        let table = op.table_name.clone();
        let record_id = op.record_id.clone();
        let server_record = op
            .conflict_resolution
            .as_ref()
            .and_then(|r| r.conflict.server_record.clone());

        match strategy {
            ConflictStrategy::Manual => Err(Error::InvalidResolution(
                "manual is not an outcome; choose server_wins, client_wins or merge".into(),
            )),
            ConflictStrategy::ServerWins => {
                let server = match data.as_ref() {
                    Some(serde_json::Value::Object(fields)) => Some(fields.clone()),
                    Some(serde_json::Value::Null) | None => server_record,
                    Some(_) => {
                        return Err(Error::InvalidResolution(
                            "server version must be an object".into(),
                        ))
                    }
                };
                if let Some(fields) = &server {
                    schema.validate(&table, fields)?;
                }

                state.operation_mut_or_err(operation_id)?.resolve_conflict(
                    strategy,
                    data,
                    resolved_by,
                    now,
                )?;
                match server {
                    Some(fields) => apply_remote(state, &table, &record_id, fields, now),
                    None => {
                        state.remove_record(&table, &record_id);
                    }
                }

                // Later local edits of the record were made on top of the
                // version the server just replaced.
                let superseded: Vec<OperationId> = state
                    .unsynced_operations_for(&table, &record_id)
                    .into_iter()
                    .filter(|id| id != operation_id)
                    .collect();
                for id in &superseded {
                    state.operation_mut_or_err(id)?.mark_as_synced(None, now);
                }
                if !superseded.is_empty() {
                    debug!(
                        operation_id,
                        superseded = superseded.len(),
                        "Server version supersedes queued edits"
                    );
                }

                state.mark_operation_synced(operation_id, None, now)?;
                debug!(operation_id, "Resolved conflict with server version");
                Ok(ConflictOutcome::ServerApplied)
            }
            ConflictStrategy::ClientWins => {
                state.operation_mut_or_err(operation_id)?.resolve_conflict(
                    strategy,
                    data,
                    resolved_by,
                    now,
                )?;
                state.settle_record(&table, &record_id, now);
                debug!(operation_id, "Resolved conflict keeping local version");
                Ok(ConflictOutcome::ClientKept)
            }
            ConflictStrategy::Merge => {
                let merged = match data {
                    Some(serde_json::Value::Object(fields)) => fields,
                    Some(_) => {
                        return Err(Error::InvalidResolution(
                            "merged payload must be an object".into(),
                        ))
                    }
                    None => {
                        let merge = self
                            .merge_fns
                            .get(&table)
                            .ok_or_else(|| Error::NoMergeHandler(table.clone()))?;
                        let server = server_record.ok_or_else(|| {
                            Error::InvalidResolution("server deleted the record; nothing to merge".into())
                        })?;
                        let local = state
                            .operation(operation_id)
                            .map(|op| &op.payload)
                            .ok_or_else(|| Error::OperationNotFound(operation_id.to_string()))?;
                        merge(&MergeContext {
                            table: &table,
                            record_id: &record_id,
                            local,
                            server: &server,
                        })
                    }
                };
                schema.validate(&table, &merged)?;

                let op = state.operation_mut_or_err(operation_id)?;
                op.payload = merged.clone();
                if op.operation_type == OperationType::Delete {
                    op.operation_type = OperationType::Update;
                }
                op.resolve_conflict(
                    strategy,
                    Some(serde_json::Value::Object(merged.clone())),
                    resolved_by,
                    now,
                )?;

                match state.record_mut(&table, &record_id) {
                    Some(record) => {
                        record.offline_deleted = false;
                        record.apply_local_update(merged, now);
                    }
                    None => state.upsert_record(Record::new_local(
                        table.clone(),
                        record_id.clone(),
                        merged,
                        now,
                    )),
                }
                state.settle_record(&table, &record_id, now);
                debug!(operation_id, "Resolved conflict with merged payload");
                Ok(ConflictOutcome::Merged)
            }
        }
    }
}

fn apply_remote(
    state: &mut StoreState,
    table: &str,
    record_id: &str,
    fields: Fields,
    now: Timestamp,
) {
    match state.record_mut(table, record_id) {
        Some(record) => record.apply_remote(fields, now),
        None => state.upsert_record(Record::from_remote(table, record_id, fields, now)),
    }
}

/// Counts from applying one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    pub applied: usize,
    pub deleted: usize,
    pub conflicts: usize,
    /// Echoes of versions we already know; nothing to do.
    pub unchanged: usize,
    pub skipped_tables: Vec<TableName>,
}

/// Apply a pull response to the store and advance the cursor.
///
/// Records without unsynced local operations are overwritten; records with
/// them go to the resolver. A record that fails schema validation aborts the
/// whole pull so the cursor stays where it was.
pub(crate) fn apply_pull(
    state: &mut StoreState,
    schema: &Schema,
    resolver: &ConflictResolver,
    response: PullResponse,
    now: Timestamp,
) -> Result<PullOutcome> {
    let mut outcome = PullOutcome::default();

    for (table, changes) in response.changes {
        if !schema.contains(&table) {
            warn!(table = %table, "Skipping pulled changes for unknown table");
            outcome.skipped_tables.push(table);
            continue;
        }

        for value in changes.created.iter().chain(changes.updated.iter()) {
            let (record_id, fields) = decode_record(value)?;
            schema.validate(&table, &fields)?;
            apply_remote_change(
                state,
                schema,
                resolver,
                &table,
                &record_id,
                Some(fields),
                now,
                &mut outcome,
            )?;
        }

        for record_id in &changes.deleted {
            apply_remote_change(
                state,
                schema,
                resolver,
                &table,
                record_id,
                None,
                now,
                &mut outcome,
            )?;
        }
    }

    state.set_last_pulled_at(response.timestamp);
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn apply_remote_change(
    state: &mut StoreState,
    schema: &Schema,
    resolver: &ConflictResolver,
    table: &str,
    record_id: &RecordId,
    fields: Option<Fields>,
    now: Timestamp,
    outcome: &mut PullOutcome,
) -> Result<()> {
    let open = state.unsynced_operations_for(table, record_id);

    let Some(blocking) = open.first() else {
        match fields {
            Some(fields) => {
                apply_remote(state, table, record_id, fields, now);
                outcome.applied += 1;
            }
            None => {
                if state.remove_record(table, record_id).is_some() {
                    outcome.deleted += 1;
                }
            }
        }
        return Ok(());
    };

    if is_known_version(state, table, record_id, fields.as_ref(), &open) {
        outcome.unchanged += 1;
        return Ok(());
    }

    let conflict = ConflictData {
        source: ConflictSource::Pull,
        server_record: fields,
        reason: Some("remote change to a locally modified record".into()),
    };

    // An operation already parked in conflict just learns the newer server version.
    let blocking: OperationId = blocking.clone();
    if let Some(op) = state.operation_mut(&blocking) {
        if op.status == OperationStatus::Conflict {
            if let Some(resolution) = op.conflict_resolution.as_mut() {
                resolution.conflict = conflict;
            }
            outcome.conflicts += 1;
            return Ok(());
        }
    }

    resolver.handle_conflict(state, schema, &blocking, conflict, now)?;
    outcome.conflicts += 1;
    Ok(())
}

/// Whether the remote version is one the device already knows: our own
/// pushed payload coming back, or the base our local edits started from.
fn is_known_version(
    state: &StoreState,
    table: &str,
    record_id: &str,
    fields: Option<&Fields>,
    open: &[OperationId],
) -> bool {
    let Some(remote) = fields else {
        return false;
    };

    let echoes_push = state.operations().values().any(|op| {
        op.status == OperationStatus::Synced
            && op.table_name == table
            && op.record_id == record_id
            && op.operation_type != OperationType::Delete
            && &op.payload == remote
    });

    let matches_base = open
        .first()
        .and_then(|id| state.operation(id))
        .and_then(|op| op.previous_payload.as_ref())
        .is_some_and(|base| base == remote);

    echoes_push || matches_base
}
