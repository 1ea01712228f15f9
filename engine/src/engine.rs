//! The sync coordinator.
//!
//! [`SyncEngine`] owns one device's sync loop: a pull-then-push cycle behind
//! a single-flight guard, the auto-sync timer, the reconnect trigger, and the
//! process-wide [`SyncMetadata`]. Everything it touches is injected through
//! [`SyncEngineBuilder`], so several engines can live side by side and tests
//! can drive time and the network by hand.

use crate::{
    clock::{Clock, SystemClock},
    config::SyncConfig,
    connectivity::{ConnectivityMonitor, ConnectivityState},
    error::{FailureKind, Result, SyncError},
    events::{ListenerId, ListenerSet, SyncEvent, SyncPhase, SyncProgress, SyncState},
    http::HttpTransport,
    metadata::{MetadataStore, SyncHealth, SyncMetadata},
    oplog::OperationLog,
    protocol::{PullRequest, PushRequest, PushResponse},
    reconcile::{apply_pull, ConflictOutcome, ConflictResolver, PullOutcome},
    store::LocalStore,
    transport::{SyncTransport, TokenProvider, TransportResult},
    ConflictData, ConflictSource, ConflictStrategy, EnqueueOptions, Error, Fields, OperationId,
    SyncOperation,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Counters kept for the lifetime of the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Cycles that finished successfully.
    pub cycles_completed: u64,
    /// Calls to `sync`/`full_sync`, refused ones included.
    pub full_sync_attempts: u64,
    pub auto_sync_invocations: u64,
    /// Remote records applied or deleted locally.
    pub operations_pulled: u64,
    /// Operations acknowledged by the server.
    pub operations_pushed: u64,
    pub conflicts_detected: u64,
}

/// What one successful cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleResult {
    pub pull: PullOutcome,
    pub pushed: usize,
    pub push_conflicts: usize,
    pub rejected: usize,
    pub batches: usize,
    pub duration: Duration,
}

/// Snapshot of everything a sync indicator in the UI needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusReport {
    pub state: SyncState,
    pub connectivity: ConnectivityState,
    pub sync_in_progress: bool,
    pub pending_operations: usize,
    pub conflicts: usize,
    pub last_sync_at: Option<crate::Timestamp>,
    pub last_error: Option<String>,
    pub health: SyncHealth,
}

/// Per-batch acknowledgement counts.
#[derive(Debug, Default)]
struct BatchAck {
    synced: usize,
    conflicts: usize,
    rejected: usize,
}

/// Releases the single-flight flag when dropped.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: Option<Arc<LocalStore>>,
    transport: Option<Arc<dyn SyncTransport>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    resolver: Option<ConflictResolver>,
}

impl SyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            tokens: None,
            clock: None,
            connectivity: None,
            resolver: None,
        }
    }

    pub fn store(mut self, store: Arc<LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to an [`HttpTransport`] on `config.base_url`.
    pub fn transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Defaults to a resolver applying `config.default_strategy` everywhere.
    pub fn resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Assemble the engine and hook it to the connectivity monitor.
    pub fn build(self) -> Result<Arc<SyncEngine>> {
        self.config.validate()?;

        let store = self
            .store
            .ok_or_else(|| Error::Config("a local store is required".into()))?;
        let tokens = self
            .tokens
            .ok_or_else(|| Error::Config("a token provider is required".into()))?;
        if store.schema().version != self.config.schema_version {
            return Err(Error::SchemaVersionMismatch {
                expected: self.config.schema_version,
                actual: store.schema().version,
            });
        }

        let transport: Arc<dyn SyncTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                if self.config.base_url.is_empty() {
                    return Err(Error::Config(
                        "base_url is required without a custom transport".into(),
                    ));
                }
                let http = HttpTransport::new(&self.config.base_url, self.config.request_timeout())
                    .map_err(|e| Error::Config(e.to_string()))?;
                Arc::new(http)
            }
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let connectivity = self.connectivity.unwrap_or_default();
        let resolver = self
            .resolver
            .unwrap_or_else(|| ConflictResolver::new(self.config.default_strategy));
        let metadata_store = MetadataStore::new(store.storage());
        let metadata = metadata_store.load()?;
        let log = OperationLog::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            self.config.retry.clone(),
        );

        let engine = Arc::new(SyncEngine {
            config: self.config,
            store,
            log,
            transport,
            tokens,
            clock,
            connectivity,
            resolver,
            metadata_store,
            metadata: Mutex::new(metadata),
            in_progress: AtomicBool::new(false),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            rejected_token: Mutex::new(None),
            listeners: ListenerSet::new(),
            connectivity_listener: Mutex::new(None),
            auto_sync_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&engine);
        let listener = engine.connectivity.subscribe(move |change| {
            if change.is_reconnect() {
                if let Some(engine) = weak.upgrade() {
                    engine.schedule_auto_sync();
                }
            }
        });
        *engine.connectivity_listener.lock() = Some(listener);

        info!(
            batch_size = engine.config.batch_size,
            strategy = %engine.resolver.default_strategy(),
            "Sync engine ready"
        );
        Ok(engine)
    }
}

/// Offline-first sync coordinator for one device.
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<LocalStore>,
    log: OperationLog,
    transport: Arc<dyn SyncTransport>,
    tokens: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    connectivity: Arc<ConnectivityMonitor>,
    resolver: ConflictResolver,
    metadata_store: MetadataStore,
    metadata: Mutex<SyncMetadata>,
    in_progress: AtomicBool,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    /// Last token answered with 401/403.
    rejected_token: Mutex<Option<String>>,
    listeners: ListenerSet<SyncEvent>,
    connectivity_listener: Mutex<Option<ListenerId>>,
    auto_sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("in_progress", &self.is_syncing())
            .field("connectivity", &self.connectivity.current())
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(id) = self.connectivity_listener.get_mut().take() {
            self.connectivity.unsubscribe(id);
        }
        if let Some(task) = self.auto_sync_task.get_mut().take() {
            task.abort();
        }
    }
}

impl SyncEngine {
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn operation_log(&self) -> &OperationLog {
        &self.log
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub fn metadata(&self) -> SyncMetadata {
        self.metadata.lock().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> SyncHealth {
        self.metadata
            .lock()
            .health(self.clock.now(), &self.config.health)
    }

    pub fn status(&self) -> SyncStatusReport {
        let (pending_operations, conflicts) = self
            .store
            .read(|s| (s.pending_operation_count(), s.conflicts().len()));
        let metadata = self.metadata();
        SyncStatusReport {
            state: self.state(),
            connectivity: self.connectivity.current(),
            sync_in_progress: self.is_syncing(),
            pending_operations,
            conflicts,
            last_sync_at: metadata.last_sync_at,
            health: metadata.health(self.clock.now(), &self.config.health),
            last_error: metadata.last_error,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    pub fn create_record(
        &self,
        table: &str,
        record_id: &str,
        fields: Fields,
        opts: EnqueueOptions,
    ) -> Result<OperationId> {
        self.log.create(table, record_id, fields, opts)
    }

    pub fn update_record(
        &self,
        table: &str,
        record_id: &str,
        fields: Fields,
        opts: EnqueueOptions,
    ) -> Result<OperationId> {
        self.log.update(table, record_id, fields, opts)
    }

    pub fn delete_record(
        &self,
        table: &str,
        record_id: &str,
        opts: EnqueueOptions,
    ) -> Result<OperationId> {
        self.log.delete(table, record_id, opts)
    }

    pub fn retry_operation(&self, operation_id: &str) -> Result<()> {
        self.log.retry(operation_id)
    }

    pub fn rollback(&self, operation_id: &str) -> Result<()> {
        self.log.rollback(operation_id)
    }

    /// Operations waiting for `resolve_conflict`.
    pub fn conflicts(&self) -> Vec<SyncOperation> {
        self.log.conflicts()
    }

    /// Settle a conflicted operation.
    ///
    /// `manual` is refused: it is the waiting state, not an outcome.
    pub fn resolve_conflict(
        &self,
        operation_id: &str,
        strategy: ConflictStrategy,
        data: Option<serde_json::Value>,
        resolved_by: Option<String>,
    ) -> Result<ConflictOutcome> {
        let now = self.clock.now();
        let schema = self.store.schema();
        let outcome = self.store.write(|state| {
            self.resolver
                .resolve(state, schema, operation_id, strategy, data, resolved_by, now)
        })?;
        info!(operation_id, %strategy, ?outcome, "Conflict resolved");
        Ok(outcome)
    }

    /// Wipe records, the operation log, the pull cursor and the metadata.
    pub fn reset_local_data(&self) -> Result<()> {
        let _guard = self.try_acquire().ok_or(Error::SyncInProgress)?;
        self.store.clear()?;
        {
            let mut metadata = self.metadata.lock();
            *metadata = SyncMetadata::default();
            self.metadata_store.save(&metadata)?;
        }
        *self.rejected_token.lock() = None;
        self.set_state(SyncState::Idle);
        warn!("Local data reset");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync entry points
    // ------------------------------------------------------------------

    /// Run one pull-then-push cycle. Returns `false` on refusal or failure.
    pub async fn full_sync(&self) -> bool {
        match self.sync().await {
            Ok(_) => true,
            Err(SyncError::InProgress) => {
                debug!("Sync already in progress");
                false
            }
            Err(SyncError::NotEligible(reason)) => {
                debug!(%reason, "Sync skipped");
                false
            }
            Err(_) => false,
        }
    }

    /// Sync only when online, not too soon after the last sync, and there
    /// is something to send.
    pub async fn auto_sync(&self) -> bool {
        self.stats.write().auto_sync_invocations += 1;

        let connectivity = self.connectivity.current();
        if !connectivity.is_online() {
            debug!(%connectivity, "Auto sync skipped");
            return false;
        }
        if self.is_syncing() {
            debug!("Auto sync skipped, cycle in progress");
            return false;
        }

        let last_sync_at = self.metadata.lock().last_sync_at;
        if let Some(last) = last_sync_at {
            let elapsed = Duration::from_millis(self.clock.now().saturating_sub(last));
            if elapsed < self.config.min_auto_sync_interval() {
                debug!(?elapsed, "Auto sync skipped, synced recently");
                return false;
            }
        }

        let has_work = self
            .store
            .read(|s| s.pending_operation_count() > 0 || s.unsynced_record_count() > 0);
        if !has_work {
            debug!("Auto sync skipped, nothing to send");
            return false;
        }

        self.full_sync().await
    }

    /// Call `auto_sync` every `interval_minutes`, replacing any running timer.
    pub fn start_auto_sync(self: &Arc<Self>, interval_minutes: u64) -> Result<()> {
        if interval_minutes == 0 {
            return Err(Error::Config("auto sync interval must be at least one minute".into()));
        }
        let handle = Handle::try_current()
            .map_err(|_| Error::Config("auto sync needs a running tokio runtime".into()))?;
        self.stop_auto_sync();

        let period = Duration::from_secs(interval_minutes * 60);
        let weak = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                engine.auto_sync().await;
            }
        });
        *self.auto_sync_task.lock() = Some(task);
        info!(interval_minutes, "Auto sync started");
        Ok(())
    }

    pub fn stop_auto_sync(&self) {
        if let Some(task) = self.auto_sync_task.lock().take() {
            task.abort();
            info!("Auto sync stopped");
        }
    }

    pub fn is_auto_sync_running(&self) -> bool {
        self.auto_sync_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn schedule_auto_sync(self: Arc<Self>) {
        match Handle::try_current() {
            Ok(handle) => {
                debug!("Reconnected, scheduling auto sync");
                handle.spawn(async move {
                    self.auto_sync().await;
                });
            }
            Err(_) => warn!("Reconnected outside a tokio runtime, auto sync not scheduled"),
        }
    }

    /// Run one cycle and report what it did.
    ///
    /// Refuses with [`SyncError::InProgress`] while another cycle runs and
    /// with [`SyncError::NotEligible`] when connectivity forbids syncing.
    pub async fn sync(&self) -> std::result::Result<SyncCycleResult, SyncError> {
        self.stats.write().full_sync_attempts += 1;

        let connectivity = self.connectivity.current();
        if !connectivity.allows_sync(self.config.sync_on_poor_connection) {
            return Err(SyncError::NotEligible(format!("connectivity is {connectivity}")));
        }
        let _guard = self.try_acquire().ok_or(SyncError::InProgress)?;

        let started = Instant::now();
        info!(%connectivity, "Starting sync cycle");
        self.update_metadata(|m| m.sync_in_progress = true);

        match self.run_cycle(connectivity).await {
            Ok(mut result) => {
                result.duration = started.elapsed();
                self.finish_success(&result);
                Ok(result)
            }
            Err(err) => {
                self.finish_failure(&err);
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // Cycle internals
    // ------------------------------------------------------------------

    fn try_acquire(&self) -> Option<CycleGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CycleGuard(&self.in_progress))
    }

    async fn run_cycle(
        &self,
        connectivity: ConnectivityState,
    ) -> std::result::Result<SyncCycleResult, SyncError> {
        self.emit_progress(SyncPhase::Preparation, 0, "Preparing sync");
        let token = self.current_token()?;
        let mut result = SyncCycleResult::default();

        self.set_state(SyncState::Pulling);
        result.pull = self.pull_phase(&token).await?;

        self.set_state(SyncState::Pushing);
        let online = connectivity.allows_sync(self.config.sync_on_poor_connection);
        self.push_phase(&token, online, &mut result).await?;

        self.emit_progress(SyncPhase::Completion, 100, "Sync complete");
        Ok(result)
    }

    fn current_token(&self) -> std::result::Result<String, SyncError> {
        let token = self
            .tokens
            .bearer_token()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Auth("no bearer token available".into()))?;
        if self.rejected_token.lock().as_deref() == Some(token.as_str()) {
            return Err(SyncError::Auth(
                "token was rejected, waiting for a fresh one".into(),
            ));
        }
        Ok(token)
    }

    /// Bound a remote call in time and remember rejected tokens.
    async fn call<T, F>(&self, token: &str, request: F) -> std::result::Result<T, SyncError>
    where
        F: Future<Output = TransportResult<T>>,
    {
        match tokio::time::timeout(self.config.request_timeout(), request).await {
            Err(_) => Err(SyncError::Timeout),
            Ok(Err(SyncError::Auth(message))) => {
                warn!(%message, "Token rejected");
                *self.rejected_token.lock() = Some(token.to_string());
                Err(SyncError::Auth(message))
            }
            Ok(result) => result,
        }
    }

    async fn pull_phase(&self, token: &str) -> std::result::Result<PullOutcome, SyncError> {
        self.emit_progress(SyncPhase::Pulling, 10, "Fetching remote changes");
        let request = PullRequest {
            last_pulled_at: self.store.last_pulled_at(),
            schema_version: self.config.schema_version,
            migration: None,
        };
        let response = self.call(token, self.transport.pull(&request, token)).await?;
        let changes = response.change_count();
        debug!(changes, timestamp = response.timestamp, "Pulled remote changes");

        let known = self.conflict_ids();
        let now = self.clock.now();
        let schema = self.store.schema();
        let outcome = self
            .store
            .write(|state| apply_pull(state, schema, &self.resolver, response, now))?;
        self.announce_new_conflicts(&known);

        {
            let mut stats = self.stats.write();
            stats.operations_pulled += (outcome.applied + outcome.deleted) as u64;
            stats.conflicts_detected += outcome.conflicts as u64;
        }
        self.emit_progress(
            SyncPhase::Pulling,
            40,
            format!("Applied {changes} remote changes"),
        );
        Ok(outcome)
    }

    async fn push_phase(
        &self,
        token: &str,
        online: bool,
        result: &mut SyncCycleResult,
    ) -> std::result::Result<(), SyncError> {
        let now = self.clock.now();
        let policy = &self.config.retry;

        // Only what is eligible now goes out this cycle; operations unblocked
        // by an acknowledgement wait for the next one.
        let selected = self.store.write(|state| {
            let promoted = state.promote_retryable(now, online, policy);
            if !promoted.is_empty() {
                debug!(count = promoted.len(), "Operations back from backoff");
            }
            Ok(state.select_for_push(now, online, policy, &HashSet::new(), usize::MAX))
        })?;

        if selected.is_empty() {
            self.emit_progress(SyncPhase::Pushing, 95, "Nothing to push");
            return Ok(());
        }

        let total = selected.len();
        let batches: Vec<&[OperationId]> = selected.chunks(self.config.batch_size).collect();
        let mut sent = 0;
        for (index, batch) in batches.iter().enumerate() {
            let ack = self.push_batch(token, batch).await?;
            sent += batch.len();
            result.batches += 1;
            result.pushed += ack.synced;
            result.push_conflicts += ack.conflicts;
            result.rejected += ack.rejected;

            let progress = 50 + (45 * (index + 1) / batches.len()) as u8;
            self.emit_progress(
                SyncPhase::Pushing,
                progress,
                format!("Sent {sent} of {total} operations"),
            );
        }
        Ok(())
    }

    async fn push_batch(
        &self,
        token: &str,
        batch: &[OperationId],
    ) -> std::result::Result<BatchAck, SyncError> {
        let batch_id = format!("batch_{}", Uuid::new_v4().simple());
        let started_at = self.clock.now();
        let (started, request) = self.store.write(|state| {
            let started = state.mark_operations_started(batch, &batch_id, started_at)?;
            let operations = started.iter().filter_map(|id| state.operation(id));
            let request = PushRequest::from_operations(operations, state.last_pulled_at());
            Ok((started, request))
        })?;
        if started.is_empty() {
            return Ok(BatchAck::default());
        }
        debug!(%batch_id, operations = started.len(), "Pushing batch");

        let response = match self.call(token, self.transport.push(&request, token)).await {
            Ok(response) => response,
            Err(err) => {
                self.fail_batch(&started, &err)?;
                return Err(err);
            }
        };

        let known = self.conflict_ids();
        let ack = self.apply_ack(&started, &response)?;
        self.announce_new_conflicts(&known);

        {
            let mut stats = self.stats.write();
            stats.operations_pushed += ack.synced as u64;
            stats.conflicts_detected += ack.conflicts as u64;
        }
        info!(
            %batch_id,
            synced = ack.synced,
            conflicts = ack.conflicts,
            rejected = ack.rejected,
            "Batch acknowledged"
        );
        Ok(ack)
    }

    /// Apply the server's answer to every operation of a batch.
    fn apply_ack(&self, batch: &[OperationId], response: &PushResponse) -> Result<BatchAck> {
        let now = self.clock.now();
        let schema = self.store.schema();
        self.store.write(|state| {
            let mut ack = BatchAck::default();
            for id in batch {
                let Some(op) = state.operation(id) else {
                    continue;
                };
                let (table, record_id) = (op.table_name.clone(), op.record_id.clone());

                let conflict = response
                    .conflicts
                    .iter()
                    .find(|c| c.table == table && c.id == record_id);
                let rejected = response
                    .rejected
                    .iter()
                    .find(|r| r.table == table && r.id == record_id);

                if let Some(conflict) = conflict {
                    let data = ConflictData {
                        source: ConflictSource::Push,
                        server_record: conflict.server_record.clone(),
                        reason: conflict.reason.clone(),
                    };
                    self.resolver.handle_conflict(state, schema, id, data, now)?;
                    ack.conflicts += 1;
                } else if let Some(rejected) = rejected {
                    state.mark_operation_error(id, &rejected.reason, FailureKind::Validation, now)?;
                    ack.rejected += 1;
                } else {
                    state.mark_operation_synced(id, response.timestamp, now)?;
                    ack.synced += 1;
                }
            }
            Ok(ack)
        })
    }

    /// A failed push call fails every operation it carried.
    fn fail_batch(&self, batch: &[OperationId], err: &SyncError) -> Result<()> {
        let now = self.clock.now();
        let message = err.to_string();
        warn!(error = %err, operations = batch.len(), "Push failed");
        self.store.write(|state| {
            for id in batch {
                match err {
                    SyncError::Conflict(_) => state.mark_operation_conflict(
                        id,
                        ConflictData {
                            source: ConflictSource::Push,
                            server_record: None,
                            reason: Some(message.clone()),
                        },
                        now,
                    )?,
                    _ => state.mark_operation_error(id, &message, err.failure_kind(), now)?,
                }
            }
            Ok(())
        })
    }

    fn finish_success(&self, result: &SyncCycleResult) {
        let now = self.clock.now();
        let pending = self.store.read(|s| s.pending_operation_count());
        self.update_metadata(|m| m.record_success(now, pending));
        self.stats.write().cycles_completed += 1;

        if let Err(e) = self.log.cleanup(self.config.retention()) {
            warn!(error = %e, "Operation cleanup failed");
        }

        self.set_state(SyncState::Success);
        self.listeners.notify(&SyncEvent::CycleFinished {
            success: true,
            error: None,
        });
        info!(
            pulled = result.pull.applied + result.pull.deleted,
            pushed = result.pushed,
            conflicts = result.pull.conflicts + result.push_conflicts,
            rejected = result.rejected,
            duration_ms = result.duration.as_millis() as u64,
            "Sync cycle finished"
        );
    }

    fn finish_failure(&self, err: &SyncError) {
        let pending = self.store.read(|s| s.pending_operation_count());
        self.update_metadata(|m| m.record_failure(err.to_string(), pending));
        self.set_state(SyncState::Error);
        self.listeners.notify(&SyncEvent::CycleFinished {
            success: false,
            error: Some(err.to_string()),
        });
        error!(error = %err, retryable = err.is_retryable(), "Sync cycle failed");
    }

    fn update_metadata(&self, f: impl FnOnce(&mut SyncMetadata)) {
        let mut metadata = self.metadata.lock();
        f(&mut metadata);
        if let Err(e) = self.metadata_store.save(&metadata) {
            warn!(error = %e, "Failed to persist sync metadata");
        }
    }

    fn set_state(&self, state: SyncState) {
        let changed = {
            let mut current = self.state.write();
            std::mem::replace(&mut *current, state) != state
        };
        if changed {
            self.listeners.notify(&SyncEvent::StateChanged(state));
        }
    }

    fn emit_progress(&self, phase: SyncPhase, progress: u8, message: impl Into<String>) {
        self.listeners
            .notify(&SyncEvent::Progress(SyncProgress::new(phase, progress, message)));
    }

    fn conflict_ids(&self) -> HashSet<OperationId> {
        self.store.read(|s| {
            s.conflicts()
                .into_iter()
                .map(|op| op.operation_id.clone())
                .collect()
        })
    }

    fn announce_new_conflicts(&self, known: &HashSet<OperationId>) {
        let fresh: Vec<SyncEvent> = self.store.read(|s| {
            s.conflicts()
                .into_iter()
                .filter(|op| !known.contains(&op.operation_id))
                .map(|op| SyncEvent::ConflictDetected {
                    operation_id: op.operation_id.clone(),
                    table: op.table_name.clone(),
                    record_id: op.record_id.clone(),
                })
                .collect()
        });
        for event in &fresh {
            self.listeners.notify(event);
        }
    }
}
