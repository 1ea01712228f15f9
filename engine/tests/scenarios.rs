//! End-to-end sync scenarios against a scripted transport.
//!
//! Time is driven with a `ManualClock` and the network with `MockTransport`,
//! so retry timing and server answers are fully deterministic.

use cuaderno_engine::{
    ConflictData, ConflictSource, ConflictStrategy, ConnectivityMonitor, ConnectivityState,
    EnqueueOptions, FailureKind, Fields, LocalStore, ManualClock, MockTransport, OperationStatus,
    OperationType, PullResponse, PullTableChanges, RetryPolicy, Schema, StaticToken, SyncConfig,
    SyncEngine, SyncError, SyncOperation, SyncStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const START: u64 = 1_706_745_600_000;

struct Device {
    engine: Arc<SyncEngine>,
    transport: Arc<MockTransport>,
    clock: ManualClock,
}

fn device(initial: ConnectivityState) -> Device {
    device_with(initial, SyncConfig::new("https://cuaderno.example.com"))
}

fn device_with(initial: ConnectivityState, config: SyncConfig) -> Device {
    let store = Arc::new(LocalStore::in_memory(Schema::field_notebook()));
    let transport = Arc::new(MockTransport::new());
    let clock = ManualClock::new(START);
    let engine = SyncEngine::builder(config)
        .store(store)
        .transport(transport.clone())
        .tokens(Arc::new(StaticToken::new("field-worker-token")))
        .clock(Arc::new(clock.clone()))
        .connectivity(Arc::new(ConnectivityMonitor::new(initial)))
        .build()
        .unwrap();
    Device {
        engine,
        transport,
        clock,
    }
}

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

fn parcela(nombre: &str) -> Fields {
    fields(json!({"nombre": nombre, "superficie": 3.25}))
}

fn actividad(parcela_id: &str) -> Fields {
    fields(json!({
        "parcela_id": parcela_id,
        "nombre": "Poda de invierno",
        "tipo": "poda",
        "fecha_inicio": START
    }))
}

fn pull_with(table: &str, changes: PullTableChanges, timestamp: u64) -> PullResponse {
    let mut response = PullResponse {
        timestamp,
        ..PullResponse::default()
    };
    response.changes.insert(table.into(), changes);
    response
}

// ============================================================================
// Scenario A: retries run out
// ============================================================================

#[tokio::test]
async fn scenario_a_three_network_failures_exhaust_retries() {
    let d = device(ConnectivityState::Online);
    let id = d
        .engine
        .create_record(
            "parcelas",
            "p1",
            parcela("Norte"),
            EnqueueOptions::default()
                .with_max_retries(3)
                .with_auto_retry(true),
        )
        .unwrap();

    for attempt in 1..=3u32 {
        d.transport
            .script_push(Err(SyncError::Network("no route to host".into())));
        assert!(!d.engine.full_sync().await);

        let op = d.engine.operation_log().get(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Error);
        assert_eq!(op.retry_count, attempt);

        // Wait out the backoff before the next cycle.
        d.clock.advance(op.next_retry_delay(&RetryPolicy::default()));
    }

    let op = d.engine.operation_log().get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    assert!(!op.can_retry());
    assert_eq!(op.failure, Some(FailureKind::ExhaustedRetries));
    assert!(op.is_terminal_error());
    assert_eq!(d.transport.pushes().len(), 3);

    // No further automatic attempts.
    d.clock.advance(Duration::from_secs(3600));
    assert!(d.engine.full_sync().await);
    assert_eq!(d.transport.pushes().len(), 3);

    // Rollback is still on offer.
    d.engine.rollback(&id).unwrap();
    assert!(d.engine.store().get("parcelas", "p1").is_none());
}

// ============================================================================
// Scenario B: dependencies gate transmission
// ============================================================================

#[tokio::test]
async fn scenario_b_dependent_waits_for_next_cycle() {
    let d = device(ConnectivityState::Online);
    let a = d
        .engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    let b = d
        .engine
        .create_record(
            "actividades",
            "a1",
            actividad("p1"),
            EnqueueOptions::default().depends_on(a.clone()).with_priority(10),
        )
        .unwrap();

    d.engine.sync().await.unwrap();

    let first = &d.transport.pushes()[0];
    assert!(first.changes.contains_key("parcelas"));
    assert!(!first.changes.contains_key("actividades"));
    assert_eq!(
        d.engine.operation_log().get(&a).unwrap().status,
        OperationStatus::Synced
    );
    assert_eq!(
        d.engine.operation_log().get(&b).unwrap().status,
        OperationStatus::Pending
    );

    d.engine.sync().await.unwrap();

    let pushes = d.transport.pushes();
    assert_eq!(pushes.len(), 2);
    let second = &pushes[1];
    assert_eq!(second.changes["actividades"].created.len(), 1);
    assert!(!second.changes.contains_key("parcelas"));
    assert_eq!(
        d.engine.operation_log().get(&b).unwrap().status,
        OperationStatus::Synced
    );
}

#[tokio::test]
async fn failed_dependency_blocks_dependent() {
    let d = device(ConnectivityState::Online);
    let a = d
        .engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    let b = d
        .engine
        .create_record(
            "actividades",
            "a1",
            actividad("p1"),
            EnqueueOptions::default().depends_on(a.clone()),
        )
        .unwrap();

    d.transport.script_push(Err(SyncError::Server {
        status: 502,
        message: "bad gateway".into(),
    }));
    assert!(!d.engine.full_sync().await);
    assert_eq!(
        d.engine.operation_log().get(&a).unwrap().status,
        OperationStatus::Error
    );

    d.clock.advance(Duration::from_secs(2));
    d.engine.sync().await.unwrap();
    assert_eq!(
        d.engine.operation_log().get(&a).unwrap().status,
        OperationStatus::Synced
    );
    assert_eq!(
        d.engine.operation_log().get(&b).unwrap().status,
        OperationStatus::Pending
    );

    d.engine.sync().await.unwrap();
    let tables: Vec<Vec<String>> = d
        .transport
        .pushes()
        .iter()
        .map(|p| p.changes.keys().cloned().collect())
        .collect();
    assert_eq!(
        tables,
        vec![
            vec!["parcelas".to_string()],
            vec!["parcelas".to_string()],
            vec!["actividades".to_string()],
        ]
    );
}

// ============================================================================
// Scenario C: reconnect triggers one auto sync
// ============================================================================

#[tokio::test]
async fn scenario_c_reconnect_triggers_single_auto_sync() {
    let d = device(ConnectivityState::Offline);
    d.engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    d.engine
        .create_record("parcelas", "p2", parcela("Sur"), EnqueueOptions::default())
        .unwrap();
    assert_eq!(d.engine.status().pending_operations, 2);

    d.engine.connectivity().set_state(ConnectivityState::Online);

    for _ in 0..200 {
        if d.engine.stats().cycles_completed == 1 && !d.engine.is_syncing() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stats = d.engine.stats();
    assert_eq!(stats.auto_sync_invocations, 1);
    assert_eq!(stats.full_sync_attempts, 1);
    assert_eq!(stats.cycles_completed, 1);
    assert_eq!(stats.operations_pushed, 2);
    assert_eq!(d.engine.status().pending_operations, 0);

    // Staying online is not a reconnect.
    d.engine.connectivity().set_state(ConnectivityState::Online);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(d.engine.stats().auto_sync_invocations, 1);
}

#[tokio::test]
async fn offline_to_poor_does_not_trigger() {
    let d = device(ConnectivityState::Offline);
    d.engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();

    d.engine.connectivity().set_state(ConnectivityState::Poor);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(d.engine.stats().auto_sync_invocations, 0);
    assert_eq!(d.transport.call_count(), 0);
}

// ============================================================================
// Scenario D: client wins after a pulled conflict
// ============================================================================

#[tokio::test]
async fn scenario_d_client_wins_forces_local_payload() {
    let d = device(ConnectivityState::Online);
    d.engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    d.engine.sync().await.unwrap();

    let update = d
        .engine
        .update_record(
            "parcelas",
            "p1",
            fields(json!({"nombre": "Norte regada", "superficie": 3.25})),
            EnqueueOptions::default(),
        )
        .unwrap();

    d.transport.script_pull(Ok(pull_with(
        "parcelas",
        PullTableChanges {
            updated: vec![json!({"id": "p1", "nombre": "Norte (oficina)", "superficie": 3.5})],
            ..PullTableChanges::default()
        },
        100,
    )));
    d.engine.sync().await.unwrap();

    let op = d.engine.operation_log().get(&update).unwrap();
    assert_eq!(op.status, OperationStatus::Conflict);
    assert_eq!(d.transport.pushes().len(), 1, "conflicted update is not sent");
    assert_eq!(
        d.engine.store().get("parcelas", "p1").unwrap().sync_status,
        SyncStatus::Conflict
    );

    d.engine
        .resolve_conflict(&update, ConflictStrategy::ClientWins, None, Some("ana".into()))
        .unwrap();
    let op = d.engine.operation_log().get(&update).unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 0);
    let resolution = op.conflict_resolution.as_ref().unwrap();
    assert_eq!(resolution.strategy, ConflictStrategy::ClientWins);
    assert_eq!(resolution.resolved_by.as_deref(), Some("ana"));

    d.engine.sync().await.unwrap();

    let pushes = d.transport.pushes();
    let forced = &pushes.last().unwrap().changes["parcelas"];
    assert_eq!(forced.force, vec!["p1".to_string()]);
    assert_eq!(forced.updated[0]["nombre"], "Norte regada");
    assert_eq!(
        d.engine.operation_log().get(&update).unwrap().status,
        OperationStatus::Synced
    );
    assert_eq!(
        d.engine.store().get("parcelas", "p1").unwrap().fields["nombre"],
        "Norte regada"
    );
}

#[tokio::test]
async fn server_wins_pull_supersedes_queued_edits() {
    let d = device_with(
        ConnectivityState::Online,
        SyncConfig::new("https://cuaderno.example.com")
            .with_default_strategy(ConflictStrategy::ServerWins),
    );
    d.engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    d.engine.sync().await.unwrap();

    let edits: Vec<_> = ["Norte 1", "Norte 2"]
        .into_iter()
        .map(|nombre| {
            d.engine
                .update_record("parcelas", "p1", parcela(nombre), EnqueueOptions::default())
                .unwrap()
        })
        .collect();

    d.transport.script_pull(Ok(pull_with(
        "parcelas",
        PullTableChanges {
            updated: vec![json!({"id": "p1", "nombre": "Oficina", "superficie": 4.0})],
            ..PullTableChanges::default()
        },
        100,
    )));
    d.engine.sync().await.unwrap();
    d.engine.sync().await.unwrap();

    assert_eq!(d.transport.pushes().len(), 1, "only the original create was sent");
    for id in &edits {
        assert_eq!(
            d.engine.operation_log().get(id).unwrap().status,
            OperationStatus::Synced
        );
    }
    let record = d.engine.store().get("parcelas", "p1").unwrap();
    assert_eq!(record.fields["nombre"], "Oficina");
    assert_eq!(record.sync_status, SyncStatus::Synced);
}

// ============================================================================
// Retry budget and transient failures
// ============================================================================

#[tokio::test]
async fn spent_operation_does_not_stall_the_queue() {
    let d = device(ConnectivityState::Online);
    let spent = d
        .engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    let fresh = d
        .engine
        .create_record("parcelas", "p2", parcela("Sur"), EnqueueOptions::default())
        .unwrap();
    // As loaded from a log written when a zero budget was accepted.
    d.engine
        .store()
        .write(|s| {
            s.operation_mut(&spent).unwrap().max_retries = 0;
            Ok(())
        })
        .unwrap();

    for _ in 0..2 {
        d.engine.sync().await.unwrap();
    }

    let pushes = d.transport.pushes();
    assert_eq!(pushes.len(), 1);
    let created = &pushes[0].changes["parcelas"].created;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["id"], "p2");

    let spent = d.engine.operation_log().get(&spent).unwrap();
    assert_eq!(spent.failure, Some(FailureKind::ExhaustedRetries));
    assert!(spent.is_terminal_error());
    assert_eq!(
        d.engine.operation_log().get(&fresh).unwrap().status,
        OperationStatus::Synced
    );
}

#[tokio::test]
async fn unreadable_push_response_keeps_batch_retryable() {
    let d = device(ConnectivityState::Online);
    let id = d
        .engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();

    d.transport.script_push(Err(SyncError::Server {
        status: 200,
        message: "malformed response: expected value at line 1 column 1".into(),
    }));
    assert!(!d.engine.full_sync().await);

    let op = d.engine.operation_log().get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.failure, Some(FailureKind::Server));
    assert!(!op.is_terminal_error());

    d.clock.advance(op.next_retry_delay(&RetryPolicy::default()));
    assert!(d.engine.full_sync().await);
    assert_eq!(d.transport.pushes().len(), 2);
    assert_eq!(
        d.engine.operation_log().get(&id).unwrap().status,
        OperationStatus::Synced
    );
}

// ============================================================================
// Operation properties
// ============================================================================

fn standalone_operation(max_retries: u32) -> SyncOperation {
    SyncOperation::new(
        OperationType::Create,
        "parcelas",
        "p1",
        parcela("Norte"),
        None,
        EnqueueOptions::default().with_max_retries(max_retries),
        3,
        0,
        START,
    )
}

#[test]
fn mark_as_synced_is_idempotent() {
    let mut op = standalone_operation(3);
    op.mark_as_synced(Some(500), START + 10);
    let first = op.clone();

    op.mark_as_synced(Some(900), START + 99);
    assert_eq!(op, first);
    assert_eq!(op.synced_at, Some(START + 10));
}

#[test]
fn ready_for_retry_only_after_backoff() {
    let policy = RetryPolicy::default();
    let mut op = standalone_operation(3);
    op.mark_as_started(START).unwrap();
    assert!(!op.is_ready_for_retry(START, true, &policy));

    let delay = op.next_retry_delay(&policy).as_millis() as u64;
    assert!(!op.is_ready_for_retry(START + delay - 1, true, &policy));
    assert!(op.is_ready_for_retry(START + delay, true, &policy));
    assert!(!op.is_ready_for_retry(START + delay, false, &policy));
}

#[test]
fn dependency_never_synced_first() {
    let store = Arc::new(LocalStore::in_memory(Schema::field_notebook()));
    let clock = Arc::new(ManualClock::new(START));
    let log = cuaderno_engine::OperationLog::new(store, clock, RetryPolicy::default());

    let a = log
        .create("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    let b = log
        .create(
            "actividades",
            "a1",
            actividad("p1"),
            EnqueueOptions::default().depends_on(a.clone()),
        )
        .unwrap();

    assert!(log.mark_as_synced(&b, None).is_err());
    assert_eq!(log.get(&b).unwrap().status, OperationStatus::Pending);

    log.mark_as_synced(&a, None).unwrap();
    log.mark_as_synced(&b, None).unwrap();
    assert_eq!(log.get(&b).unwrap().status, OperationStatus::Synced);
}

#[tokio::test]
async fn server_wins_resolution_applies_server_values() {
    let d = device(ConnectivityState::Online);
    let id = d
        .engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    d.engine
        .operation_log()
        .mark_as_conflict(
            &id,
            ConflictData {
                source: ConflictSource::Push,
                server_record: Some(fields(
                    json!({"nombre": "Oficina", "superficie": 0.1 + 0.2}),
                )),
                reason: Some("stale".into()),
            },
        )
        .unwrap();

    d.engine
        .resolve_conflict(&id, ConflictStrategy::ServerWins, None, None)
        .unwrap();

    let record = d.engine.store().get("parcelas", "p1").unwrap();
    assert_eq!(
        record.fields,
        fields(json!({"nombre": "Oficina", "superficie": 0.1 + 0.2}))
    );
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(
        d.engine.operation_log().get(&id).unwrap().status,
        OperationStatus::Synced
    );
}

#[tokio::test]
async fn manual_resolution_requires_an_outcome() {
    let d = device(ConnectivityState::Online);
    let id = d
        .engine
        .create_record("parcelas", "p1", parcela("Norte"), EnqueueOptions::default())
        .unwrap();
    d.engine
        .operation_log()
        .mark_as_conflict(
            &id,
            ConflictData {
                source: ConflictSource::Pull,
                server_record: Some(parcela("Oficina")),
                reason: None,
            },
        )
        .unwrap();

    assert!(d
        .engine
        .resolve_conflict(&id, ConflictStrategy::Manual, None, None)
        .is_err());
    assert!(d.engine.operation_log().get(&id).unwrap().conflict_info().requires_manual_resolution);

    // Still parked after any number of cycles.
    d.clock.advance(Duration::from_secs(3600));
    d.engine.sync().await.unwrap();
    assert_eq!(
        d.engine.operation_log().get(&id).unwrap().status,
        OperationStatus::Conflict
    );
    assert!(d.transport.pushes().is_empty());
}
