//! # Cuaderno Engine
//!
//! Offline-first sync engine for the cuaderno campo field notebook.
//!
//! Field workers edit records on a device that is offline most of the day.
//! Every edit is applied to the local store and queued as a durable
//! [`SyncOperation`]; when the network comes back the [`SyncEngine`] pulls
//! remote changes, reconciles them with what is still queued, and pushes the
//! queue in priority order.
//!
//! ## Core Concepts
//!
//! ### Local Store
//!
//! [`LocalStore`] holds records and the operation log in one state guarded by
//! write transactions: a closure runs on a draft, the draft is persisted
//! through a [`Storage`] backend, and only then becomes visible. A failed
//! closure or a failed write leaves nothing behind.
//!
//! ### Operation Log
//!
//! [`OperationLog`] is the queue of mutations waiting for the server. Each
//! operation moves through `pending → synced | error | conflict`, carries
//! its retry budget and backoff, and may depend on other operations.
//!
//! ### Conflicts
//!
//! A remote change to a record with unsynced local work, or a server-side
//! mismatch on push, parks the operation in `conflict`. [`ConflictResolver`]
//! applies one of [`ConflictStrategy::ServerWins`],
//! [`ConflictStrategy::ClientWins`], [`ConflictStrategy::Merge`], or waits
//! for a decision ([`ConflictStrategy::Manual`], the default).
//!
//! ### Sync Coordinator
//!
//! [`SyncEngine`] runs single-flight pull-then-push cycles over a
//! [`SyncTransport`], keeps [`SyncMetadata`], and reacts to
//! [`ConnectivityMonitor`] changes.
//!
//! ## Quick Start
//!
//! ```rust
//! use cuaderno_engine::{
//!     EnqueueOptions, LocalStore, ManualClock, OperationLog, OperationStatus, RetryPolicy,
//!     Schema, SyncStatus,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let store = Arc::new(LocalStore::in_memory(Schema::field_notebook()));
//! let clock = Arc::new(ManualClock::new(1_706_745_600_000));
//! let log = OperationLog::new(Arc::clone(&store), clock, RetryPolicy::default());
//!
//! let fields = json!({"nombre": "Finca El Olivar", "superficie": 12.5});
//! let op_id = log
//!     .create("parcelas", "p1", fields.as_object().cloned().unwrap(), EnqueueOptions::default())
//!     .unwrap();
//!
//! assert_eq!(log.get(&op_id).unwrap().status, OperationStatus::Pending);
//! assert_eq!(store.get("parcelas", "p1").unwrap().sync_status, SyncStatus::Pending);
//! ```
//!
//! ## Persistence
//!
//! [`FileStorage`] writes each key atomically (temp file, fsync, rename).
//! The store lives under [`STORE_SNAPSHOT_KEY`] as a versioned
//! [`StoreSnapshot`]; the sync metadata under [`SYNC_METADATA_KEY`].

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod metadata;
pub mod oplog;
pub mod operation;
pub mod protocol;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod transport;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{HealthThresholds, RetryPolicy, SyncConfig};
pub use connectivity::{
    CellularGeneration, ConnectivityChange, ConnectivityMonitor, ConnectivityState, LinkInfo,
    LinkKind,
};
pub use engine::{SyncCycleResult, SyncEngine, SyncEngineBuilder, SyncStats, SyncStatusReport};
pub use error::{Error, FailureKind, SyncError};
pub use events::{ListenerId, ListenerSet, SyncEvent, SyncPhase, SyncProgress, SyncState};
pub use http::HttpTransport;
pub use metadata::{MetadataStore, SyncHealth, SyncMetadata};
pub use operation::{
    new_operation_id, ConflictData, ConflictInfo, ConflictResolution, ConflictSource,
    ConflictStrategy, EnqueueOptions, OperationId, OperationMap, OperationStatus, OperationType,
    SyncOperation, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
pub use oplog::OperationLog;
pub use protocol::{
    PullRequest, PullResponse, PullTableChanges, PushConflict, PushRequest, PushResponse,
    PushTableChanges, RejectedRecord,
};
pub use reconcile::{ConflictOutcome, ConflictResolver, MergeContext, MergeFn, PullOutcome};
pub use record::{Record, SyncStatus};
pub use schema::{FieldDef, FieldType, Schema, TableSchema};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use storage::{FileStorage, MemoryStorage, Storage, STORE_SNAPSHOT_KEY, SYNC_METADATA_KEY};
pub use store::{LocalStore, QueryBuilder, StoreState};
pub use transport::{MockTransport, StaticToken, SyncTransport, TokenProvider, TransportResult};

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;

/// Field values of a record, keyed by field name.
pub type Fields = serde_json::Map<String, serde_json::Value>;
