//! Local store - the durable, transactional state container.
//!
//! The store holds domain records, the operation log and the pull cursor.
//! All mutation goes through [`LocalStore::write`]: the closure works on a
//! draft copy which is persisted and swapped in only if the closure returns
//! `Ok`. An `Err` (or a failed persist) leaves both memory and disk as they
//! were.

use crate::{
    error::Result,
    snapshot::StoreSnapshot,
    storage::{MemoryStorage, Storage, STORE_SNAPSHOT_KEY},
    Error, Fields, OperationId, OperationMap, OperationStatus, Record, RecordId, Schema,
    SyncOperation, TableName, Timestamp,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything the store persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    pub(crate) tables: BTreeMap<TableName, BTreeMap<RecordId, Record>>,
    pub(crate) operations: OperationMap,
    pub(crate) last_pulled_at: Option<Timestamp>,
    pub(crate) next_sequence: u64,
}

impl StoreState {
    /// Get a record, including local tombstones.
    pub fn record(&self, table: &str, id: &str) -> Option<&Record> {
        self.tables.get(table)?.get(id)
    }

    pub fn record_mut(&mut self, table: &str, id: &str) -> Option<&mut Record> {
        self.tables.get_mut(table)?.get_mut(id)
    }

    /// Query the records of a table.
    pub fn query(&self, table: &str) -> QueryBuilder<'_> {
        QueryBuilder::new(self.tables.get(table))
    }

    pub fn upsert_record(&mut self, record: Record) {
        self.tables
            .entry(record.table.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn remove_record(&mut self, table: &str, id: &str) -> Option<Record> {
        let records = self.tables.get_mut(table)?;
        let removed = records.remove(id);
        if records.is_empty() {
            self.tables.remove(table);
        }
        removed
    }

    /// Records with local changes not yet confirmed by the server.
    pub fn unsynced_record_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(|t| t.values())
            .filter(|r| r.needs_sync())
            .count()
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    pub fn operation(&self, id: &str) -> Option<&SyncOperation> {
        self.operations.get(id)
    }

    pub fn operation_mut(&mut self, id: &str) -> Option<&mut SyncOperation> {
        self.operations.get_mut(id)
    }

    pub(crate) fn operation_mut_or_err(&mut self, id: &str) -> Result<&mut SyncOperation> {
        self.operations
            .get_mut(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    pub fn operations(&self) -> &OperationMap {
        &self.operations
    }

    pub(crate) fn insert_operation(&mut self, op: SyncOperation) {
        self.operations.insert(op.operation_id.clone(), op);
    }

    /// Hand out the next log position.
    pub(crate) fn take_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Operations not yet `synced`.
    pub fn pending_operation_count(&self) -> usize {
        self.operations
            .values()
            .filter(|op| op.status != OperationStatus::Synced)
            .count()
    }

    /// Ids of unsynced operations on one record, in log order.
    pub fn unsynced_operations_for(&self, table: &str, record_id: &str) -> Vec<OperationId> {
        let mut ops: Vec<&SyncOperation> = self
            .operations
            .values()
            .filter(|op| {
                op.status != OperationStatus::Synced
                    && op.table_name == table
                    && op.record_id == record_id
            })
            .collect();
        ops.sort_by_key(|op| op.sequence);
        ops.into_iter().map(|op| op.operation_id.clone()).collect()
    }

    pub fn last_pulled_at(&self) -> Option<Timestamp> {
        self.last_pulled_at
    }

    pub(crate) fn set_last_pulled_at(&mut self, cursor: Timestamp) {
        self.last_pulled_at = Some(cursor);
    }

    /// Insert a record created on this device.
    pub(crate) fn create_local(
        &mut self,
        schema: &Schema,
        table: &str,
        id: &str,
        fields: Fields,
        now: Timestamp,
    ) -> Result<()> {
        schema.validate(table, &fields)?;
        if self.record(table, id).is_some_and(|r| !r.is_deleted()) {
            return Err(Error::RecordAlreadyExists {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        self.upsert_record(Record::new_local(table, id, fields, now));
        Ok(())
    }

    /// Replace the fields of a live record, returning the previous fields.
    pub(crate) fn update_local(
        &mut self,
        schema: &Schema,
        table: &str,
        id: &str,
        fields: Fields,
        now: Timestamp,
    ) -> Result<Fields> {
        schema.validate(table, &fields)?;
        let record = self.live_record_mut(table, id)?;
        let previous = std::mem::replace(&mut record.fields, Fields::new());
        record.apply_local_update(fields, now);
        Ok(previous)
    }

    /// Tombstone a live record, returning its fields.
    pub(crate) fn delete_local(&mut self, table: &str, id: &str, now: Timestamp) -> Result<Fields> {
        let record = self.live_record_mut(table, id)?;
        record.mark_deleted(now);
        Ok(record.fields.clone())
    }

    fn live_record_mut(&mut self, table: &str, id: &str) -> Result<&mut Record> {
        self.tables
            .get_mut(table)
            .and_then(|t| t.get_mut(id))
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| Error::RecordNotFound {
                table: table.to_string(),
                id: id.to_string(),
            })
    }
}

/// Handle to the durable local store.
pub struct LocalStore {
    schema: Arc<Schema>,
    storage: Arc<dyn Storage>,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("schema_version", &self.schema.version)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open a store, loading the last committed snapshot if there is one.
    pub fn open(schema: Schema, storage: Arc<dyn Storage>) -> Result<Self> {
        let state = match storage.read(STORE_SNAPSHOT_KEY)? {
            Some(bytes) => {
                let snapshot = StoreSnapshot::from_slice(&bytes)?;
                snapshot.validate(&schema)?;
                info!(
                    records = snapshot.record_count(),
                    operations = snapshot.operations.len(),
                    "Loaded local store"
                );
                snapshot.into_state()
            }
            None => StoreState::default(),
        };

        Ok(Self {
            schema: Arc::new(schema),
            storage,
            state: Mutex::new(state),
        })
    }

    /// A store backed by [`MemoryStorage`].
    pub fn in_memory(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            storage: Arc::new(MemoryStorage::new()),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Run a read-only closure against the current state.
    pub fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        f(&self.state.lock())
    }

    /// Run a write transaction.
    ///
    /// Commits (persist, then swap in) when `f` returns `Ok`; otherwise
    /// nothing changes.
    pub fn write<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let mut draft = state.clone();
        let out = f(&mut draft)?;
        if draft != *state {
            self.persist(&draft)?;
            *state = draft;
        }
        Ok(out)
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let json = StoreSnapshot::from_state(state, self.schema.version).to_json()?;
        self.storage.write(STORE_SNAPSHOT_KEY, json.as_bytes())?;
        debug!(bytes = json.len(), "Persisted store snapshot");
        Ok(())
    }

    /// Get a live (not locally deleted) record.
    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.read(|s| s.record(table, id).filter(|r| !r.is_deleted()).cloned())
    }

    /// Get a record, tombstones included.
    pub fn get_including_deleted(&self, table: &str, id: &str) -> Option<Record> {
        self.read(|s| s.record(table, id).cloned())
    }

    /// Live records of a table.
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.read(|s| s.query(table).all().into_iter().cloned().collect())
    }

    pub fn last_pulled_at(&self) -> Option<Timestamp> {
        self.read(|s| s.last_pulled_at)
    }

    /// Export the current state.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.read(|s| StoreSnapshot::from_state(s, self.schema.version))
    }

    /// Drop all records, operations and the pull cursor.
    pub fn clear(&self) -> Result<()> {
        self.write(|s| {
            *s = StoreState::default();
            Ok(())
        })?;
        info!("Cleared local store");
        Ok(())
    }
}

/// Query builder for filtering records.
pub struct QueryBuilder<'a> {
    records: Option<&'a BTreeMap<RecordId, Record>>,
    include_deleted: bool,
}

impl<'a> QueryBuilder<'a> {
    fn new(records: Option<&'a BTreeMap<RecordId, Record>>) -> Self {
        Self {
            records,
            include_deleted: false,
        }
    }

    /// Include locally deleted records in results.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    fn iter(&self) -> impl Iterator<Item = &'a Record> + '_ {
        self.records
            .into_iter()
            .flat_map(|t| t.values())
            .filter(|r| self.include_deleted || !r.is_deleted())
    }

    /// Get all matching records, ordered by id.
    pub fn all(self) -> Vec<&'a Record> {
        self.iter().collect()
    }

    pub fn first(self) -> Option<&'a Record> {
        self.iter().next()
    }

    pub fn count(self) -> usize {
        self.iter().count()
    }

    /// Filter records with a predicate.
    pub fn filter<F>(self, predicate: F) -> Vec<&'a Record>
    where
        F: Fn(&Record) -> bool,
    {
        self.iter().filter(|r| predicate(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncStatus;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn parcela(nombre: &str) -> Fields {
        fields(json!({"nombre": nombre, "superficie": 1.25}))
    }

    #[derive(Debug, Default)]
    struct FailingStorage;

    impl Storage for FailingStorage {
        fn read(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn write(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(Error::Storage("disk full".into()))
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn create_and_get() {
        let store = LocalStore::in_memory(Schema::field_notebook());
        store
            .write(|s| s.create_local(&Schema::field_notebook(), "parcelas", "p1", parcela("A"), 1_000))
            .unwrap();

        let record = store.get("parcelas", "p1").unwrap();
        assert_eq!(record.fields["nombre"], "A");
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn create_duplicate() {
        let schema = Schema::field_notebook();
        let store = LocalStore::in_memory(schema.clone());
        store
            .write(|s| s.create_local(&schema, "parcelas", "p1", parcela("A"), 1_000))
            .unwrap();

        let result = store.write(|s| s.create_local(&schema, "parcelas", "p1", parcela("B"), 2_000));
        assert!(matches!(result, Err(Error::RecordAlreadyExists { .. })));
    }

    #[test]
    fn update_returns_previous_fields() {
        let schema = Schema::field_notebook();
        let store = LocalStore::in_memory(schema.clone());
        store
            .write(|s| s.create_local(&schema, "parcelas", "p1", parcela("A"), 1_000))
            .unwrap();

        let previous = store
            .write(|s| s.update_local(&schema, "parcelas", "p1", parcela("B"), 2_000))
            .unwrap();
        assert_eq!(previous["nombre"], "A");
        assert_eq!(store.get("parcelas", "p1").unwrap().fields["nombre"], "B");
    }

    #[test]
    fn delete_leaves_tombstone() {
        let schema = Schema::field_notebook();
        let store = LocalStore::in_memory(schema.clone());
        store
            .write(|s| s.create_local(&schema, "parcelas", "p1", parcela("A"), 1_000))
            .unwrap();
        store.write(|s| s.delete_local("parcelas", "p1", 2_000)).unwrap();

        assert!(store.get("parcelas", "p1").is_none());
        assert!(store.get_including_deleted("parcelas", "p1").unwrap().is_deleted());
        assert!(matches!(
            store.write(|s| s.delete_local("parcelas", "p1", 3_000)),
            Err(Error::RecordNotFound { .. })
        ));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let schema = Schema::field_notebook();
        let store = LocalStore::in_memory(schema.clone());

        let result: Result<()> = store.write(|s| {
            s.create_local(&schema, "parcelas", "p1", parcela("A"), 1_000)?;
            s.create_local(&schema, "parcelas", "p2", fields(json!({"nombre": "no area"})), 1_000)
        });

        assert!(matches!(result, Err(Error::MissingRequiredField(_))));
        assert!(store.get("parcelas", "p1").is_none());
    }

    #[test]
    fn failed_persist_rolls_back() {
        let schema = Schema::field_notebook();
        let store = LocalStore::open(schema.clone(), Arc::new(FailingStorage)).unwrap();

        let result = store.write(|s| s.create_local(&schema, "parcelas", "p1", parcela("A"), 1_000));
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(store.get("parcelas", "p1").is_none());
    }

    #[test]
    fn reopen_restores_state() {
        let schema = Schema::field_notebook();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

        {
            let store = LocalStore::open(schema.clone(), Arc::clone(&storage)).unwrap();
            store
                .write(|s| {
                    s.create_local(&schema, "parcelas", "p1", parcela("A"), 1_000)?;
                    s.set_last_pulled_at(42);
                    Ok(())
                })
                .unwrap();
        }

        let reopened = LocalStore::open(schema, storage).unwrap();
        assert_eq!(reopened.get("parcelas", "p1").unwrap().fields["nombre"], "A");
        assert_eq!(reopened.last_pulled_at(), Some(42));
    }

    #[test]
    fn query_filter() {
        let schema = Schema::field_notebook();
        let store = LocalStore::in_memory(schema.clone());
        store
            .write(|s| {
                s.create_local(&schema, "parcelas", "p1", parcela("Norte"), 1_000)?;
                s.create_local(&schema, "parcelas", "p2", parcela("Sur"), 1_000)?;
                s.create_local(&schema, "parcelas", "p3", parcela("Este"), 1_000)?;
                s.delete_local("parcelas", "p3", 2_000)?;
                Ok(())
            })
            .unwrap();

        store.read(|s| {
            assert_eq!(s.query("parcelas").count(), 2);
            assert_eq!(s.query("parcelas").include_deleted().count(), 3);
            let sur = s.query("parcelas").filter(|r| r.fields["nombre"] == "Sur");
            assert_eq!(sur.len(), 1);
            assert_eq!(sur[0].id, "p2");
            assert_eq!(s.query("actividades").count(), 0);
            assert_eq!(s.unsynced_record_count(), 3);
        });
    }

    #[test]
    fn clear_drops_everything() {
        let schema = Schema::field_notebook();
        let store = LocalStore::in_memory(schema.clone());
        store
            .write(|s| {
                s.create_local(&schema, "parcelas", "p1", parcela("A"), 1_000)?;
                s.set_last_pulled_at(10);
                Ok(())
            })
            .unwrap();

        store.clear().unwrap();
        assert!(store.records("parcelas").is_empty());
        assert_eq!(store.last_pulled_at(), None);
    }
}
