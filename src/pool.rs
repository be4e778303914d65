//! A bounded cache of recently used records, in front of an accessor.

use std::{collections::HashMap, sync::Arc};

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    accessor::{BulkDataAccessor, WriteKind},
    error::Result,
    ident::RecordId,
    record::Record,
};

/// Pool capacity for record types that don't declare one.
pub const DEFAULT_POOL_SIZE: usize = 200;

#[derive(Debug)]
struct PoolState {
    slots: Vec<Option<Record>>,
    index: HashMap<RecordId, usize>,
    cursor: usize,
}

impl PoolState {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            index: HashMap::with_capacity(capacity),
            cursor: 0,
        }
    }

    fn get(&self, id: &RecordId) -> Option<&Record> {
        self.index
            .get(id)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    /// Put `record` at the cursor and advance it. The slot's previous
    /// occupant is evicted, and so is an older copy of the same key.
    fn add(&mut self, record: Record) {
        self.remove(record.id());

        let slot = self.cursor;
        if let Some(evicted) = self.slots[slot].take() {
            trace!(id = %evicted.id(), slot, "evicting pooled record");
            self.index.remove(evicted.id());
        }

        self.index.insert(record.id().clone(), slot);
        self.slots[slot] = Some(record);
        self.cursor = (slot + 1) % self.slots.len();
    }

    fn remove(&mut self, id: &RecordId) -> Option<Record> {
        let slot = self.index.remove(id)?;
        self.slots[slot].take()
    }
}

/// A fixed-size ring of records, keyed by id.
///
/// Reads are served from the ring when possible and fall through to the
/// [`BulkDataAccessor`] otherwise. Every write is validated by the accessor
/// before the ring is touched, then written through.
///
/// The ring evicts in insertion order: each new entry goes into the slot
/// under the cursor, pushing out whatever was there. A cache hit re-inserts
/// the record at the cursor, which keeps frequently read records around
/// without tracking exact recency.
#[derive(Debug, Clone)]
pub struct RecordPool {
    accessor: BulkDataAccessor,
    state: Arc<Mutex<PoolState>>,
}

impl RecordPool {
    /// Create a pool in front of `accessor`. The capacity comes from the
    /// record type, or [`DEFAULT_POOL_SIZE`]; it is never less than 1.
    pub fn new(accessor: BulkDataAccessor) -> Self {
        let capacity = accessor.kind().pool_size().unwrap_or(DEFAULT_POOL_SIZE);
        Self::with_capacity(accessor, capacity)
    }

    pub fn with_capacity(accessor: BulkDataAccessor, capacity: usize) -> Self {
        Self {
            accessor,
            state: Arc::new(Mutex::new(PoolState::new(capacity.max(1)))),
        }
    }

    pub fn accessor(&self) -> &BulkDataAccessor {
        &self.accessor
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of records currently pooled.
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.state.lock().index.contains_key(id)
    }

    /// Cache `record` without writing it anywhere.
    pub fn add(&self, record: Record) {
        self.state.lock().add(record);
    }

    /// Evict the record with the given id, returning it if it was pooled.
    pub fn remove(&self, id: &RecordId) -> Option<Record> {
        self.state.lock().remove(id)
    }

    /// Re-insert a pooled record at the cursor. Returns false if the id
    /// isn't pooled.
    pub fn bump(&self, id: &RecordId) -> bool {
        let mut state = self.state.lock();
        match state.remove(id) {
            Some(record) => {
                state.add(record);
                true
            }
            None => false,
        }
    }

    fn lookup(&self, id: &RecordId) -> Option<Record> {
        let mut state = self.state.lock();
        let record = state.get(id)?.clone();
        state.add(record.clone());
        Some(record)
    }

    /// Find a record by id, from the pool if possible.
    pub fn find_one_by_key(&self, id: &RecordId) -> BoxFuture<'static, Result<Record>> {
        if let Some(record) = self.lookup(id) {
            trace!(%id, "pool hit");
            return future::ready(Ok(record)).boxed();
        }

        debug!(%id, "pool miss");
        let fetch = self.accessor.find_one_by_key(id);
        let pool = self.clone();

        async move {
            let record = fetch.await?;

            // Someone else may have pooled this record while we were
            // fetching; theirs wins.
            let mut state = pool.state.lock();
            match state.get(record.id()) {
                Some(pooled) => Ok(pooled.clone()),
                None => {
                    state.add(record.clone());
                    Ok(record)
                }
            }
        }
        .boxed()
    }

    pub fn try_one_by_key(&self, id: &RecordId) -> BoxFuture<'static, Result<Option<Record>>> {
        self.find_one_by_key(id)
            .map(|result| match result {
                Ok(record) => Ok(Some(record)),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            })
            .boxed()
    }

    pub fn insert(&self, record: Record) -> BoxFuture<'static, Result<Record>> {
        self.write_through(WriteKind::Insert, record)
    }

    pub fn update(&self, record: Record) -> BoxFuture<'static, Result<Record>> {
        self.write_through(WriteKind::Update, record)
    }

    pub fn upsert(&self, record: Record) -> BoxFuture<'static, Result<Record>> {
        self.write_through(WriteKind::Upsert, record)
    }

    /// Evict the record, then delete it from the store.
    pub fn delete(&self, record: Record) -> BoxFuture<'static, Result<Record>> {
        self.write_through(WriteKind::Delete, record)
    }

    fn write_through(&self, kind: WriteKind, record: Record) -> BoxFuture<'static, Result<Record>> {
        let id = record.id().clone();

        match self.accessor.write(kind, record.clone()) {
            Err(err) => future::ready(Err(err)).boxed(),
            Ok(write) => {
                if kind == WriteKind::Delete {
                    self.remove(&id);
                } else {
                    self.add(record);
                }
                write
            }
        }
    }
}
