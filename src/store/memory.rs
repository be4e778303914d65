use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures_timer::Delay;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{Store, WriteOp};
use crate::{
    error::{Error, Result},
    ident::RecordId,
    record::{Record, RecordType},
};

/// A call received by a [`MemoryStore`], recorded in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    BulkWrite { kind: String, ops: Vec<WriteOp> },
    Find { kind: String, ids: Vec<RecordId> },
}

#[derive(Debug, Default)]
struct MemoryState {
    // Record type key -> id -> fields
    collections: HashMap<String, HashMap<RecordId, Map<String, Value>>>,
    calls: Vec<StoreCall>,
    fail_next: Option<Error>,
}

/// A [`Store`] that keeps everything in memory.
///
/// Every call is logged, so tests can check exactly how many round-trips
/// were made and in which order operations arrived. A failure can be queued
/// for the next call, and an artificial latency can be added to every call.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before it is applied.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Fail the next call (of either kind) as a whole with `error`.
    pub fn fail_next(&self, error: Error) {
        self.state.lock().fail_next = Some(error);
    }

    /// Put a record directly into the store, without logging a call.
    pub fn seed(&self, record: Record) {
        let kind = record.kind().key().to_owned();
        let id = record.id().clone();
        self.state
            .lock()
            .collections
            .entry(kind)
            .or_default()
            .insert(id, record.into_fields());
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.state
            .lock()
            .collections
            .get(id.kind().key())
            .and_then(|records| records.get(id))
            .map(|fields| Record::from_parts(id.clone(), fields.clone()))
    }

    /// Number of stored records of the given type.
    pub fn len(&self, kind: &RecordType) -> usize {
        self.state
            .lock()
            .collections
            .get(kind.key())
            .map_or(0, HashMap::len)
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    /// The number of operations in each bulk write so far.
    pub fn bulk_write_sizes(&self) -> Vec<usize> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                StoreCall::BulkWrite { ops, .. } => Some(ops.len()),
                StoreCall::Find { .. } => None,
            })
            .collect()
    }

    pub fn find_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, StoreCall::Find { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn begin(&self, call: StoreCall) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn wait(&self) {
        if let Some(latency) = self.latency {
            Delay::new(latency).await;
        }
    }
}

fn apply(
    kind: &RecordType,
    records: &mut HashMap<RecordId, Map<String, Value>>,
    op: WriteOp,
) -> Result<()> {
    match op {
        WriteOp::InsertOne { mut document } => {
            let id = match document.remove("_id") {
                Some(Value::String(id)) => kind.id(&id)?,
                _ => return Err(Error::Store("inserted document has no _id".into())),
            };
            if records.contains_key(&id) {
                return Err(Error::Store(format!("duplicate key {}", id)));
            }
            records.insert(id, document);
            Ok(())
        }
        WriteOp::UpdateOne {
            filter,
            update,
            upsert,
        } => match records.get_mut(&filter.id) {
            Some(fields) => {
                fields.extend(update);
                Ok(())
            }
            None if upsert => {
                records.insert(filter.id, update);
                Ok(())
            }
            None => Err(Error::not_found(kind.singular(), filter.id.as_str())),
        },
        WriteOp::DeleteOne { filter } => {
            records.remove(&filter.id);
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn bulk_write(&self, kind: &RecordType, ops: Vec<WriteOp>) -> Result<Vec<Result<()>>> {
        self.begin(StoreCall::BulkWrite {
            kind: kind.key().to_owned(),
            ops: ops.clone(),
        })?;
        self.wait().await;

        let mut state = self.state.lock();
        let records = state.collections.entry(kind.key().to_owned()).or_default();

        Ok(ops.into_iter().map(|op| apply(kind, records, op)).collect())
    }

    async fn find_by_ids(&self, kind: &RecordType, ids: &[RecordId]) -> Result<Vec<Record>> {
        self.begin(StoreCall::Find {
            kind: kind.key().to_owned(),
            ids: ids.to_vec(),
        })?;
        self.wait().await;

        let state = self.state.lock();
        let records = match state.collections.get(kind.key()) {
            None => return Ok(Vec::new()),
            Some(records) => records,
        };

        Ok(ids
            .iter()
            .filter_map(|id| {
                records
                    .get(id)
                    .map(|fields| Record::from_parts(id.clone(), fields.clone()))
            })
            .collect())
    }
}
