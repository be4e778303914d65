//! Batched, key-serialized access to the records of one type.

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    batch::{BatchConfig, BatchController, BatchDriver, BatchRules},
    collection::BatchCollection,
    error::{Error, Result},
    ident::RecordId,
    lock::{KeyLocks, LockDriver},
    record::{FieldDescriptor, Record, RecordType},
    store::{IdFilter, Store, WriteOp},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl WriteKind {
    fn permits(self, field: &FieldDescriptor) -> bool {
        match self {
            WriteKind::Insert => field.insertable,
            WriteKind::Update | WriteKind::Upsert => field.updatable,
            WriteKind::Delete => false,
        }
    }
}

/// A batching accessor for the records of one [`RecordType`].
///
/// Writes are collected into a single bulk write per flush, and reads into
/// a single lookup by id set. Operations on the same record key are run
/// strictly one after another, in the order they were called; operations on
/// different keys may share a batch.
///
/// Validation happens when an operation is called, not when it is polled:
/// an invalid record never reaches a batch, and its future fails at once.
///
/// Accessors are cheap to clone; clones share batches and key locks.
#[derive(Clone)]
pub struct BulkDataAccessor {
    kind: RecordType,
    writes: BatchController<WriteOp, ()>,
    reads: BatchController<RecordId, Record>,
    locks: KeyLocks<RecordId>,
}

impl BulkDataAccessor {
    /// Create an accessor for `kind`, backed by `store`. The returned driver
    /// must be polled for any batch to be flushed.
    pub fn new(
        kind: RecordType,
        store: Arc<dyn Store>,
        config: BatchConfig,
    ) -> Result<(Self, AccessorDriver)> {
        let write_rules = {
            let store = Arc::clone(&store);
            let kind = kind.clone();
            BatchRules::new(move |batch: BatchCollection<WriteOp, ()>, _config| {
                let store = Arc::clone(&store);
                let kind = kind.clone();
                async move {
                    let ops: Vec<WriteOp> = batch.requests().cloned().collect();
                    let outcomes = store.bulk_write(&kind, ops).await?;
                    batch.settle_each(Ok(outcomes));
                    Ok(())
                }
            })
            .config(config)
        };

        let read_rules = {
            let kind = kind.clone();
            BatchRules::new(move |batch: BatchCollection<RecordId, Record>, _config| {
                let store = Arc::clone(&store);
                let kind = kind.clone();
                async move {
                    let ids: Vec<RecordId> = {
                        let mut seen = HashSet::new();
                        batch
                            .requests()
                            .filter(|id| seen.insert(*id))
                            .cloned()
                            .collect()
                    };

                    let found: HashMap<RecordId, Record> = store
                        .find_by_ids(&kind, &ids)
                        .await?
                        .into_iter()
                        .map(|record| (record.id().clone(), record))
                        .collect();

                    batch.resolve_all(|id| {
                        found
                            .get(id)
                            .cloned()
                            .ok_or_else(|| Error::not_found(kind.singular(), id.as_str()))
                    });
                    Ok(())
                }
            })
            .config(config)
        };

        let (writes, write_driver) = BatchController::new(write_rules)?;
        let (reads, read_driver) = BatchController::new(read_rules)?;
        let (locks, lock_driver) = KeyLocks::new();

        let accessor = Self {
            kind,
            writes,
            reads,
            locks,
        };

        let driver = AccessorDriver {
            locks: Some(lock_driver),
            writes: Some(write_driver),
            reads: Some(read_driver),
        };

        Ok((accessor, driver))
    }

    pub fn kind(&self) -> &RecordType {
        &self.kind
    }

    /// Rotate both the write and the read batch now, without waiting for
    /// the timer.
    pub fn flush(&self) {
        self.writes.flush();
        self.reads.flush();
    }

    /// Number of record keys with an operation still pending.
    pub fn pending_keys(&self) -> usize {
        self.locks.len()
    }

    /// Queue an insert of every insertable field of `record`. Resolves with
    /// the record once the write has been applied.
    pub fn insert(&self, record: Record) -> BoxFuture<'static, Result<Record>> {
        self.write(WriteKind::Insert, record)
            .unwrap_or_else(|err| future::ready(Err(err)).boxed())
    }

    /// Queue an update of every updatable field of `record`.
    pub fn update(&self, record: Record) -> BoxFuture<'static, Result<Record>> {
        self.write(WriteKind::Update, record)
            .unwrap_or_else(|err| future::ready(Err(err)).boxed())
    }

    /// Like [`update`](BulkDataAccessor::update), but creates the record if
    /// it doesn't exist yet.
    pub fn upsert(&self, record: Record) -> BoxFuture<'static, Result<Record>> {
        self.write(WriteKind::Upsert, record)
            .unwrap_or_else(|err| future::ready(Err(err)).boxed())
    }

    pub fn delete(&self, record: Record) -> BoxFuture<'static, Result<Record>> {
        self.write(WriteKind::Delete, record)
            .unwrap_or_else(|err| future::ready(Err(err)).boxed())
    }

    /// Delete a record knowing only its id.
    pub fn delete_by_key(&self, id: &RecordId) -> BoxFuture<'static, Result<()>> {
        if let Err(err) = self.check_key(id) {
            return future::ready(Err(err)).boxed();
        }

        let op = WriteOp::DeleteOne {
            filter: IdFilter { id: id.clone() },
        };
        let writes = self.writes.clone();

        self.locks
            .run(id.clone(), submit_and_release(writes, op))
    }

    /// Find the record with the given id. Fails with [`Error::NotFound`] if
    /// there is no such record.
    pub fn find_one_by_key(&self, id: &RecordId) -> BoxFuture<'static, Result<Record>> {
        if let Err(err) = self.check_key(id) {
            return future::ready(Err(err)).boxed();
        }

        let reads = self.reads.clone();
        let request = id.clone();

        self.locks
            .run(id.clone(), submit_and_release(reads, request))
    }

    /// Like [`find_one_by_key`](BulkDataAccessor::find_one_by_key), but a
    /// missing record resolves to `None`.
    pub fn try_one_by_key(&self, id: &RecordId) -> BoxFuture<'static, Result<Option<Record>>> {
        self.find_one_by_key(id)
            .map(|result| match result {
                Ok(record) => Ok(Some(record)),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            })
            .boxed()
    }

    fn check_key(&self, id: &RecordId) -> Result<()> {
        if *id.kind() == self.kind {
            Ok(())
        } else {
            Err(Error::invalid_key(
                id.as_str(),
                format!("expected a {} id", self.kind.singular()),
            ))
        }
    }

    /// Validate and project `record` for the given kind of write, then
    /// queue it behind any earlier operation on the same key. Errors are
    /// returned here, before anything is queued.
    pub(crate) fn write(
        &self,
        kind: WriteKind,
        record: Record,
    ) -> Result<BoxFuture<'static, Result<Record>>> {
        let op = match self.prepare(kind, &record)? {
            Some(op) => op,
            None => {
                debug!(id = %record.id(), ?kind, "nothing to write; skipping");
                return Ok(future::ready(Ok(record)).boxed());
            }
        };

        let writes = self.writes.clone();
        let id = record.id().clone();

        Ok(self.locks.run(id, async move {
            submit_and_release(writes, op).await?;
            Ok(record)
        }))
    }

    fn prepare(&self, kind: WriteKind, record: &Record) -> Result<Option<WriteOp>> {
        if *record.kind() != self.kind {
            return Err(Error::Validation(format!(
                "a {} record was given to the {} accessor",
                record.kind().singular(),
                self.kind.singular()
            )));
        }

        let filter = IdFilter {
            id: record.id().clone(),
        };

        if kind == WriteKind::Delete {
            return Ok(Some(WriteOp::DeleteOne { filter }));
        }

        if kind == WriteKind::Insert {
            let missing: Vec<&str> = self
                .kind
                .fields()
                .iter()
                .filter(|field| field.required && record.get(&field.name).is_none())
                .map(|field| field.name.as_str())
                .collect();

            if !missing.is_empty() {
                return Err(Error::Validation(format!(
                    "{} {} is missing required fields: {}",
                    self.kind.singular(),
                    record.id(),
                    missing.join(", ")
                )));
            }
        }

        let fields = project(&self.kind, kind, record);
        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(match kind {
            WriteKind::Insert => {
                let mut document = Map::with_capacity(fields.len() + 1);
                document.insert("_id".into(), Value::String(record.id().to_string()));
                document.extend(fields);
                WriteOp::InsertOne { document }
            }
            WriteKind::Update | WriteKind::Upsert => WriteOp::UpdateOne {
                filter,
                update: fields,
                upsert: kind == WriteKind::Upsert,
            },
            WriteKind::Delete => WriteOp::DeleteOne { filter },
        }))
    }
}

/// Copy out the fields of `record` that `kind` may write. Undefined fields
/// are skipped; fields the record type doesn't declare are never written.
/// Submit `request` once the chain reaches it, then let go of the controller
/// handle while waiting, so that dropping the accessor can still end the
/// driver.
async fn submit_and_release<Req, Out>(
    controller: BatchController<Req, Out>,
    request: Req,
) -> Result<Out> {
    let pending = controller.submit(request);
    drop(controller);
    pending.await
}

fn project(record_type: &RecordType, kind: WriteKind, record: &Record) -> Map<String, Value> {
    record_type
        .fields()
        .iter()
        .filter(|field| kind.permits(field))
        .filter_map(|field| {
            record
                .get(&field.name)
                .map(|value| (field.name.clone(), value.clone()))
        })
        .collect()
}

impl Debug for BulkDataAccessor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkDataAccessor")
            .field("kind", &self.kind)
            .field("writes", &self.writes)
            .field("reads", &self.reads)
            .field("pending_keys", &self.locks.len())
            .finish()
    }
}

/// Drives a [`BulkDataAccessor`]: its keyed operations and both of its
/// batch controllers. Completes once every clone of the accessor has been
/// dropped, every queued operation has settled, and the last batches are
/// flushed.
#[must_use = "accessor operations only run while the driver is polled"]
#[derive(Debug)]
pub struct AccessorDriver {
    locks: Option<LockDriver>,
    writes: Option<BatchDriver<WriteOp, ()>>,
    reads: Option<BatchDriver<RecordId, Record>>,
}

/// Poll a driver that may already have finished; clears it once it does.
fn poll_part<F>(part: &mut Option<F>, ctx: &mut Context<'_>)
where
    F: Future<Output = ()> + Unpin,
{
    if let Some(driver) = part.as_mut() {
        if driver.poll_unpin(ctx).is_ready() {
            *part = None;
        }
    }
}

impl Future for AccessorDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        let unpinned = Pin::into_inner(self);

        // Keyed operations submit into the batches, so they go first.
        poll_part(&mut unpinned.locks, ctx);
        poll_part(&mut unpinned.writes, ctx);
        poll_part(&mut unpinned.reads, ctx);

        match (&unpinned.locks, &unpinned.writes, &unpinned.reads) {
            (None, None, None) => Poll::Ready(()),
            _ => Poll::Pending,
        }
    }
}
