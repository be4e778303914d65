//! Bulkloader turns a stream of individually issued asynchronous operations
//! into periodically flushed batches, and builds a record-oriented data
//! access layer on top of that. Callers read and write one record at a time;
//! the store sees one bulk write, or one lookup by a set of ids, per flush.
//!
//! ## Overview
//!
//! The lowest layer is the [`BatchController`]. It wraps a bulk handler: an
//! async function that receives a [`BatchCollection`] of buffered requests
//! and settles each of them. Requests are submitted one at a time, and each
//! submission returns a [`BatchFuture`] for that request's outcome.
//!
//! ```
//! use bulkloader::{BatchCollection, BatchConfig, BatchController, BatchRules};
//! use futures::executor::LocalPool;
//! use futures::task::LocalSpawnExt;
//!
//! let rules = BatchRules::new(|batch: BatchCollection<u32, String>, _config| async move {
//!     // One round-trip for the whole batch would go here.
//!     batch.resolve_all(|request| Ok(request.to_string()));
//!     Ok(())
//! })
//! .config(BatchConfig {
//!     interval_ms: 5,
//!     ..BatchConfig::default()
//! });
//!
//! let (controller, driver) = BatchController::new(rules).unwrap();
//!
//! let mut pool = LocalPool::new();
//! pool.spawner().spawn_local(driver).unwrap();
//!
//! let first = controller.submit(1);
//! let second = controller.submit(2);
//!
//! assert_eq!(pool.run_until(first).unwrap(), "1");
//! assert_eq!(pool.run_until(second).unwrap(), "2");
//! ```
//!
//! A batch is rotated out of the controller and handed to the handler when
//! it reaches `max_size`, or when the timer fires. If a flush is still
//! running when the timer fires, the controller may skip a few ticks to let
//! the batch grow instead of piling up flushes; see [`BatchConfig`].
//!
//! The handler must settle every element it was given. Any element still
//! pending when the handler returns is rejected with [`Error::Protocol`], and
//! if the handler fails, its error is given to every element it didn't
//! settle. No caller ever waits on an element that nobody will settle.
//!
//! ## Records
//!
//! On top of the controller sits the [`BulkDataAccessor`], which serves the
//! records of one [`RecordType`] from a [`Store`]. Writes to distinct records
//! share a bulk write; writes to the same record are run one after another,
//! in call order, so a record never has two writes in flight. Which fields a
//! write carries is declared once per record type, with
//! [`FieldDescriptor`]s.
//!
//! ```
//! use std::sync::Arc;
//!
//! use bulkloader::store::MemoryStore;
//! use bulkloader::{BatchConfig, FieldDescriptor, Model, RecordType};
//! use futures::executor::LocalPool;
//! use futures::task::LocalSpawnExt;
//!
//! let user = RecordType::builder("User", "U")
//!     .field(FieldDescriptor::new("email").required())
//!     .field(FieldDescriptor::new("created").immutable())
//!     .build()
//!     .unwrap();
//!
//! let store = Arc::new(MemoryStore::new());
//! let (users, driver) = Model::new(user, store.clone(), BatchConfig::default()).unwrap();
//!
//! let mut pool = LocalPool::new();
//! pool.spawner().spawn_local(driver).unwrap();
//!
//! let record = users.create().with("email", "someone@example.com");
//! let id = record.id().clone();
//!
//! pool.run_until(users.data().insert(record)).unwrap();
//!
//! let found = pool.run_until(users.data().find_one_by_key(&id)).unwrap();
//! assert_eq!(found.get("email").unwrap(), "someone@example.com");
//! ```
//!
//! Ids are exposed as `PREFIX-raw` strings (see [`RecordId`]). The prefix
//! alone is enough to route an id to its record type through a
//! [`TypeRegistry`].
//!
//! ## Design notes
//!
//! ### Drivers
//!
//! Bulkloader spawns nothing, and doesn't depend on any particular runtime.
//! Instead, every controller comes with a driver future (a [`BatchDriver`],
//! or an [`AccessorDriver`] for an accessor) that owns the flush timer and
//! runs the handler. An accessor's driver also runs its keyed operations. Spawn it on whatever executor the application uses.
//! The driver finishes on its own once every handle to its controller has
//! been dropped; anything still buffered at that point is flushed first.
//!
//! ### Per-key ordering
//!
//! Operations on a record key are chained when they are *called*, not when
//! they are first polled, and the driver runs them. Callers are free to await
//! them in any order, or to drop the returned future: a write that was called
//! still happens.
//!
//! ### The record pool
//!
//! The [`RecordPool`] is a fixed ring of recently used records. It is not an
//! LRU cache: new entries always go into the slot under the cursor, and a
//! cache hit simply re-inserts the record there.

mod accessor;
mod batch;
mod collection;
mod error;
mod ident;
mod lock;
mod model;
mod pool;
mod record;
pub mod store;

pub use accessor::{AccessorDriver, BulkDataAccessor};
pub use batch::{BatchConfig, BatchController, BatchDriver, BatchHandler, BatchRules};
pub use collection::{BatchCollection, BatchFuture, PendingElement};
pub use error::{Error, Result};
pub use ident::{RecordId, TypeRegistry};
pub use lock::{KeyLocks, LockDriver};
pub use model::Model;
pub use pool::{RecordPool, DEFAULT_POOL_SIZE};
pub use record::{FieldDefault, FieldDescriptor, Record, RecordType, RecordTypeBuilder, ID_FIELD};
pub use store::Store;
