//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::{future::Future, sync::Arc};

use bulkloader::{
    store::MemoryStore, AccessorDriver, BatchConfig, BulkDataAccessor, FieldDescriptor,
    RecordType,
};
use futures::{executor::LocalPool, task::LocalSpawnExt};

/// A local executor with `driver` already spawned on it.
pub fn executor(driver: impl Future<Output = ()> + 'static) -> LocalPool {
    let pool = LocalPool::new();
    pool.spawner()
        .spawn_local(driver)
        .expect("failed to spawn the driver");
    pool
}

/// `User`: a required email, an immutable creation stamp, and a free-form
/// name.
pub fn user_type() -> RecordType {
    RecordType::builder("User", "U")
        .field(FieldDescriptor::new("email").required())
        .field(FieldDescriptor::new("created").immutable())
        .field(FieldDescriptor::new("name"))
        .build()
        .expect("invalid user type")
}

pub fn campaign_type() -> RecordType {
    RecordType::builder("Campaign", "CMP")
        .pool_size(2)
        .field(FieldDescriptor::new("subject"))
        .build()
        .expect("invalid campaign type")
}

/// A config that never rotates on the timer during a test; flushes only
/// happen on size or an explicit `flush`.
pub fn manual_config() -> BatchConfig {
    BatchConfig {
        interval_ms: 60_000,
        ..BatchConfig::default()
    }
}

pub fn fast_config() -> BatchConfig {
    BatchConfig {
        interval_ms: 1,
        ..BatchConfig::default()
    }
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub accessor: BulkDataAccessor,
    pub executor: LocalPool,
}

pub fn accessor_fixture(kind: RecordType, config: BatchConfig) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let (accessor, driver): (BulkDataAccessor, AccessorDriver) =
        BulkDataAccessor::new(kind, store.clone(), config).expect("failed to build accessor");

    Fixture {
        store,
        accessor,
        executor: executor(driver),
    }
}
