//! Per-key ordering when operations are queued from many threads at once

mod common;

use bulkloader::{
    store::{StoreCall, WriteOp},
    Error, KeyLocks, Record,
};
use common::{accessor_fixture, fast_config, user_type, Fixture};
use futures::{executor::block_on, future::join_all};
use futures_timer::Delay;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

#[test]
fn test_same_key_is_first_in_first_out_across_threads() {
    let (locks, driver) = KeyLocks::new();
    let tickets = Mutex::new(0);
    let log = Arc::new(Mutex::new(Vec::new()));
    let busy = Arc::new(AtomicBool::new(false));

    crossbeam::scope(|scope| {
        // Runs every operation; finishes once every handle is dropped
        scope.spawn(move |_| block_on(driver));

        for _ in 0..8 {
            let locks = locks.clone();
            let tickets = &tickets;
            let log = Arc::clone(&log);
            let busy = Arc::clone(&busy);

            scope.spawn(move |_| {
                for _ in 0..10 {
                    let log = Arc::clone(&log);
                    let busy = Arc::clone(&busy);

                    // Taking a ticket and queueing happen under one lock, so
                    // ticket order is call order.
                    let outcome = {
                        let mut next = tickets.lock();
                        let ticket = *next;
                        *next += 1;

                        locks.run("shared", async move {
                            if busy.swap(true, Ordering::SeqCst) {
                                return Err(Error::Protocol("operations overlapped".into()));
                            }
                            Delay::new(Duration::from_micros(200)).await;
                            log.lock().push(ticket);
                            busy.store(false, Ordering::SeqCst);
                            Ok(ticket)
                        })
                    };

                    block_on(outcome).unwrap();
                }
            });
        }

        drop(locks);
    })
    .unwrap();

    let log = log.lock();
    assert_eq!(*log, (0..80).collect::<Vec<_>>());
}

#[test]
fn test_same_key_updates_from_many_threads_apply_in_call_order() {
    let Fixture {
        store,
        accessor,
        mut executor,
    } = accessor_fixture(user_type(), fast_config());
    let base = Record::new(accessor.kind().id("shared").unwrap()).with("email", "s@example.com");
    store.seed(base.clone());

    let tickets = Mutex::new(0);

    let writes = crossbeam::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let accessor = &accessor;
                let tickets = &tickets;
                let base = &base;

                scope.spawn(move |_| {
                    (0..5)
                        .map(|_| {
                            let mut next = tickets.lock();
                            let ticket: u64 = *next;
                            *next += 1;
                            accessor.update(base.clone().with("name", ticket))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();
    assert_eq!(accessor.pending_keys(), 1);

    let results = executor.run_until(join_all(writes));
    assert!(results.iter().all(Result::is_ok));

    // One round-trip per write, in ticket order
    let applied: Vec<u64> = store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::BulkWrite { mut ops, .. } => {
                assert_eq!(ops.len(), 1);
                match ops.pop() {
                    Some(WriteOp::UpdateOne { update, .. }) => update.get("name")?.as_u64(),
                    _ => None,
                }
            }
            StoreCall::Find { .. } => None,
        })
        .collect();
    assert_eq!(applied, (0..20).collect::<Vec<_>>());

    assert_eq!(store.get(base.id()).unwrap().get("name"), Some(&19.into()));
    assert_eq!(accessor.pending_keys(), 0);
}
