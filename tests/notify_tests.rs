//! These tests ensure that a waiting future is notified exactly when its
//! element is settled, whether by the handler or by the driver going away.

use bulkloader::{BatchCollection, BatchConfig, BatchController, BatchRules, Error};
use cooked_waker::{IntoWaker, Wake, WakeRef};
use futures::{channel::oneshot, FutureExt};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};

/// A waker that stores true if it has been awoken
#[derive(Debug, Clone, Default, IntoWaker)]
struct BoolWaker {
    cell: Arc<AtomicBool>,
}

impl BoolWaker {
    fn reset(&self) {
        self.cell.store(false, Ordering::SeqCst)
    }

    fn is_signaled(&self) -> bool {
        self.cell.load(Ordering::SeqCst)
    }
}

impl WakeRef for BoolWaker {
    fn wake_by_ref(&self) {
        self.cell.store(true, Ordering::SeqCst)
    }
}

impl Wake for BoolWaker {}

/// A manually polled future, with a waker that remembers being signaled
struct Task<F: Future + Unpin> {
    fut: F,
    signal: BoolWaker,
    waker: Waker,
}

impl<F: Future + Unpin> Task<F> {
    fn new(fut: F) -> Self {
        let signal = BoolWaker::default();

        Task {
            fut,
            waker: signal.clone().into_waker(),
            signal,
        }
    }

    fn poll(&mut self) -> Poll<F::Output> {
        self.signal.reset();
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }

    fn is_signaled(&self) -> bool {
        self.signal.is_signaled()
    }
}

fn manual_config() -> BatchConfig {
    BatchConfig {
        interval_ms: 60_000,
        ..BatchConfig::default()
    }
}

#[test]
fn test_notify_lifecycle() {
    // The handler waits on this gate before settling anything
    let (open, gate) = oneshot::channel::<()>();
    let gate = Arc::new(Mutex::new(Some(gate)));

    let rules = BatchRules::new(move |batch: BatchCollection<i32, i32>, _config| {
        let gate = gate.lock().take();
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            batch.resolve_all(|request| Ok(*request));
            Ok(())
        }
    })
    .config(manual_config());

    let (controller, driver) = BatchController::new(rules).unwrap();
    let mut driver = Task::new(driver);

    let mut task1 = Task::new(controller.submit(1));
    let mut task2 = Task::new(controller.submit(2));

    assert_eq!(task1.poll(), Poll::Pending);
    assert_eq!(task2.poll(), Poll::Pending);

    controller.flush();

    // The driver starts the flush, which blocks on the gate
    assert_eq!(driver.poll(), Poll::Pending);
    assert!(!task1.is_signaled());
    assert!(!task2.is_signaled());

    // Opening the gate wakes the driver, and only the driver
    open.send(()).unwrap();
    assert!(driver.is_signaled());
    assert!(!task1.is_signaled());
    assert!(!task2.is_signaled());

    // Polling the driver completes the flush, which notifies every element
    assert_eq!(driver.poll(), Poll::Pending);
    assert!(task1.is_signaled());
    assert!(task2.is_signaled());

    assert_eq!(task1.poll(), Poll::Ready(Ok(1)));
    assert_eq!(task2.poll(), Poll::Ready(Ok(2)));

    // Once the controller is gone, the driver has nothing left to do
    drop(controller);
    assert!(driver.is_signaled());
    assert_eq!(driver.poll(), Poll::Ready(()));
}

#[test]
fn test_dropped_driver_notifies_waiting_futures() {
    let rules = BatchRules::new(|batch: BatchCollection<i32, i32>, _config| async move {
        batch.resolve_all(|request| Ok(*request));
        Ok(())
    })
    .config(manual_config());

    let (controller, driver) = BatchController::new(rules).unwrap();

    let mut task = Task::new(controller.submit(1));
    assert_eq!(task.poll(), Poll::Pending);

    drop(driver);
    assert!(!task.is_signaled());

    // Nobody will ever run this batch; rotating it drops it, which settles
    // the element with an error.
    controller.flush();
    assert!(task.is_signaled());
    assert!(matches!(task.poll(), Poll::Ready(Err(Error::Protocol(_)))));
}
