use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    channel::mpsc,
    future::BoxFuture,
    stream::{FuturesUnordered, StreamExt},
    FutureExt,
};
use futures_timer::Delay;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::{
    collection::{BatchCollection, BatchFuture},
    error::{Error, Result},
};

/// Timing and sizing rules for a [`BatchController`].
///
/// The raw fields are kept exactly as configured; use the accessor methods
/// to read the effective values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Milliseconds between timer ticks. Floored to 1.
    pub interval_ms: u64,
    /// Largest number of elements in one batch. Floored to 1.
    pub max_size: usize,
    /// Whether a new batch may start while an earlier one is still running.
    pub concurrent: bool,
    /// How many consecutive ticks may be skipped while a flush is in
    /// flight. Defaults to 0 when `concurrent`, 2 otherwise.
    pub skips: Option<u32>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            max_size: 200,
            concurrent: false,
            skips: None,
        }
    }
}

impl BatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn max_size(&self) -> usize {
        self.max_size.max(1)
    }

    pub fn skip_budget(&self) -> u32 {
        match self.skips {
            Some(skips) => skips,
            None if self.concurrent => 0,
            None => 2,
        }
    }
}

/// The bulk handler called with each flushed batch. It must settle every
/// element of the collection before its future completes.
pub type BatchHandler<Req, Out, Ctx> = Arc<
    dyn Fn(BatchCollection<Req, Out, Ctx>, BatchConfig) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// Everything needed to build a [`BatchController`]: the handler, the
/// timing rules, and a context value shared by every batch.
pub struct BatchRules<Req, Out, Ctx = ()> {
    pub handler: Option<BatchHandler<Req, Out, Ctx>>,
    pub config: BatchConfig,
    pub context: Ctx,
}

impl<Req, Out, Ctx: Default> BatchRules<Req, Out, Ctx> {
    pub fn new<H, Fut>(handler: H) -> Self
    where
        H: Fn(BatchCollection<Req, Out, Ctx>, BatchConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::with_context(Ctx::default(), handler)
    }
}

impl<Req, Out, Ctx> BatchRules<Req, Out, Ctx> {
    /// Like [`new`](BatchRules::new), with an explicit context value.
    pub fn with_context<H, Fut>(context: Ctx, handler: H) -> Self
    where
        H: Fn(BatchCollection<Req, Out, Ctx>, BatchConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            handler: None,
            config: BatchConfig::default(),
            context,
        }
        .handler(handler)
    }

    pub fn config(self, config: BatchConfig) -> Self {
        Self { config, ..self }
    }

    pub fn handler<H, Fut>(mut self, handler: H) -> Self
    where
        H: Fn(BatchCollection<Req, Out, Ctx>, BatchConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handler = Some(Arc::new(
            move |batch: BatchCollection<Req, Out, Ctx>, config: BatchConfig| {
                handler(batch, config).boxed()
            },
        ));
        self
    }
}

impl<Req, Out, Ctx: Default> Default for BatchRules<Req, Out, Ctx> {
    fn default() -> Self {
        Self {
            handler: None,
            config: BatchConfig::default(),
            context: Ctx::default(),
        }
    }
}

impl<Req, Out, Ctx: Debug> Debug for BatchRules<Req, Out, Ctx> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRules")
            .field("handler", &self.handler.as_ref().map(|_| "<closure>"))
            .field("config", &self.config)
            .field("context", &self.context)
            .finish()
    }
}

struct ControllerState<Req, Out, Ctx> {
    live: BatchCollection<Req, Out, Ctx>,
    // Rotations that have been handed to the driver but not finished yet
    in_flight: usize,
    skips_since_rotation: u32,
}

struct SharedState<Req, Out, Ctx> {
    config: BatchConfig,
    state: Mutex<ControllerState<Req, Out, Ctx>>,
    flushes: mpsc::UnboundedSender<BatchCollection<Req, Out, Ctx>>,
}

/// Why a batch was rotated out of the controller; only used for logging.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Size,
    Timer,
    Manual,
    Shutdown,
}

impl<Req, Out, Ctx> SharedState<Req, Out, Ctx> {
    /// Swap the live collection for an empty one and hand the old one to
    /// the driver. Does nothing if the live collection is empty.
    fn rotate(&self, state: &mut ControllerState<Req, Out, Ctx>, trigger: Trigger) {
        state.skips_since_rotation = 0;

        if state.live.is_empty() {
            return;
        }

        let batch = state.live.take();
        debug!(size = batch.len(), ?trigger, "rotating batch");

        state.in_flight += 1;
        if self.flushes.unbounded_send(batch).is_err() {
            // The driver is gone. The batch was dropped along with the
            // failed send, which fails every element in it.
            state.in_flight -= 1;
            warn!("batch driver is gone; dropping batch");
        }
    }

    fn tick(&self) {
        let mut state = self.state.lock();

        if state.live.is_empty() {
            return;
        }

        if state.in_flight == 0 {
            self.rotate(&mut state, Trigger::Timer);
        } else if state.skips_since_rotation < self.config.skip_budget() {
            state.skips_since_rotation += 1;
            trace!(
                skipped = state.skips_since_rotation,
                in_flight = state.in_flight,
                "flush in flight; skipping rotation"
            );
        } else {
            self.rotate(&mut state, Trigger::Timer);
        }
    }

    fn finish_flush(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

impl<Req, Out, Ctx> Drop for SharedState<Req, Out, Ctx> {
    fn drop(&mut self) {
        // Hand off whatever is still buffered, so that those callers are
        // served before the driver shuts down.
        let state = self.state.get_mut();
        if !state.live.is_empty() {
            let batch = state.live.take();
            debug!(size = batch.len(), trigger = ?Trigger::Shutdown, "rotating batch");
            let _ = self.flushes.unbounded_send(batch);
        }
    }
}

/// A `BatchController` collects individually submitted requests into
/// batches and hands each batch to a bulk handler.
///
/// Each controller comes with a [`BatchDriver`], a future that must be
/// spawned on (or otherwise polled by) the application's executor. The
/// driver owns the flush timer and runs the handler for every batch; the
/// controller itself only buffers. Controllers are cheap to clone, and all
/// clones feed the same batches.
pub struct BatchController<Req, Out, Ctx = ()> {
    shared: Arc<SharedState<Req, Out, Ctx>>,
}

impl<Req, Out, Ctx> BatchController<Req, Out, Ctx> {
    /// Build a controller and the driver that runs its batches. Fails if
    /// the rules have no handler.
    pub fn new(rules: BatchRules<Req, Out, Ctx>) -> Result<(Self, BatchDriver<Req, Out, Ctx>)> {
        let BatchRules {
            handler,
            config,
            context,
        } = rules;

        let handler = handler.ok_or_else(|| {
            Error::Config("a batch controller requires a handler".into())
        })?;

        let (sender, receiver) = mpsc::unbounded();

        let shared = Arc::new(SharedState {
            config,
            state: Mutex::new(ControllerState {
                live: BatchCollection::new(Arc::new(context)),
                in_flight: 0,
                skips_since_rotation: 0,
            }),
            flushes: sender,
        });

        let driver = BatchDriver {
            shared: Arc::downgrade(&shared),
            handler,
            config,
            incoming: receiver,
            incoming_closed: false,
            queued: Vec::new(),
            running: FuturesUnordered::new(),
            ticker: Delay::new(config.interval()),
        };

        Ok((BatchController { shared }, driver))
    }

    /// Buffer a single request. If the live batch is already full, it is
    /// rotated first, so no batch ever exceeds `max_size`.
    pub fn submit(&self, request: Req) -> BatchFuture<Out> {
        let mut state = self.shared.state.lock();

        if state.live.len() >= self.shared.config.max_size() {
            self.shared.rotate(&mut state, Trigger::Size);
        }

        state.live.add(request)
    }

    /// Rotate the live batch now, without waiting for the timer. Does
    /// nothing if nothing is buffered.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        self.shared.rotate(&mut state, Trigger::Manual);
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// Number of requests waiting for the next rotation.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    /// Number of rotated batches that haven't finished yet.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    #[cfg(test)]
    pub(crate) fn tick(&self) {
        self.shared.tick()
    }
}

impl<Req, Out, Ctx> Clone for BatchController<Req, Out, Ctx> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Req, Out, Ctx> Debug for BatchController<Req, Out, Ctx> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BatchController")
            .field("config", &self.shared.config)
            .field("buffered", &state.live.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

/// Run one batch through the handler, then make sure nothing in it is
/// left pending.
fn run_flush<Req, Out, Ctx>(
    handler: &BatchHandler<Req, Out, Ctx>,
    config: BatchConfig,
    batch: BatchCollection<Req, Out, Ctx>,
) -> BoxFuture<'static, ()>
where
    Req: Send + Sync + 'static,
    Out: Send + 'static,
{
    let ledger = batch.ledger();
    let work = handler(batch, config);

    async move {
        let size = ledger.len();

        match work.await {
            Ok(()) => {
                let unsettled = ledger
                    .iter()
                    .filter(|element| {
                        element.reject(Error::Protocol("element not resolved by handler".into()))
                    })
                    .count();

                if unsettled > 0 {
                    warn!(size, unsettled, "batch handler left elements unsettled");
                }
            }
            Err(err) => {
                warn!(size, error = %err, "batch handler failed");
                ledger.iter().for_each(|element| {
                    element.reject(err.clone());
                });
            }
        }

        debug!(size, "batch flushed");
    }
    .boxed()
}

/// The future that drives a [`BatchController`]: it ticks the rotation
/// timer and runs the handler for every rotated batch.
///
/// Without `concurrent`, batches run strictly one after another, in the
/// order they were rotated. The driver completes once every controller
/// handle has been dropped and every remaining batch has been flushed.
#[must_use = "batches are only flushed while the driver is polled"]
pub struct BatchDriver<Req, Out, Ctx = ()> {
    shared: Weak<SharedState<Req, Out, Ctx>>,
    handler: BatchHandler<Req, Out, Ctx>,
    config: BatchConfig,
    incoming: mpsc::UnboundedReceiver<BatchCollection<Req, Out, Ctx>>,
    incoming_closed: bool,
    // Rotated batches waiting for an earlier flush to finish. Stored in
    // reverse, so that `pop` yields the oldest.
    queued: Vec<BatchCollection<Req, Out, Ctx>>,
    running: FuturesUnordered<BoxFuture<'static, ()>>,
    ticker: Delay,
}

// The driver never pins its fields in place.
impl<Req, Out, Ctx> Unpin for BatchDriver<Req, Out, Ctx> {}

impl<Req, Out, Ctx> BatchDriver<Req, Out, Ctx>
where
    Req: Send + Sync + 'static,
    Out: Send + 'static,
{
    fn start_flushes(&mut self) -> bool {
        let mut started = false;

        while self.config.concurrent || self.running.is_empty() {
            match self.queued.pop() {
                None => break,
                Some(batch) => {
                    self.running
                        .push(run_flush(&self.handler, self.config, batch));
                    started = true;
                }
            }
        }

        started
    }
}

impl<Req, Out, Ctx> Future for BatchDriver<Req, Out, Ctx>
where
    Req: Send + Sync + 'static,
    Out: Send + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        let unpinned = Pin::into_inner(self);

        loop {
            let mut progressed = false;

            // Collect newly rotated batches. They're pushed onto the front
            // of the reversed queue, keeping rotation order.
            let mut fresh = Vec::new();
            while !unpinned.incoming_closed {
                match unpinned.incoming.poll_next_unpin(ctx) {
                    Poll::Ready(Some(batch)) => fresh.push(batch),
                    Poll::Ready(None) => unpinned.incoming_closed = true,
                    Poll::Pending => break,
                }
            }
            if !fresh.is_empty() {
                fresh.reverse();
                fresh.append(&mut unpinned.queued);
                unpinned.queued = fresh;
            }

            progressed |= unpinned.start_flushes();

            while let Poll::Ready(Some(())) = unpinned.running.poll_next_unpin(ctx) {
                progressed = true;
                if let Some(shared) = unpinned.shared.upgrade() {
                    shared.finish_flush();
                }
            }

            progressed |= unpinned.start_flushes();

            if !unpinned.incoming_closed {
                if let Poll::Ready(()) = unpinned.ticker.poll_unpin(ctx) {
                    unpinned.ticker.reset(unpinned.config.interval());
                    progressed = true;

                    if let Some(shared) = unpinned.shared.upgrade() {
                        shared.tick();
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        if unpinned.incoming_closed && unpinned.queued.is_empty() && unpinned.running.is_empty()
        {
            debug!("batch driver finished");
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

impl<Req, Out, Ctx> Debug for BatchDriver<Req, Out, Ctx> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDriver")
            .field("config", &self.config)
            .field("queued", &self.queued.len())
            .field("running", &self.running.len())
            .field("closed", &self.incoming_closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{
        executor::{block_on, LocalPool},
        task::LocalSpawnExt,
    };

    fn echo_rules(config: BatchConfig) -> BatchRules<u32, u32> {
        BatchRules::new(|batch: BatchCollection<u32, u32>, _config| async move {
            batch.resolve_all(|req| Ok(*req));
            Ok(())
        })
        .config(config)
    }

    #[test]
    fn test_config_floors_and_skip_defaults() {
        let config = BatchConfig {
            interval_ms: 0,
            max_size: 0,
            ..BatchConfig::default()
        };
        assert_eq!(config.interval(), Duration::from_millis(1));
        assert_eq!(config.max_size(), 1);
        assert_eq!(config.skip_budget(), 2);

        let concurrent = BatchConfig {
            concurrent: true,
            ..BatchConfig::default()
        };
        assert_eq!(concurrent.skip_budget(), 0);

        let explicit = BatchConfig {
            skips: Some(5),
            concurrent: true,
            ..BatchConfig::default()
        };
        assert_eq!(explicit.skip_budget(), 5);
    }

    #[test]
    fn test_missing_handler_is_an_error() {
        let rules: BatchRules<u32, u32> = BatchRules::default();
        assert!(matches!(BatchController::new(rules), Err(Error::Config(_))));
    }

    #[test]
    fn test_timer_skips_while_flush_in_flight() {
        let config = BatchConfig {
            interval_ms: 60_000,
            skips: Some(2),
            ..BatchConfig::default()
        };
        // The driver is never polled, so the first rotation stays in flight.
        let (controller, _driver) = BatchController::new(echo_rules(config)).unwrap();

        let _first = controller.submit(1);
        controller.flush();
        assert_eq!(controller.in_flight(), 1);
        assert_eq!(controller.buffered(), 0);

        let _second = controller.submit(2);

        controller.tick();
        assert_eq!(controller.buffered(), 1);
        controller.tick();
        assert_eq!(controller.buffered(), 1);

        // Skip budget exhausted: this tick rotates despite the flush in
        // flight.
        controller.tick();
        assert_eq!(controller.buffered(), 0);
        assert_eq!(controller.in_flight(), 2);
    }

    #[test]
    fn test_timer_rotates_when_idle() {
        let config = BatchConfig {
            interval_ms: 60_000,
            ..BatchConfig::default()
        };
        let (controller, _driver) = BatchController::new(echo_rules(config)).unwrap();

        // Ticking an empty controller does nothing
        controller.tick();
        assert_eq!(controller.in_flight(), 0);

        let _fut = controller.submit(1);
        controller.tick();
        assert_eq!(controller.buffered(), 0);
        assert_eq!(controller.in_flight(), 1);
    }

    #[test]
    fn test_driver_finishes_after_controller_drop() {
        let config = BatchConfig {
            interval_ms: 60_000,
            ..BatchConfig::default()
        };
        let (controller, driver) = BatchController::new(echo_rules(config)).unwrap();

        let fut = controller.submit(7);
        drop(controller);

        let mut pool = LocalPool::new();
        pool.spawner().spawn_local(driver).unwrap();
        pool.run();

        assert_eq!(block_on(fut), Ok(7));
    }

    #[test]
    fn test_dropped_driver_fails_elements() {
        let (controller, driver) = BatchController::new(echo_rules(BatchConfig::default())).unwrap();
        drop(driver);

        let fut = controller.submit(1);
        controller.flush();

        assert!(matches!(block_on(fut), Err(Error::Protocol(_))));
    }
}
