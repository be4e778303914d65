//! Data structures for passing requests into a batch handler and outcomes
//! back out of it.
//!
//! A [`BatchCollection`] is what a batch handler receives: every request
//! that was buffered during one window, each paired with a single-use
//! outcome slot. The handler settles each element (resolve or reject), and
//! the caller that submitted the request sees that outcome through its
//! [`BatchFuture`].

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{channel::oneshot, future::join_all, FutureExt};
use parking_lot::Mutex;

use crate::error::{Error, Result};

type Outcome<Out> = oneshot::Sender<Result<Out>>;

struct Slot<Req, Out> {
    request: Req,
    // `None` once the element has been settled
    outcome: Mutex<Option<Outcome<Out>>>,
}

/// A handle to one buffered request inside a batch.
///
/// Settling is idempotent: the first `resolve` or `reject` wins, and every
/// later call is ignored and returns `false`. Handles are cheap to clone;
/// all clones refer to the same element.
pub struct PendingElement<Req, Out> {
    slot: Arc<Slot<Req, Out>>,
}

impl<Req, Out> PendingElement<Req, Out> {
    pub fn request(&self) -> &Req {
        &self.slot.request
    }

    /// Settle this element with a value. Returns false if it was already
    /// settled.
    pub fn resolve(&self, value: Out) -> bool {
        self.settle(Ok(value))
    }

    /// Settle this element with an error. Returns false if it was already
    /// settled.
    pub fn reject(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    pub fn settle(&self, outcome: Result<Out>) -> bool {
        match self.slot.outcome.lock().take() {
            None => false,
            Some(sender) => {
                // The caller may have stopped listening; the element counts
                // as settled either way.
                let _ = sender.send(outcome);
                true
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.slot.outcome.lock().is_none()
    }
}

impl<Req, Out> Clone for PendingElement<Req, Out> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<Req: Debug, Out> Debug for PendingElement<Req, Out> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingElement")
            .field("request", &self.slot.request)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// The caller's side of a buffered request. Completes once a batch handler
/// settles the element.
///
/// If the element is dropped without ever being settled (for instance
/// because the driver that runs the batches was dropped), this future
/// completes with [`Error::Protocol`] rather than waiting forever.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct BatchFuture<Out> {
    receiver: oneshot::Receiver<Result<Out>>,
}

impl<Out> Future for BatchFuture<Out> {
    type Output = Result<Out>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let unpinned = Pin::into_inner(self);

        match unpinned.receiver.poll_unpin(ctx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Protocol(
                "element was dropped before it was settled".into(),
            ))),
        }
    }
}

/// An ordered set of pending elements, plus the context shared by every
/// collection a controller creates.
///
/// Every processing pass consumes the collection and hands back the
/// elements that are still unsettled, moved into a new collection. An
/// element therefore can never be processed by two passes at once.
pub struct BatchCollection<Req, Out, Ctx = ()> {
    elements: Vec<PendingElement<Req, Out>>,
    context: Arc<Ctx>,
}

impl<Req, Out, Ctx> BatchCollection<Req, Out, Ctx> {
    pub fn new(context: Arc<Ctx>) -> Self {
        Self {
            elements: Vec::new(),
            context,
        }
    }

    /// Buffer a request. The returned future completes when the element is
    /// settled.
    pub fn add(&mut self, request: Req) -> BatchFuture<Out> {
        let (sender, receiver) = oneshot::channel();
        self.elements.push(PendingElement {
            slot: Arc::new(Slot {
                request,
                outcome: Mutex::new(Some(sender)),
            }),
        });

        BatchFuture { receiver }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    /// Iterate over the buffered requests, in submission order.
    pub fn requests(&self) -> impl Iterator<Item = &Req> + Clone {
        self.elements.iter().map(PendingElement::request)
    }

    pub fn elements(&self) -> &[PendingElement<Req, Out>] {
        &self.elements
    }

    /// Handles to every element, for settling them after the collection
    /// itself has been given away.
    pub(crate) fn ledger(&self) -> Vec<PendingElement<Req, Out>> {
        self.elements.clone()
    }

    /// Take the elements out of this collection, leaving it empty.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            elements: mem::take(&mut self.elements),
            context: Arc::clone(&self.context),
        }
    }

    fn remaining(self) -> Self {
        let BatchCollection { elements, context } = self;
        Self {
            elements: elements
                .into_iter()
                .filter(|element| !element.is_settled())
                .collect(),
            context,
        }
    }

    /// Call `handler` once per element, one at a time, awaiting each call
    /// before starting the next.
    ///
    /// The handler settles elements through the handle it's given. An `Err`
    /// from the handler rejects that element (if it's still pending) and
    /// iteration continues. Elements left unsettled are returned in a new
    /// collection.
    pub async fn process_each<F, Fut>(self, mut handler: F) -> Self
    where
        F: FnMut(PendingElement<Req, Out>, usize) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        for (index, element) in self.elements.iter().enumerate() {
            if let Err(err) = handler(element.clone(), index).await {
                element.reject(err);
            }
        }

        self.remaining()
    }

    /// Like [`process_each`](BatchCollection::process_each), but every
    /// handler call runs concurrently. Prefer this when the order of
    /// processing doesn't matter.
    pub async fn process_all<F, Fut>(self, mut handler: F) -> Self
    where
        F: FnMut(PendingElement<Req, Out>, usize) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let calls = self
            .elements
            .iter()
            .enumerate()
            .map(|(index, element)| handler(element.clone(), index));

        let results = join_all(calls).await;

        for (element, result) in self.elements.iter().zip(results) {
            if let Err(err) = result {
                element.reject(err);
            }
        }

        self.remaining()
    }

    /// Settle every pending element with `get_outcome` applied to its
    /// request. The returned collection is always empty.
    pub fn resolve_all(self, mut get_outcome: impl FnMut(&Req) -> Result<Out>) -> Self {
        for element in &self.elements {
            if !element.is_settled() {
                element.settle(get_outcome(element.request()));
            }
        }

        self.remaining()
    }

    /// Resolve every pending element with a clone of `value`.
    pub fn resolve_all_with(self, value: Out) -> Self
    where
        Out: Clone,
    {
        self.resolve_all(move |_| Ok(value.clone()))
    }

    /// Reject every pending element with a clone of `error`.
    pub fn reject_all(self, error: Error) -> Self {
        self.resolve_all(move |_| Err(error.clone()))
    }

    /// Settle the elements from a whole-pass result: one outcome per
    /// element, in submission order. A failed pass, or an outcome list of
    /// the wrong length, rejects every pending element.
    pub fn settle_each(self, outcomes: Result<Vec<Result<Out>>>) -> Self {
        match outcomes {
            Err(err) => self.reject_all(err),
            Ok(outcomes) if outcomes.len() != self.elements.len() => {
                let message = format!(
                    "expected {} outcomes for the batch, got {}",
                    self.elements.len(),
                    outcomes.len()
                );
                self.reject_all(Error::Protocol(message))
            }
            Ok(outcomes) => {
                for (element, outcome) in self.elements.iter().zip(outcomes) {
                    element.settle(outcome);
                }
                self.remaining()
            }
        }
    }
}

impl<Req, Out, Ctx: Default> Default for BatchCollection<Req, Out, Ctx> {
    fn default() -> Self {
        Self::new(Arc::new(Ctx::default()))
    }
}

impl<Req: Debug, Out, Ctx> Debug for BatchCollection<Req, Out, Ctx> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCollection")
            .field("elements", &self.elements)
            .field("context", &"<context>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn collection_of(requests: &[u32]) -> (BatchCollection<u32, String>, Vec<BatchFuture<String>>) {
        let mut collection = BatchCollection::default();
        let futures = requests.iter().map(|&req| collection.add(req)).collect();
        (collection, futures)
    }

    #[test]
    fn test_settle_is_idempotent() {
        let (collection, mut futures) = collection_of(&[1]);
        let element = collection.elements()[0].clone();

        assert!(element.resolve("first".into()));
        assert!(!element.reject(Error::Protocol("late".into())));
        assert!(!element.resolve("second".into()));
        assert!(element.is_settled());

        assert_eq!(block_on(futures.remove(0)).unwrap(), "first");
    }

    #[test]
    fn test_process_each_is_sequential_and_keeps_unsettled() {
        let (collection, futures) = collection_of(&[1, 2, 3, 4]);
        let mut order = Vec::new();

        let remaining = block_on(collection.process_each(|element, index| {
            order.push(index);
            let request = *element.request();
            async move {
                match request {
                    1 => {
                        element.resolve("one".into());
                        Ok(())
                    }
                    2 => Err(Error::Validation("two".into())),
                    // Left unsettled
                    _ => Ok(()),
                }
            }
        }));

        assert_eq!(order, [0, 1, 2, 3]);
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining.requests().copied().collect::<Vec<_>>(), [3, 4]);

        let empty = remaining.resolve_all(|req| Ok(req.to_string()));
        assert!(empty.is_empty());

        let results: Vec<_> = futures.into_iter().map(block_on).collect();
        assert_eq!(results[0], Ok("one".to_string()));
        assert_eq!(results[1], Err(Error::Validation("two".into())));
        assert_eq!(results[2], Ok("3".to_string()));
        assert_eq!(results[3], Ok("4".to_string()));
    }

    #[test]
    fn test_process_all_rejects_only_failed_elements() {
        let (collection, futures) = collection_of(&[10, 11, 12]);

        let remaining = block_on(collection.process_all(|element, _index| async move {
            if *element.request() % 2 == 0 {
                element.resolve("even".into());
                Ok(())
            } else {
                Err(Error::Store("odd".into()))
            }
        }));

        assert!(remaining.is_empty());

        let results: Vec<_> = futures.into_iter().map(block_on).collect();
        assert_eq!(results[0], Ok("even".to_string()));
        assert_eq!(results[1], Err(Error::Store("odd".into())));
        assert_eq!(results[2], Ok("even".to_string()));
    }

    #[test]
    fn test_process_all_runs_elements_concurrently() {
        let (collection, futures) = collection_of(&[1, 2]);
        let (open, gate) = oneshot::channel::<()>();
        let mut open = Some(open);
        let mut gate = Some(gate);
        let log = Arc::new(Mutex::new(Vec::new()));

        // The first element can only finish once the second one has run,
        // so a sequential pass would never complete.
        let remaining = block_on(collection.process_all(|element, index| {
            let gate = if index == 0 { gate.take() } else { None };
            let open = if index == 1 { open.take() } else { None };
            let log = Arc::clone(&log);

            async move {
                if let Some(gate) = gate {
                    gate.await.map_err(|_| Error::Protocol("gate dropped".into()))?;
                }
                if let Some(open) = open {
                    let _ = open.send(());
                }
                log.lock().push(index);
                element.resolve(element.request().to_string());
                Ok(())
            }
        }));

        assert!(remaining.is_empty());
        assert_eq!(*log.lock(), [1, 0]);

        let results: Vec<_> = futures.into_iter().map(block_on).collect();
        assert_eq!(results, [Ok("1".to_string()), Ok("2".to_string())]);
    }

    #[test]
    fn test_settle_each_length_mismatch_rejects_everything() {
        let (collection, futures) = collection_of(&[1, 2]);

        let remaining = collection.settle_each(Ok(vec![Ok("only one".to_string())]));
        assert!(remaining.is_empty());

        for future in futures {
            assert!(matches!(block_on(future), Err(Error::Protocol(_))));
        }
    }

    #[test]
    fn test_dropped_element_fails_its_future() {
        let (collection, mut futures) = collection_of(&[1]);
        drop(collection);

        assert!(matches!(
            block_on(futures.remove(0)),
            Err(Error::Protocol(_))
        ));
    }
}
