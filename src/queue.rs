//! Bounded-concurrency request queue in front of the rate limiter.
//!
//! A single dispatch loop (spawned on construction) owns every scheduling
//! decision: it keeps at most `max_concurrent` units of work in flight and,
//! whenever a slot frees, admits the most urgent pending item (lowest
//! priority number, FIFO among ties). Each admitted unit waits on
//! [`RateLimiter::acquire`] inside its own task, so a rate-limit wait never
//! blocks the loop. The slot is reserved at dispatch and released when the
//! unit settles.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{Notify, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::QueueError;
use crate::rate_limiter::RateLimiter;

type BoxedWork<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type Settle<T> = oneshot::Sender<Result<T, QueueError>>;

struct QueueItem<T> {
    id: Uuid,
    priority: i32,
    seq: u64,
    estimated_tokens: u64,
    work: BoxedWork<T>,
    settle: Settle<T>,
}

// BinaryHeap pops the greatest element, so the ordering is reversed: lower
// priority numbers and earlier sequence numbers compare as greater.
impl<T> Ord for QueueItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for QueueItem<T> {}

struct Inner<T> {
    pending: BinaryHeap<QueueItem<T>>,
    active: usize,
    paused: bool,
    closed: bool,
    next_seq: u64,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    max_concurrent: usize,
    limiter: Arc<RateLimiter>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain_pending(&self) -> Vec<QueueItem<T>> {
        self.lock().pending.drain().collect()
    }

    fn cancel_pending(&self) -> usize {
        let drained = self.drain_pending();
        let count = drained.len();
        for item in drained {
            let _ = item.settle.send(Err(QueueError::Cancelled));
        }
        if count > 0 {
            info!(cancelled = count, "request queue cleared");
        }
        count
    }
}

/// Releases a concurrency slot when the dispatched unit settles, including by panic.
struct SlotGuard<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.lock().active -= 1;
        self.shared.notify.notify_one();
    }
}

/// Handle to a queued unit of work. Resolves with the work's output, or
/// [`QueueError::Cancelled`] if the item was cleared before dispatch.
#[derive(Debug)]
pub struct QueueHandle<T> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> QueueHandle<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<T> Future for QueueHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(QueueError::Abandoned)))
    }
}

pub struct RequestQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Creates the queue and spawns its dispatch loop. Must be called inside a Tokio runtime.
    pub fn new(limiter: Arc<RateLimiter>, max_concurrent: usize) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                pending: BinaryHeap::new(),
                active: 0,
                paused: false,
                closed: false,
                next_seq: 0,
            }),
            notify: Notify::new(),
            max_concurrent: max_concurrent.max(1),
            limiter,
        });
        tokio::spawn(dispatch_loop(Arc::clone(&shared)));
        Self { shared }
    }

    /// Queues `work` for execution. Nothing runs until the dispatch loop admits it.
    pub fn enqueue<F>(&self, work: F, estimated_tokens: u64, priority: i32) -> QueueHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (settle, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        {
            let mut inner = self.shared.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.push(QueueItem {
                id,
                priority,
                seq,
                estimated_tokens,
                work: Box::pin(work),
                settle,
            });
        }
        self.shared.notify.notify_one();
        QueueHandle { id, rx }
    }
}

impl<T> RequestQueue<T> {
    /// Stops admitting new work. In-flight units keep running.
    pub fn pause(&self) {
        self.shared.lock().paused = true;
        info!("request queue paused");
    }

    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.notify.notify_one();
        info!("request queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Fails every not-yet-dispatched item with [`QueueError::Cancelled`].
    /// Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        self.shared.cancel_pending()
    }

    /// A handle that can [`clear`](QueueCanceller::clear) this queue from
    /// inside a dispatched unit of work.
    pub fn canceller(&self) -> QueueCanceller<T> {
        QueueCanceller {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn queue_length(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }
}

/// Clears the pending items of a [`RequestQueue`] without owning it.
///
/// Work that decides to stop the run calls [`clear`](Self::clear) before it
/// returns, while its slot is still reserved, so nothing else is admitted in
/// between.
pub struct QueueCanceller<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueCanceller<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> QueueCanceller<T> {
    pub fn clear(&self) -> usize {
        self.shared.cancel_pending()
    }
}

impl<T> Drop for RequestQueue<T> {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        for item in self.shared.drain_pending() {
            let _ = item.settle.send(Err(QueueError::Cancelled));
        }
        self.shared.notify.notify_one();
    }
}

async fn dispatch_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    loop {
        let next = {
            let mut inner = shared.lock();
            if inner.closed {
                return;
            }
            if !inner.paused && inner.active < shared.max_concurrent {
                let item = inner.pending.pop();
                if item.is_some() {
                    inner.active += 1;
                }
                item
            } else {
                None
            }
        };
        match next {
            Some(item) => {
                tokio::spawn(run_item(Arc::clone(&shared), item));
            }
            None => shared.notify.notified().await,
        }
    }
}

async fn run_item<T>(shared: Arc<Shared<T>>, item: QueueItem<T>) {
    let _slot = SlotGuard { shared: &shared };
    let QueueItem {
        id,
        priority,
        estimated_tokens,
        work,
        settle,
        ..
    } = item;
    shared.limiter.acquire(estimated_tokens).await;
    debug!(%id, priority, estimated_tokens, "request dispatched");
    let output = work.await;
    // The caller may have dropped its handle; the slot is released either way.
    let _ = settle.send(Ok(output));
}
