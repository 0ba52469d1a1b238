//! Typed blocking work queues.
//!
//! A session owns four queues:
//! - two priority queues of candidate [`Model`]s (diver-bound, surfer-bound),
//! - two FIFO queues of exploration results (path conditions, traces).
//!
//! Both flavours are unbounded and safe for concurrent enqueue/dequeue.
//! A blocking dequeue waits on a crossbeam channel together with the caller's
//! [`CancelToken`], so a cancelled worker unblocks immediately instead of
//! hanging on an empty queue.
//!
//! Priority queues keep their items in a `BinaryHeap` and use a channel of
//! unit "doorbell" tokens for blocking: every enqueue pushes first and rings
//! once, every dequeue takes one token and pops once, so the heap always holds
//! at least as many items as there are tokens in flight. Equal priorities are
//! not dequeued in insertion order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};
use serde::Serialize;
use shoal_model::{Model, PathResult, TraceResult, WorkItem};

use crate::error::Cancelled;

/// Uninhabited message type: the cancel channel never carries a value, it only
/// disconnects.
#[derive(Debug)]
enum Never {}

/// Cooperative cancellation signal shared between a worker and its owner.
///
/// Cancelling drops the only sender of an internal channel; every `select!`
/// waiting on the receiver wakes up at once.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    trigger: Mutex<Option<Sender<Never>>>,
    signal: Receiver<Never>,
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                trigger: Mutex::new(Some(tx)),
                signal: rx,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, AtomicOrdering::SeqCst);
        drop(
            self.inner
                .trigger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(AtomicOrdering::SeqCst)
    }

    /// Sleep for up to `timeout`; returns true if cancelled meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        select! {
            recv(self.signal()) -> _ => true,
            default(timeout) => self.is_cancelled(),
        }
    }

    fn signal(&self) -> &Receiver<Never> {
        &self.inner.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything that can be ordered in a priority queue. Lower values first.
pub trait Prioritized {
    fn priority(&self) -> i64;
}

impl Prioritized for Model {
    fn priority(&self) -> i64 {
        self.priority
    }
}

/// Heap entry ordered by priority alone (reversed, so the heap pops minima).
#[derive(Debug)]
struct Ranked<T> {
    priority: i64,
    item: T,
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority)
    }
}

/// Unbounded blocking priority queue.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    heap: Mutex<BinaryHeap<Ranked<T>>>,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
    pushed: AtomicUsize,
    popped: AtomicUsize,
}

impl<T: Prioritized> PriorityQueue<T> {
    pub fn new() -> Self {
        let (doorbell_tx, doorbell_rx) = channel::unbounded();
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            doorbell_tx,
            doorbell_rx,
            pushed: AtomicUsize::new(0),
            popped: AtomicUsize::new(0),
        }
    }

    pub fn enqueue(&self, item: T) {
        let priority = item.priority();
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Ranked { priority, item });
        self.pushed.fetch_add(1, AtomicOrdering::Relaxed);
        // The queue owns the receiving end, so the doorbell never disconnects.
        let _ = self.doorbell_tx.send(());
    }

    pub fn enqueue_all<I: IntoIterator<Item = T>>(&self, items: I) -> usize {
        let mut count = 0;
        for item in items {
            self.enqueue(item);
            count += 1;
        }
        count
    }

    /// Block until an item is available or `cancel` fires.
    pub fn dequeue(&self, cancel: &CancelToken) -> Result<T, Cancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            select! {
                recv(self.doorbell_rx) -> ring => {
                    if ring.is_err() {
                        return Err(Cancelled);
                    }
                }
                recv(cancel.signal()) -> _ => return Err(Cancelled),
            }
            if let Some(item) = self.pop() {
                return Ok(item);
            }
        }
    }

    /// Non-blocking dequeue. `None` means the queue is currently empty.
    pub fn try_dequeue(&self) -> Option<T> {
        self.doorbell_rx.try_recv().ok()?;
        self.pop()
    }

    fn pop(&self) -> Option<T> {
        let ranked = self
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()?;
        self.popped.fetch_add(1, AtomicOrdering::Relaxed);
        Some(ranked.item)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get total items pushed (cumulative).
    pub fn total_pushed(&self) -> usize {
        self.pushed.load(AtomicOrdering::Relaxed)
    }

    /// Get total items popped (cumulative).
    pub fn total_popped(&self) -> usize {
        self.popped.load(AtomicOrdering::Relaxed)
    }
}

impl<T: Prioritized> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Unbounded blocking FIFO queue.
#[derive(Debug)]
pub struct FifoQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    pushed: AtomicUsize,
    popped: AtomicUsize,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            pushed: AtomicUsize::new(0),
            popped: AtomicUsize::new(0),
        }
    }

    pub fn enqueue(&self, item: T) {
        // Never disconnects: `self.rx` lives as long as `self.tx`.
        let _ = self.tx.send(item);
        self.pushed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Block until an item is available or `cancel` fires.
    pub fn dequeue(&self, cancel: &CancelToken) -> Result<T, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let item = select! {
            recv(self.rx) -> item => item.map_err(|_| Cancelled),
            recv(cancel.signal()) -> _ => Err(Cancelled),
        };
        if item.is_ok() {
            self.popped.fetch_add(1, AtomicOrdering::Relaxed);
        }
        item
    }

    /// Non-blocking dequeue. `None` means the queue is currently empty.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.popped.fetch_add(1, AtomicOrdering::Relaxed);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn total_pushed(&self) -> usize {
        self.pushed.load(AtomicOrdering::Relaxed)
    }

    pub fn total_popped(&self) -> usize {
        self.popped.load(AtomicOrdering::Relaxed)
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Which model queue a model is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModelLane {
    Divers,
    Surfers,
}

/// Snapshot of queue sizes, for monitoring and reports only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueLengths {
    pub diver_models: usize,
    pub surfer_models: usize,
    pub paths: usize,
    pub traces: usize,
}

impl QueueLengths {
    pub fn total(&self) -> usize {
        self.diver_models + self.surfer_models + self.paths + self.traces
    }
}

/// The four queues carrying a session's traffic.
#[derive(Debug, Default)]
pub struct WorkQueueSet {
    diver_models: PriorityQueue<Model>,
    surfer_models: PriorityQueue<Model>,
    paths: FifoQueue<PathResult>,
    traces: FifoQueue<TraceResult>,
}

impl WorkQueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn models(&self, lane: ModelLane) -> &PriorityQueue<Model> {
        match lane {
            ModelLane::Divers => &self.diver_models,
            ModelLane::Surfers => &self.surfer_models,
        }
    }

    pub fn diver_models(&self) -> &PriorityQueue<Model> {
        &self.diver_models
    }

    pub fn surfer_models(&self) -> &PriorityQueue<Model> {
        &self.surfer_models
    }

    pub fn paths(&self) -> &FifoQueue<PathResult> {
        &self.paths
    }

    pub fn traces(&self) -> &FifoQueue<TraceResult> {
        &self.traces
    }

    pub fn lengths(&self) -> QueueLengths {
        QueueLengths {
            diver_models: self.diver_models.len(),
            surfer_models: self.surfer_models.len(),
            paths: self.paths.len(),
            traces: self.traces.len(),
        }
    }

    /// Remove everything still queued. Used once workers are gone.
    pub fn drain(&self) -> Vec<WorkItem> {
        let mut residue = Vec::new();
        while let Some(m) = self.diver_models.try_dequeue() {
            residue.push(WorkItem::Model(m));
        }
        while let Some(m) = self.surfer_models.try_dequeue() {
            residue.push(WorkItem::Model(m));
        }
        while let Some(p) = self.paths.try_dequeue() {
            residue.push(WorkItem::PathResult(p));
        }
        while let Some(t) = self.traces.try_dequeue() {
            residue.push(WorkItem::TraceResult(t));
        }
        residue
    }
}
