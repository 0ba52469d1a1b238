//! Worker pools hosting pluggable task kinds.
//!
//! A [`TaskKind`] pairs a name and thread bounds with a [`TaskFactory`]. The
//! factory builds one shared manager per kind and one [`Task`] per worker
//! thread; the pool never looks inside either.
//!
//! ## Worker lifecycle
//! - Every worker owns a [`CancelToken`]; `shutdown` cancels them all, which
//!   unblocks any dequeue in progress.
//! - A task that returns `Err(TaskError::Failed)` or panics is logged. If it
//!   was holding a dequeued item that it never `finish`ed, the item counts as
//!   consumed with nothing produced (`update(-1)`); otherwise the counter is
//!   left alone. Under [`RestartPolicy::OnFailure`] the worker then carries on
//!   with a fresh task from the same factory, after a backoff that grows while
//!   failures keep coming without any item being taken.
//! - `Cancelled` ends a worker quietly.
//!
//! The number of workers only changes through explicit
//! [`TaskPool::add_worker`] / [`TaskPool::retire_worker`] calls, always within
//! the kind's `[min_threads, max_threads]`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use shoal_model::{Model, PathResult, TraceResult};
use tracing::{debug, error, warn};

use crate::bus::panic_message;
use crate::error::{Cancelled, ConfigError, PoolError, TaskError};
use crate::queue::{CancelToken, ModelLane};
use crate::report::Reportable;
use crate::session::SessionHandle;

pub const DEFAULT_MAX_THREADS: u32 = 128;

const RESTART_BACKOFF_FIRST: Duration = Duration::from_millis(5);
const RESTART_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// The body of one worker.
pub trait Task: Send {
    /// Run until cancelled or done. Dequeue through `ctx` so cancellation is
    /// observed.
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), TaskError>;
}

/// Builds the manager and the tasks of one task kind.
pub trait TaskFactory: Send + Sync + 'static {
    /// State shared by every worker of the kind; reported at the end.
    type Manager: Reportable + 'static;

    /// Called once per kind, when the pool is built.
    fn create_manager(&self, session: &SessionHandle) -> Self::Manager;

    /// Called once for every worker the pool starts (and on restarts).
    fn create_task(&self, session: &SessionHandle, manager: Arc<Self::Manager>) -> Box<dyn Task>;
}

/// What a task kind does in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Diver,
    Surfer,
    Strategy,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Diver => "diver",
            Role::Surfer => "surfer",
            Role::Strategy => "strategy",
        };
        f.write_str(s)
    }
}

/// Initial, minimum and maximum worker counts of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadBounds {
    pub threads: u32,
    pub min_threads: u32,
    pub max_threads: u32,
}

impl ThreadBounds {
    pub fn new(threads: u32, min_threads: u32, max_threads: u32) -> Self {
        Self {
            threads,
            min_threads,
            max_threads,
        }
    }

    /// `threads` workers, and no room to grow or shrink.
    pub fn fixed(threads: u32) -> Self {
        Self::new(threads, threads, threads)
    }

    pub fn validate(&self, kind: &str) -> Result<(), ConfigError> {
        if self.min_threads > self.max_threads {
            return Err(ConfigError::InvalidBounds {
                kind: kind.to_string(),
                min: self.min_threads,
                max: self.max_threads,
            });
        }
        if self.threads < self.min_threads || self.threads > self.max_threads {
            return Err(ConfigError::InitOutOfBounds {
                kind: kind.to_string(),
                init: self.threads,
                min: self.min_threads,
                max: self.max_threads,
            });
        }
        Ok(())
    }
}

impl Default for ThreadBounds {
    fn default() -> Self {
        Self::new(0, 0, DEFAULT_MAX_THREADS)
    }
}

/// What a worker does after its task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    #[default]
    OnFailure,
}

/// Manager and task construction with the factory's types erased.
trait BoundKind: Send + Sync {
    fn manager(&self) -> Arc<dyn Reportable>;
    fn create_task(&self, session: &SessionHandle) -> Box<dyn Task>;
}

struct Bound<F: TaskFactory> {
    factory: F,
    manager: Arc<F::Manager>,
}

impl<F: TaskFactory> BoundKind for Bound<F> {
    fn manager(&self) -> Arc<dyn Reportable> {
        Arc::clone(&self.manager) as Arc<dyn Reportable>
    }

    fn create_task(&self, session: &SessionHandle) -> Box<dyn Task> {
        self.factory.create_task(session, Arc::clone(&self.manager))
    }
}

trait ErasedFactory: Send + Sync {
    fn bind(self: Box<Self>, session: &SessionHandle) -> Arc<dyn BoundKind>;
}

impl<F: TaskFactory> ErasedFactory for F {
    fn bind(self: Box<Self>, session: &SessionHandle) -> Arc<dyn BoundKind> {
        let manager = Arc::new(self.create_manager(session));
        Arc::new(Bound {
            factory: *self,
            manager,
        })
    }
}

/// A named, pluggable producer/consumer role.
pub struct TaskKind {
    name: String,
    role: Role,
    bounds: ThreadBounds,
    restart: RestartPolicy,
    factory: Box<dyn ErasedFactory>,
}

impl TaskKind {
    pub fn new<F: TaskFactory>(
        name: impl Into<String>,
        role: Role,
        bounds: ThreadBounds,
        factory: F,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            bounds,
            restart: RestartPolicy::default(),
            factory: Box::new(factory),
        }
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn bounds(&self) -> ThreadBounds {
        self.bounds
    }

    pub fn bounds_mut(&mut self) -> &mut ThreadBounds {
        &mut self.bounds
    }
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskKind")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("bounds", &self.bounds)
            .field("restart", &self.restart)
            .finish()
    }
}

/// Per-worker view of the session.
pub struct WorkerContext {
    session: SessionHandle,
    cancel: CancelToken,
    kind: Arc<str>,
    index: usize,
    /// A dequeued item has not been `finish`ed yet.
    holding: AtomicBool,
    taken: AtomicU64,
}

impl WorkerContext {
    pub fn new(session: SessionHandle, cancel: CancelToken, kind: &str, index: usize) -> Self {
        Self {
            session,
            cancel,
            kind: Arc::from(kind),
            index,
            holding: AtomicBool::new(false),
            taken: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn next_model(&self, lane: ModelLane) -> Result<Model, Cancelled> {
        self.claim(self.session.queues().models(lane).dequeue(&self.cancel))
    }

    pub fn next_diver_model(&self) -> Result<Model, Cancelled> {
        self.next_model(ModelLane::Divers)
    }

    pub fn next_surfer_model(&self) -> Result<Model, Cancelled> {
        self.next_model(ModelLane::Surfers)
    }

    pub fn next_path(&self) -> Result<PathResult, Cancelled> {
        self.claim(self.session.queues().paths().dequeue(&self.cancel))
    }

    pub fn next_trace(&self) -> Result<TraceResult, Cancelled> {
        self.claim(self.session.queues().traces().dequeue(&self.cancel))
    }

    /// Report one consumed item and the `produced` items already enqueued.
    pub fn finish(&self, produced: usize) -> bool {
        self.holding.store(false, Ordering::SeqCst);
        let produced = i64::try_from(produced).unwrap_or(i64::MAX);
        self.session.update(produced - 1)
    }

    /// Whether a dequeued item is waiting for `finish`.
    pub fn is_holding(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    /// Items dequeued through this context so far.
    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::SeqCst)
    }

    fn claim<T>(&self, item: Result<T, Cancelled>) -> Result<T, Cancelled> {
        if item.is_ok() {
            self.taken.fetch_add(1, Ordering::SeqCst);
            self.holding.store(true, Ordering::SeqCst);
        }
        item
    }

    /// Charge the unfinished item of a failed task, if there is one.
    fn abandon(&self) -> bool {
        if self.holding.swap(false, Ordering::SeqCst) {
            self.session.update(-1);
            true
        } else {
            false
        }
    }
}

struct Entry {
    name: String,
    role: Role,
    bounds: ThreadBounds,
    restart: RestartPolicy,
    kind: Arc<dyn BoundKind>,
    live: Arc<AtomicU32>,
    spawned: usize,
}

struct WorkerHandle {
    entry: usize,
    name: String,
    cancel: CancelToken,
    join: JoinHandle<()>,
    retired: bool,
}

/// Outcome of [`TaskPool::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    pub joined: usize,
    /// Workers that did not exit within the grace period and were detached.
    pub abandoned: usize,
}

pub struct TaskPool {
    session: SessionHandle,
    entries: Vec<Entry>,
    workers: Vec<WorkerHandle>,
    exit_tx: Sender<usize>,
    exit_rx: Receiver<usize>,
    exited: Vec<bool>,
    accepting: bool,
}

impl TaskPool {
    /// Validate `kinds` and build each kind's manager.
    pub fn new(session: SessionHandle, kinds: Vec<TaskKind>) -> Result<Self, ConfigError> {
        let mut entries: Vec<Entry> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            kind.bounds.validate(&kind.name)?;
            if entries.iter().any(|e| e.name == kind.name) {
                return Err(ConfigError::DuplicateKind(kind.name));
            }
            let bound = kind.factory.bind(&session);
            entries.push(Entry {
                name: kind.name,
                role: kind.role,
                bounds: kind.bounds,
                restart: kind.restart,
                kind: bound,
                live: Arc::new(AtomicU32::new(0)),
                spawned: 0,
            });
        }
        let (exit_tx, exit_rx) = channel::unbounded();
        Ok(Self {
            session,
            entries,
            workers: Vec::new(),
            exit_tx,
            exit_rx,
            exited: Vec::new(),
            accepting: true,
        })
    }

    /// Start every kind's initial workers. Returns how many were started.
    pub fn start_all(&mut self) -> Result<usize, PoolError> {
        let mut started = 0;
        for entry in 0..self.entries.len() {
            for _ in 0..self.entries[entry].bounds.threads {
                self.spawn(entry)?;
                started += 1;
            }
        }
        debug!(workers = started, kinds = self.entries.len(), "task pool started");
        Ok(started)
    }

    /// Start one more worker of `kind` if it is below `max_threads`.
    pub fn add_worker(&mut self, kind: &str) -> Result<bool, PoolError> {
        let Some(entry) = self.entry_index(kind) else {
            return Ok(false);
        };
        if self.running_workers(entry) >= self.entries[entry].bounds.max_threads as usize {
            return Ok(false);
        }
        self.spawn(entry)?;
        Ok(true)
    }

    /// Cancel the newest worker of `kind` if it is above `min_threads`.
    pub fn retire_worker(&mut self, kind: &str) -> bool {
        let Some(entry) = self.entry_index(kind) else {
            return false;
        };
        if self.running_workers(entry) <= self.entries[entry].bounds.min_threads as usize {
            return false;
        }
        self.collect_exits();
        let exited = &self.exited;
        let newest = self
            .workers
            .iter_mut()
            .enumerate()
            .rev()
            .find(|(id, w)| w.entry == entry && !w.retired && !exited[*id]);
        match newest {
            Some((_, worker)) => {
                worker.retired = true;
                worker.cancel.cancel();
                debug!(worker = %worker.name, "worker retired");
                true
            }
            None => false,
        }
    }

    fn spawn(&mut self, entry: usize) -> Result<(), PoolError> {
        if !self.accepting {
            return Err(PoolError::ShutDown);
        }
        let id = self.workers.len();
        let e = &mut self.entries[entry];
        let name = format!("{}-{}", e.name, e.spawned);
        let cancel = CancelToken::new();
        let ctx = WorkerContext::new(self.session.clone(), cancel.clone(), &e.name, e.spawned);
        let task = e.kind.create_task(&self.session);
        let worker = Worker {
            id,
            ctx,
            kind: Arc::clone(&e.kind),
            restart: e.restart,
            live: Arc::clone(&e.live),
            exit_tx: self.exit_tx.clone(),
        };

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run(task))
            .map_err(|source| PoolError::Spawn {
                kind: e.name.clone(),
                source,
            })?;
        e.spawned += 1;
        self.workers.push(WorkerHandle {
            entry,
            name,
            cancel,
            join,
            retired: false,
        });
        self.exited.push(false);
        Ok(())
    }

    fn entry_index(&self, kind: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == kind)
    }

    fn collect_exits(&mut self) {
        while let Ok(id) = self.exit_rx.try_recv() {
            self.exited[id] = true;
        }
    }

    /// Workers of `entry` that have not exited and were not retired.
    fn running_workers(&mut self, entry: usize) -> usize {
        self.collect_exits();
        self.workers
            .iter()
            .enumerate()
            .filter(|(id, w)| w.entry == entry && !w.retired && !self.exited[*id])
            .count()
    }

    /// Cancel every worker, then wait up to `grace` for them to exit.
    ///
    /// Workers still running after `grace` are detached and reported as
    /// abandoned. The pool accepts no new workers afterwards.
    pub fn shutdown(&mut self, grace: Duration) -> ShutdownSummary {
        self.accepting = false;
        for worker in &self.workers {
            worker.cancel.cancel();
        }

        self.collect_exits();
        let deadline = Instant::now() + grace;
        let mut remaining = self.exited.iter().filter(|e| !**e).count();
        while remaining > 0 {
            match self.exit_rx.recv_deadline(deadline) {
                Ok(id) => {
                    self.exited[id] = true;
                    remaining -= 1;
                }
                Err(_) => break,
            }
        }

        let mut summary = ShutdownSummary::default();
        for (id, worker) in self.workers.drain(..).enumerate() {
            if self.exited[id] {
                if worker.join.join().is_err() {
                    warn!(worker = %worker.name, "worker thread panicked outside its task");
                }
                summary.joined += 1;
            } else {
                warn!(worker = %worker.name, ?grace, "worker did not stop in time, detaching");
                summary.abandoned += 1;
            }
        }
        self.exited.clear();
        debug!(joined = summary.joined, abandoned = summary.abandoned, "task pool shut down");
        summary
    }

    /// Every kind's manager, in registration order.
    pub fn managers(&self) -> Vec<Arc<dyn Reportable>> {
        self.entries.iter().map(|e| e.kind.manager()).collect()
    }

    /// Worker threads of `kind` currently inside their run loop.
    pub fn live_threads(&self, kind: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.name == kind)
            .map(|e| e.live.load(Ordering::SeqCst))
    }

    pub fn bounds(&self, kind: &str) -> Option<ThreadBounds> {
        self.entries.iter().find(|e| e.name == kind).map(|e| e.bounds)
    }

    pub fn role(&self, kind: &str) -> Option<Role> {
        self.entries.iter().find(|e| e.name == kind).map(|e| e.role)
    }

    pub fn kind_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.cancel.cancel();
        }
    }
}

/// Everything a worker thread owns.
struct Worker {
    id: usize,
    ctx: WorkerContext,
    kind: Arc<dyn BoundKind>,
    restart: RestartPolicy,
    live: Arc<AtomicU32>,
    exit_tx: Sender<usize>,
}

/// Decrements the live count and reports the exit, however the thread ends.
struct ExitGuard<'a> {
    id: usize,
    live: &'a AtomicU32,
    exit_tx: &'a Sender<usize>,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        // The pool may already have given up on this worker.
        let _ = self.exit_tx.send(self.id);
    }
}

impl Worker {
    fn run(self, mut task: Box<dyn Task>) {
        self.live.fetch_add(1, Ordering::SeqCst);
        let _guard = ExitGuard {
            id: self.id,
            live: &self.live,
            exit_tx: &self.exit_tx,
        };
        let ctx = &self.ctx;
        debug!(kind = ctx.kind(), index = ctx.index(), "worker started");

        let mut backoff = RESTART_BACKOFF_FIRST;
        loop {
            let taken_before = ctx.taken();
            match panic::catch_unwind(AssertUnwindSafe(|| task.run(ctx))) {
                Ok(Ok(())) => {
                    debug!(kind = ctx.kind(), index = ctx.index(), "worker finished");
                    return;
                }
                Ok(Err(TaskError::Cancelled)) => {
                    debug!(kind = ctx.kind(), index = ctx.index(), "worker cancelled");
                    return;
                }
                Ok(Err(TaskError::Failed(err))) => {
                    let dropped = ctx.abandon();
                    error!(
                        kind = ctx.kind(),
                        index = ctx.index(),
                        dropped_item = dropped,
                        error = %format!("{err:#}"),
                        "worker failed"
                    );
                }
                Err(payload) => {
                    let dropped = ctx.abandon();
                    error!(
                        kind = ctx.kind(),
                        index = ctx.index(),
                        dropped_item = dropped,
                        panic = %panic_message(payload.as_ref()),
                        "worker panicked"
                    );
                }
            }

            if self.restart == RestartPolicy::Never || ctx.is_cancelled() {
                return;
            }
            if ctx.taken() > taken_before {
                backoff = RESTART_BACKOFF_FIRST;
            }
            debug!(kind = ctx.kind(), index = ctx.index(), delay = ?backoff, "restarting worker");
            if ctx.cancel_token().wait_timeout(backoff) {
                return;
            }
            backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
            task = self.kind.create_task(ctx.session());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::PropertyValue;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Tally {
        tasks: AtomicUsize,
        items: AtomicUsize,
    }

    impl Reportable for Tally {
        fn name(&self) -> String {
            "Tally".into()
        }

        fn property_names(&self) -> Vec<String> {
            vec!["#tasks".into(), "#items".into()]
        }

        fn property_values(&self) -> Vec<PropertyValue> {
            vec![
                self.tasks.load(Ordering::SeqCst).into(),
                self.items.load(Ordering::SeqCst).into(),
            ]
        }
    }

    /// Consumes diver models and produces nothing; fails on negative priority.
    struct Sink {
        tally: Arc<Tally>,
    }

    impl Task for Sink {
        fn run(&mut self, ctx: &WorkerContext) -> Result<(), TaskError> {
            loop {
                let model = ctx.next_diver_model()?;
                if model.priority < 0 {
                    return Err(anyhow::anyhow!("bad model {}", model.priority).into());
                }
                self.tally.items.fetch_add(1, Ordering::SeqCst);
                ctx.finish(0);
            }
        }
    }

    struct SinkFactory;

    impl TaskFactory for SinkFactory {
        type Manager = Tally;

        fn create_manager(&self, _session: &SessionHandle) -> Tally {
            Tally::default()
        }

        fn create_task(&self, _session: &SessionHandle, manager: Arc<Tally>) -> Box<dyn Task> {
            manager.tasks.fetch_add(1, Ordering::SeqCst);
            Box::new(Sink { tally: manager })
        }
    }

    fn pool(session: &SessionHandle, bounds: ThreadBounds) -> TaskPool {
        TaskPool::new(
            session.clone(),
            vec![TaskKind::new("sink", Role::Diver, bounds, SinkFactory)],
        )
        .unwrap()
    }

    fn tally(pool: &TaskPool) -> (PropertyValue, PropertyValue) {
        let values = pool.managers()[0].property_values();
        (values[0].clone(), values[1].clone())
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_bounds_validation() {
        assert!(ThreadBounds::new(1, 0, 4).validate("k").is_ok());
        assert!(matches!(
            ThreadBounds::new(1, 5, 4).validate("k"),
            Err(ConfigError::InvalidBounds { min: 5, max: 4, .. })
        ));
        assert!(matches!(
            ThreadBounds::new(9, 0, 4).validate("k"),
            Err(ConfigError::InitOutOfBounds { init: 9, .. })
        ));
        assert_eq!(ThreadBounds::default().max_threads, DEFAULT_MAX_THREADS);
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let session = SessionHandle::new();
        let result = TaskPool::new(
            session,
            vec![
                TaskKind::new("a", Role::Strategy, ThreadBounds::fixed(1), SinkFactory),
                TaskKind::new("a", Role::Strategy, ThreadBounds::fixed(1), SinkFactory),
            ],
        );
        assert!(matches!(result, Err(ConfigError::DuplicateKind(name)) if name == "a"));
    }

    #[test]
    fn test_manager_created_once_task_per_worker() {
        let session = SessionHandle::new();
        let mut pool = pool(&session, ThreadBounds::new(3, 0, 4));
        assert_eq!(pool.start_all().unwrap(), 3);
        assert!(wait_for(|| pool.live_threads("sink") == Some(3)));
        assert_eq!(tally(&pool).0, PropertyValue::Int(3));

        let summary = pool.shutdown(Duration::from_secs(5));
        assert_eq!(summary, ShutdownSummary { joined: 3, abandoned: 0 });
        assert_eq!(pool.live_threads("sink"), Some(0));
    }

    #[test]
    fn test_shutdown_unblocks_idle_workers() {
        let session = SessionHandle::new();
        let mut pool = pool(&session, ThreadBounds::new(2, 0, 2));
        pool.start_all().unwrap();
        let started = Instant::now();
        let summary = pool.shutdown(Duration::from_secs(5));
        assert_eq!(summary.joined, 2);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(pool.add_worker("sink"), Err(PoolError::ShutDown)));
    }

    #[test]
    fn test_failed_worker_counts_one_item_and_restarts() {
        let session = SessionHandle::new();
        session.seed().unwrap();
        session.update(2);
        let mut pool = pool(&session, ThreadBounds::new(1, 0, 1));
        pool.start_all().unwrap();

        session.queues().diver_models().enqueue(Model::new(-1, shoal_model::SeedId(0), Default::default()));
        assert!(wait_for(|| session.outstanding() == 2));
        assert!(wait_for(|| tally(&pool).0 == PropertyValue::Int(2)));

        session.queues().diver_models().enqueue(Model::bootstrap());
        assert!(wait_for(|| session.outstanding() == 1));
        assert_eq!(tally(&pool).1, PropertyValue::Int(1));
        assert_eq!(pool.live_threads("sink"), Some(1));
        pool.shutdown(Duration::from_secs(5));
    }

    struct EarlyFail {
        attempt: usize,
    }

    impl Task for EarlyFail {
        fn run(&mut self, _ctx: &WorkerContext) -> Result<(), TaskError> {
            if self.attempt % 2 == 0 {
                panic!("attempt {} gave up", self.attempt);
            }
            Err(anyhow::anyhow!("attempt {} gave up", self.attempt).into())
        }
    }

    struct EarlyFailFactory;

    impl TaskFactory for EarlyFailFactory {
        type Manager = Tally;

        fn create_manager(&self, _session: &SessionHandle) -> Tally {
            Tally::default()
        }

        fn create_task(&self, _session: &SessionHandle, manager: Arc<Tally>) -> Box<dyn Task> {
            let attempt = manager.tasks.fetch_add(1, Ordering::SeqCst);
            Box::new(EarlyFail { attempt })
        }
    }

    #[test]
    fn test_failure_without_item_leaves_counter_alone() {
        let session = SessionHandle::new();
        session.seed().unwrap();
        session.update(2);
        session.queues().surfer_models().enqueue(Model::bootstrap());
        let mut pool = TaskPool::new(
            session.clone(),
            vec![TaskKind::new("early", Role::Strategy, ThreadBounds::fixed(1), EarlyFailFactory)],
        )
        .unwrap();
        pool.start_all().unwrap();

        assert!(wait_for(|| tally(&pool).0 == PropertyValue::Int(5)));
        assert_eq!(session.outstanding(), 3);
        assert!(!session.is_done());
        assert_eq!(session.queues().surfer_models().len(), 1);

        let started = Instant::now();
        assert_eq!(pool.shutdown(Duration::from_secs(5)).joined, 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_context_tracks_unfinished_item() {
        let session = SessionHandle::new();
        session.seed().unwrap();
        session.update(1);
        let ctx = WorkerContext::new(session.clone(), CancelToken::new(), "ctx", 0);
        assert!(!ctx.is_holding());
        assert!(!ctx.abandon());
        assert_eq!(session.outstanding(), 2);

        session.queues().traces().enqueue(TraceResult::Absent);
        session.queues().traces().enqueue(TraceResult::Absent);
        ctx.next_trace().unwrap();
        assert!(ctx.is_holding());
        assert!(!ctx.finish(0));
        assert!(!ctx.is_holding());
        assert!(!ctx.abandon());
        assert_eq!(session.outstanding(), 1);

        ctx.next_trace().unwrap();
        assert!(ctx.abandon());
        assert!(!ctx.is_holding());
        assert_eq!(ctx.taken(), 2);
        assert!(session.is_done());
    }

    #[test]
    fn test_never_restart_leaves_other_workers_running() {
        let session = SessionHandle::new();
        session.seed().unwrap();
        session.update(2);
        let kind = TaskKind::new("sink", Role::Diver, ThreadBounds::new(2, 0, 2), SinkFactory)
            .with_restart(RestartPolicy::Never);
        let mut pool = TaskPool::new(session.clone(), vec![kind]).unwrap();
        pool.start_all().unwrap();
        assert!(wait_for(|| pool.live_threads("sink") == Some(2)));

        session.queues().diver_models().enqueue(Model::new(-3, shoal_model::SeedId(0), Default::default()));
        assert!(wait_for(|| pool.live_threads("sink") == Some(1)));
        assert_eq!(session.outstanding(), 2);

        session.queues().diver_models().enqueue(Model::bootstrap());
        assert!(wait_for(|| session.outstanding() == 1));
        pool.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn test_add_and_retire_respect_bounds() {
        let session = SessionHandle::new();
        let mut pool = pool(&session, ThreadBounds::new(1, 1, 2));
        pool.start_all().unwrap();
        assert!(pool.add_worker("sink").unwrap());
        assert!(!pool.add_worker("sink").unwrap());
        assert!(!pool.add_worker("unknown").unwrap());
        assert!(wait_for(|| pool.live_threads("sink") == Some(2)));

        assert!(pool.retire_worker("sink"));
        assert!(!pool.retire_worker("sink"));
        assert!(wait_for(|| pool.live_threads("sink") == Some(1)));
        assert_eq!(pool.shutdown(Duration::from_secs(5)).joined, 2);
    }

    #[test]
    fn test_worker_threads_are_named_after_kind() {
        struct Named(Arc<std::sync::Mutex<Vec<String>>>);
        impl Task for Named {
            fn run(&mut self, ctx: &WorkerContext) -> Result<(), TaskError> {
                let name = thread::current().name().unwrap_or_default().to_string();
                self.0.lock().unwrap().push(name);
                ctx.next_trace()?;
                Ok(())
            }
        }
        struct NamedFactory(Arc<std::sync::Mutex<Vec<String>>>);
        impl TaskFactory for NamedFactory {
            type Manager = Tally;
            fn create_manager(&self, _session: &SessionHandle) -> Tally {
                Tally::default()
            }
            fn create_task(&self, _session: &SessionHandle, _manager: Arc<Tally>) -> Box<dyn Task> {
                Box::new(Named(Arc::clone(&self.0)))
            }
        }

        let names = Arc::new(std::sync::Mutex::new(Vec::new()));
        let session = SessionHandle::new();
        let mut pool = TaskPool::new(
            session,
            vec![TaskKind::new(
                "surfer",
                Role::Surfer,
                ThreadBounds::fixed(2),
                NamedFactory(Arc::clone(&names)),
            )],
        )
        .unwrap();
        pool.start_all().unwrap();
        assert!(wait_for(|| names.lock().unwrap().len() == 2));
        pool.shutdown(Duration::from_secs(5));
        let mut names = names.lock().unwrap().clone();
        names.sort();
        assert_eq!(names, vec!["surfer-0", "surfer-1"]);
    }
}
