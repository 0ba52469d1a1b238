//! Shared state of one running session.
//!
//! [`SessionHandle`] is what task factories, workers and observers hold. It
//! exposes the queues and the bus directly; the termination counter is only
//! reachable through `update` and `request_stop`.

use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::{Event, EventBus, TickStatus};
use crate::error::TerminationError;
use crate::instrument::CodeCache;
use crate::queue::WorkQueueSet;
use crate::report::{PropertyValue, Reportable};
use crate::termination::{StopReason, Termination, WaitOutcome};

struct SessionShared {
    queues: WorkQueueSet,
    termination: Termination,
    bus: EventBus,
    /// Reset when the orchestrator starts running.
    started: Mutex<Instant>,
    code_cache: Option<Arc<CodeCache>>,
    /// Set once `stop-requested` has been fully dispatched.
    announced: Mutex<bool>,
    announced_cv: Condvar,
}

/// Cheap, cloneable reference to a session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::with_code_cache(None)
    }

    pub fn with_code_cache(code_cache: Option<Arc<CodeCache>>) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                queues: WorkQueueSet::new(),
                termination: Termination::new(),
                bus: EventBus::new(),
                started: Mutex::new(Instant::now()),
                code_cache,
                announced: Mutex::new(false),
                announced_cv: Condvar::new(),
            }),
        }
    }

    pub fn queues(&self) -> &WorkQueueSet {
        &self.shared.queues
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn code_cache(&self) -> Option<&Arc<CodeCache>> {
        self.shared.code_cache.as_ref()
    }

    /// Account for the bootstrap item.
    pub(crate) fn seed(&self) -> Result<(), TerminationError> {
        self.shared.termination.seed()
    }

    /// Fold a worker's net production into the outstanding count.
    ///
    /// Must be called *after* the products were enqueued.
    pub fn update(&self, delta: i64) -> bool {
        let reached_zero = self.shared.termination.update(delta);
        if reached_zero {
            debug!(completed = self.completed(), "no outstanding work left");
        }
        reached_zero
    }

    /// Stop the session early.
    ///
    /// The caller that actually ends the session publishes `stop-requested`.
    /// Returns `false` if the session was already done.
    pub fn request_stop(&self, reason: StopReason) -> bool {
        if !self.shared.termination.request_stop(reason.clone()) {
            return false;
        }
        warn!(%reason, "stop requested");
        self.shared.bus.publish(Event::StopRequested(reason));
        *self
            .shared
            .announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.shared.announced_cv.notify_all();
        true
    }

    /// Wait until a pending `stop-requested` dispatch has finished, so that it
    /// is ordered before shutdown. Gives up after `timeout`.
    pub(crate) fn await_stop_announced(&self, timeout: Duration) -> bool {
        let guard = self
            .shared
            .announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .shared
            .announced_cv
            .wait_timeout_while(guard, timeout, |announced| !*announced)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Publish a program termination point.
    pub fn signal_stop(&self, message: Option<String>) {
        self.shared.bus.publish(Event::Stop(message));
    }

    /// Publish an assertion violation.
    pub fn signal_assert_failed(&self, message: Option<String>) {
        self.shared.bus.publish(Event::AssertFailed(message));
    }

    pub(crate) fn await_done(&self, timeout: Duration) -> WaitOutcome {
        self.shared.termination.await_done(timeout)
    }

    pub fn is_done(&self) -> bool {
        self.shared.termination.is_done()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.termination.stop_reason()
    }

    pub fn outstanding(&self) -> i64 {
        self.shared.termination.outstanding()
    }

    pub fn completed(&self) -> u64 {
        self.shared.termination.completed()
    }

    pub fn started(&self) -> Instant {
        *self
            .shared
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Restart the session clock; called once the run begins.
    pub(crate) fn mark_started(&self) -> Instant {
        let now = Instant::now();
        *self
            .shared
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = now;
        now
    }

    pub fn elapsed(&self) -> Duration {
        self.started().elapsed()
    }

    pub fn status(&self) -> TickStatus {
        TickStatus {
            elapsed: self.elapsed(),
            outstanding: self.outstanding(),
            completed: self.completed(),
            queues: self.shared.queues.lengths(),
        }
    }

    /// A handle that does not keep the session alive, for bus handlers.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("outstanding", &self.outstanding())
            .field("done", &self.is_done())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

#[derive(Clone)]
pub struct WeakSession {
    shared: Weak<SessionShared>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<SessionHandle> {
        self.shared.upgrade().map(|shared| SessionHandle { shared })
    }
}

impl Reportable for SessionHandle {
    fn name(&self) -> String {
        "Session".into()
    }

    fn property_names(&self) -> Vec<String> {
        [
            "#elapsed",
            "diver-models",
            "surfer-models",
            "paths",
            "traces",
            "#completed",
            "outstanding",
            "stop-reason",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        let status = self.status();
        vec![
            PropertyValue::Float(status.elapsed.as_secs_f64()),
            status.queues.diver_models.into(),
            status.queues.surfer_models.into(),
            status.queues.paths.into(),
            status.queues.traces.into(),
            status.completed.into(),
            status.outstanding.into(),
            self.stop_reason().map(|r| r.to_string()).into(),
        ]
    }
}
