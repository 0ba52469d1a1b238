//! Work accounting and quiescence detection.
//!
//! `outstanding` counts every work item that is queued *or* being processed.
//! The bootstrap item sets it to 1; a worker that finishes one item folds in
//! `produced - 1`. Because a worker enqueues its products before it reports,
//! the count cannot touch zero while anything is still in flight, so the
//! update that lands on zero is the exact instant of quiescence.
//!
//! # Correctness Invariants
//!
//! - `done` is set by the update that reaches zero, or by `request_stop`.
//! - Once `done` is set it never reverts within the session.
//! - The first reason to set `done` is the one recorded.
//! - All reads and writes go through one mutex; the zero comparison happens in
//!   the same critical section as the addition.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::error::TerminationError;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "kebab-case")]
pub enum StopReason {
    /// No work remained anywhere in the pipeline.
    Quiescent,
    /// The wall-clock time limit was exceeded.
    TimeLimit,
    /// A program termination point or explicit stop call.
    Stopped(Option<String>),
    /// An assertion violation was observed.
    AssertionFailed(Option<String>),
}

impl StopReason {
    /// Whether the stop happened before the work ran out.
    pub fn is_early(&self) -> bool {
        !matches!(self, StopReason::Quiescent)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            StopReason::Stopped(m) | StopReason::AssertionFailed(m) => m.as_deref(),
            StopReason::Quiescent | StopReason::TimeLimit => None,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Quiescent => f.write_str("all work done"),
            StopReason::TimeLimit => f.write_str("time limit reached"),
            StopReason::Stopped(None) => f.write_str("stop requested"),
            StopReason::Stopped(Some(m)) => write!(f, "stop requested: {m}"),
            StopReason::AssertionFailed(None) => f.write_str("assertion failed"),
            StopReason::AssertionFailed(Some(m)) => write!(f, "assertion failed: {m}"),
        }
    }
}

/// Result of [`Termination::await_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Done,
    TimedOut,
}

#[derive(Debug)]
struct State {
    outstanding: i64,
    done: bool,
    seeded: bool,
    reason: Option<StopReason>,
    /// Number of `update` calls, i.e. work items finished.
    completed: u64,
}

/// Outstanding-work counter plus a done flag, with blocking wait.
#[derive(Debug)]
pub struct Termination {
    state: Mutex<State>,
    cv: Condvar,
}

impl Termination {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                outstanding: 0,
                done: false,
                seeded: false,
                reason: None,
                completed: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Lock state with poison recovery; a panicking worker must not wedge
    /// the session's accounting.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account for the bootstrap item. Valid once, before any worker starts.
    pub fn seed(&self) -> Result<(), TerminationError> {
        let mut st = self.lock();
        if st.seeded {
            return Err(TerminationError::AlreadySeeded);
        }
        st.seeded = true;
        st.outstanding = 1;
        Ok(())
    }

    /// Fold `delta` into the outstanding count.
    ///
    /// Returns `true` if this call brought the count to zero and thereby
    /// finished the session.
    pub fn update(&self, delta: i64) -> bool {
        let mut st = self.lock();
        st.outstanding += delta;
        st.completed += 1;
        if st.outstanding < 0 {
            warn!(
                outstanding = st.outstanding,
                delta, "outstanding work went negative"
            );
        }
        if st.outstanding != 0 || st.done {
            return false;
        }
        st.done = true;
        st.reason = Some(StopReason::Quiescent);
        drop(st);
        self.cv.notify_all();
        true
    }

    /// Set `done` regardless of the outstanding count.
    ///
    /// Returns `true` if this call was the one that set it.
    pub fn request_stop(&self, reason: StopReason) -> bool {
        let mut st = self.lock();
        if st.done {
            return false;
        }
        st.done = true;
        st.reason = Some(reason);
        drop(st);
        self.cv.notify_all();
        true
    }

    /// Block until `done` or until `timeout` elapses.
    pub fn await_done(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        while !st.done {
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
        }
        WaitOutcome::Done
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Snapshot for monitoring. Never use this to make scheduling decisions.
    pub fn outstanding(&self) -> i64 {
        self.lock().outstanding
    }

    pub fn completed(&self) -> u64 {
        self.lock().completed
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.lock().reason.clone()
    }
}

impl Default for Termination {
    fn default() -> Self {
        Self::new()
    }
}
