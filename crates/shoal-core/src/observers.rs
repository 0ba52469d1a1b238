//! Built-in session observers.
//!
//! Each observer subscribes itself to the session bus on `attach` and reports
//! what it saw. Turning `stop` / `assert-failed` into an actual stop is the
//! orchestrator's job; these only record.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::info;

use crate::bus::{Event, Topic};
use crate::limits::report_delay;
use crate::report::{PropertyValue, Reportable};
use crate::session::SessionHandle;

/// Records whether a program termination point was reached.
#[derive(Debug, Default)]
pub struct StopController {
    stopped: AtomicBool,
    message: Mutex<Option<String>>,
}

impl StopController {
    pub fn attach(session: &SessionHandle) -> Arc<Self> {
        let controller = Arc::new(Self::default());
        let this = Arc::clone(&controller);
        session.bus().subscribe(Topic::Stop, move |event| {
            if let Event::Stop(message) = event {
                this.stopped.store(true, Ordering::SeqCst);
                *this.message.lock().unwrap_or_else(PoisonError::into_inner) = message.clone();
            }
            Ok(())
        });
        controller
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn message(&self) -> Option<String> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Reportable for StopController {
    fn name(&self) -> String {
        "StopController".into()
    }

    fn property_names(&self) -> Vec<String> {
        vec!["was-stopped".into(), "stop-message".into()]
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        vec![self.was_stopped().into(), self.message().into()]
    }
}

/// Records the first assertion violation.
#[derive(Debug, Default)]
pub struct AssertController {
    failed: AtomicBool,
    message: Mutex<Option<String>>,
}

impl AssertController {
    pub fn attach(session: &SessionHandle) -> Arc<Self> {
        let controller = Arc::new(Self::default());
        let this = Arc::clone(&controller);
        session.bus().subscribe(Topic::AssertFailed, move |event| {
            if let Event::AssertFailed(message) = event {
                if !this.failed.swap(true, Ordering::SeqCst) {
                    *this.message.lock().unwrap_or_else(PoisonError::into_inner) =
                        message.clone();
                }
            }
            Ok(())
        });
        controller
    }

    pub fn assert_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn message(&self) -> Option<String> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Reportable for AssertController {
    fn name(&self) -> String {
        "AssertController".into()
    }

    fn property_names(&self) -> Vec<String> {
        vec!["assert-failed".into(), "assert-message".into()]
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        vec![self.assert_failed().into(), self.message().into()]
    }
}

/// Logs a progress line on every `tick` past the next report time.
///
/// Reports are spaced by [`report_delay`], so they thin out as the session
/// ages.
#[derive(Debug)]
pub struct ProgressMonitor {
    next_at: Mutex<Duration>,
    reports: AtomicU64,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self {
            next_at: Mutex::new(report_delay(Duration::ZERO)),
            reports: AtomicU64::new(0),
        }
    }

    pub fn attach(session: &SessionHandle) -> Arc<Self> {
        let monitor = Arc::new(Self::new());
        let this = Arc::clone(&monitor);
        session.bus().subscribe(Topic::Tick, move |event| {
            if let Event::Tick(status) = event {
                if this.due(status.elapsed) {
                    info!(
                        elapsed_secs = status.elapsed.as_secs(),
                        completed = status.completed,
                        outstanding = status.outstanding,
                        diver_models = status.queues.diver_models,
                        surfer_models = status.queues.surfer_models,
                        paths = status.queues.paths,
                        traces = status.queues.traces,
                        "progress"
                    );
                }
            }
            Ok(())
        });
        monitor
    }

    /// Whether a report is due at `elapsed`; schedules the next one if so.
    pub fn due(&self, elapsed: Duration) -> bool {
        let mut next_at = self.next_at.lock().unwrap_or_else(PoisonError::into_inner);
        if elapsed < *next_at {
            return false;
        }
        *next_at = elapsed + report_delay(elapsed);
        self.reports.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn report_count(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reportable for ProgressMonitor {
    fn name(&self) -> String {
        "Progress".into()
    }

    fn property_names(&self) -> Vec<String> {
        vec!["#reports".into()]
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        vec![self.report_count().into()]
    }
}
