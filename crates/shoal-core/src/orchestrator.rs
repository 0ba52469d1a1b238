//! Session lifecycle.
//!
//! ```text
//! INITIALIZING --seed, start workers, init, start--> RUNNING
//! RUNNING --quiescent | time limit | stop request--> STOPPING
//! STOPPING --pre-shutdown, pool shutdown, post-shutdown, report--> STOPPED
//! ```
//!
//! While running, the orchestrator thread only blocks in
//! `Termination::await_done`. Each timed-out wait re-checks the time limit
//! and publishes a `tick`. Every way of ending the session funnels through the
//! done flag, so there is exactly one shutdown sequence.

use std::sync::Arc;
use std::time::Duration;

use shoal_model::Model;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, Topic};
use crate::config::SessionConfig;
use crate::error::{ConfigError, SessionError};
use crate::instrument::CodeCache;
use crate::limits::{TimeLimit, Watchdog};
use crate::pool::{Role, TaskFactory, TaskKind, TaskPool, ThreadBounds};
use crate::queue::ModelLane;
use crate::registry::{ObserverCtor, Registry};
use crate::report::{Reportable, Reporter, SessionReport};
use crate::session::SessionHandle;
use crate::termination::{StopReason, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Collects task kinds, observers and limits, then validates them in
/// [`SessionBuilder::build`].
pub struct SessionBuilder {
    kinds: Vec<TaskKind>,
    observers: Vec<(String, ObserverCtor)>,
    reportables: Vec<Arc<dyn Reportable>>,
    time_limit: TimeLimit,
    poll_interval: Duration,
    shutdown_grace: Duration,
    code_cache: Option<Arc<CodeCache>>,
    settings: Vec<(String, String)>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            kinds: Vec::new(),
            observers: Vec::new(),
            reportables: Vec::new(),
            time_limit: TimeLimit::Unbounded,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(1),
            code_cache: None,
            settings: Vec::new(),
        }
    }

    /// Resolve every identifier in `config` against `registry`.
    pub fn from_config(config: &SessionConfig, registry: &Registry) -> Result<Self, ConfigError> {
        let mut builder = Self::new()
            .time_limit(config.time_limit())
            .poll_interval(Duration::from_millis(config.settings.poll_interval_ms))
            .shutdown_grace(Duration::from_millis(config.settings.shutdown_grace_ms));
        builder.settings = config.settings();

        // A registered diver is kept even at zero threads so it can be forced.
        if config.divers.threads > 0 || registry.has_diver() {
            builder = builder.kind(registry.diver(config.divers)?);
        }
        if config.surfers.threads > 0 || registry.has_surfer() {
            builder = builder.kind(registry.surfer(config.surfers)?);
        }
        for strategy in &config.strategies {
            builder = builder.kind(registry.strategy(&strategy.name, strategy.bounds)?);
        }
        for name in &config.observers {
            builder = builder.observer_ctor(name, registry.observer(name)?);
        }
        Ok(builder)
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn diver<F: TaskFactory>(self, factory: F, bounds: ThreadBounds) -> Self {
        self.kind(TaskKind::new("diver", Role::Diver, bounds, factory))
    }

    pub fn surfer<F: TaskFactory>(self, factory: F, bounds: ThreadBounds) -> Self {
        self.kind(TaskKind::new("surfer", Role::Surfer, bounds, factory))
    }

    pub fn strategy<F: TaskFactory>(self, name: &str, factory: F, bounds: ThreadBounds) -> Self {
        self.kind(TaskKind::new(name, Role::Strategy, bounds, factory))
    }

    pub fn observer<C>(self, name: &str, ctor: C) -> Self
    where
        C: Fn(&SessionHandle) -> Arc<dyn Reportable> + Send + Sync + 'static,
    {
        self.observer_ctor(name, Arc::new(ctor))
    }

    pub fn observer_ctor(mut self, name: &str, ctor: ObserverCtor) -> Self {
        self.observers.push((name.to_string(), ctor));
        self
    }

    /// Include an extra section in the final report.
    pub fn reportable(mut self, reportable: Arc<dyn Reportable>) -> Self {
        self.reportables.push(reportable);
        self
    }

    pub fn time_limit(mut self, limit: TimeLimit) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn code_cache(mut self, cache: Arc<CodeCache>) -> Self {
        self.code_cache = Some(cache);
        self
    }

    /// Validate the configuration and wire up a session ready to run.
    pub fn build(mut self) -> Result<Orchestrator, ConfigError> {
        let threads_of = |kinds: &[TaskKind], role: Role| -> u32 {
            kinds
                .iter()
                .filter(|k| k.role() == role)
                .map(|k| k.bounds().threads)
                .sum()
        };

        if threads_of(&self.kinds, Role::Strategy) == 0 {
            return Err(ConfigError::NoStrategy);
        }
        if threads_of(&self.kinds, Role::Diver) + threads_of(&self.kinds, Role::Surfer) == 0 {
            let diver = self
                .kinds
                .iter_mut()
                .find(|k| k.role() == Role::Diver)
                .ok_or_else(|| ConfigError::MissingFactory(Role::Diver.to_string()))?;
            let bounds = diver.bounds_mut();
            bounds.threads = 1;
            bounds.max_threads = bounds.max_threads.max(1);
            info!(kind = diver.name(), "no divers or surfers configured, forcing one diver");
        }
        let bootstrap_lane = if threads_of(&self.kinds, Role::Diver) > 0 {
            ModelLane::Divers
        } else {
            ModelLane::Surfers
        };

        let session = SessionHandle::with_code_cache(self.code_cache.clone());
        let pool = TaskPool::new(session.clone(), self.kinds)?;

        let reporter = Reporter::attach(session.bus());
        reporter.register(Arc::new(session.clone()));
        for manager in pool.managers() {
            reporter.register(manager);
        }
        for (name, ctor) in &self.observers {
            debug!(observer = %name, "attaching observer");
            reporter.register(ctor(&session));
        }
        if let Some(cache) = &self.code_cache {
            reporter.register(Arc::clone(cache) as Arc<dyn Reportable>);
        }
        for reportable in self.reportables {
            reporter.register(reportable);
        }

        let weak = session.downgrade();
        session.bus().subscribe(Topic::Stop, move |event| {
            if let (Event::Stop(message), Some(session)) = (event, weak.upgrade()) {
                session.request_stop(StopReason::Stopped(message.clone()));
            }
            Ok(())
        });
        let weak = session.downgrade();
        session.bus().subscribe(Topic::AssertFailed, move |event| {
            if let (Event::AssertFailed(message), Some(session)) = (event, weak.upgrade()) {
                session.request_stop(StopReason::AssertionFailed(message.clone()));
            }
            Ok(())
        });

        Ok(Orchestrator {
            state: RunState::Initializing,
            session,
            pool,
            reporter,
            time_limit: self.time_limit,
            poll_interval: self.poll_interval,
            shutdown_grace: self.shutdown_grace,
            settings: self.settings,
            bootstrap_lane,
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the pool, the reporter and the session; drives one run.
pub struct Orchestrator {
    state: RunState,
    session: SessionHandle,
    pool: TaskPool,
    reporter: Arc<Reporter>,
    time_limit: TimeLimit,
    poll_interval: Duration,
    shutdown_grace: Duration,
    settings: Vec<(String, String)>,
    bootstrap_lane: ModelLane,
}

impl Orchestrator {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// A handle for stopping or inspecting the session from other threads.
    pub fn handle(&self) -> SessionHandle {
        self.session.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    /// Queue that receives the bootstrap model.
    pub fn bootstrap_lane(&self) -> ModelLane {
        self.bootstrap_lane
    }

    /// Run the session to completion on the calling thread.
    pub fn run(mut self) -> Result<SessionReport, SessionError> {
        let started = self.session.mark_started();
        for (key, value) in &self.settings {
            info!(%key, %value, "setting");
        }
        info!(time_limit = %self.time_limit, "session starting");

        let bus = self.session.bus();
        bus.publish(Event::Init);
        self.session.seed()?;
        self.session
            .queues()
            .models(self.bootstrap_lane)
            .enqueue(Model::bootstrap());

        if let Err(err) = self.pool.start_all() {
            error!(error = %err, "failed to start workers");
            self.session
                .request_stop(StopReason::Stopped(Some(format!("worker start failed: {err}"))));
        }
        self.state = RunState::Running;
        bus.publish(Event::Start);

        let watchdog = Watchdog::starting_at(self.time_limit, started);
        loop {
            let wait = watchdog
                .remaining()
                .map_or(self.poll_interval, |left| left.clamp(Duration::from_millis(1), self.poll_interval));
            match self.session.await_done(wait) {
                WaitOutcome::Done => break,
                WaitOutcome::TimedOut => {
                    if watchdog.exceeded() {
                        warn!(limit = %self.time_limit, "time limit reached");
                        self.session.request_stop(StopReason::TimeLimit);
                        continue;
                    }
                    if self.session.is_done() {
                        continue;
                    }
                    bus.publish(Event::Tick(self.session.status()));
                }
            }
        }

        self.state = RunState::Stopping;
        let reason = self.session.stop_reason().unwrap_or(StopReason::Quiescent);
        if reason.is_early() && !self.session.await_stop_announced(self.shutdown_grace) {
            warn!("stop-requested dispatch still running at shutdown");
        }
        bus.publish(Event::PreShutdown);
        let summary = self.pool.shutdown(self.shutdown_grace);
        let residue = self.session.queues().drain();
        if !residue.is_empty() {
            debug!(items = residue.len(), "discarding queued work");
        }
        bus.publish(Event::PostShutdown);
        self.state = RunState::Stopped;

        bus.publish(Event::Report);
        let report = SessionReport {
            stop_reason: reason,
            duration: self.session.elapsed(),
            completed: self.session.completed(),
            sections: self.reporter.take_sections(),
        };
        if report.completed <= 1 {
            warn!(
                completed = report.completed,
                "only a single work item was processed, check the settings"
            );
        }
        info!(
            reason = %report.stop_reason,
            elapsed_ms = report.duration.as_millis() as u64,
            completed = report.completed,
            abandoned_workers = summary.abandoned,
            "session finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("kinds", &self.pool.kind_names().collect::<Vec<_>>())
            .finish()
    }
}
