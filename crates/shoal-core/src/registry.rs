//! String-keyed lookup of task factories and observers.
//!
//! Configuration names strategies and observers by identifier; the registry
//! turns each identifier into a constructor. A name that was never registered
//! is a configuration error.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::observers::{AssertController, ProgressMonitor, StopController};
use crate::pool::{Role, TaskFactory, TaskKind, ThreadBounds};
use crate::report::Reportable;
use crate::session::SessionHandle;

type KindCtor = Arc<dyn Fn(ThreadBounds) -> TaskKind + Send + Sync>;

/// Builds an observer for a session; the observer subscribes itself to the
/// session's bus and is reported at the end.
pub type ObserverCtor = Arc<dyn Fn(&SessionHandle) -> Arc<dyn Reportable> + Send + Sync>;

pub const STOP_CONTROLLER: &str = "stop-controller";
pub const ASSERT_CONTROLLER: &str = "assert-controller";
pub const PROGRESS: &str = "progress";

#[derive(Clone)]
pub struct Registry {
    diver: Option<KindCtor>,
    surfer: Option<KindCtor>,
    strategies: BTreeMap<String, KindCtor>,
    observers: BTreeMap<String, ObserverCtor>,
}

fn kind_ctor<F, C>(name: String, role: Role, ctor: C) -> KindCtor
where
    F: TaskFactory,
    C: Fn() -> F + Send + Sync + 'static,
{
    Arc::new(move |bounds: ThreadBounds| TaskKind::new(name.clone(), role, bounds, ctor()))
}

impl Registry {
    /// An empty registry with only the built-in observers.
    pub fn new() -> Self {
        let mut registry = Self {
            diver: None,
            surfer: None,
            strategies: BTreeMap::new(),
            observers: BTreeMap::new(),
        };
        registry.register_observer(STOP_CONTROLLER, |session| {
            StopController::attach(session) as Arc<dyn Reportable>
        });
        registry.register_observer(ASSERT_CONTROLLER, |session| {
            AssertController::attach(session) as Arc<dyn Reportable>
        });
        registry.register_observer(PROGRESS, |session| {
            ProgressMonitor::attach(session) as Arc<dyn Reportable>
        });
        registry
    }

    pub fn register_diver<F, C>(&mut self, ctor: C) -> &mut Self
    where
        F: TaskFactory,
        C: Fn() -> F + Send + Sync + 'static,
    {
        self.diver = Some(kind_ctor("diver".into(), Role::Diver, ctor));
        self
    }

    pub fn register_surfer<F, C>(&mut self, ctor: C) -> &mut Self
    where
        F: TaskFactory,
        C: Fn() -> F + Send + Sync + 'static,
    {
        self.surfer = Some(kind_ctor("surfer".into(), Role::Surfer, ctor));
        self
    }

    pub fn register_strategy<F, C>(&mut self, name: &str, ctor: C) -> &mut Self
    where
        F: TaskFactory,
        C: Fn() -> F + Send + Sync + 'static,
    {
        self.strategies
            .insert(name.to_string(), kind_ctor(name.to_string(), Role::Strategy, ctor));
        self
    }

    pub fn register_observer<C>(&mut self, name: &str, ctor: C) -> &mut Self
    where
        C: Fn(&SessionHandle) -> Arc<dyn Reportable> + Send + Sync + 'static,
    {
        self.observers.insert(name.to_string(), Arc::new(ctor));
        self
    }

    pub fn has_diver(&self) -> bool {
        self.diver.is_some()
    }

    pub fn has_surfer(&self) -> bool {
        self.surfer.is_some()
    }

    pub fn diver(&self, bounds: ThreadBounds) -> Result<TaskKind, ConfigError> {
        self.diver
            .as_ref()
            .map(|ctor| ctor(bounds))
            .ok_or_else(|| ConfigError::MissingFactory(Role::Diver.to_string()))
    }

    pub fn surfer(&self, bounds: ThreadBounds) -> Result<TaskKind, ConfigError> {
        self.surfer
            .as_ref()
            .map(|ctor| ctor(bounds))
            .ok_or_else(|| ConfigError::MissingFactory(Role::Surfer.to_string()))
    }

    pub fn strategy(&self, name: &str, bounds: ThreadBounds) -> Result<TaskKind, ConfigError> {
        self.strategies
            .get(name)
            .map(|ctor| ctor(bounds))
            .ok_or_else(|| ConfigError::UnknownStrategy(name.to_string()))
    }

    pub fn observer(&self, name: &str) -> Result<ObserverCtor, ConfigError> {
        self.observers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownObserver(name.to_string()))
    }

    pub fn strategy_names(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }

    pub fn observer_names(&self) -> impl Iterator<Item = &str> {
        self.observers.keys().map(String::as_str)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("diver", &self.has_diver())
            .field("surfer", &self.has_surfer())
            .field("strategies", &self.strategies.keys().collect::<Vec<_>>())
            .field("observers", &self.observers.keys().collect::<Vec<_>>())
            .finish()
    }
}
