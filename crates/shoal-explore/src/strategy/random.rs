//! Seeded random input generation driven by surfer traces.
//!
//! Every trace that comes back buys up to `fanout` fresh random models for
//! the surfers, until the session-wide budget is spent. Each task draws from
//! its own ChaCha8 stream, so one seed always yields the same inputs per task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use shoal_core::{PropertyValue, Reportable, SessionHandle, Task, TaskError, TaskFactory, WorkerContext};
use shoal_model::{Assignment, Decision, Model, SeedId, TraceResult, Value};

use crate::program::BranchProgram;

/// Deterministic RNG for one task of a seeded session.
pub fn task_rng(global_seed: u64, task_id: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(global_seed.wrapping_add(task_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomOptions {
    pub seed: u64,
    /// Total number of models the strategy may generate in one session.
    pub budget: usize,
    /// Models generated per incoming trace.
    pub fanout: usize,
}

impl Default for RandomOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            budget: 64,
            fanout: 2,
        }
    }
}

#[derive(Debug)]
pub struct RandomState {
    options: RandomOptions,
    remaining: AtomicUsize,
    next_task: AtomicU64,
    traces: AtomicUsize,
    absent: AtomicUsize,
    generated: AtomicUsize,
    distinct: Mutex<HashSet<Vec<Decision>>>,
}

impl RandomState {
    pub fn new(options: RandomOptions) -> Self {
        Self {
            options,
            remaining: AtomicUsize::new(options.budget),
            next_task: AtomicU64::new(0),
            traces: AtomicUsize::new(0),
            absent: AtomicUsize::new(0),
            generated: AtomicUsize::new(0),
            distinct: Mutex::new(HashSet::new()),
        }
    }

    /// Take up to `wanted` units from the budget.
    fn take(&self, wanted: usize) -> usize {
        let before = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                Some(left - left.min(wanted))
            })
            .unwrap_or(0);
        before.min(wanted)
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn distinct_traces(&self) -> usize {
        self.distinct
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Reportable for RandomState {
    fn name(&self) -> String {
        "Random".into()
    }

    fn property_names(&self) -> Vec<String> {
        ["seed", "#traces", "#absent", "#distinct-traces", "#generated", "budget-left"]
            .map(String::from)
            .to_vec()
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        vec![
            self.options.seed.into(),
            self.traces.load(Ordering::SeqCst).into(),
            self.absent.load(Ordering::SeqCst).into(),
            self.distinct_traces().into(),
            self.generated().into(),
            self.remaining.load(Ordering::SeqCst).into(),
        ]
    }
}

pub struct RandomFactory {
    program: Arc<BranchProgram>,
    options: RandomOptions,
}

impl RandomFactory {
    pub fn new(program: Arc<BranchProgram>, options: RandomOptions) -> Self {
        Self { program, options }
    }
}

impl TaskFactory for RandomFactory {
    type Manager = RandomState;

    fn create_manager(&self, _session: &SessionHandle) -> RandomState {
        RandomState::new(self.options)
    }

    fn create_task(&self, _session: &SessionHandle, state: Arc<RandomState>) -> Box<dyn Task> {
        let task_id = state.next_task.fetch_add(1, Ordering::SeqCst);
        Box::new(RandomSearch {
            program: Arc::clone(&self.program),
            rng: task_rng(state.options.seed, task_id),
            state,
        })
    }
}

struct RandomSearch {
    program: Arc<BranchProgram>,
    rng: ChaCha8Rng,
    state: Arc<RandomState>,
}

impl RandomSearch {
    fn random_model(&mut self, seed: SeedId) -> Model {
        let values: Assignment = self
            .program
            .variables()
            .map(|v| (v.name.clone(), Value::Int(self.rng.gen_range(v.min..=v.max))))
            .collect();
        Model::new(0, seed, values)
    }
}

impl Task for RandomSearch {
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), TaskError> {
        loop {
            let trace = match ctx.next_trace()? {
                TraceResult::Present(trace) => trace,
                TraceResult::Absent => {
                    self.state.absent.fetch_add(1, Ordering::SeqCst);
                    ctx.finish(0);
                    continue;
                }
            };
            self.state.traces.fetch_add(1, Ordering::SeqCst);
            self.state
                .distinct
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(trace.decisions);

            let granted = self.state.take(self.state.options.fanout);
            let models: Vec<Model> = (0..granted)
                .map(|_| self.random_model(trace.origin.seed))
                .collect();
            self.state.generated.fetch_add(models.len(), Ordering::SeqCst);
            let produced = ctx.session().queues().surfer_models().enqueue_all(models);
            ctx.finish(produced);
        }
    }
}
