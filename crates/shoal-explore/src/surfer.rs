//! Surfers replay models cheaply, keeping only the branch directions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shoal_core::{PropertyValue, Reportable, SessionHandle, Task, TaskError, TaskFactory, WorkerContext};
use shoal_model::{Trace, TraceResult};
use tracing::warn;

use crate::program::BranchProgram;

#[derive(Debug, Default)]
pub struct SurfStats {
    surfs: AtomicUsize,
    absent: AtomicUsize,
    outcomes: AtomicUsize,
}

impl SurfStats {
    pub fn surfs(&self) -> usize {
        self.surfs.load(Ordering::SeqCst)
    }
}

impl Reportable for SurfStats {
    fn name(&self) -> String {
        "Surfers".into()
    }

    fn property_names(&self) -> Vec<String> {
        vec!["#surfs".into(), "#absent".into(), "#outcomes".into()]
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        vec![
            self.surfs().into(),
            self.absent.load(Ordering::SeqCst).into(),
            self.outcomes.load(Ordering::SeqCst).into(),
        ]
    }
}

pub struct SurferFactory {
    program: Arc<BranchProgram>,
}

impl SurferFactory {
    pub fn new(program: Arc<BranchProgram>) -> Self {
        Self { program }
    }
}

impl TaskFactory for SurferFactory {
    type Manager = SurfStats;

    fn create_manager(&self, _session: &SessionHandle) -> SurfStats {
        SurfStats::default()
    }

    fn create_task(&self, _session: &SessionHandle, stats: Arc<SurfStats>) -> Box<dyn Task> {
        Box::new(Surfer {
            program: Arc::clone(&self.program),
            stats,
        })
    }
}

struct Surfer {
    program: Arc<BranchProgram>,
    stats: Arc<SurfStats>,
}

impl Task for Surfer {
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), TaskError> {
        loop {
            let model = ctx.next_surfer_model()?;
            self.stats.surfs.fetch_add(1, Ordering::SeqCst);

            let (result, outcome) = match self.program.execute(&model) {
                Ok(execution) => {
                    let trace = Trace {
                        decisions: execution.clauses.iter().map(|c| c.decision()).collect(),
                        origin: model,
                    };
                    (TraceResult::Present(trace), execution.outcome)
                }
                Err(err) => {
                    warn!(worker = ctx.index(), error = %err, "surf produced no trace");
                    self.stats.absent.fetch_add(1, Ordering::SeqCst);
                    (TraceResult::Absent, None)
                }
            };

            ctx.session().queues().traces().enqueue(result);
            if let Some(outcome) = outcome {
                self.stats.outcomes.fetch_add(1, Ordering::SeqCst);
                outcome.signal(ctx.session());
            }
            ctx.finish(1);
        }
    }
}
