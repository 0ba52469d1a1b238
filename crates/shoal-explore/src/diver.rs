//! Divers execute models and record full path conditions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shoal_core::{PropertyValue, Reportable, SessionHandle, Task, TaskError, TaskFactory, WorkerContext};
use shoal_model::{PathCondition, PathResult};
use tracing::{debug, warn};

use crate::program::{BranchProgram, Outcome};

/// Counters shared by every diver of a session.
#[derive(Debug, Default)]
pub struct DiveStats {
    dives: AtomicUsize,
    absent: AtomicUsize,
    stops: AtomicUsize,
    asserts: AtomicUsize,
    max_depth: AtomicUsize,
}

impl DiveStats {
    pub fn dives(&self) -> usize {
        self.dives.load(Ordering::SeqCst)
    }

    pub fn absent(&self) -> usize {
        self.absent.load(Ordering::SeqCst)
    }

    pub(crate) fn record_outcome(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Stop(_) => self.stops.fetch_add(1, Ordering::SeqCst),
            Outcome::AssertFailed(_) => self.asserts.fetch_add(1, Ordering::SeqCst),
        };
    }
}

impl Reportable for DiveStats {
    fn name(&self) -> String {
        "Divers".into()
    }

    fn property_names(&self) -> Vec<String> {
        ["#dives", "#absent", "#stops", "#asserts", "max-depth"]
            .map(String::from)
            .to_vec()
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        vec![
            self.dives().into(),
            self.absent().into(),
            self.stops.load(Ordering::SeqCst).into(),
            self.asserts.load(Ordering::SeqCst).into(),
            self.max_depth.load(Ordering::SeqCst).into(),
        ]
    }
}

pub struct DiverFactory {
    program: Arc<BranchProgram>,
}

impl DiverFactory {
    pub fn new(program: Arc<BranchProgram>) -> Self {
        Self { program }
    }
}

impl TaskFactory for DiverFactory {
    type Manager = DiveStats;

    fn create_manager(&self, _session: &SessionHandle) -> DiveStats {
        DiveStats::default()
    }

    fn create_task(&self, _session: &SessionHandle, stats: Arc<DiveStats>) -> Box<dyn Task> {
        Box::new(Diver {
            program: Arc::clone(&self.program),
            stats,
        })
    }
}

struct Diver {
    program: Arc<BranchProgram>,
    stats: Arc<DiveStats>,
}

impl Task for Diver {
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), TaskError> {
        loop {
            let model = ctx.next_diver_model()?;
            self.stats.dives.fetch_add(1, Ordering::SeqCst);

            let (result, outcome) = match self.program.execute(&model) {
                Ok(execution) => {
                    self.stats
                        .max_depth
                        .fetch_max(execution.clauses.len(), Ordering::SeqCst);
                    let path = PathCondition {
                        clauses: execution.clauses,
                        origin: model,
                    };
                    (PathResult::Present(path), execution.outcome)
                }
                Err(err) => {
                    warn!(worker = ctx.index(), error = %err, "dive produced no path");
                    self.stats.absent.fetch_add(1, Ordering::SeqCst);
                    (PathResult::Absent, None)
                }
            };

            ctx.session().queues().paths().enqueue(result);
            if let Some(outcome) = outcome {
                debug!(worker = ctx.index(), ?outcome, "dive reached an outcome");
                self.stats.record_outcome(&outcome);
                outcome.signal(ctx.session());
            }
            ctx.finish(1);
        }
    }
}
