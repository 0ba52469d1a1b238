//! Systematic path exploration by flipping recorded branch decisions.
//!
//! For every path that comes back from a diver, each branch decision is
//! negated in turn (deepest first) and the prefix up to it is handed to the
//! solver. A prefix is claimed the first time anyone covers it, either by
//! exploring it or by flipping into it, so no prefix is solved twice across
//! the whole session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use shoal_core::{PropertyValue, Reportable, SessionHandle, Task, TaskError, TaskFactory, WorkerContext};
use shoal_model::{Clause, Decision, Model, PathCondition, PathResult};
use tracing::trace;

use crate::program::BranchProgram;
use crate::solver::{IntervalSolver, SolveError};

#[derive(Debug, Default)]
struct Frontier {
    claimed: HashSet<Vec<Decision>>,
    explored: HashSet<Vec<Decision>>,
}

#[derive(Debug, Default)]
pub struct DepthFirstState {
    frontier: Mutex<Frontier>,
    paths: AtomicUsize,
    absent: AtomicUsize,
    revisits: AtomicUsize,
    generated: AtomicUsize,
    infeasible: AtomicUsize,
}

impl DepthFirstState {
    /// Distinct full paths seen so far.
    pub fn distinct_paths(&self) -> usize {
        self.lock().explored.len()
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    pub fn infeasible(&self) -> usize {
        self.infeasible.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Frontier> {
        self.frontier.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim every unclaimed flip of `path`, returning the branch indices
    /// the caller should solve for.
    fn claim_flips(&self, path: &PathCondition) -> Vec<usize> {
        let signature = path.signature();
        let mut frontier = self.lock();
        if !frontier.explored.insert(signature.clone()) {
            self.revisits.fetch_add(1, Ordering::SeqCst);
        }
        for len in 1..=signature.len() {
            frontier.claimed.insert(signature[..len].to_vec());
        }

        (0..signature.len())
            .rev()
            .filter(|&i| {
                let mut flipped = signature[..i].to_vec();
                flipped.push(path.clauses[i].negated().decision());
                frontier.claimed.insert(flipped)
            })
            .collect()
    }

    /// New models reaching every unexplored sibling of `path`.
    pub fn expand(&self, program: &BranchProgram, path: &PathCondition) -> Result<Vec<Model>, SolveError> {
        self.paths.fetch_add(1, Ordering::SeqCst);
        let solver = IntervalSolver::new(program);
        let mut models = Vec::new();
        for index in self.claim_flips(path) {
            let mut constraints: Vec<Clause> = path.clauses[..index].to_vec();
            constraints.push(path.clauses[index].negated());
            match solver.solve(&constraints, &path.origin)? {
                Some(values) => {
                    let priority = -i64::try_from(index).unwrap_or(i64::MAX);
                    models.push(Model::new(priority, path.origin.seed, values));
                }
                None => {
                    trace!(site = path.clauses[index].site, "flip is infeasible");
                    self.infeasible.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.generated.fetch_add(models.len(), Ordering::SeqCst);
        Ok(models)
    }
}

impl Reportable for DepthFirstState {
    fn name(&self) -> String {
        "DepthFirst".into()
    }

    fn property_names(&self) -> Vec<String> {
        ["#paths", "#distinct-paths", "#absent", "#revisits", "#generated", "#infeasible"]
            .map(String::from)
            .to_vec()
    }

    fn property_values(&self) -> Vec<PropertyValue> {
        vec![
            self.paths.load(Ordering::SeqCst).into(),
            self.distinct_paths().into(),
            self.absent.load(Ordering::SeqCst).into(),
            self.revisits.load(Ordering::SeqCst).into(),
            self.generated().into(),
            self.infeasible().into(),
        ]
    }
}

pub struct DepthFirstFactory {
    program: Arc<BranchProgram>,
}

impl DepthFirstFactory {
    pub fn new(program: Arc<BranchProgram>) -> Self {
        Self { program }
    }
}

impl TaskFactory for DepthFirstFactory {
    type Manager = DepthFirstState;

    fn create_manager(&self, _session: &SessionHandle) -> DepthFirstState {
        DepthFirstState::default()
    }

    fn create_task(&self, _session: &SessionHandle, state: Arc<DepthFirstState>) -> Box<dyn Task> {
        Box::new(DepthFirst {
            program: Arc::clone(&self.program),
            state,
        })
    }
}

struct DepthFirst {
    program: Arc<BranchProgram>,
    state: Arc<DepthFirstState>,
}

impl Task for DepthFirst {
    fn run(&mut self, ctx: &WorkerContext) -> Result<(), TaskError> {
        loop {
            let path = match ctx.next_path()? {
                PathResult::Present(path) => path,
                PathResult::Absent => {
                    self.state.absent.fetch_add(1, Ordering::SeqCst);
                    ctx.finish(0);
                    continue;
                }
            };
            let models = self
                .state
                .expand(&self.program, &path)
                .map_err(anyhow::Error::from)?;
            let produced = ctx.session().queues().diver_models().enqueue_all(models);
            ctx.finish(produced);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Branch, Variable};
    use shoal_model::CmpOp;

    fn program() -> BranchProgram {
        BranchProgram::new(
            vec![Variable::new("x", 0, 100, 0)],
            vec![
                Branch::new(1, "x", CmpOp::Gt, 50),
                Branch::new(2, "x", CmpOp::Gt, 75),
            ],
        )
        .unwrap()
    }

    fn path_of(program: &BranchProgram, model: Model) -> PathCondition {
        let execution = program.execute(&model).unwrap();
        PathCondition {
            clauses: execution.clauses,
            origin: model,
        }
    }

    #[test]
    fn test_expand_flips_deepest_first() {
        let program = program();
        let state = DepthFirstState::default();
        // x = 0: both branches fall through.
        let models = state.expand(&program, &path_of(&program, Model::bootstrap())).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(state.infeasible(), 1);
        // Only the first flip (x > 50) is feasible, at priority 0.
        assert_eq!(models[0].priority, 0);
        assert_eq!(models[0].get("x").and_then(|v| v.as_int()), Some(51));
    }

    #[test]
    fn test_claimed_prefixes_are_not_solved_again() {
        let program = program();
        let state = DepthFirstState::default();
        let bootstrap = path_of(&program, Model::bootstrap());
        state.expand(&program, &bootstrap).unwrap();
        assert!(state.expand(&program, &bootstrap).unwrap().is_empty());
        assert_eq!(state.revisits.load(Ordering::SeqCst), 1);
        assert_eq!(state.distinct_paths(), 1);
    }

    #[test]
    fn test_exploration_covers_every_feasible_path() {
        let program = program();
        let state = DepthFirstState::default();
        let mut pending = vec![Model::bootstrap()];
        while let Some(model) = pending.pop() {
            pending.extend(state.expand(&program, &path_of(&program, model)).unwrap());
        }
        // x <= 50; 50 < x <= 75; x > 75.
        assert_eq!(state.distinct_paths(), 3);
        assert_eq!(state.generated(), 2);
        assert_eq!(state.revisits.load(Ordering::SeqCst), 0);
    }
}
