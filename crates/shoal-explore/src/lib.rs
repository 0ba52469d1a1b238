//! Exploration task kinds for `shoal-core` sessions.
//!
//! A [`program::BranchProgram`] stands in for the code under exploration.
//! Divers execute it and report path conditions; surfers execute it and
//! report decision traces. Strategies read those results and feed new models
//! back:
//! - `depth-first` flips path conditions through the interval solver,
//! - `random` samples seeded random inputs for every trace.

use std::sync::Arc;

use shoal_core::Registry;

pub mod diver;
pub mod program;
pub mod solver;
pub mod strategy;
pub mod surfer;

pub use diver::{DiveStats, DiverFactory};
pub use program::{Branch, BranchProgram, Execution, Outcome, ProgramError, Variable};
pub use solver::{IntervalSolver, SolveError};
pub use strategy::{DepthFirstFactory, RandomFactory, RandomOptions};
pub use surfer::{SurfStats, SurferFactory};

/// Register the diver, the surfer and every built-in strategy for `program`.
pub fn register_defaults(
    registry: &mut Registry,
    program: Arc<BranchProgram>,
    random: RandomOptions,
) -> &mut Registry {
    let diver_program = Arc::clone(&program);
    let surfer_program = Arc::clone(&program);
    let depth_first_program = Arc::clone(&program);
    registry
        .register_diver(move || DiverFactory::new(Arc::clone(&diver_program)))
        .register_surfer(move || SurferFactory::new(Arc::clone(&surfer_program)))
        .register_strategy(strategy::DEPTH_FIRST, move || {
            DepthFirstFactory::new(Arc::clone(&depth_first_program))
        })
        .register_strategy(strategy::RANDOM, move || {
            RandomFactory::new(Arc::clone(&program), random)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::ThreadBounds;

    #[test]
    fn test_register_defaults() {
        let program = Arc::new(BranchProgram::new(vec![Variable::new("x", 0, 1, 0)], vec![]).unwrap());
        let mut registry = Registry::new();
        register_defaults(&mut registry, program, RandomOptions::default());
        assert!(registry.has_diver());
        assert!(registry.has_surfer());
        assert_eq!(
            registry.strategy_names().collect::<Vec<_>>(),
            vec![strategy::DEPTH_FIRST, strategy::RANDOM]
        );
        let kind = registry.strategy(strategy::RANDOM, ThreadBounds::fixed(2)).unwrap();
        assert_eq!(kind.name(), "random");
        assert_eq!(kind.bounds().threads, 2);
    }
}
