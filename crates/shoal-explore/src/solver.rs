//! Interval solver for conjunctions of `var op constant` clauses.
//!
//! Every clause narrows one variable's `[lo, hi]` window or, for `!=`,
//! excludes a single point. A conjunction is satisfiable exactly when every
//! window still holds a non-excluded value.

use std::collections::{BTreeMap, BTreeSet};

use shoal_model::{Assignment, Clause, CmpOp, Model, Value};

use crate::program::BranchProgram;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SolveError {
    #[error("clause at site {site} constrains unknown variable '{var}'")]
    UnknownVariable { site: u32, var: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Domain {
    lo: i64,
    hi: i64,
    excluded: BTreeSet<i64>,
}

impl Domain {
    fn narrow(&mut self, op: CmpOp, rhs: i64) {
        match op {
            CmpOp::Lt => self.hi = self.hi.min(rhs.saturating_sub(1)),
            CmpOp::Le => self.hi = self.hi.min(rhs),
            CmpOp::Gt => self.lo = self.lo.max(rhs.saturating_add(1)),
            CmpOp::Ge => self.lo = self.lo.max(rhs),
            CmpOp::Eq => {
                self.lo = self.lo.max(rhs);
                self.hi = self.hi.min(rhs);
            }
            CmpOp::Ne => {
                self.excluded.insert(rhs);
            }
        }
    }

    fn admits(&self, value: i64) -> bool {
        (self.lo..=self.hi).contains(&value) && !self.excluded.contains(&value)
    }

    /// `hint` if admissible, otherwise the smallest admissible value.
    fn pick(&self, hint: Option<i64>) -> Option<i64> {
        if let Some(hint) = hint.filter(|&h| self.admits(h)) {
            return Some(hint);
        }
        let mut candidate = self.lo;
        // Only finitely many points are excluded, so this ends quickly.
        while candidate <= self.hi {
            if !self.excluded.contains(&candidate) {
                return Some(candidate);
            }
            candidate = candidate.checked_add(1)?;
        }
        None
    }
}

/// Solves path constraints over the inputs of one program.
#[derive(Debug, Clone, Copy)]
pub struct IntervalSolver<'p> {
    program: &'p BranchProgram,
}

impl<'p> IntervalSolver<'p> {
    pub fn new(program: &'p BranchProgram) -> Self {
        Self { program }
    }

    /// Find an assignment to every program input that satisfies all of
    /// `clauses`, staying as close to `hint` as the constraints allow.
    ///
    /// Returns `Ok(None)` when the conjunction is unsatisfiable.
    pub fn solve(&self, clauses: &[Clause], hint: &Model) -> Result<Option<Assignment>, SolveError> {
        let mut domains: BTreeMap<&str, Domain> = self
            .program
            .variables()
            .map(|v| {
                (
                    v.name.as_str(),
                    Domain {
                        lo: v.min,
                        hi: v.max,
                        excluded: BTreeSet::new(),
                    },
                )
            })
            .collect();

        for clause in clauses {
            let domain = domains
                .get_mut(clause.var.as_str())
                .ok_or_else(|| SolveError::UnknownVariable {
                    site: clause.site,
                    var: clause.var.clone(),
                })?;
            domain.narrow(clause.op, clause.rhs);
            if domain.lo > domain.hi {
                return Ok(None);
            }
        }

        let mut assignment = Assignment::new();
        for var in self.program.variables() {
            let hint = hint
                .get(&var.name)
                .and_then(Value::as_int)
                .or(Some(var.default));
            match domains[var.name.as_str()].pick(hint) {
                Some(value) => {
                    assignment.insert(var.name.clone(), Value::Int(value));
                }
                None => return Ok(None),
            }
        }
        Ok(Some(assignment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Branch, Variable};
    use shoal_model::SeedId;

    fn program() -> BranchProgram {
        BranchProgram::new(
            vec![Variable::new("x", 0, 10, 0), Variable::new("y", 0, 2, 1)],
            vec![Branch::new(1, "x", CmpOp::Gt, 5)],
        )
        .unwrap()
    }

    fn clause(site: u32, var: &str, op: CmpOp, rhs: i64) -> Clause {
        Clause {
            site,
            var: var.into(),
            op,
            rhs,
            taken: true,
        }
    }

    fn hint(x: i64) -> Model {
        Model::new(0, SeedId(0), [("x".to_string(), Value::Int(x))].into_iter().collect())
    }

    #[test]
    fn test_keeps_hint_when_admissible() {
        let program = program();
        let solution = IntervalSolver::new(&program)
            .solve(&[clause(1, "x", CmpOp::Gt, 5)], &hint(8))
            .unwrap()
            .unwrap();
        assert_eq!(solution["x"], Value::Int(8));
        // Unconstrained, unhinted inputs take their default.
        assert_eq!(solution["y"], Value::Int(1));
    }

    #[test]
    fn test_moves_to_smallest_admissible() {
        let program = program();
        let solution = IntervalSolver::new(&program)
            .solve(
                &[clause(1, "x", CmpOp::Gt, 5), clause(2, "x", CmpOp::Ne, 6)],
                &hint(2),
            )
            .unwrap()
            .unwrap();
        assert_eq!(solution["x"], Value::Int(7));
    }

    #[test]
    fn test_unsatisfiable() {
        let program = program();
        let solver = IntervalSolver::new(&program);
        let empty = [clause(1, "x", CmpOp::Gt, 5), clause(2, "x", CmpOp::Lt, 3)];
        assert_eq!(solver.solve(&empty, &Model::bootstrap()), Ok(None));

        let excluded = [
            clause(1, "y", CmpOp::Ne, 0),
            clause(2, "y", CmpOp::Ne, 1),
            clause(3, "y", CmpOp::Ne, 2),
        ];
        assert_eq!(solver.solve(&excluded, &Model::bootstrap()), Ok(None));

        let outside = [clause(1, "x", CmpOp::Eq, 11)];
        assert_eq!(solver.solve(&outside, &Model::bootstrap()), Ok(None));
    }

    #[test]
    fn test_extreme_constants_saturate() {
        let program = program();
        let solver = IntervalSolver::new(&program);
        assert_eq!(
            solver.solve(&[clause(1, "x", CmpOp::Lt, i64::MIN)], &Model::bootstrap()),
            Ok(None)
        );
        assert!(solver
            .solve(&[clause(1, "x", CmpOp::Le, i64::MAX)], &Model::bootstrap())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_unknown_variable() {
        let program = program();
        assert_eq!(
            IntervalSolver::new(&program).solve(&[clause(4, "z", CmpOp::Eq, 0)], &Model::bootstrap()),
            Err(SolveError::UnknownVariable {
                site: 4,
                var: "z".into()
            })
        );
    }
}
