//! A straight-line branching program over bounded integer inputs.
//!
//! Each [`Branch`] compares one input against a constant. Executing the
//! program on a [`Model`] records every decision as a [`Clause`]; a branch
//! may also end the run with a stop or an assertion failure when taken.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use shoal_core::SessionHandle;
use shoal_model::{Assignment, Clause, CmpOp, Model, Value};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("variable '{0}' declared twice")]
    DuplicateVariable(String),

    #[error("variable '{var}': min {min} exceeds max {max}")]
    EmptyDomain { var: String, min: i64, max: i64 },

    #[error("variable '{var}': default {default} outside [{min}, {max}]")]
    DefaultOutOfBounds {
        var: String,
        default: i64,
        min: i64,
        max: i64,
    },

    #[error("branch site {site} uses undeclared variable '{var}'")]
    UndeclaredVariable { site: u32, var: String },

    #[error("branch site {0} appears twice")]
    DuplicateSite(u32),

    #[error("value {value} of '{var}' outside [{min}, {max}]")]
    OutOfBounds {
        var: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("value of '{0}' is not an integer")]
    NotAnInteger(String),
}

/// A bounded integer input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub min: i64,
    pub max: i64,
    /// Used when a model does not assign the variable.
    pub default: i64,
}

impl Variable {
    pub fn new(name: &str, min: i64, max: i64, default: i64) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
            default,
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// What happens when a branch is taken, besides continuing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "kebab-case")]
pub enum Outcome {
    /// The program reached a termination point.
    Stop(String),
    /// An assertion does not hold.
    AssertFailed(String),
}

impl Outcome {
    /// Announce the outcome on the session bus.
    pub fn signal(&self, session: &SessionHandle) {
        match self {
            Outcome::Stop(message) => session.signal_stop(Some(message.clone())),
            Outcome::AssertFailed(message) => session.signal_assert_failed(Some(message.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub site: u32,
    pub var: String,
    pub op: CmpOp,
    pub rhs: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_taken: Option<Outcome>,
}

impl Branch {
    pub fn new(site: u32, var: &str, op: CmpOp, rhs: i64) -> Self {
        Self {
            site,
            var: var.to_string(),
            op,
            rhs,
            on_taken: None,
        }
    }

    pub fn on_taken(mut self, outcome: Outcome) -> Self {
        self.on_taken = Some(outcome);
        self
    }
}

/// The record of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub clauses: Vec<Clause>,
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawProgram")]
pub struct BranchProgram {
    variables: BTreeMap<String, Variable>,
    branches: Vec<Branch>,
}

#[derive(Deserialize)]
struct RawProgram {
    variables: Vec<Variable>,
    branches: Vec<Branch>,
}

impl TryFrom<RawProgram> for BranchProgram {
    type Error = ProgramError;

    fn try_from(raw: RawProgram) -> Result<Self, Self::Error> {
        BranchProgram::new(raw.variables, raw.branches)
    }
}

impl BranchProgram {
    pub fn new(variables: Vec<Variable>, branches: Vec<Branch>) -> Result<Self, ProgramError> {
        let mut vars = BTreeMap::new();
        for var in variables {
            if var.min > var.max {
                return Err(ProgramError::EmptyDomain {
                    var: var.name,
                    min: var.min,
                    max: var.max,
                });
            }
            if !var.contains(var.default) {
                return Err(ProgramError::DefaultOutOfBounds {
                    var: var.name,
                    default: var.default,
                    min: var.min,
                    max: var.max,
                });
            }
            if vars.contains_key(&var.name) {
                return Err(ProgramError::DuplicateVariable(var.name));
            }
            vars.insert(var.name.clone(), var);
        }

        let mut sites = HashSet::new();
        for branch in &branches {
            if !vars.contains_key(&branch.var) {
                return Err(ProgramError::UndeclaredVariable {
                    site: branch.site,
                    var: branch.var.clone(),
                });
            }
            if !sites.insert(branch.site) {
                return Err(ProgramError::DuplicateSite(branch.site));
            }
        }

        Ok(Self {
            variables: vars,
            branches,
        })
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// The value `model` gives `var`, falling back to the declared default.
    fn input(&self, model: &Model, var: &Variable) -> Result<i64, ProgramError> {
        let value = match model.get(&var.name) {
            None => var.default,
            Some(v) => v
                .as_int()
                .ok_or_else(|| ProgramError::NotAnInteger(var.name.clone()))?,
        };
        if !var.contains(value) {
            return Err(ProgramError::OutOfBounds {
                var: var.name.clone(),
                value,
                min: var.min,
                max: var.max,
            });
        }
        Ok(value)
    }

    /// Run the program on `model`, recording each branch decision.
    pub fn execute(&self, model: &Model) -> Result<Execution, ProgramError> {
        let mut inputs = BTreeMap::new();
        for var in self.variables.values() {
            inputs.insert(var.name.as_str(), self.input(model, var)?);
        }

        let mut clauses = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            let value = inputs[branch.var.as_str()];
            let taken = branch.op.eval(value, branch.rhs);
            let clause = Clause {
                site: branch.site,
                var: branch.var.clone(),
                op: branch.op,
                rhs: branch.rhs,
                taken: true,
            };
            clauses.push(if taken { clause } else { clause.negated() });
            if taken {
                if let Some(outcome) = &branch.on_taken {
                    return Ok(Execution {
                        clauses,
                        outcome: Some(outcome.clone()),
                    });
                }
            }
        }
        Ok(Execution {
            clauses,
            outcome: None,
        })
    }

    /// Every input at its default.
    pub fn default_assignment(&self) -> Assignment {
        self.variables
            .values()
            .map(|v| (v.name.clone(), Value::Int(v.default)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_model::SeedId;

    fn program() -> BranchProgram {
        BranchProgram::new(
            vec![Variable::new("x", 0, 100, 0), Variable::new("y", -10, 10, 0)],
            vec![
                Branch::new(1, "x", CmpOp::Gt, 50),
                Branch::new(2, "y", CmpOp::Eq, 3),
                Branch::new(3, "x", CmpOp::Lt, 75)
                    .on_taken(Outcome::AssertFailed("x < 75".into())),
            ],
        )
        .unwrap()
    }

    fn model(x: i64, y: i64) -> Model {
        let values = [("x".to_string(), Value::Int(x)), ("y".to_string(), Value::Int(y))]
            .into_iter()
            .collect();
        Model::new(0, SeedId(0), values)
    }

    #[test]
    fn test_execute_records_decisions() {
        let exec = program().execute(&model(80, 3)).unwrap();
        let rendered: Vec<String> = exec.clauses.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["x > 50", "y == 3", "x >= 75"]);
        assert_eq!(
            exec.clauses.iter().map(|c| c.taken).collect::<Vec<_>>(),
            vec![true, true, false]
        );
        assert_eq!(exec.outcome, None);
    }

    #[test]
    fn test_taken_outcome_ends_execution() {
        let exec = program().execute(&model(60, 0)).unwrap();
        assert_eq!(exec.clauses.len(), 3);
        assert_eq!(exec.outcome, Some(Outcome::AssertFailed("x < 75".into())));
    }

    #[test]
    fn test_unassigned_uses_default() {
        let exec = program().execute(&Model::bootstrap()).unwrap();
        assert_eq!(exec.clauses[0].to_string(), "x <= 50");
        // x = 0 takes the asserting branch.
        assert!(exec.outcome.is_some());
    }

    #[test]
    fn test_out_of_bounds_input() {
        assert_eq!(
            program().execute(&model(101, 0)),
            Err(ProgramError::OutOfBounds {
                var: "x".into(),
                value: 101,
                min: 0,
                max: 100
            })
        );
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            BranchProgram::new(vec![], vec![Branch::new(1, "z", CmpOp::Eq, 0)]),
            Err(ProgramError::UndeclaredVariable { site: 1, .. })
        ));
        assert!(matches!(
            BranchProgram::new(vec![Variable::new("x", 5, 1, 3)], vec![]),
            Err(ProgramError::EmptyDomain { .. })
        ));
        assert!(matches!(
            BranchProgram::new(
                vec![Variable::new("x", 0, 9, 0)],
                vec![Branch::new(1, "x", CmpOp::Eq, 0), Branch::new(1, "x", CmpOp::Ne, 0)]
            ),
            Err(ProgramError::DuplicateSite(1))
        ));
    }

    #[test]
    fn test_program_from_json() {
        let program: BranchProgram = serde_json::from_str(
            r#"{
                "variables": [ { "name": "x", "min": 0, "max": 9, "default": 0 } ],
                "branches": [
                    { "site": 1, "var": "x", "op": "Ge", "rhs": 5,
                      "on_taken": { "kind": "stop", "message": "done" } }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(program.branches().len(), 1);
        assert_eq!(program.default_assignment().len(), 1);

        let bad = serde_json::from_str::<BranchProgram>(
            r#"{ "variables": [], "branches": [ { "site": 1, "var": "q", "op": "Eq", "rhs": 0 } ] }"#,
        );
        assert!(bad.is_err());
    }
}
