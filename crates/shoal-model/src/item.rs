use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Variable name -> assigned value (sorted for determinism).
pub type Assignment = BTreeMap<String, Value>;

/// Identifies the seed model a chain of explorations started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeedId(pub u64);

/// A candidate input model waiting to be explored.
///
/// Lower `priority` values are explored first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub values: Assignment,
    pub priority: i64,
    pub seed: SeedId,
}

impl Model {
    pub fn new(priority: i64, seed: SeedId, values: Assignment) -> Self {
        Self {
            values,
            priority,
            seed,
        }
    }

    /// The model that starts every session: no assignments, priority 0.
    pub fn bootstrap() -> Self {
        Self::new(0, SeedId(0), Assignment::new())
    }

    pub fn get(&self, var: &str) -> Option<&Value> {
        self.values.get(var)
    }
}

/// Comparison operator of a recorded branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    /// The operator that holds exactly when `self` does not.
    pub fn negate(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
        }
    }

    pub fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }
}

impl std::fmt::Display for CmpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// One branch decision as it held along an explored execution:
/// `var op rhs` was true at branch site `site`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clause {
    pub site: u32,
    pub var: String,
    pub op: CmpOp,
    pub rhs: i64,
    /// Whether the branch at `site` was taken (as opposed to falling through).
    pub taken: bool,
}

impl Clause {
    /// The same branch site with the opposite outcome.
    pub fn negated(&self) -> Self {
        Self {
            site: self.site,
            var: self.var.clone(),
            op: self.op.negate(),
            rhs: self.rhs,
            taken: !self.taken,
        }
    }

    pub fn decision(&self) -> Decision {
        Decision {
            site: self.site,
            taken: self.taken,
        }
    }
}

impl std::fmt::Display for Clause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.var, self.op, self.rhs)
    }
}

/// A branch site and the direction it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Decision {
    pub site: u32,
    pub taken: bool,
}

/// The logical record of branch decisions taken along one explored execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCondition {
    pub clauses: Vec<Clause>,
    /// The model the diver executed to obtain this path.
    pub origin: Model,
}

impl PathCondition {
    pub fn depth(&self) -> usize {
        self.clauses.len()
    }

    pub fn signature(&self) -> Vec<Decision> {
        self.clauses.iter().map(Clause::decision).collect()
    }
}

/// A cheap replay of one execution: only the decisions, no formulas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub decisions: Vec<Decision>,
    pub origin: Model,
}

/// The outcome of one dive.
///
/// `Absent` means the dive produced no usable path information; it is not the
/// same thing as "nothing queued yet".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathResult {
    Present(PathCondition),
    Absent,
}

impl PathResult {
    pub fn is_absent(&self) -> bool {
        matches!(self, PathResult::Absent)
    }
}

impl From<Option<PathCondition>> for PathResult {
    fn from(pc: Option<PathCondition>) -> Self {
        pc.map_or(PathResult::Absent, PathResult::Present)
    }
}

/// The outcome of one surf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceResult {
    Present(Trace),
    Absent,
}

impl TraceResult {
    pub fn is_absent(&self) -> bool {
        matches!(self, TraceResult::Absent)
    }
}

impl From<Option<Trace>> for TraceResult {
    fn from(trace: Option<Trace>) -> Self {
        trace.map_or(TraceResult::Absent, TraceResult::Present)
    }
}

/// Any unit of work that can sit in one of the session queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    Model(Model),
    PathResult(PathResult),
    TraceResult(TraceResult),
}

impl WorkItem {
    /// Short label for logs and residue accounting.
    pub fn label(&self) -> &'static str {
        match self {
            WorkItem::Model(_) => "model",
            WorkItem::PathResult(_) => "path",
            WorkItem::TraceResult(_) => "trace",
        }
    }
}
