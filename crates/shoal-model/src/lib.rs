//! Work items exchanged between divers, surfers and strategies.
//!
//! A session moves three kinds of data through its queues:
//! - [`Model`]s: concrete input assignments waiting to be explored,
//! - [`PathResult`]s: path conditions recorded by divers,
//! - [`TraceResult`]s: lightweight replay traces recorded by surfers.
//!
//! Both result types carry an explicit `Absent` variant so that "this
//! exploration produced nothing" travels through a queue like any other item.

pub mod item;
pub mod value;

pub use item::{
    Assignment, Clause, CmpOp, Decision, Model, PathCondition, PathResult, SeedId, Trace,
    TraceResult, WorkItem,
};
pub use value::Value;
