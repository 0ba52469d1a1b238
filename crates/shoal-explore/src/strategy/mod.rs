//! Strategies turn exploration results back into new models.

pub mod depth_first;
pub mod random;

pub use depth_first::{DepthFirstFactory, DepthFirstState};
pub use random::{RandomFactory, RandomOptions, RandomState};

pub const DEPTH_FIRST: &str = "depth-first";
pub const RANDOM: &str = "random";
