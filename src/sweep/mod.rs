//! Sweep parameter parsing and iteration.

pub mod plan;
pub mod vector;

pub use plan::{SweepAxis, SweepPlan, SweepPoint};
pub use vector::{parse_sweep_vector, SweepVectorError, INVALID_EXPRESSION};
