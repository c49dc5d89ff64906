//! State that flows down a pipeline branch.
//!
//! - [`Table`]: the loaded dataset
//! - [`ExperimentContext`]: dataset plus modelling session, copied per branch

mod experiment;
mod table;

pub use experiment::ExperimentContext;
pub use table::Table;
