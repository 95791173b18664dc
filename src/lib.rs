//! card-est-rs: cardinality estimation with autoregressive density models
//! (ordering ensembles, progressive sampling, workload evaluation)

pub mod cardest;

pub use cardest::settings::TrialSettings;
pub use cardest::trial::{StepResult, TrialController};
pub use cardest::{CardEstError, Result};

/// Test utilities: fixture tables, CSV writers and tensor builders.
pub mod test_utils;
