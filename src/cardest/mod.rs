//! Cardinality estimation with autoregressive density models.

pub mod architectures;
pub mod data;
pub mod error;
pub mod estimation;
pub mod settings;
pub mod training;
pub mod trial;

pub use error::{CardEstError, Result};
pub use settings::TrialSettings;
