pub mod density;
pub mod loss_utils;
pub mod made;
pub mod ordering;

pub use density::{DensityModel, SupportsOrderingEnsemble};
pub use made::{apply_wildcard_dropout, Made, MadeConfig};
pub use ordering::{Ordering, OrderingBuilder};
