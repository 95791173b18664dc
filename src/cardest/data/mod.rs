//! Tables, joins, queries and the tuple streams the trainer consumes.

pub mod factorized;
pub mod join;
pub mod loader;
pub mod query;
pub mod table;
pub mod value;
pub mod workload;

pub use factorized::{FactorizedStream, FactorizedTable};
pub use join::{JoinSampler, JoinSpec, StarJoinSampler};
pub use loader::{CsvDatasetLoader, DatasetLoader};
pub use query::{BoundPredicate, Query};
pub use table::{Column, ColumnRole, FactorInfo, Table, TableDataset, TupleBatch, TupleStream};
pub use value::{Op, Value};
pub use workload::Workload;
