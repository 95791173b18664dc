//! Cardinality estimators and the workload evaluation loop.

pub mod evaluation;
pub mod oracle;
pub mod progressive;
pub mod report;

use std::collections::BTreeSet;

use crate::cardest::data::{BoundPredicate, ColumnRole, Op, Query, Table, Value};

pub use evaluation::{error_metric, EvaluationLoop, QueryRecord, RunLog};
pub use oracle::TableScanOracle;
pub use progressive::{FactorizedProgressiveSampling, ProgressiveSampling, SamplingOptions};
pub use report::EstimatorReport;

/// Code of queries flagged unsupported before estimation.
pub const UNSUPPORTED_PREFLAGGED: i32 = -1;
/// Code of queries whose estimation failed.
pub const UNSUPPORTED_FAILED: i32 = 0;

/// Result of answering one query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Estimated {
        cardinality: f64,
        /// Time spent turning the query into per-column constraints.
        prep_ms: f64,
    },
    Unsupported {
        code: i32,
        reason: String,
    },
}

impl QueryOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            code: UNSUPPORTED_FAILED,
            reason: reason.into(),
        }
    }
}

pub trait CardinalityEstimator {
    fn name(&self) -> String;

    fn query(&mut self, query: &Query) -> QueryOutcome;

    /// Drop caches built while answering queries.
    fn release_memory(&mut self) {}
}

/// Per-column restriction derived from a query over a non-factorized
/// schema.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    /// `None` for columns the query does not restrict.
    pub masks: Vec<Option<Vec<bool>>>,
    /// Fanout columns whose sampled value divides the weight.
    pub scale: Vec<bool>,
}

impl Constraints {
    pub fn is_queried(&self, column: usize) -> bool {
        self.masks[column].is_some() || self.scale[column]
    }
}

/// AND every predicate into per-column masks over `table`'s domains.
pub fn predicate_masks(table: &Table, predicates: &[BoundPredicate]) -> Vec<Option<Vec<bool>>> {
    let mut masks: Vec<Option<Vec<bool>>> = vec![None; table.num_columns()];
    for p in predicates {
        let column = &table.columns[p.column];
        let mask = column.valid_mask(p.op, &p.value);
        masks[p.column] = Some(match masks[p.column].take() {
            Some(prev) => prev.iter().zip(&mask).map(|(a, b)| *a && *b).collect(),
            None => mask,
        });
    }
    masks
}

/// Add join semantics to predicate masks: queried tables must be present
/// (`__in_<t> = 1`), and the fanouts of every other table scale the
/// estimate down.
pub fn apply_join_semantics(
    table: &Table,
    query: &Query,
    predicates: &[BoundPredicate],
    mut masks: Vec<Option<Vec<bool>>>,
    fanout_scaling: bool,
) -> Constraints {
    let mut scale = vec![false; table.num_columns()];
    let has_virtual = table.columns.iter().any(|c| c.role.is_virtual());
    if !fanout_scaling || !has_virtual {
        return Constraints { masks, scale };
    }

    let queried: BTreeSet<&str> = if query.tables.is_empty() {
        predicates
            .iter()
            .map(|p| table.columns[p.column].table.as_str())
            .collect()
    } else {
        query.tables.iter().map(String::as_str).collect()
    };

    for (c, column) in table.columns.iter().enumerate() {
        let in_query = queried.contains(column.table.as_str());
        match column.role {
            ColumnRole::Indicator if in_query => {
                let present = column.valid_mask(Op::Eq, &Value::Int(1));
                masks[c] = Some(match masks[c].take() {
                    Some(prev) => prev.iter().zip(&present).map(|(a, b)| *a && *b).collect(),
                    None => present,
                });
            }
            ColumnRole::Fanout if !in_query => scale[c] = true,
            _ => {}
        }
    }
    Constraints { masks, scale }
}

/// Numeric value of a fanout code; non-numeric values count as 1.
pub fn fanout_value(table: &Table, column: usize, code: u32) -> f64 {
    match table.columns[column].domain.get(code as usize) {
        Some(Value::Int(v)) => (*v as f64).max(1.0),
        Some(Value::Float(v)) => v.max(1.0),
        _ => 1.0,
    }
}
