use std::time::Instant;

use super::{apply_join_semantics, fanout_value, predicate_masks, CardinalityEstimator, QueryOutcome};
use crate::cardest::data::{Query, Table};
use crate::cardest::error::Result;

/// Exact answers by scanning a (materialized) table.
///
/// Rows of a join sample are weighted by the inverse fanouts of tables the
/// query does not touch, so the count matches the query's own join.
pub struct TableScanOracle {
    table: Table,
    fanout_scaling: bool,
}

impl TableScanOracle {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            fanout_scaling: true,
        }
    }

    pub fn with_fanout_scaling(mut self, enabled: bool) -> Self {
        self.fanout_scaling = enabled;
        self
    }

    pub fn count(&self, query: &Query) -> Result<f64> {
        let bound = query.bind(&self.table)?;
        let constraints = apply_join_semantics(
            &self.table,
            query,
            &bound,
            predicate_masks(&self.table, &bound),
            self.fanout_scaling,
        );

        let mut total = 0.0;
        for r in 0..self.table.num_rows() {
            let mut weight = 1.0;
            for (c, codes) in self.table.codes.iter().enumerate() {
                let code = codes[r];
                if let Some(mask) = &constraints.masks[c] {
                    if !mask[code as usize] {
                        weight = 0.0;
                        break;
                    }
                }
                if constraints.scale[c] {
                    weight /= fanout_value(&self.table, c, code);
                }
            }
            total += weight;
        }
        Ok(total)
    }
}

impl CardinalityEstimator for TableScanOracle {
    fn name(&self) -> String {
        "oracle".to_string()
    }

    fn query(&mut self, query: &Query) -> QueryOutcome {
        let started = Instant::now();
        match self.count(query) {
            Ok(cardinality) => QueryOutcome::Estimated {
                cardinality,
                prep_ms: started.elapsed().as_secs_f64() * 1e3,
            },
            Err(err) => QueryOutcome::failed(err.to_string()),
        }
    }
}
