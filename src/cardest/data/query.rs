use serde::{Deserialize, Serialize};

use super::table::Table;
use super::value::{Op, Value};
use crate::cardest::error::{CardEstError, Result};

/// Conjunctive predicate `AND_i (columns[i] ops[i] values[i])`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Tables the query joins; empty for single-table workloads.
    pub tables: Vec<String>,
    pub columns: Vec<String>,
    pub ops: Vec<Op>,
    pub values: Vec<Value>,
}

/// A predicate bound to a column index of a concrete table.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundPredicate {
    pub column: usize,
    pub op: Op,
    pub value: Value,
}

impl Query {
    pub fn new(columns: Vec<String>, ops: Vec<Op>, values: Vec<Value>) -> Self {
        Self {
            tables: Vec::new(),
            columns,
            ops,
            values,
        }
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Resolve column names against `table`. A `table.column` name also
    /// matches a plain `column` of a single table with that name.
    pub fn bind(&self, table: &Table) -> Result<Vec<BoundPredicate>> {
        if self.ops.len() != self.columns.len() || self.values.len() != self.columns.len() {
            return Err(CardEstError::InvalidQuery(format!(
                "{} columns, {} operators, {} values",
                self.columns.len(),
                self.ops.len(),
                self.values.len()
            )));
        }
        self.columns
            .iter()
            .zip(&self.ops)
            .zip(&self.values)
            .map(|((name, &op), value)| {
                let column = resolve_column(table, name)
                    .ok_or_else(|| CardEstError::UnknownColumn(name.clone()))?;
                Ok(BoundPredicate {
                    column,
                    op,
                    value: value.clone(),
                })
            })
            .collect()
    }
}

pub fn resolve_column(table: &Table, name: &str) -> Option<usize> {
    table.column_index(name).or_else(|| {
        let (prefix, local) = name.split_once('.')?;
        (prefix == table.name).then(|| table.column_index(local)).flatten()
    })
}
