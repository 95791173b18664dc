use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::value::{Op, Value};
use crate::cardest::error::{CardEstError, Result};

/// Semantic bracket of a column, derived from the virtual-column naming
/// convention used by the join sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnRole {
    Content,
    /// `__in_<table>`: whether the joined row carries a tuple of `<table>`.
    Indicator,
    /// `__fanout_<table>` (or any other `__` column): join multiplicity.
    Fanout,
}

impl ColumnRole {
    pub fn from_name(name: &str) -> Self {
        let local = name.rsplit('.').next().unwrap_or(name);
        if local.starts_with("__in_") {
            ColumnRole::Indicator
        } else if local.starts_with("__") {
            ColumnRole::Fanout
        } else {
            ColumnRole::Content
        }
    }

    pub fn is_virtual(self) -> bool {
        self != ColumnRole::Content
    }
}

/// Back-reference from a sub-variable column to the column it was split from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorInfo {
    /// Index of the original column in the unfactorized table.
    pub original: usize,
    /// 0 is the most significant word.
    pub sub_index: usize,
    pub num_subs: usize,
    /// Right shift that extracts this word from an original code.
    pub shift: u32,
    pub word_bits: u32,
}

impl FactorInfo {
    pub fn digit(&self, code: u32) -> u32 {
        (code >> self.shift) & ((1u32 << self.word_bits) - 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub table: String,
    /// Sorted distinct values; a value's code is its index here.
    pub domain: Vec<Value>,
    pub role: ColumnRole,
    pub factor: Option<FactorInfo>,
}

impl Column {
    pub fn new(name: impl Into<String>, table: impl Into<String>, domain: Vec<Value>) -> Self {
        let name = name.into();
        Self {
            role: ColumnRole::from_name(&name),
            name,
            table: table.into(),
            domain,
            factor: None,
        }
    }

    /// Number of distinct codes the model must predict for this column.
    pub fn distribution_size(&self) -> usize {
        self.domain.len()
    }

    pub fn code_of(&self, value: &Value) -> Option<u32> {
        self.domain.binary_search(value).ok().map(|i| i as u32)
    }

    /// Which domain codes satisfy `<column> <op> <literal>`.
    pub fn valid_mask(&self, op: Op, literal: &Value) -> Vec<bool> {
        self.domain.iter().map(|v| op.matches(v, literal)).collect()
    }
}

/// A discretised table: every cell is stored as its column-domain code.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// Column-major codes, `codes[col][row]`.
    pub codes: Vec<Vec<u32>>,
    /// True row count, or an externally supplied estimate.
    pub cardinality: usize,
}

impl Table {
    /// Build a table from parsed rows, computing each column's sorted domain.
    pub fn from_rows(name: &str, headers: &[String], rows: &[Vec<Value>]) -> Result<Self> {
        let mut domains: Vec<BTreeSet<Value>> = vec![BTreeSet::new(); headers.len()];
        for (r, row) in rows.iter().enumerate() {
            if row.len() != headers.len() {
                return Err(CardEstError::InvalidState(format!(
                    "table `{name}` row {r} has {} cells, expected {}",
                    row.len(),
                    headers.len()
                )));
            }
            for (c, v) in row.iter().enumerate() {
                domains[c].insert(v.clone());
            }
        }

        let columns: Vec<Column> = headers
            .iter()
            .zip(domains)
            .map(|(h, d)| Column::new(h.clone(), name, d.into_iter().collect()))
            .collect();

        let mut codes = vec![Vec::with_capacity(rows.len()); columns.len()];
        for row in rows {
            for (c, v) in row.iter().enumerate() {
                let code = columns[c]
                    .code_of(v)
                    .ok_or_else(|| CardEstError::InvalidState(format!("value {v} missing from domain")))?;
                codes[c].push(code);
            }
        }

        Ok(Self {
            name: name.to_string(),
            columns,
            codes,
            cardinality: rows.len(),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.codes.first().map_or(0, Vec::len)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn domain_sizes(&self) -> Vec<usize> {
        self.columns.iter().map(Column::distribution_size).collect()
    }

    /// Columns and cardinality without the row data.
    pub fn schema(&self) -> Table {
        Table {
            name: self.name.clone(),
            columns: self.columns.clone(),
            codes: Vec::new(),
            cardinality: self.cardinality,
        }
    }

    pub fn row(&self, r: usize) -> Vec<u32> {
        self.codes.iter().map(|col| col[r]).collect()
    }
}

/// A batch of tuples, row-major `[rows, cols]` codes.
#[derive(Debug, Clone)]
pub struct TupleBatch {
    pub codes: Vec<u32>,
    pub rows: usize,
    pub cols: usize,
}

/// Source of training tuples for one epoch.
pub trait TupleStream {
    fn num_columns(&self) -> usize;

    /// Tuples per full pass, `None` for unbounded join samplers (which then
    /// require a step budget).
    fn len_hint(&self) -> Option<usize>;

    fn start_epoch(&mut self, shuffle: bool);

    fn next_batch(&mut self, batch_size: usize) -> Option<TupleBatch>;
}

/// Finite stream over a table's rows.
pub struct TableDataset {
    rows: Vec<u32>,
    num_rows: usize,
    cols: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl TableDataset {
    pub fn new(table: &Table, seed: u64) -> Self {
        let num_rows = table.num_rows();
        let cols = table.num_columns();
        let mut rows = Vec::with_capacity(num_rows * cols);
        for r in 0..num_rows {
            rows.extend(table.codes.iter().map(|col| col[r]));
        }
        Self {
            rows,
            num_rows,
            cols,
            order: (0..num_rows).collect(),
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl TupleStream for TableDataset {
    fn num_columns(&self) -> usize {
        self.cols
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.num_rows)
    }

    fn start_epoch(&mut self, shuffle: bool) {
        self.cursor = 0;
        if shuffle {
            self.order.shuffle(&mut self.rng);
        } else {
            self.order.sort_unstable();
        }
    }

    fn next_batch(&mut self, batch_size: usize) -> Option<TupleBatch> {
        if self.cursor >= self.num_rows || batch_size == 0 {
            return None;
        }
        let end = (self.cursor + batch_size).min(self.num_rows);
        let mut codes = Vec::with_capacity((end - self.cursor) * self.cols);
        for &r in &self.order[self.cursor..end] {
            codes.extend_from_slice(&self.rows[r * self.cols..(r + 1) * self.cols]);
        }
        let rows = end - self.cursor;
        self.cursor = end;
        Some(TupleBatch {
            codes,
            rows,
            cols: self.cols,
        })
    }
}
