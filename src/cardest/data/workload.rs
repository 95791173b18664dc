//! Query workload files.
//!
//! One query per line, four `#`-separated fields:
//!
//! ```text
//! title,movie_info#title.id=movie_info.movie_id#title.year,>,2000,movie_info.info_type_id,=,3#1042
//! ```
//!
//! tables, join clauses, flat `column,op,value` predicate triples, and the
//! true cardinality (empty when unknown). Lines that cannot be fully understood are kept and
//! flagged unsupported by index so query numbering stays aligned with the
//! file.

use rand::{rngs::StdRng, seq::index, Rng, SeedableRng};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::query::{resolve_column, Query};
use super::table::Table;
use super::value::{Op, Value};
use crate::cardest::error::{CardEstError, Result};

#[derive(Debug, Clone, Default)]
pub struct Workload {
    pub name: String,
    pub queries: Vec<Query>,
    /// Oracle cardinalities, parallel to `queries`; `None` where a line
    /// carries none (or was flagged).
    pub true_cards: Vec<Option<f64>>,
    /// Indices of queries that are known up front to be unanswerable.
    pub unsupported: BTreeSet<usize>,
}

impl Workload {
    pub fn from_queries(name: &str, queries: Vec<Query>, true_cards: Option<Vec<f64>>) -> Self {
        let true_cards = match true_cards {
            Some(cards) => cards.into_iter().map(Some).collect(),
            None => vec![None; queries.len()],
        };
        Self {
            name: name.to_string(),
            queries,
            true_cards,
            unsupported: BTreeSet::new(),
        }
    }

    pub fn true_card(&self, index: usize) -> Option<f64> {
        self.true_cards.get(index).copied().flatten()
    }

    /// Whether some answerable query has no cardinality of its own and
    /// needs an oracle.
    pub fn needs_oracle(&self) -> bool {
        (0..self.len()).any(|i| !self.unsupported.contains(&i) && self.true_card(i).is_none())
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Load a workload file, validating predicate columns against `schema`.
    pub fn load(path: &Path, name: &str, schema: &Table) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut queries = Vec::new();
        let mut cards = Vec::new();
        let mut unsupported = BTreeSet::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let index = queries.len();
            match parse_line(line, schema) {
                Ok((query, card)) => {
                    queries.push(query);
                    cards.push(card);
                }
                Err(err) => {
                    warn!("Query {index} flagged unsupported: {err}");
                    queries.push(Query::default());
                    cards.push(None);
                    unsupported.insert(index);
                }
            }
        }

        info!(
            "Loaded workload `{name}`: {} queries, {} pre-flagged unsupported",
            queries.len(),
            unsupported.len()
        );
        Ok(Self {
            name: name.to_string(),
            queries,
            true_cards: cards,
            unsupported,
        })
    }

    /// Random conjunctive queries anchored on sampled rows of `table`, so
    /// every query matches at least one row. Small domains get equality
    /// predicates, wider ones a mix of `=`, `<=` and `>=`. True
    /// cardinalities are left to an oracle.
    pub fn generate(name: &str, table: &Table, num_queries: usize, seed: u64) -> Result<Self> {
        let content: Vec<usize> = (0..table.num_columns())
            .filter(|&c| !table.columns[c].role.is_virtual())
            .collect();
        if content.is_empty() || table.num_rows() == 0 {
            return Err(CardEstError::InvalidState(format!(
                "cannot generate queries over `{}`: no content columns or rows",
                table.name
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let max_filters = content.len().min(5);
        let min_filters = content.len().min(2);
        let mut queries = Vec::with_capacity(num_queries);
        for _ in 0..num_queries {
            let row = rng.random_range(0..table.num_rows());
            let k = rng.random_range(min_filters..=max_filters);
            let mut picked: Vec<usize> = index::sample(&mut rng, content.len(), k)
                .into_iter()
                .map(|i| content[i])
                .collect();
            picked.sort_unstable();

            let mut columns = Vec::with_capacity(k);
            let mut ops = Vec::with_capacity(k);
            let mut values = Vec::with_capacity(k);
            let mut tables = BTreeSet::new();
            for c in picked {
                let column = &table.columns[c];
                let value = &column.domain[table.codes[c][row] as usize];
                if matches!(value, Value::Null) {
                    continue;
                }
                let op = if column.distribution_size() < 10 {
                    Op::Eq
                } else {
                    [Op::Eq, Op::Le, Op::Ge][rng.random_range(0..3)]
                };
                columns.push(column.name.clone());
                ops.push(op);
                values.push(value.clone());
                tables.insert(column.table.clone());
            }
            queries.push(Query::new(columns, ops, values).with_tables(tables.into_iter().collect()));
        }
        info!("Generated {} queries over `{}`", queries.len(), table.name);
        Ok(Self::from_queries(name, queries, None))
    }

    /// Keep only the first `n` queries.
    pub fn truncate(&mut self, n: usize) {
        self.queries.truncate(n);
        self.true_cards.truncate(n);
        self.unsupported.retain(|&i| i < n);
    }
}

fn parse_line(line: &str, schema: &Table) -> Result<(Query, Option<f64>)> {
    let fields: Vec<&str> = line.split('#').collect();
    if fields.len() != 4 {
        return Err(CardEstError::InvalidQuery(format!(
            "expected 4 `#`-separated fields, got {}",
            fields.len()
        )));
    }

    let tables: Vec<String> = fields[0]
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let parts: Vec<&str> = fields[2].split(',').map(str::trim).collect();
    let parts = if parts.len() == 1 && parts[0].is_empty() {
        Vec::new()
    } else {
        parts
    };
    if parts.len() % 3 != 0 {
        return Err(CardEstError::InvalidQuery(format!(
            "predicate list has {} items, not a multiple of 3",
            parts.len()
        )));
    }

    let mut columns = Vec::new();
    let mut ops = Vec::new();
    let mut values = Vec::new();
    for triple in parts.chunks(3) {
        if resolve_column(schema, triple[0]).is_none() {
            return Err(CardEstError::UnknownColumn(triple[0].to_string()));
        }
        columns.push(triple[0].to_string());
        ops.push(triple[1].parse::<Op>()?);
        values.push(Value::parse_cell(triple[2]));
    }

    let card = match fields[3].trim() {
        "" => None,
        raw => Some(raw.parse::<f64>().map_err(|_| {
            CardEstError::InvalidQuery(format!("unparsable cardinality `{raw}`"))
        })?),
    };

    Ok((Query::new(columns, ops, values).with_tables(tables), card))
}
