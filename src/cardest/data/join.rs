//! Join description and a star-schema join sampler.
//!
//! The sampler draws tuples uniformly from the left outer join of the root
//! table with every child table, without materialising it. Each joined tuple
//! carries `__in_<table>` indicator columns and, per child, a
//! `__fanout_<table>` column holding how many child tuples matched the root
//! tuple's key. Estimators divide by the fanout of tables a query does not
//! touch to turn probabilities over the full join into cardinalities of the
//! queried sub-join.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::table::{Column, Table, TupleBatch, TupleStream};
use super::value::Value;
use crate::cardest::error::{CardEstError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub tables: Vec<String>,
    /// Table whose tuples anchor every joined row.
    pub root: String,
    /// table -> join key columns (only the first key is used by the star sampler)
    pub keys: BTreeMap<String, Vec<String>>,
}

impl JoinSpec {
    pub fn single(table: &str) -> Self {
        Self {
            tables: vec![table.to_string()],
            root: table.to_string(),
            keys: BTreeMap::new(),
        }
    }

    pub fn is_single(&self) -> bool {
        self.tables.len() == 1
    }

    fn key_of(&self, table: &str) -> Result<&str> {
        self.keys
            .get(table)
            .and_then(|k| k.first())
            .map(String::as_str)
            .ok_or_else(|| {
                CardEstError::invalid_setting("join_keys", format!("no join key for `{table}`"))
            })
    }
}

/// Supplies the true join cardinality and the training stream for
/// multi-table joins.
pub trait JoinSampler {
    fn join_card(&self) -> usize;

    /// Schema (and, for small joins, contents) of the joined relation.
    fn table(&self) -> &Table;

    fn stream(&self, seed: u64) -> Box<dyn TupleStream>;
}

struct ChildIndex {
    table: Table,
    /// Per column: 1 when a NULL code was prepended to the joined domain.
    null_offsets: Vec<u32>,
    /// root row -> matching child rows
    matches: Vec<Vec<usize>>,
    fanout_domain: Vec<usize>,
}

struct JoinIndex {
    root: Table,
    children: Vec<ChildIndex>,
    /// Prefix sums of per-root-row join multiplicity.
    cumulative: Vec<u64>,
    num_columns: usize,
}

impl JoinIndex {
    /// Codes of one joined row given the chosen child row per child.
    fn encode(&self, root_row: usize, picks: &[Option<usize>], out: &mut Vec<u32>) {
        out.extend(self.root.codes.iter().map(|col| col[root_row]));
        for (child, pick) in self.children.iter().zip(picks) {
            match pick {
                Some(m) => out.extend(
                    child
                        .table
                        .codes
                        .iter()
                        .zip(&child.null_offsets)
                        .map(|(col, off)| col[*m] + off),
                ),
                None => out.extend(std::iter::repeat(0).take(child.table.num_columns())),
            }
        }
        // Root indicator, then one per child.
        out.push(1);
        out.extend(picks.iter().map(|p| u32::from(p.is_some())));
        for child in &self.children {
            let fanout = child.matches[root_row].len().max(1);
            let code = child.fanout_domain.binary_search(&fanout).unwrap_or(0);
            out.push(code as u32);
        }
    }
}

pub struct StarJoinSampler {
    index: Arc<JoinIndex>,
    schema: Table,
    join_card: usize,
}

impl StarJoinSampler {
    /// `tables` must be given in `spec.tables` order.
    pub fn new(spec: &JoinSpec, tables: Vec<Table>) -> Result<Self> {
        if tables.len() != spec.tables.len() {
            return Err(CardEstError::InvalidState(format!(
                "join over {} tables received {}",
                spec.tables.len(),
                tables.len()
            )));
        }
        let mut root = None;
        let mut others = Vec::new();
        for table in tables {
            if table.name == spec.root {
                root = Some(table);
            } else {
                others.push(table);
            }
        }
        let root = root.ok_or_else(|| {
            CardEstError::invalid_setting("join_root", format!("`{}` is not a join table", spec.root))
        })?;
        let root_key_name = spec.key_of(&root.name)?;
        let root_key = root
            .column_index(root_key_name)
            .ok_or_else(|| CardEstError::UnknownColumn(format!("{}.{root_key_name}", root.name)))?;

        let mut children = Vec::with_capacity(others.len());
        for table in others {
            let key_name = spec.key_of(&table.name)?;
            let key = table
                .column_index(key_name)
                .ok_or_else(|| CardEstError::UnknownColumn(format!("{}.{key_name}", table.name)))?;

            let mut by_key: BTreeMap<&Value, Vec<usize>> = BTreeMap::new();
            for (r, &code) in table.codes[key].iter().enumerate() {
                let v = &table.columns[key].domain[code as usize];
                if !v.is_null() {
                    by_key.entry(v).or_default().push(r);
                }
            }
            let matches: Vec<Vec<usize>> = root.codes[root_key]
                .iter()
                .map(|&code| {
                    let v = &root.columns[root_key].domain[code as usize];
                    by_key.get(v).cloned().unwrap_or_default()
                })
                .collect();
            let fanout_domain: Vec<usize> = matches
                .iter()
                .map(|m| m.len().max(1))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let null_offsets = table
                .columns
                .iter()
                .map(|c| u32::from(!c.domain.first().is_some_and(Value::is_null)))
                .collect();
            children.push(ChildIndex {
                table,
                null_offsets,
                matches,
                fanout_domain,
            });
        }

        let mut cumulative = Vec::with_capacity(root.num_rows());
        let mut total = 0u64;
        for r in 0..root.num_rows() {
            let weight: u64 = children
                .iter()
                .map(|c| c.matches[r].len().max(1) as u64)
                .product();
            total += weight;
            cumulative.push(total);
        }

        let schema_columns = Self::schema_columns(&root, &children);
        let index = JoinIndex {
            num_columns: schema_columns.len(),
            root,
            children,
            cumulative,
        };
        let join_card = total as usize;
        let schema = Table {
            name: spec.tables.join("-"),
            columns: schema_columns,
            codes: Vec::new(),
            cardinality: join_card,
        };
        Ok(Self {
            index: Arc::new(index),
            schema,
            join_card,
        })
    }

    fn schema_columns(root: &Table, children: &[ChildIndex]) -> Vec<Column> {
        let mut columns: Vec<Column> = root
            .columns
            .iter()
            .map(|c| Column::new(format!("{}.{}", root.name, c.name), root.name.clone(), c.domain.clone()))
            .collect();
        for child in children {
            for (c, &offset) in child.table.columns.iter().zip(&child.null_offsets) {
                let mut domain = c.domain.clone();
                if offset == 1 {
                    domain.insert(0, Value::Null);
                }
                columns.push(Column::new(
                    format!("{}.{}", child.table.name, c.name),
                    child.table.name.clone(),
                    domain,
                ));
            }
        }
        let indicator_domain = vec![Value::Int(0), Value::Int(1)];
        columns.push(Column::new(format!("__in_{}", root.name), root.name.clone(), indicator_domain.clone()));
        for child in children {
            columns.push(Column::new(
                format!("__in_{}", child.table.name),
                child.table.name.clone(),
                indicator_domain.clone(),
            ));
        }
        for child in children {
            let domain = child.fanout_domain.iter().map(|&f| Value::Int(f as i64)).collect();
            columns.push(Column::new(
                format!("__fanout_{}", child.table.name),
                child.table.name.clone(),
                domain,
            ));
        }
        columns
    }

    /// Enumerate every joined row into the schema table. Only sensible for
    /// small joins (tests, exact oracles).
    pub fn materialize(&self) -> Table {
        let index = &self.index;
        let mut codes: Vec<Vec<u32>> = vec![Vec::new(); index.num_columns];
        let mut row = Vec::with_capacity(index.num_columns);
        for r in 0..index.root.num_rows() {
            let choices: Vec<Vec<Option<usize>>> = index
                .children
                .iter()
                .map(|c| {
                    if c.matches[r].is_empty() {
                        vec![None]
                    } else {
                        c.matches[r].iter().copied().map(Some).collect()
                    }
                })
                .collect();
            let mut cursor = vec![0usize; choices.len()];
            loop {
                let picks: Vec<Option<usize>> =
                    cursor.iter().zip(&choices).map(|(&i, c)| c[i]).collect();
                row.clear();
                index.encode(r, &picks, &mut row);
                for (col, &code) in codes.iter_mut().zip(&row) {
                    col.push(code);
                }
                // Odometer increment over the child choices.
                let mut k = 0;
                while k < cursor.len() {
                    cursor[k] += 1;
                    if cursor[k] < choices[k].len() {
                        break;
                    }
                    cursor[k] = 0;
                    k += 1;
                }
                if k == cursor.len() {
                    break;
                }
            }
        }
        Table {
            codes,
            ..self.schema.clone()
        }
    }
}

impl JoinSampler for StarJoinSampler {
    fn join_card(&self) -> usize {
        self.join_card
    }

    fn table(&self) -> &Table {
        &self.schema
    }

    fn stream(&self, seed: u64) -> Box<dyn TupleStream> {
        Box::new(JoinStream {
            index: Arc::clone(&self.index),
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

/// Unbounded uniform sampler over the joined relation.
struct JoinStream {
    index: Arc<JoinIndex>,
    rng: StdRng,
}

impl TupleStream for JoinStream {
    fn num_columns(&self) -> usize {
        self.index.num_columns
    }

    fn len_hint(&self) -> Option<usize> {
        None
    }

    fn start_epoch(&mut self, _shuffle: bool) {}

    fn next_batch(&mut self, batch_size: usize) -> Option<TupleBatch> {
        let total = *self.index.cumulative.last()?;
        if total == 0 || batch_size == 0 {
            return None;
        }
        let cols = self.index.num_columns;
        let mut codes = Vec::with_capacity(batch_size * cols);
        for _ in 0..batch_size {
            let u = self.rng.random_range(0..total);
            let r = self.index.cumulative.partition_point(|&c| c <= u);
            let picks: Vec<Option<usize>> = self
                .index
                .children
                .iter()
                .map(|c| {
                    let m = &c.matches[r];
                    (!m.is_empty()).then(|| m[self.rng.random_range(0..m.len())])
                })
                .collect();
            self.index.encode(r, &picks, &mut codes);
        }
        Some(TupleBatch {
            codes,
            rows: batch_size,
            cols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, headers: &[&str], rows: Vec<Vec<i64>>) -> Table {
        let headers: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
        let rows: Vec<Vec<Value>> = rows
            .into_iter()
            .map(|r| r.into_iter().map(Value::Int).collect())
            .collect();
        Table::from_rows(name, &headers, &rows).unwrap()
    }

    fn spec() -> JoinSpec {
        let mut keys = BTreeMap::new();
        keys.insert("title".to_string(), vec!["id".to_string()]);
        keys.insert("cast".to_string(), vec!["movie_id".to_string()]);
        JoinSpec {
            tables: vec!["title".to_string(), "cast".to_string()],
            root: "title".to_string(),
            keys,
        }
    }

    fn sampler() -> StarJoinSampler {
        let title = table("title", &["id", "year"], vec![vec![1, 2000], vec![2, 2001], vec![3, 2002]]);
        let cast = table(
            "cast",
            &["movie_id", "role"],
            vec![vec![1, 10], vec![1, 11], vec![1, 12], vec![2, 10]],
        );
        StarJoinSampler::new(&spec(), vec![title, cast]).unwrap()
    }

    #[test]
    fn test_join_card_counts_outer_join_rows() {
        // title 1 -> 3 rows, title 2 -> 1 row, title 3 -> 1 unmatched row.
        assert_eq!(sampler().join_card(), 5);
    }

    #[test]
    fn test_schema_virtual_columns_trail() {
        let s = sampler();
        let names: Vec<&str> = s.table().columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "title.id",
                "title.year",
                "cast.movie_id",
                "cast.role",
                "__in_title",
                "__in_cast",
                "__fanout_cast"
            ]
        );
    }

    #[test]
    fn test_materialize_matches_join_card() {
        let s = sampler();
        let joined = s.materialize();
        assert_eq!(joined.num_rows(), 5);
        let in_cast = joined.column_index("__in_cast").unwrap();
        assert_eq!(joined.codes[in_cast].iter().filter(|&&c| c == 0).count(), 1);
    }

    #[test]
    fn test_stream_is_unbounded() {
        let s = sampler();
        let mut stream = s.stream(3);
        assert_eq!(stream.len_hint(), None);
        let batch = stream.next_batch(8).unwrap();
        assert_eq!(batch.rows, 8);
        assert_eq!(batch.codes.len(), 8 * stream.num_columns());
    }
}
