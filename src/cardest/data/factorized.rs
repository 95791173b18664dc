//! Column factorization: wide domains are split into fixed-width words so
//! the density model predicts several small distributions instead of one
//! huge one.

use super::table::{Column, FactorInfo, Table, TupleBatch, TupleStream};
use super::value::Value;

#[derive(Debug, Clone)]
pub struct FactorizedTable {
    /// The unfactorized table that queries are written against.
    pub original: Table,
    /// Training view: one column per sub-variable (or the column itself when
    /// it fits in a single word). Virtual join columns are never split.
    pub table: Table,
    /// original column index -> training column indices, most significant
    /// word first.
    pub fact_col_mapping: Vec<Vec<usize>>,
    pub word_size_bits: u32,
}

/// Number of bits needed to represent codes `0..domain_size`.
fn code_bits(domain_size: usize) -> u32 {
    if domain_size <= 1 {
        1
    } else {
        usize::BITS - (domain_size - 1).leading_zeros()
    }
}

impl FactorizedTable {
    pub fn new(original: Table, word_size_bits: u32) -> Self {
        let limit = 1usize << word_size_bits;
        let mut columns = Vec::new();
        let mut codes = Vec::new();
        let mut fact_col_mapping = Vec::with_capacity(original.num_columns());

        for (c, column) in original.columns.iter().enumerate() {
            let size = column.distribution_size();
            if size <= limit || column.role.is_virtual() {
                fact_col_mapping.push(vec![columns.len()]);
                columns.push(column.clone());
                codes.push(original.codes.get(c).cloned().unwrap_or_default());
                continue;
            }

            let num_subs = code_bits(size).div_ceil(word_size_bits) as usize;
            let mut group = Vec::with_capacity(num_subs);
            for sub_index in 0..num_subs {
                let shift = (num_subs - 1 - sub_index) as u32 * word_size_bits;
                let info = FactorInfo {
                    original: c,
                    sub_index,
                    num_subs,
                    shift,
                    word_bits: word_size_bits,
                };
                let sub_size = if sub_index == 0 {
                    ((size - 1) >> shift) + 1
                } else {
                    limit
                };
                let domain = (0..sub_size as i64).map(Value::Int).collect();
                let mut sub = Column::new(
                    format!("{}_fact_{}", column.name, sub_index),
                    column.table.clone(),
                    domain,
                );
                sub.role = column.role;
                sub.factor = Some(info);

                group.push(columns.len());
                codes.push(
                    original
                        .codes
                        .get(c)
                        .map_or_else(Vec::new, |col| col.iter().map(|&v| info.digit(v)).collect()),
                );
                columns.push(sub);
            }
            fact_col_mapping.push(group);
        }

        let table = Table {
            name: original.name.clone(),
            columns,
            codes,
            cardinality: original.cardinality,
        };
        Self {
            original,
            table,
            fact_col_mapping,
            word_size_bits,
        }
    }

    /// Groups of training indices that must stay contiguous in any ordering.
    pub fn factor_groups(&self) -> Vec<Vec<usize>> {
        self.fact_col_mapping
            .iter()
            .filter(|g| g.len() > 1)
            .cloned()
            .collect()
    }

    /// Wrap a stream of original-schema tuples so it yields training tuples.
    pub fn wrap_stream(&self, inner: Box<dyn TupleStream>) -> FactorizedStream {
        let mut layout = vec![(0, None); self.table.num_columns()];
        for (original, group) in self.fact_col_mapping.iter().enumerate() {
            for &t in group {
                layout[t] = (original, self.table.columns[t].factor);
            }
        }
        FactorizedStream { inner, layout }
    }
}

/// Re-encodes batches of an unfactorized stream (e.g. a join sampler) into
/// sub-variable codes.
pub struct FactorizedStream {
    inner: Box<dyn TupleStream>,
    /// training column -> (original column, word extraction)
    layout: Vec<(usize, Option<FactorInfo>)>,
}

impl TupleStream for FactorizedStream {
    fn num_columns(&self) -> usize {
        self.layout.len()
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }

    fn start_epoch(&mut self, shuffle: bool) {
        self.inner.start_epoch(shuffle);
    }

    fn next_batch(&mut self, batch_size: usize) -> Option<TupleBatch> {
        let batch = self.inner.next_batch(batch_size)?;
        let cols = self.layout.len();
        let mut codes = Vec::with_capacity(batch.rows * cols);
        for row in batch.codes.chunks(batch.cols) {
            codes.extend(self.layout.iter().map(|&(c, info)| match info {
                Some(info) => info.digit(row[c]),
                None => row[c],
            }));
        }
        Some(TupleBatch {
            codes,
            rows: batch.rows,
            cols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide_table(n: i64) -> Table {
        let headers = vec!["id".to_string(), "flag".to_string()];
        let rows: Vec<Vec<Value>> = (0..n)
            .map(|i| vec![Value::Int(i), Value::Int(i % 2)])
            .collect();
        Table::from_rows("wide", &headers, &rows).unwrap()
    }

    #[test]
    fn test_code_bits() {
        assert_eq!(code_bits(1), 1);
        assert_eq!(code_bits(2), 1);
        assert_eq!(code_bits(1000), 10);
        assert_eq!(code_bits(1024), 10);
        assert_eq!(code_bits(1025), 11);
    }

    #[test]
    fn test_split_into_words() {
        let fact = FactorizedTable::new(wide_table(1000), 4);

        assert_eq!(fact.fact_col_mapping, vec![vec![0, 1, 2], vec![3]]);
        assert_eq!(fact.table.domain_sizes(), vec![4, 16, 16, 2]);
        assert_eq!(fact.factor_groups(), vec![vec![0, 1, 2]]);

        // Code 999 = 0b11_1110_0111.
        let row = fact.table.row(999);
        assert_eq!(&row[..3], &[3, 14, 7]);
    }

    #[test]
    fn test_digits_recombine() {
        let fact = FactorizedTable::new(wide_table(300), 3);
        let group = &fact.fact_col_mapping[0];
        for r in [0usize, 17, 255, 299] {
            let code = group.iter().fold(0u32, |acc, &c| {
                (acc << fact.word_size_bits) | fact.table.codes[c][r]
            });
            assert_eq!(code, fact.original.codes[0][r]);
        }
    }

    #[test]
    fn test_wrapped_stream_matches_training_table() {
        use crate::cardest::data::TableDataset;

        let fact = FactorizedTable::new(wide_table(40), 2);
        let mut stream = fact.wrap_stream(Box::new(TableDataset::new(&fact.original, 0)));
        stream.start_epoch(false);

        let batch = stream.next_batch(40).unwrap();
        assert_eq!(batch.cols, fact.table.num_columns());
        for r in 0..40 {
            assert_eq!(&batch.codes[r * batch.cols..(r + 1) * batch.cols], fact.table.row(r).as_slice());
        }
    }
}
