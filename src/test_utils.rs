// Test utilities: small tables, CSV fixtures and tensor builders.
//
// These helpers panic on malformed input; they are meant for tests and
// benchmarks only.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use std::path::{Path, PathBuf};

use crate::cardest::architectures::{Made, MadeConfig, Ordering};
use crate::cardest::data::{Table, Value};

/// Create an `[rows, cols]` code tensor from row-major codes.
pub fn codes_tensor<B: Backend>(codes: &[u32], rows: usize, cols: usize, device: &B::Device) -> Tensor<B, 2, Int> {
    assert_eq!(
        codes.len(),
        rows * cols,
        "Data length {} doesn't match shape [{}, {}]",
        codes.len(),
        rows,
        cols
    );
    let values: Vec<i64> = codes.iter().map(|&c| i64::from(c)).collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), device)
}

/// Build a table of integer cells.
pub fn int_table(name: &str, headers: &[&str], rows: &[Vec<i64>]) -> Table {
    let headers: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|r| r.iter().map(|&v| Value::Int(v)).collect())
        .collect();
    Table::from_rows(name, &headers, &rows).expect("well-formed fixture table")
}

/// `n` rows over three columns: `a = i % 4`, `b = a + (i / 4) % 2`,
/// `c = i % 3`. With `n >= 8` the domains have sizes 4, 5 and 3.
pub fn correlated_table(n: usize) -> Table {
    let rows: Vec<Vec<i64>> = (0..n as i64)
        .map(|i| {
            let a = i % 4;
            vec![a, a + (i / 4) % 2, i % 3]
        })
        .collect();
    int_table("corr", &["a", "b", "c"], &rows)
}

/// Write `{dir}/{name}.csv` with a header row, quoting cells as needed.
pub fn write_csv_table(dir: &Path, name: &str, headers: &[&str], rows: &[Vec<String>]) -> PathBuf {
    let path = dir.join(format!("{name}.csv"));
    let mut writer = csv::Writer::from_path(&path).expect("fixture csv created");
    writer.write_record(headers).expect("fixture header written");
    for row in rows {
        writer.write_record(row).expect("fixture row written");
    }
    writer.flush().expect("fixture csv flushed");
    path
}

/// A small MADE over `domain_sizes` with the given orderings.
pub fn tiny_made<B: Backend>(domain_sizes: Vec<usize>, orderings: Vec<Ordering>, device: &B::Device) -> Made<B> {
    MadeConfig::new(domain_sizes, 8, 32, 2, 0)
        .init::<B>(orderings, device)
        .expect("valid model config")
}
