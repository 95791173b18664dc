use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::table::Table;
use super::value::Value;
use crate::cardest::error::{CardEstError, Result};

/// Loads one table of a dataset, already discretised.
pub trait DatasetLoader {
    fn load(&self, dataset: &str, table: &str, use_cols: Option<&[String]>) -> Result<Table>;
}

/// Reads `{data_dir}/{table}.csv` with a header row.
#[derive(Debug, Clone)]
pub struct CsvDatasetLoader {
    data_dir: PathBuf,
}

impl CsvDatasetLoader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.data_dir.join(format!("{table}.csv"))
    }

    fn read(path: &Path, name: &str, use_cols: Option<&[String]>) -> Result<Table> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let projection: Vec<usize> = match use_cols {
            Some(cols) => cols
                .iter()
                .map(|c| {
                    headers
                        .iter()
                        .position(|h| h == c)
                        .ok_or_else(|| CardEstError::UnknownColumn(format!("{name}.{c}")))
                })
                .collect::<Result<_>>()?,
            None => (0..headers.len()).collect(),
        };
        let kept: Vec<String> = projection.iter().map(|&i| headers[i].clone()).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                projection
                    .iter()
                    .map(|&i| Value::parse_cell(record.get(i).unwrap_or("")))
                    .collect::<Vec<_>>(),
            );
        }
        debug!("Read {} rows x {} columns from {:?}", rows.len(), kept.len(), path);
        Table::from_rows(name, &kept, &rows)
    }
}

impl DatasetLoader for CsvDatasetLoader {
    fn load(&self, dataset: &str, table: &str, use_cols: Option<&[String]>) -> Result<Table> {
        let path = self.table_path(table);
        let loaded = Self::read(&path, table, use_cols)?;
        info!(
            "Loaded {dataset}/{table}: {} rows, domain sizes {:?}",
            loaded.cardinality,
            loaded.domain_sizes()
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_with_projection() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("cars.csv"),
            "make,year,price\nvw,2001,1.5\nbmw,,2.0\nvw,2003,1.5\n",
        )
        .unwrap();

        let loader = CsvDatasetLoader::new(dir.path());
        let cols = vec!["year".to_string(), "make".to_string()];
        let table = loader.load("synthetic", "cars", Some(&cols)).unwrap();

        assert_eq!(table.cardinality, 3);
        assert_eq!(table.columns[0].name, "year");
        assert_eq!(table.columns[0].domain[0], Value::Null);
        assert_eq!(table.domain_sizes(), vec![3, 2]);
    }

    #[test]
    fn test_unknown_projection_column() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.csv"), "a\n1\n").unwrap();
        let loader = CsvDatasetLoader::new(dir.path());
        let err = loader
            .load("synthetic", "t", Some(&["b".to_string()]))
            .unwrap_err();
        assert!(matches!(err, CardEstError::UnknownColumn(_)));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = CsvDatasetLoader::new(dir.path());
        assert!(loader.load("synthetic", "absent", None).is_err());
    }
}
