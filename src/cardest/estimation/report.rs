//! Per-estimator aggregates and result exports.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::evaluation::{QueryRecord, RunLog};
use crate::cardest::error::Result;

/// Linear-interpolated quantile of an ascending slice, `q` in `[0, 100]`.
/// `NaN` for an empty slice.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = (q / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorReport {
    pub name: String,
    pub max: f64,
    pub p99: f64,
    pub p95: f64,
    pub median: f64,
    pub records: Vec<QueryRecord>,
}

#[derive(Serialize)]
struct CsvRow {
    errs: f64,
    est_cards: f64,
    true_cards: f64,
    query_dur_ms: f64,
    query_prep_ms: f64,
}

impl EstimatorReport {
    /// Aggregates cover answered queries only.
    pub fn from_log(name: impl Into<String>, log: &RunLog) -> Self {
        let mut errors = log.errors();
        errors.sort_by(f64::total_cmp);
        Self {
            name: name.into(),
            max: errors.last().copied().unwrap_or(f64::NAN),
            p99: percentile(&errors, 99.0),
            p95: percentile(&errors, 95.0),
            median: percentile(&errors, 50.0),
            records: log.records().to_vec(),
        }
    }

    pub fn num_queries(&self) -> usize {
        self.records.len()
    }

    pub fn unsupported(&self) -> Vec<usize> {
        self.records
            .iter()
            .filter(|r| r.unsupported.is_some())
            .map(|r| r.index)
            .collect()
    }

    /// Insert `{name}_{max,p99,p95,median}` into `results`.
    pub fn extend_results(&self, results: &mut BTreeMap<String, f64>) {
        for (suffix, value) in [
            ("max", self.max),
            ("p99", self.p99),
            ("p95", self.p95),
            ("median", self.median),
        ] {
            results.insert(format!("{}_{}", self.name, suffix), value);
        }
    }

    pub fn log_summary(&self) {
        info!(
            "{}: {} queries ({} unsupported), median {:.3}, p95 {:.3}, p99 {:.3}, max {:.3}",
            self.name,
            self.num_queries(),
            self.unsupported().len(),
            self.median,
            self.p95,
            self.p99,
            self.max
        );
    }

    /// Per-query series as `{dir}/{workload}_{name}.csv`. Unsupported rows
    /// carry their sentinel code in `errs`.
    pub fn write_csv(&self, dir: &Path, workload: &str) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_{}.csv", workload, self.name));
        let mut writer = csv::Writer::from_path(&path)?;
        for r in &self.records {
            writer.serialize(CsvRow {
                errs: r.error.unwrap_or_else(|| f64::from(r.unsupported.unwrap_or_default())),
                est_cards: r.est_card,
                true_cards: r.true_card,
                query_dur_ms: r.dur_ms,
                query_prep_ms: r.prep_ms,
            })?;
        }
        writer.flush()?;
        Ok(path)
    }
}

/// Unsupported query indices per estimator, `{dir}/{workload}_err_queries.txt`.
pub fn write_error_summary(reports: &[EstimatorReport], dir: &Path, workload: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{workload}_err_queries.txt"));
    let mut file = fs::File::create(&path)?;
    for report in reports {
        let indices: Vec<String> = report.unsupported().iter().map(usize::to_string).collect();
        writeln!(file, "{}\t{}", report.name, indices.join(","))?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 100.0), 4.0);
        assert!((percentile(&v, 50.0) - 2.5).abs() < 1e-12);
        assert!(percentile(&[], 50.0).is_nan());
    }

    #[test]
    fn test_results_keys() {
        let report = EstimatorReport {
            name: "psample_100".into(),
            max: 3.0,
            p99: 2.9,
            p95: 2.5,
            median: 1.2,
            records: Vec::new(),
        };
        let mut results = BTreeMap::new();
        report.extend_results(&mut results);
        assert_eq!(results["psample_100_max"], 3.0);
        assert_eq!(results["psample_100_median"], 1.2);
        assert_eq!(results.len(), 4);
    }
}
