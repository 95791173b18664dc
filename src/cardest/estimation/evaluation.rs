//! Workload evaluation: ground truth, per-estimator answers, failure
//! isolation and aggregate reports.

use serde::Serialize;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Once;
use std::time::Instant;
use tracing::{error, info, warn};

use super::report::{percentile, EstimatorReport};
use super::{CardinalityEstimator, QueryOutcome, UNSUPPORTED_FAILED, UNSUPPORTED_PREFLAGGED};
use crate::cardest::data::Workload;
use crate::cardest::error::{CardEstError, Result};

/// Symmetric multiplicative error, `1.0` meaning exact. A single zero side
/// yields the other side's value.
pub fn error_metric(est: f64, truth: f64) -> f64 {
    match (est == 0.0, truth == 0.0) {
        (true, true) => 1.0,
        (true, false) => truth,
        (false, true) => est,
        (false, false) => (est / truth).max(truth / est),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryRecord {
    pub index: usize,
    /// `None` when the query was not answered.
    pub error: Option<f64>,
    pub est_card: f64,
    pub true_card: f64,
    pub dur_ms: f64,
    pub prep_ms: f64,
    pub unsupported: Option<i32>,
}

/// Append-only per-estimator log for one evaluation round.
#[derive(Debug, Default, Clone)]
pub struct RunLog {
    records: Vec<QueryRecord>,
}

impl RunLog {
    pub fn push(&mut self, record: QueryRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[QueryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Errors of answered queries, in query order.
    pub fn errors(&self) -> Vec<f64> {
        self.records.iter().filter_map(|r| r.error).collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "estimator panicked".to_string()
    }
}

thread_local! {
    /// Backtrace of the latest panic on this thread.
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static TRACE_HOOK: Once = Once::new();

/// Chain a panic hook that keeps each thread's latest backtrace so a caught
/// estimator panic can be logged with it.
fn install_trace_hook() {
    TRACE_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_PANIC_TRACE.with(|t| *t.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    LAST_PANIC_TRACE.with(|t| t.borrow_mut().take())
}

pub struct EvaluationLoop {
    workload_name: String,
    report_every: usize,
    output_dir: Option<PathBuf>,
}

impl EvaluationLoop {
    pub fn new(workload_name: impl Into<String>) -> Self {
        Self {
            workload_name: workload_name.into(),
            report_every: 100,
            output_dir: None,
        }
    }

    pub fn with_report_every(mut self, every: usize) -> Self {
        self.report_every = every;
        self
    }

    /// Directory for the per-workload error trace log. Without one,
    /// failures only reach the tracing output.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn error_log_path(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|d| d.join(format!("{}_err_query_trace.log", self.workload_name)))
    }

    /// Append one failure entry, with the panic backtrace when there is one.
    /// A log that cannot be written is reported and skipped.
    fn log_failure(&self, index: usize, estimator: &str, reason: &str, trace: Option<&str>) {
        error!("Query {} failed for {}: {}", index, estimator, reason);
        let Some(path) = self.error_log_path() else {
            return;
        };
        let written = (|| -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "err - {index}\t{estimator}\t{reason}")?;
            if let Some(trace) = trace {
                writeln!(file, "panic trace:")?;
                for line in trace.lines() {
                    writeln!(file, "    {line}")?;
                }
            }
            Ok(())
        })();
        if let Err(err) = written {
            warn!("Could not append to error log {:?}: {}", path, err);
        }
    }

    /// Cardinalities from the workload itself, with the oracle filling in
    /// answerable queries that carry none.
    fn ground_truth(
        &self,
        workload: &Workload,
        mut oracle: Option<&mut dyn CardinalityEstimator>,
    ) -> Result<Vec<Option<f64>>> {
        if workload.needs_oracle() && oracle.is_none() {
            return Err(CardEstError::InvalidState(format!(
                "workload `{}` lacks true cardinalities and no oracle was given",
                workload.name
            )));
        }
        let mut truths = Vec::with_capacity(workload.len());
        for (i, query) in workload.queries.iter().enumerate() {
            if workload.unsupported.contains(&i) {
                truths.push(None);
                continue;
            }
            if let Some(card) = workload.true_card(i) {
                truths.push(Some(card));
                continue;
            }
            let Some(oracle) = oracle.as_deref_mut() else {
                truths.push(None);
                continue;
            };
            match oracle.query(query) {
                QueryOutcome::Estimated { cardinality, .. } => truths.push(Some(cardinality)),
                QueryOutcome::Unsupported { reason, .. } => {
                    warn!("Oracle could not answer query {}: {}", i, reason);
                    truths.push(None);
                }
            }
        }
        Ok(truths)
    }

    /// Run every estimator over the workload. Per-query failures are
    /// recorded and never abort the round.
    pub fn evaluate(
        &self,
        estimators: &mut [Box<dyn CardinalityEstimator>],
        workload: &Workload,
        oracle: Option<&mut dyn CardinalityEstimator>,
    ) -> Result<Vec<EstimatorReport>> {
        let truths = self.ground_truth(workload, oracle)?;
        install_trace_hook();
        let mut logs: Vec<RunLog> = vec![RunLog::default(); estimators.len()];

        for (i, query) in workload.queries.iter().enumerate() {
            let truth = if workload.unsupported.contains(&i) {
                None
            } else {
                truths.get(i).copied().flatten()
            };
            for (estimator, log) in estimators.iter_mut().zip(logs.iter_mut()) {
                let name = estimator.name();
                let mut record = QueryRecord {
                    index: i,
                    error: None,
                    est_card: f64::NAN,
                    true_card: truth.unwrap_or(f64::NAN),
                    dur_ms: 0.0,
                    prep_ms: 0.0,
                    unsupported: None,
                };

                let Some(truth) = truth else {
                    record.unsupported = Some(UNSUPPORTED_PREFLAGGED);
                    log.push(record);
                    continue;
                };

                estimator.release_memory();
                let started = Instant::now();
                take_panic_trace();
                let mut trace = None;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| estimator.query(query))).unwrap_or_else(|payload| {
                    trace = take_panic_trace();
                    QueryOutcome::failed(panic_message(payload.as_ref()))
                });
                record.dur_ms = started.elapsed().as_secs_f64() * 1e3;
                estimator.release_memory();

                match outcome {
                    QueryOutcome::Estimated { cardinality, prep_ms } => {
                        record.est_card = cardinality;
                        record.prep_ms = prep_ms;
                        record.error = Some(error_metric(cardinality, truth));
                    }
                    QueryOutcome::Unsupported { code, reason } => {
                        record.unsupported = Some(code);
                        if code == UNSUPPORTED_FAILED {
                            self.log_failure(i, &name, &reason, trace.as_deref());
                        }
                    }
                }
                log.push(record);
            }

            let done = i + 1;
            if self.report_every > 0 && done % self.report_every == 0 {
                for (estimator, log) in estimators.iter().zip(&logs) {
                    let mut errors = log.errors();
                    errors.sort_by(f64::total_cmp);
                    info!(
                        "{} after {} queries: median {:.3}, p95 {:.3}, max {:.3}",
                        estimator.name(),
                        done,
                        percentile(&errors, 50.0),
                        percentile(&errors, 95.0),
                        errors.last().copied().unwrap_or(f64::NAN)
                    );
                }
            }
        }

        Ok(estimators
            .iter()
            .zip(&logs)
            .map(|(estimator, log)| EstimatorReport::from_log(estimator.name(), log))
            .collect())
    }
}
