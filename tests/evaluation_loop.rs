// tests/evaluation_loop.rs - Error metric, failure isolation and aggregate reports
use card_est_rs::cardest::data::{Op, Query, Value, Workload};
use card_est_rs::cardest::estimation::{
    error_metric, CardinalityEstimator, EvaluationLoop, QueryOutcome, TableScanOracle, UNSUPPORTED_FAILED,
    UNSUPPORTED_PREFLAGGED,
};
use card_est_rs::test_utils::correlated_table;
use std::collections::BTreeMap;
use std::fs;

/// Answers from a script, one entry per query; `None` panics.
struct Scripted {
    name: &'static str,
    answers: Vec<Option<QueryOutcome>>,
    next: usize,
    releases: usize,
}

impl Scripted {
    fn new(name: &'static str, answers: Vec<Option<QueryOutcome>>) -> Self {
        Self {
            name,
            answers,
            next: 0,
            releases: 0,
        }
    }
}

fn est(cardinality: f64) -> Option<QueryOutcome> {
    Some(QueryOutcome::Estimated {
        cardinality,
        prep_ms: 0.1,
    })
}

impl CardinalityEstimator for Scripted {
    fn name(&self) -> String {
        self.name.to_string()
    }

    fn query(&mut self, _query: &Query) -> QueryOutcome {
        let i = self.next;
        self.next += 1;
        match self.answers[i].clone() {
            Some(outcome) => outcome,
            None => panic!("scripted failure on query {i}"),
        }
    }

    fn release_memory(&mut self) {
        self.releases += 1;
    }
}

fn queries(n: usize) -> Vec<Query> {
    (0..n)
        .map(|i| Query::new(vec!["a".into()], vec![Op::Eq], vec![Value::Int(i as i64 % 4)]))
        .collect()
}

#[test]
fn test_error_metric_properties() {
    for t in [1.0, 3.5, 1000.0] {
        assert_eq!(error_metric(t, t), 1.0);
        assert_eq!(error_metric(0.0, t), t);
        assert_eq!(error_metric(t, 0.0), t);
        for e in [0.5, 2.0, 777.0] {
            assert_eq!(error_metric(e, t), error_metric(t, e));
            assert!(error_metric(e, t) >= 1.0);
        }
    }
    assert_eq!(error_metric(0.0, 0.0), 1.0);
    assert!((error_metric(950.0, 1000.0) - 1.0526).abs() < 1e-4);
}

#[test]
fn test_aggregates_over_three_queries() {
    let workload = Workload::from_queries("w", queries(3), Some(vec![100.0, 100.0, 100.0]));
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> =
        vec![Box::new(Scripted::new("fixed", vec![est(100.0), est(105.0), est(50.0)]))];

    let reports = EvaluationLoop::new("w").evaluate(&mut estimators, &workload, None).unwrap();
    let report = &reports[0];
    assert_eq!(report.num_queries(), 3);
    assert_eq!(report.max, 2.0);
    assert!((report.median - 1.05).abs() < 1e-12);

    let mut results = BTreeMap::new();
    report.extend_results(&mut results);
    assert_eq!(results["fixed_max"], 2.0);
}

#[test]
fn test_failing_query_does_not_abort_the_workload() {
    let dir = tempfile::tempdir().unwrap();
    let n = 5;
    let workload = Workload::from_queries("resilience", queries(n), Some(vec![10.0; n]));
    let answers = vec![est(10.0), est(20.0), None, Some(QueryOutcome::failed("bad literal")), est(5.0)];
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> = vec![Box::new(Scripted::new("scripted", answers))];

    let evaluation = EvaluationLoop::new("resilience").with_output_dir(dir.path());
    let reports = evaluation.evaluate(&mut estimators, &workload, None).unwrap();
    let records = &reports[0].records;

    assert_eq!(records.len(), n);
    assert_eq!(records[2].unsupported, Some(UNSUPPORTED_FAILED));
    assert_eq!(records[3].unsupported, Some(UNSUPPORTED_FAILED));
    assert_eq!(records[0].error, Some(1.0));
    assert_eq!(records[1].error, Some(2.0));
    assert_eq!(records[4].error, Some(2.0));
    assert_eq!(reports[0].unsupported(), vec![2, 3]);

    let trace = fs::read_to_string(evaluation.error_log_path().unwrap()).unwrap();
    assert!(trace.contains("err - 2\tscripted\tscripted failure on query 2"));
    assert!(trace.contains("err - 3\tscripted\tbad literal"));

    // The panicking query carries its backtrace; the returned failure does not.
    let panic_entry = trace.find("err - 2").unwrap();
    let failed_entry = trace.find("err - 3").unwrap();
    let backtrace = trace.find("panic trace:").unwrap();
    assert!(panic_entry < backtrace && backtrace < failed_entry);
    assert_eq!(trace.matches("panic trace:").count(), 1);
}

#[test]
fn test_unwritable_error_log_does_not_abort_the_workload() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the log directory should be.
    let blocker = dir.path().join("not_a_dir");
    fs::write(&blocker, "").unwrap();

    let workload = Workload::from_queries("w", queries(3), Some(vec![2.0; 3]));
    let answers = vec![None, Some(QueryOutcome::failed("x")), est(2.0)];
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> = vec![Box::new(Scripted::new("s", answers))];

    let reports = EvaluationLoop::new("w")
        .with_output_dir(blocker.join("logs"))
        .evaluate(&mut estimators, &workload, None)
        .unwrap();
    assert_eq!(reports[0].unsupported(), vec![0, 1]);
    assert_eq!(reports[0].records[2].error, Some(1.0));
}

#[test]
fn test_oracle_only_fills_missing_cardinalities() {
    let mut workload = Workload::from_queries("partial", queries(4), None);
    workload.true_cards = vec![Some(10.0), None, Some(30.0), None];
    workload.unsupported.insert(3);
    // One scripted answer: a second oracle call would panic.
    let mut oracle = Scripted::new("oracle", vec![est(20.0)]);
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> =
        vec![Box::new(Scripted::new("e", vec![est(10.0), est(10.0), est(30.0)]))];

    let reports = EvaluationLoop::new("partial")
        .evaluate(&mut estimators, &workload, Some(&mut oracle))
        .unwrap();
    let truths: Vec<f64> = reports[0].records[..3].iter().map(|r| r.true_card).collect();
    assert_eq!(truths, vec![10.0, 20.0, 30.0]);
    assert_eq!(reports[0].records[1].error, Some(2.0));
    assert_eq!(reports[0].records[3].unsupported, Some(UNSUPPORTED_PREFLAGGED));
}

#[test]
fn test_preflagged_queries_are_never_asked() {
    let mut workload = Workload::from_queries("w", queries(3), Some(vec![4.0, 4.0, 4.0]));
    workload.unsupported.insert(1);
    // Only two answers: asking query 1 would shift the script and panic on the third call.
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> =
        vec![Box::new(Scripted::new("two", vec![est(4.0), est(8.0)]))];

    let reports = EvaluationLoop::new("w").evaluate(&mut estimators, &workload, None).unwrap();
    let records = &reports[0].records;
    assert_eq!(records[1].unsupported, Some(UNSUPPORTED_PREFLAGGED));
    assert_eq!(records[0].error, Some(1.0));
    assert_eq!(records[2].error, Some(2.0));
}

#[test]
fn test_truth_from_oracle_estimator() {
    let table = correlated_table(40);
    let workload = Workload::from_queries("oracle", queries(4), None);
    let mut oracle = TableScanOracle::new(table);
    // Every value of `a` covers exactly 10 of the 40 rows.
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> =
        vec![Box::new(Scripted::new("ten", vec![est(10.0), est(10.0), est(20.0), est(10.0)]))];

    let reports = EvaluationLoop::new("oracle")
        .evaluate(&mut estimators, &workload, Some(&mut oracle))
        .unwrap();
    let errors: Vec<f64> = reports[0].records.iter().map(|r| r.error.unwrap()).collect();
    assert_eq!(errors, vec![1.0, 1.0, 2.0, 1.0]);
    assert!(reports[0].records.iter().all(|r| r.true_card == 10.0));
}

#[test]
fn test_missing_truth_is_an_error() {
    let workload = Workload::from_queries("w", queries(1), None);
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> = vec![Box::new(Scripted::new("x", vec![est(1.0)]))];
    assert!(EvaluationLoop::new("w").evaluate(&mut estimators, &workload, None).is_err());
}

#[test]
fn test_csv_export_columns() {
    let dir = tempfile::tempdir().unwrap();
    let workload = Workload::from_queries("csv", queries(2), Some(vec![3.0, 3.0]));
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> =
        vec![Box::new(Scripted::new("exp", vec![est(3.0), Some(QueryOutcome::failed("x"))]))];
    let reports = EvaluationLoop::new("csv").evaluate(&mut estimators, &workload, None).unwrap();

    let path = reports[0].write_csv(dir.path(), "csv").unwrap();
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
    assert_eq!(
        headers,
        vec!["errs", "est_cards", "true_cards", "query_dur_ms", "query_prep_ms"]
    );
    let rows: Vec<Vec<f64>> = reader
        .records()
        .map(|r| r.unwrap().iter().map(|v| v.parse::<f64>().unwrap()).collect())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(&rows[0][..3], &[1.0, 3.0, 3.0]);
    assert_eq!(rows[1][0], f64::from(UNSUPPORTED_FAILED));
    assert!(rows[1][1].is_nan());
}
