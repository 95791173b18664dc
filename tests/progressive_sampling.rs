// tests/progressive_sampling.rs - Plain and factorized progressive sampling
use burn_ndarray::NdArray;
use card_est_rs::cardest::architectures::{Made, Ordering};
use card_est_rs::cardest::data::{FactorizedTable, Op, Query, Value};
use card_est_rs::cardest::estimation::{
    CardinalityEstimator, FactorizedProgressiveSampling, ProgressiveSampling, QueryOutcome, SamplingOptions,
};
use card_est_rs::cardest::CardEstError;
use card_est_rs::test_utils::{correlated_table, int_table, tiny_made};

type TestBackend = NdArray<f32>;
type TestModel = Made<TestBackend>;

fn query(columns: &[&str], ops: &[Op], values: &[i64]) -> Query {
    Query::new(
        columns.iter().map(|c| c.to_string()).collect(),
        ops.to_vec(),
        values.iter().map(|&v| Value::Int(v)).collect(),
    )
}

fn estimate(estimator: &mut dyn CardinalityEstimator, q: &Query) -> f64 {
    match estimator.query(q) {
        QueryOutcome::Estimated { cardinality, .. } => cardinality,
        other => panic!("query was not answered: {other:?}"),
    }
}

fn options(num_samples: usize) -> SamplingOptions {
    SamplingOptions {
        seed: 3,
        ..SamplingOptions::new(num_samples)
    }
}

#[test]
fn test_full_domain_predicate_returns_cardinality() {
    let device = Default::default();
    let table = correlated_table(40);
    let model = tiny_made::<TestBackend>(table.domain_sizes(), vec![Ordering::natural(3)], &device);
    let mut estimator =
        ProgressiveSampling::<TestBackend, TestModel>::new(&model, &table, 40.0, options(64), device);
    assert_eq!(estimator.name(), "psample_64");

    let single = estimate(&mut estimator, &query(&["a"], &[Op::Ge], &[0]));
    assert!((single - 40.0).abs() < 1e-3, "got {single}");

    let both = estimate(&mut estimator, &query(&["a", "c"], &[Op::Ge, Op::Le], &[0, 2]));
    assert!((both - 40.0).abs() < 1e-3, "got {both}");
}

#[test]
fn test_ensemble_averages_over_orderings() {
    let device = Default::default();
    let table = correlated_table(40);
    let orderings = vec![Ordering::natural(3), Ordering::from_order(vec![2, 0, 1]).unwrap()];
    let model = tiny_made::<TestBackend>(table.domain_sizes(), orderings, &device);
    let mut estimator =
        ProgressiveSampling::<TestBackend, TestModel>::new(&model, &table, 40.0, options(32), device);

    let full = estimate(&mut estimator, &query(&["b", "c"], &[Op::Ge, Op::Ge], &[0, 0]));
    assert!((full - 40.0).abs() < 1e-3, "got {full}");

    let partial = estimate(&mut estimator, &query(&["a", "b"], &[Op::Eq, Op::Le], &[1, 1]));
    assert!(partial > 0.0 && partial < 40.0, "got {partial}");
}

#[test]
fn test_empty_predicate_gives_zero() {
    let device = Default::default();
    let table = correlated_table(40);
    let model = tiny_made::<TestBackend>(table.domain_sizes(), vec![Ordering::natural(3)], &device);
    let mut estimator =
        ProgressiveSampling::<TestBackend, TestModel>::new(&model, &table, 40.0, options(16), device);

    assert_eq!(estimate(&mut estimator, &query(&["a"], &[Op::Eq], &[99])), 0.0);
    assert_eq!(estimate(&mut estimator, &query(&["a", "c"], &[Op::Lt, Op::Eq], &[0, 1])), 0.0);
}

#[test]
fn test_unknown_column_is_reported_as_failure() {
    let device = Default::default();
    let table = correlated_table(40);
    let model = tiny_made::<TestBackend>(table.domain_sizes(), vec![Ordering::natural(3)], &device);
    let mut estimator =
        ProgressiveSampling::<TestBackend, TestModel>::new(&model, &table, 40.0, options(16), device);

    match estimator.query(&query(&["missing"], &[Op::Eq], &[1])) {
        QueryOutcome::Unsupported { code, reason } => {
            assert_eq!(code, 0);
            assert!(reason.contains("missing"));
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}

fn wide_table() -> FactorizedTable {
    // `id` has 300 distinct values: three 3-bit words.
    let rows: Vec<Vec<i64>> = (0..300).map(|i| vec![i, i % 2]).collect();
    FactorizedTable::new(int_table("wide", &["id", "flag"], &rows), 3)
}

#[test]
fn test_factorized_estimates_stay_in_range() {
    let device = Default::default();
    let factorized = wide_table();
    assert_eq!(factorized.factor_groups(), vec![vec![0, 1, 2]]);

    let orderings = vec![Ordering::natural(4), Ordering::from_order(vec![3, 0, 1, 2]).unwrap()];
    let model = tiny_made::<TestBackend>(factorized.table.domain_sizes(), orderings, &device);
    let mut estimator = FactorizedProgressiveSampling::<TestBackend, TestModel>::new(
        &model,
        &factorized,
        300.0,
        options(32),
        device,
    )
    .unwrap();
    assert_eq!(estimator.name(), "fact_psample_32");

    // Only the unsplit column is restricted.
    let flag = estimate(&mut estimator, &query(&["flag"], &[Op::Ge], &[0]));
    assert!((flag - 300.0).abs() < 1e-2, "got {flag}");

    let range = estimate(&mut estimator, &query(&["id", "flag"], &[Op::Lt, Op::Eq], &[100, 1]));
    assert!(range > 0.0 && range < 300.0, "got {range}");

    assert_eq!(estimate(&mut estimator, &query(&["id"], &[Op::Gt], &[1000])), 0.0);
}

#[test]
fn test_factorized_rejects_split_groups() {
    let device = Default::default();
    let factorized = wide_table();
    let orderings = vec![Ordering::from_order(vec![0, 3, 1, 2]).unwrap()];
    let model = tiny_made::<TestBackend>(factorized.table.domain_sizes(), orderings, &device);

    let result = FactorizedProgressiveSampling::<TestBackend, TestModel>::new(
        &model,
        &factorized,
        300.0,
        options(8),
        device,
    );
    assert!(matches!(result, Err(CardEstError::MalformedOrdering(_))));
}
