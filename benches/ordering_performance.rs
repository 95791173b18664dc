use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use burn_ndarray::NdArray;
use card_est_rs::cardest::architectures::{Made, Ordering, OrderingBuilder};
use card_est_rs::cardest::data::{Column, Op, Query, Value};
use card_est_rs::cardest::estimation::{report, CardinalityEstimator, ProgressiveSampling, SamplingOptions};
use card_est_rs::test_utils::{correlated_table, tiny_made};

type BenchBackend = NdArray<f32>;

/// `n` content columns followed by one indicator and one fanout per table.
fn join_columns(n: usize) -> Vec<Column> {
    let domain = || (0..8).map(Value::Int).collect::<Vec<_>>();
    let mut columns: Vec<Column> = (0..n).map(|i| Column::new(format!("c{i}"), "t", domain())).collect();
    columns.push(Column::new("__in_t", "t", domain()));
    columns.push(Column::new("__fanout_t", "t", domain()));
    columns
}

fn benchmark_ordering_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordering_build");
    group.measurement_time(Duration::from_secs(5));

    for n in [8, 32, 128] {
        let columns = join_columns(n);
        group.bench_with_input(BenchmarkId::new("special_orders_16", n), &columns, |b, columns| {
            b.iter(|| {
                let builder = OrderingBuilder::new(columns).content_only(true);
                black_box(builder.build(black_box(16)))
            });
        });
    }

    group.finish();
}

fn benchmark_progressive_sampling(c: &mut Criterion) {
    let device = Default::default();
    let table = correlated_table(400);
    let model: Made<BenchBackend> = tiny_made(table.domain_sizes(), vec![Ordering::natural(3)], &device);
    let query = Query::new(
        vec!["a".to_string(), "c".to_string()],
        vec![Op::Le, Op::Eq],
        vec![Value::Int(2), Value::Int(1)],
    );

    let mut group = c.benchmark_group("progressive_sampling");
    group.sample_size(20);

    for samples in [100, 1000] {
        let mut estimator = ProgressiveSampling::<BenchBackend, Made<BenchBackend>>::new(
            &model,
            &table,
            table.cardinality as f64,
            SamplingOptions::new(samples),
            device,
        );
        group.bench_function(BenchmarkId::new("query", samples), |b| {
            b.iter(|| black_box(estimator.query(black_box(&query))));
        });
    }

    group.finish();
}

fn benchmark_percentiles(c: &mut Criterion) {
    let mut errors: Vec<f64> = (0..10_000).map(|i| 1.0 + ((i * 7919) % 1000) as f64 / 10.0).collect();
    errors.sort_by(f64::total_cmp);

    c.bench_function("percentile_summary", |b| {
        b.iter(|| {
            let sorted = black_box(&errors);
            black_box([
                report::percentile(sorted, 50.0),
                report::percentile(sorted, 95.0),
                report::percentile(sorted, 99.0),
                report::percentile(sorted, 100.0),
            ])
        });
    });
}

criterion_group!(
    benches,
    benchmark_ordering_build,
    benchmark_progressive_sampling,
    benchmark_percentiles,
);
criterion_main!(benches);
