//! Trial lifecycle: `Created -> Setup -> Step* -> Stopped`.
//!
//! A trial resolves its settings into data, model, optimizer and
//! learning-rate policy, restores a checkpoint, then answers `step` calls
//! with structured results. Evaluate and inference trials evaluate the
//! loaded model once; train trials run one epoch per step first.

pub mod sink;

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::cardest::architectures::{Made, MadeConfig, OrderingBuilder};
use crate::cardest::data::{
    CsvDatasetLoader, DatasetLoader, FactorizedTable, JoinSampler, JoinSpec, StarJoinSampler, Table, TableDataset,
    TupleStream, Workload,
};
use crate::cardest::error::{CardEstError, Result};
use crate::cardest::estimation::{
    report, CardinalityEstimator, EstimatorReport, EvaluationLoop, FactorizedProgressiveSampling,
    ProgressiveSampling, SamplingOptions, TableScanOracle,
};
use crate::cardest::settings::{TrialMode, TrialSettings};
use crate::cardest::training::schedule::DEFAULT_BASE_LR;
use crate::cardest::training::{
    find_checkpoint, LrPolicy, LrPolicyChoice, ModelOptimizer, Split, TrainConfig, Trainer,
};

pub use sink::{JsonLinesSink, ResultSink};

/// Outcome of one `step`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub epoch: usize,
    pub done: bool,
    pub results: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Created,
    Ready,
    Stopped,
}

/// Compare every configured threshold against the matching metric in
/// `results` (or, failing that, `returns`). A metric breaches when it is
/// not below its threshold; absent metrics are skipped.
///
/// # Errors
/// `AssertionFailed` listing every breached metric.
pub fn check_asserts(
    asserts: &BTreeMap<String, f64>,
    results: &BTreeMap<String, f64>,
    returns: &BTreeMap<String, f64>,
) -> Result<()> {
    let failures: Vec<String> = asserts
        .iter()
        .filter_map(|(metric, &bound)| {
            let value = results.get(metric).or_else(|| returns.get(metric))?;
            (!(*value < bound)).then(|| format!("{metric}: {value} >= {bound}"))
        })
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(CardEstError::AssertionFailed(failures.join("\n")))
    }
}

type TrialTrainer<B> = Trainer<B, Made<B>, ModelOptimizer<Made<B>, B>>;

/// Everything `setup` resolves.
struct TrialRuntime<B: AutodiffBackend> {
    trainer: TrialTrainer<B>,
    /// Schema the model is trained on (factorized when enabled).
    training_schema: Table,
    factorized: Option<FactorizedTable>,
    stream: Box<dyn TupleStream>,
    cardinality: f64,
    workload: Workload,
    oracle: Option<TableScanOracle>,
    epoch: usize,
    loss: f64,
}

pub struct TrialController<B: AutodiffBackend> {
    settings: TrialSettings,
    device: B::Device,
    state: TrialState,
    runtime: Option<TrialRuntime<B>>,
    sink: Option<Box<dyn ResultSink>>,
    returns: BTreeMap<String, f64>,
    loader: Box<dyn DatasetLoader>,
}

impl<B: AutodiffBackend> TrialController<B> {
    pub fn new(settings: TrialSettings, device: B::Device) -> Self {
        let loader = Box::new(CsvDatasetLoader::new(settings.data_dir.clone()));
        Self {
            settings,
            device,
            state: TrialState::Created,
            runtime: None,
            sink: None,
            returns: BTreeMap::new(),
            loader,
        }
    }

    pub fn with_loader(mut self, loader: Box<dyn DatasetLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Extra metrics consulted by the assertion gate when a step's own
    /// results do not carry them.
    pub fn with_returns(mut self, returns: BTreeMap<String, f64>) -> Self {
        self.returns = returns;
        self
    }

    pub fn state(&self) -> TrialState {
        self.state
    }

    pub fn settings(&self) -> &TrialSettings {
        &self.settings
    }

    pub fn epoch(&self) -> Option<usize> {
        self.runtime.as_ref().map(|r| r.epoch)
    }

    /// Checkpointed loss of the restored (or last trained) epoch.
    pub fn loss(&self) -> Option<f64> {
        self.runtime.as_ref().map(|r| r.loss)
    }

    pub fn setup(&mut self) -> Result<()> {
        if self.state != TrialState::Created {
            return Err(CardEstError::InvalidState(format!("setup called in state {:?}", self.state)));
        }
        let s = &self.settings;
        s.validate()?;
        if !s.available_datasets.contains(&s.dataset) {
            return Err(CardEstError::UnsupportedDataset(s.dataset.clone()));
        }
        if s.use_data_parallel {
            warn!("use_data_parallel is set; replication is left to the backend, running on one device");
        }
        let seed = s.random_seed.unwrap_or(s.seed);

        // ------ Data
        let mut tables = Vec::with_capacity(s.join_tables.len());
        for name in &s.join_tables {
            let use_cols = if s.is_multi_table() { None } else { s.use_cols.as_deref() };
            tables.push(self.loader.load(&s.dataset, name, use_cols)?);
        }

        let file_workload = s.queries_path.as_deref();
        let (query_table, cardinality, join_stream, workload) = if s.is_multi_table() {
            let spec = JoinSpec {
                tables: s.join_tables.clone(),
                root: s.resolved_join_root().to_string(),
                keys: s.join_keys.clone(),
            };
            let sampler = StarJoinSampler::new(&spec, tables)?;
            let workload = match file_workload {
                Some(path) => Some(Workload::load(path, &s.workload_name, sampler.table())?),
                None => None,
            };
            // Rows are only needed to generate queries or to count them.
            let needs_rows = workload.as_ref().map_or(true, Workload::needs_oracle);
            let joined = if needs_rows {
                sampler.materialize()
            } else {
                sampler.table().schema()
            };
            info!(
                "Join over {:?} rooted at `{}`: {} tuples",
                spec.tables,
                spec.root,
                sampler.join_card()
            );
            (joined, sampler.join_card() as f64, Some(sampler.stream(seed)), workload)
        } else {
            let table = tables
                .pop()
                .ok_or_else(|| CardEstError::invalid_setting("join_tables", "no table loaded"))?;
            let workload = match file_workload {
                Some(path) => Some(Workload::load(path, &s.workload_name, &table)?),
                None => None,
            };
            let cardinality = table.cardinality as f64;
            (table, cardinality, None, workload)
        };

        let mut workload = match workload {
            Some(w) => w,
            None => Workload::generate(&s.workload_name, &query_table, s.num_eval_queries, seed)?,
        };
        workload.truncate(s.num_eval_queries);

        let factorized = s
            .factorize
            .then(|| FactorizedTable::new(query_table.clone(), s.word_size_bits));
        // Join streams are re-encoded on the fly; single tables are factorized up front.
        let (training_schema, stream): (Table, Box<dyn TupleStream>) = match (&factorized, join_stream) {
            (Some(fact), Some(join)) => (fact.table.schema(), Box::new(fact.wrap_stream(join))),
            (Some(fact), None) => (fact.table.schema(), Box::new(TableDataset::new(&fact.table, seed))),
            (None, Some(join)) => (query_table.schema(), join),
            (None, None) => (query_table.schema(), Box::new(TableDataset::new(&query_table, seed))),
        };
        let oracle = workload.needs_oracle().then(|| TableScanOracle::new(query_table));

        // ------ Model
        let mut builder = OrderingBuilder::new(&training_schema.columns)
            .content_only(s.order_content_only)
            .indicators_at_front(s.order_indicators_at_front);
        if let Some(fact) = &factorized {
            builder = builder.with_factor_groups(fact.factor_groups());
        }
        let fixed = builder.fixed_ordering(s.order.as_deref(), s.order_seed)?;
        let orderings = builder.with_fixed(fixed).build(s.special_orders)?;

        let model: Made<B> = MadeConfig::new(
            training_schema.domain_sizes(),
            s.embed_size,
            s.fc_hiddens,
            s.layers,
            s.seed,
        )
        .init::<B>(orderings, &self.device)?;
        info!(
            "Model over {} columns, hidden {:?}, {} ordering(s)",
            training_schema.num_columns(),
            model.hidden_sizes(),
            model.orderings().len()
        );

        // ------ Optimisation
        let total_steps = s.max_steps.saturating_mul(s.epochs).max(1);
        let resolved = LrPolicyChoice {
            constant: s.constant_lr,
            warmup: s.warmups.map(|w| (s.embed_size, w)),
            ..LrPolicyChoice::default()
        }
        .with_scheduler(s.lr_scheduler.as_deref(), total_steps)?
        .resolve(total_steps);
        // Only training consumes the rate; evaluation trials may leave it unset.
        let policy = match resolved {
            Err(CardEstError::NoLearningRatePolicy) if s.mode != TrialMode::Train => {
                debug!("No learning-rate policy configured; {:?} trials never step", s.mode);
                LrPolicy::Constant(DEFAULT_BASE_LR)
            }
            other => other?,
        };
        let optimizer = ModelOptimizer::new(s.optimizer, &self.device);
        let config = TrainConfig {
            batch_size: s.bs,
            accum_iter: s.accum_iter,
            max_steps: s.max_steps,
            label_smoothing: s.label_smoothing,
            log_every: s.log_every,
            wildcard_dropout: s.wildcard_dropout,
            seed,
        };
        let mut trainer = Trainer::new(model, optimizer, policy, config, self.device.clone())?;

        // ------ Checkpoint
        let (epoch, loss) = match (s.mode, s.checkpoint_to_load.as_deref()) {
            (TrialMode::Evaluate, Some(pattern)) | (TrialMode::Train, Some(pattern)) => {
                let meta = trainer.load_checkpoint(&find_checkpoint(pattern)?)?;
                (meta.epoch, meta.loss)
            }
            (TrialMode::Inference, Some(pattern)) => {
                trainer.load_model(&find_checkpoint(pattern)?)?;
                (0, f64::NAN)
            }
            (TrialMode::Train, None) => (0, f64::NAN),
            (_, None) => {
                return Err(CardEstError::CheckpointNotFound {
                    pattern: "<checkpoint_to_load unset>".to_string(),
                    found: 0,
                })
            }
        };

        if self.sink.is_none() {
            if let Some(path) = &s.result_log {
                self.sink = Some(Box::new(JsonLinesSink::create(path)?));
            }
        }

        self.runtime = Some(TrialRuntime {
            trainer,
            training_schema,
            factorized,
            stream,
            cardinality,
            workload,
            oracle,
            epoch,
            loss,
        });
        self.state = TrialState::Ready;
        info!("Trial ready in {:?} mode at epoch {}", self.settings.mode, epoch);
        Ok(())
    }

    pub fn step(&mut self) -> Result<StepResult> {
        if self.state != TrialState::Ready {
            return Err(CardEstError::InvalidState(format!("step called in state {:?}", self.state)));
        }
        let settings = &self.settings;
        let runtime = self
            .runtime
            .as_mut()
            .ok_or_else(|| CardEstError::InvalidState("trial runtime missing".to_string()))?;

        let mut results = BTreeMap::new();
        if settings.mode == TrialMode::Train {
            let outcome = runtime
                .trainer
                .run_epoch(Split::Train, runtime.stream.as_mut(), runtime.epoch)?;
            runtime.epoch += 1;
            runtime.loss = outcome.mean_loss;
            results.insert("train_bits".to_string(), outcome.mean_loss);
            if let Some(dir) = &settings.checkpoint_dir {
                let path = dir.join(format!("epoch-{:04}", runtime.epoch));
                runtime.trainer.save_checkpoint(&path, runtime.epoch, outcome.mean_loss)?;
            }
        }

        if !runtime.workload.is_empty() {
            let reports = evaluate(settings, runtime, &self.device)?;
            for report in &reports {
                report.log_summary();
                report.extend_results(&mut results);
            }
        }

        let done = settings.mode != TrialMode::Train || runtime.epoch >= settings.epochs;
        let result = StepResult {
            // Evaluation-only trials report epoch 0 whatever checkpoint they restored.
            epoch: if settings.mode == TrialMode::Train { runtime.epoch } else { 0 },
            done,
            results,
        };
        if let Some(sink) = self.sink.as_mut() {
            sink.record(&result)?;
        }
        check_asserts(&settings.asserts, &result.results, &self.returns)?;
        Ok(result)
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.close()?;
        }
        self.state = TrialState::Stopped;
        Ok(())
    }

    /// `setup`, `step` until done, `stop`.
    pub fn run(&mut self) -> Result<Vec<StepResult>> {
        self.setup()?;
        let mut results = Vec::new();
        let outcome = loop {
            match self.step() {
                Ok(result) => {
                    let done = result.done;
                    results.push(result);
                    if done {
                        break Ok(());
                    }
                }
                Err(err) => break Err(err),
            }
        };
        self.stop()?;
        outcome.map(|()| results)
    }
}

fn evaluate<B: AutodiffBackend>(
    settings: &TrialSettings,
    runtime: &mut TrialRuntime<B>,
    device: &B::Device,
) -> Result<Vec<EstimatorReport>> {
    let model: Made<B::InnerBackend> = runtime.trainer.model.valid();
    let mut estimators: Vec<Box<dyn CardinalityEstimator>> = Vec::with_capacity(settings.eval_psamples.len());
    for &num_samples in &settings.eval_psamples {
        let options = SamplingOptions {
            num_samples,
            shortcircuit: settings.wildcard_dropout,
            fanout_scaling: true,
            seed: settings.random_seed.unwrap_or(settings.seed),
        };
        let estimator: Box<dyn CardinalityEstimator> = match &runtime.factorized {
            Some(fact) => Box::new(FactorizedProgressiveSampling::new(
                &model,
                fact,
                runtime.cardinality,
                options,
                device.clone(),
            )?),
            None => Box::new(ProgressiveSampling::new(
                &model,
                &runtime.training_schema,
                runtime.cardinality,
                options,
                device.clone(),
            )),
        };
        estimators.push(estimator);
    }

    // The failure trace log is always kept; CSV exports are opt-in.
    let evaluation = EvaluationLoop::new(settings.workload_name.clone())
        .with_report_every(settings.report_every)
        .with_output_dir(settings.results_dir.clone());
    let oracle = runtime
        .oracle
        .as_mut()
        .map(|o| o as &mut dyn CardinalityEstimator);
    let reports = evaluation.evaluate(&mut estimators, &runtime.workload, oracle)?;

    if settings.save_eval_result {
        for r in &reports {
            let path = r.write_csv(&settings.results_dir, &settings.workload_name)?;
            info!("Wrote {:?}", path);
        }
        report::write_error_summary(&reports, &settings.results_dir, &settings.workload_name)?;
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_asserts_pass_below_threshold() {
        let asserts = map(&[("psample_100_max", 10.0)]);
        let results = map(&[("psample_100_max", 3.2)]);
        assert!(check_asserts(&asserts, &results, &BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_asserts_list_every_breach() {
        let asserts = map(&[("a", 1.0), ("b", 2.0), ("c", 5.0), ("missing", 0.0)]);
        let results = map(&[("a", 1.0), ("c", 4.0)]);
        let returns = map(&[("b", 9.0)]);
        let err = check_asserts(&asserts, &results, &returns).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("a: 1 >= 1"));
        assert!(msg.contains("b: 9 >= 2"));
        assert!(!msg.contains("c:"));
        assert!(!msg.contains("missing"));
    }

    #[test]
    fn test_results_take_precedence_over_returns() {
        let asserts = map(&[("a", 2.0)]);
        let results = map(&[("a", 1.0)]);
        let returns = map(&[("a", 9.0)]);
        assert!(check_asserts(&asserts, &results, &returns).is_ok());
    }
}
