//! Trial configuration.
//!
//! Every knob a trial reads is an explicit, defaulted field of
//! [`TrialSettings`]. Sources are layered with the `config` crate:
//! struct defaults, an optional settings file, then environment variables
//! prefixed with `CARDEST_`. Unknown keys are rejected when the settings are
//! deserialized rather than silently accepted.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::error::{CardEstError, Result};

/// Which optimizer drives the density model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Adagrad,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Adam
    }
}

/// What a trial `step` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialMode {
    /// Load a checkpoint (model, optimizer, epoch, loss) and evaluate.
    Evaluate,
    /// Load only the model parameters from a checkpoint and evaluate.
    Inference,
    /// Train one epoch per step, checkpoint, then evaluate.
    Train,
}

impl Default for TrialMode {
    fn default() -> Self {
        Self::Evaluate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKeyword {
    Reverse,
}

/// Post-processing applied to the fixed column ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderSeed {
    /// Shuffle the fixed ordering with this seed.
    Seed(u64),
    /// `"reverse"`: reverse the fixed ordering.
    Keyword(OrderKeyword),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrialSettings {
    // ------ Data
    pub dataset: String,
    pub available_datasets: Vec<String>,
    pub data_dir: PathBuf,
    /// Tables participating in the (possibly single-table) join.
    pub join_tables: Vec<String>,
    pub join_root: Option<String>,
    /// table -> join key columns
    pub join_keys: BTreeMap<String, Vec<String>>,
    pub use_cols: Option<Vec<String>>,
    pub factorize: bool,
    pub word_size_bits: u32,

    // ------ Orderings
    pub order: Option<Vec<usize>>,
    pub order_seed: Option<OrderSeed>,
    pub special_orders: usize,
    pub order_content_only: bool,
    pub order_indicators_at_front: bool,

    // ------ Model
    pub fc_hiddens: usize,
    /// Number of hidden layers; 0 selects the fixed default stack.
    pub layers: usize,
    pub embed_size: usize,
    /// Train with wildcard dropout so estimators can short-circuit
    /// unqueried columns.
    pub wildcard_dropout: bool,
    pub seed: u64,
    pub random_seed: Option<u64>,

    // ------ Optimisation
    pub optimizer: OptimizerKind,
    pub constant_lr: Option<f64>,
    /// `CosineAnnealingLR`, `OneCycleLR`, `OneCycleLR-<pct>` or
    /// `wd_<lr>_<warmup_fraction>`.
    pub lr_scheduler: Option<String>,
    /// Warmup steps for the inverse-square-root schedule; values below 1 are
    /// a fraction of the total step budget.
    pub warmups: Option<f64>,
    pub accum_iter: usize,
    pub epochs: usize,
    /// Per-epoch step budget.
    pub max_steps: usize,
    pub bs: usize,
    pub label_smoothing: f64,
    pub log_every: usize,

    // ------ Trial lifecycle
    pub mode: TrialMode,
    /// Glob pattern that must match exactly one checkpoint directory.
    pub checkpoint_to_load: Option<String>,
    /// Where train-mode steps write checkpoints.
    pub checkpoint_dir: Option<PathBuf>,
    pub use_data_parallel: bool,

    // ------ Evaluation
    /// One progressive-sampling estimator per entry (sample count).
    pub eval_psamples: Vec<usize>,
    pub num_eval_queries: usize,
    pub queries_path: Option<PathBuf>,
    pub workload_name: String,
    pub save_eval_result: bool,
    pub results_dir: PathBuf,
    pub report_every: usize,
    /// metric name -> exclusive upper bound checked after every step
    pub asserts: BTreeMap<String, f64>,
    /// JSON-lines file receiving one result object per step.
    pub result_log: Option<PathBuf>,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            dataset: "synthetic".to_string(),
            available_datasets: vec![
                "synthetic".to_string(),
                "imdb".to_string(),
                "dmv".to_string(),
            ],
            data_dir: PathBuf::from("datasets"),
            join_tables: Vec::new(),
            join_root: None,
            join_keys: BTreeMap::new(),
            use_cols: None,
            factorize: false,
            word_size_bits: 10,
            order: None,
            order_seed: None,
            special_orders: 0,
            order_content_only: true,
            order_indicators_at_front: true,
            fc_hiddens: 128,
            layers: 4,
            embed_size: 32,
            wildcard_dropout: true,
            seed: 0,
            random_seed: None,
            optimizer: OptimizerKind::default(),
            constant_lr: None,
            lr_scheduler: None,
            warmups: None,
            accum_iter: 1,
            epochs: 20,
            max_steps: 500,
            bs: 2048,
            label_smoothing: 0.0,
            log_every: 10,
            mode: TrialMode::default(),
            checkpoint_to_load: None,
            checkpoint_dir: None,
            use_data_parallel: false,
            eval_psamples: vec![2000],
            num_eval_queries: 20,
            queries_path: None,
            workload_name: "workload".to_string(),
            save_eval_result: false,
            results_dir: PathBuf::from("results"),
            report_every: 100,
            asserts: BTreeMap::new(),
            result_log: None,
        }
    }
}

impl TrialSettings {
    /// Load settings from an optional file plus `CARDEST_*` environment
    /// variables, then validate them.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings: Self = builder
            .add_source(
                Environment::with_prefix("CARDEST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("join_tables")
                    .with_list_parse_key("eval_psamples")
                    .with_list_parse_key("use_cols")
                    .with_list_parse_key("order"),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Build settings from a JSON object, the form a hyperparameter-search
    /// driver hands to a trial.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let settings: Self = serde_json::from_value(value)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.join_tables.is_empty() {
            return Err(CardEstError::invalid_setting(
                "join_tables",
                "at least one table is required",
            ));
        }
        if self.accum_iter == 0 {
            return Err(CardEstError::invalid_setting("accum_iter", "must be >= 1"));
        }
        if !(1..=31).contains(&self.word_size_bits) {
            return Err(CardEstError::invalid_setting(
                "word_size_bits",
                format!("must be in 1..=31, got {}", self.word_size_bits),
            ));
        }
        if self.bs == 0 || self.max_steps == 0 {
            return Err(CardEstError::invalid_setting(
                "bs/max_steps",
                "batch size and step budget must be positive",
            ));
        }
        if self.embed_size == 0 {
            return Err(CardEstError::invalid_setting("embed_size", "must be positive"));
        }
        if self.eval_psamples.iter().any(|&n| n == 0) {
            return Err(CardEstError::invalid_setting(
                "eval_psamples",
                "sample counts must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(CardEstError::invalid_setting(
                "label_smoothing",
                format!("must be in [0, 1), got {}", self.label_smoothing),
            ));
        }
        if let Some(lr) = self.constant_lr {
            if !(lr > 0.0) {
                return Err(CardEstError::invalid_setting("constant_lr", "must be positive"));
            }
        }
        if let Some(w) = self.warmups {
            if !(w > 0.0) {
                return Err(CardEstError::invalid_setting("warmups", "must be positive"));
            }
        }
        if self.report_every == 0 {
            return Err(CardEstError::invalid_setting("report_every", "must be >= 1"));
        }
        Ok(())
    }

    /// Table whose rows define the joined relation's fanout semantics.
    pub fn resolved_join_root(&self) -> &str {
        self.join_root
            .as_deref()
            .unwrap_or_else(|| self.join_tables[0].as_str())
    }

    pub fn is_multi_table(&self) -> bool {
        self.join_tables.len() > 1
    }
}
