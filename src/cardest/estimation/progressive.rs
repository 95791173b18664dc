//! Progressive sampling.
//!
//! Draws `num_samples` tuples column by column in the model's ordering.
//! At each queried column the conditional distribution is restricted to the
//! predicate's valid codes; the retained probability mass multiplies the
//! sample's weight and the next value is drawn from the restricted
//! distribution. The mean weight estimates the predicate's selectivity.
//! Ensembles answer once per ordering and average.

use burn::tensor::{activation, backend::Backend, Int, Tensor, TensorData};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Instant;
use tracing::debug;

use super::{apply_join_semantics, fanout_value, predicate_masks, CardinalityEstimator, QueryOutcome};
use crate::cardest::architectures::DensityModel;
use crate::cardest::data::{FactorizedTable, Query, Table};
use crate::cardest::error::{CardEstError, Result};

#[derive(Debug, Clone)]
pub struct SamplingOptions {
    pub num_samples: usize,
    /// Leave unqueried columns as wildcard tokens instead of sampling them.
    pub shortcircuit: bool,
    /// Scale join-sample probabilities by the fanouts of unqueried tables.
    pub fanout_scaling: bool,
    pub seed: u64,
}

impl SamplingOptions {
    pub fn new(num_samples: usize) -> Self {
        Self {
            num_samples,
            shortcircuit: false,
            fanout_scaling: true,
            seed: 0,
        }
    }
}

/// Restriction of one training column during sampling.
#[derive(Debug, Clone)]
enum SampleMask {
    Free,
    Fixed(Vec<bool>),
    /// Sub-variable of a factorized column: the allowed digits depend on the
    /// digits already drawn for the higher words of the same column.
    Factor {
        group: Vec<usize>,
        sub_index: usize,
        shift: u32,
        word_bits: u32,
        valid_codes: std::rc::Rc<Vec<u32>>,
    },
}

impl SampleMask {
    fn is_free(&self) -> bool {
        matches!(self, SampleMask::Free)
    }
}

fn factor_digits(
    valid_codes: &[u32],
    prefix: u64,
    shift: u32,
    word_bits: u32,
    domain_size: usize,
) -> Vec<bool> {
    let mut allowed = vec![false; domain_size];
    let word_mask = (1u64 << word_bits) - 1;
    for &v in valid_codes {
        let v = u64::from(v);
        if v >> (shift + word_bits) == prefix {
            let digit = ((v >> shift) & word_mask) as usize;
            if digit < domain_size {
                allowed[digit] = true;
            }
        }
    }
    allowed
}

/// Sampling machinery shared by the plain and factorized estimators.
struct SamplingCore<B: Backend, M> {
    /// One model per ordering, each with that ordering installed.
    models: Vec<M>,
    schema: Table,
    cardinality: f64,
    options: SamplingOptions,
    device: B::Device,
    rng: StdRng,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: DensityModel<B> + Clone> SamplingCore<B, M> {
    fn new(model: &M, schema: Table, cardinality: f64, options: SamplingOptions, device: B::Device) -> Self {
        let models = match model.ensemble() {
            Some(ensemble) => (0..ensemble.num_orderings())
                .map(|i| {
                    let mut m = model.clone();
                    if let Some(e) = m.ensemble_mut() {
                        e.set_ordering_index(i);
                    }
                    m
                })
                .collect(),
            None => vec![model.clone()],
        };
        Self {
            models,
            schema,
            cardinality,
            rng: StdRng::seed_from_u64(options.seed),
            options,
            device,
            _backend: PhantomData,
        }
    }

    fn estimate(&mut self, masks: &[SampleMask], scale: &[bool]) -> Result<f64> {
        let mut selectivity = 0.0;
        for k in 0..self.models.len() {
            selectivity += self.sample_with(k, masks, scale)?;
        }
        Ok(selectivity / self.models.len() as f64 * self.cardinality)
    }

    fn column_probs(&self, model: &M, codes: &[u32], rows: usize, column: usize) -> Result<Vec<f32>> {
        let cols = model.num_columns();
        let values: Vec<i64> = codes.iter().map(|&c| i64::from(c)).collect();
        let input = Tensor::<B, 2, Int>::from_data(TensorData::new(values, [rows, cols]), &self.device);
        let logits = model.forward_logits(input);
        let probs = activation::softmax(model.column_logits(logits, column), 1);
        probs
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(CardEstError::tensor_data)
    }

    /// Mean sample weight (selectivity) under ordering `k`.
    fn sample_with(&mut self, k: usize, masks: &[SampleMask], scale: &[bool]) -> Result<f64> {
        let model = &self.models[k];
        let n = model.num_columns();
        let s = self.options.num_samples;
        let order = model.ordering().column_order().to_vec();
        let relevant = |c: usize| !masks[c].is_free() || scale[c];

        let Some(last) = order.iter().rposition(|&c| relevant(c)) else {
            return Ok(1.0);
        };

        let mut codes: Vec<u32> = Vec::with_capacity(s * n);
        for _ in 0..s {
            codes.extend((0..n).map(|c| model.wildcard_token(c)));
        }
        let mut weights = vec![1.0f64; s];
        let mut digit_cache: HashMap<(usize, u64), Vec<bool>> = HashMap::new();

        for &col in &order[..=last] {
            if self.options.shortcircuit && !relevant(col) {
                continue;
            }
            let probs = self.column_probs(model, &codes, s, col)?;
            let d = model.domain_sizes()[col];

            for r in 0..s {
                if weights[r] == 0.0 {
                    codes[r * n + col] = 0;
                    continue;
                }
                let p = &probs[r * d..(r + 1) * d];
                let allowed: Option<&[bool]> = match &masks[col] {
                    SampleMask::Free => None,
                    SampleMask::Fixed(m) => Some(m),
                    SampleMask::Factor {
                        group,
                        sub_index,
                        shift,
                        word_bits,
                        valid_codes,
                    } => {
                        let prefix = group[..*sub_index]
                            .iter()
                            .fold(0u64, |acc, &g| (acc << word_bits) | u64::from(codes[r * n + g]));
                        Some(
                            digit_cache
                                .entry((col, prefix))
                                .or_insert_with(|| factor_digits(valid_codes, prefix, *shift, *word_bits, d))
                                .as_slice(),
                        )
                    }
                };

                let mass: f64 = match allowed {
                    Some(m) => p.iter().zip(m).filter(|&(_, &ok)| ok).map(|(&x, _)| f64::from(x)).sum(),
                    None => p.iter().map(|&x| f64::from(x)).sum(),
                };
                if !(mass > 0.0) {
                    weights[r] = 0.0;
                    codes[r * n + col] = 0;
                    continue;
                }

                let target = self.rng.random::<f64>() * mass;
                let mut acc = 0.0;
                let mut pick = None;
                for (i, &x) in p.iter().enumerate() {
                    if allowed.is_some_and(|m| !m[i]) {
                        continue;
                    }
                    acc += f64::from(x);
                    pick = Some(i);
                    if acc > target {
                        break;
                    }
                }
                let pick = pick.unwrap_or(0) as u32;

                weights[r] *= mass;
                if scale[col] {
                    weights[r] /= fanout_value(&self.schema, col, pick);
                }
                codes[r * n + col] = pick;
            }
        }

        Ok(weights.iter().sum::<f64>() / s.max(1) as f64)
    }
}

/// Progressive sampling over an unfactorized schema.
pub struct ProgressiveSampling<B: Backend, M> {
    core: SamplingCore<B, M>,
}

impl<B: Backend, M: DensityModel<B> + Clone> ProgressiveSampling<B, M> {
    pub fn new(model: &M, table: &Table, cardinality: f64, options: SamplingOptions, device: B::Device) -> Self {
        Self {
            core: SamplingCore::new(model, table.schema(), cardinality, options, device),
        }
    }

    fn try_query(&mut self, query: &Query) -> Result<QueryOutcome> {
        let started = Instant::now();
        let schema = &self.core.schema;
        let bound = query.bind(schema)?;
        let constraints = apply_join_semantics(
            schema,
            query,
            &bound,
            predicate_masks(schema, &bound),
            self.core.options.fanout_scaling,
        );
        let masks: Vec<SampleMask> = constraints
            .masks
            .into_iter()
            .map(|m| m.map_or(SampleMask::Free, SampleMask::Fixed))
            .collect();
        let prep_ms = started.elapsed().as_secs_f64() * 1e3;

        let cardinality = self.core.estimate(&masks, &constraints.scale)?;
        Ok(QueryOutcome::Estimated { cardinality, prep_ms })
    }
}

impl<B: Backend, M: DensityModel<B> + Clone> CardinalityEstimator for ProgressiveSampling<B, M> {
    fn name(&self) -> String {
        format!("psample_{}", self.core.options.num_samples)
    }

    fn query(&mut self, query: &Query) -> QueryOutcome {
        self.try_query(query)
            .unwrap_or_else(|err| QueryOutcome::failed(err.to_string()))
    }

    fn release_memory(&mut self) {
        B::sync(&self.core.device);
    }
}

/// Progressive sampling over a factorized schema. Queries are written
/// against the original columns; predicates on a split column become
/// per-word constraints conditioned on the words already drawn.
pub struct FactorizedProgressiveSampling<B: Backend, M> {
    core: SamplingCore<B, M>,
    original: Table,
    fact_col_mapping: Vec<Vec<usize>>,
}

impl<B: Backend, M: DensityModel<B> + Clone> FactorizedProgressiveSampling<B, M> {
    /// # Errors
    /// `MalformedOrdering` if some ordering does not keep every split
    /// column's words contiguous and ascending.
    pub fn new(
        model: &M,
        factorized: &FactorizedTable,
        cardinality: f64,
        options: SamplingOptions,
        device: B::Device,
    ) -> Result<Self> {
        let core = SamplingCore::new(model, factorized.table.schema(), cardinality, options, device);
        for m in &core.models {
            let ranks = m.ordering().ranks();
            for group in factorized.factor_groups() {
                if group.windows(2).any(|w| ranks[w[1]] != ranks[w[0]] + 1) {
                    return Err(CardEstError::MalformedOrdering(format!(
                        "sub-variables {group:?} are not contiguous in {:?}",
                        m.ordering().column_order()
                    )));
                }
            }
        }
        Ok(Self {
            core,
            original: factorized.original.schema(),
            fact_col_mapping: factorized.fact_col_mapping.clone(),
        })
    }

    fn try_query(&mut self, query: &Query) -> Result<QueryOutcome> {
        let started = Instant::now();
        let bound = query.bind(&self.original)?;
        let constraints = apply_join_semantics(
            &self.original,
            query,
            &bound,
            predicate_masks(&self.original, &bound),
            self.core.options.fanout_scaling,
        );

        let num_training = self.core.schema.num_columns();
        let mut masks = vec![SampleMask::Free; num_training];
        let mut scale = vec![false; num_training];
        for (c, mask) in constraints.masks.into_iter().enumerate() {
            let group = &self.fact_col_mapping[c];
            if let [single] = group.as_slice() {
                masks[*single] = mask.map_or(SampleMask::Free, SampleMask::Fixed);
                scale[*single] = constraints.scale[c];
                continue;
            }
            let Some(mask) = mask else {
                continue;
            };
            let valid_codes: Vec<u32> = mask
                .iter()
                .enumerate()
                .filter(|&(_, &ok)| ok)
                .map(|(v, _)| v as u32)
                .collect();
            let valid_codes = std::rc::Rc::new(valid_codes);
            for (i, &sub) in group.iter().enumerate() {
                let info = self.core.schema.columns[sub]
                    .factor
                    .ok_or_else(|| CardEstError::InvalidState(format!("column {sub} is not a sub-variable")))?;
                masks[sub] = SampleMask::Factor {
                    group: group.clone(),
                    sub_index: i,
                    shift: info.shift,
                    word_bits: info.word_bits,
                    valid_codes: std::rc::Rc::clone(&valid_codes),
                };
            }
        }
        let prep_ms = started.elapsed().as_secs_f64() * 1e3;
        debug!("Factorized query over {} training columns", num_training);

        let cardinality = self.core.estimate(&masks, &scale)?;
        Ok(QueryOutcome::Estimated { cardinality, prep_ms })
    }
}

impl<B: Backend, M: DensityModel<B> + Clone> CardinalityEstimator for FactorizedProgressiveSampling<B, M> {
    fn name(&self) -> String {
        format!("fact_psample_{}", self.core.options.num_samples)
    }

    fn query(&mut self, query: &Query) -> QueryOutcome {
        self.try_query(query)
            .unwrap_or_else(|err| QueryOutcome::failed(err.to_string()))
    }

    fn release_memory(&mut self) {
        B::sync(&self.core.device);
    }
}
