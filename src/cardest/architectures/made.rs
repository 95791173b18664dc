//! MADE: a masked MLP whose connectivity enforces the autoregressive
//! property for the installed column ordering.
//!
//! Inputs are per-column embeddings (each column has one extra row, the
//! wildcard token, used when the column is unobserved). Hidden unit `k` gets
//! degree `k mod max(1, n - 1)`; a hidden unit sees input column `c` when its
//! degree is at least `rank(c)`, and column `c`'s output block sees hidden
//! unit `k` only when `rank(c)` exceeds the unit's degree. Column logits
//! therefore depend only on columns generated strictly earlier.
//!
//! Parameter initialisation is seeded: linear layer `l` draws from
//! `seed + 100 + l`, the embedding of column `j` from `seed + 200 + j`.

use burn::module::{Ignored, Module, Param, ParamId};
use burn::tensor::{activation, backend::Backend, Int, Tensor, TensorData};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::density::{DensityModel, SupportsOrderingEnsemble};
use super::ordering::Ordering;
use crate::cardest::error::{CardEstError, Result};

/// Hidden stack used when `layers == 0`.
pub const DEFAULT_HIDDEN_STACK: [usize; 5] = [512, 256, 512, 128, 1024];

const LINEAR_SEED_OFFSET: u64 = 100;
const EMBEDDING_SEED_OFFSET: u64 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MadeConfig {
    pub domain_sizes: Vec<usize>,
    pub embed_size: usize,
    pub hidden_sizes: Vec<usize>,
    pub seed: u64,
}

impl MadeConfig {
    /// `layers` hidden layers of width `fc_hiddens`, or the fixed default
    /// stack when `layers == 0`.
    pub fn new(domain_sizes: Vec<usize>, embed_size: usize, fc_hiddens: usize, layers: usize, seed: u64) -> Self {
        let hidden_sizes = if layers == 0 {
            DEFAULT_HIDDEN_STACK.to_vec()
        } else {
            vec![fc_hiddens; layers]
        };
        Self {
            domain_sizes,
            embed_size,
            hidden_sizes,
            seed,
        }
    }

    /// Build the model with every ordering of the ensemble; the first one is
    /// installed.
    pub fn init<B: Backend>(&self, orderings: Vec<Ordering>, device: &B::Device) -> Result<Made<B>> {
        let n = self.domain_sizes.len();
        if n == 0 {
            return Err(CardEstError::InvalidState("model needs at least one column".into()));
        }
        if orderings.is_empty() {
            return Err(CardEstError::MalformedOrdering("empty ordering ensemble".into()));
        }
        if let Some(bad) = orderings.iter().find(|o| o.len() != n) {
            return Err(CardEstError::MalformedOrdering(format!(
                "ordering over {} columns for a {n}-column model",
                bad.len()
            )));
        }

        let embeddings = self
            .domain_sizes
            .iter()
            .enumerate()
            .map(|(j, &d)| {
                let mut rng = StdRng::seed_from_u64(self.seed + EMBEDDING_SEED_OFFSET + j as u64);
                let std = (1.0 / self.embed_size as f32).sqrt();
                Param::from_tensor(normal_tensor([d + 1, self.embed_size], &mut rng, std, device))
            })
            .collect();

        let mut layers = Vec::with_capacity(self.hidden_sizes.len());
        let mut fan_in = n * self.embed_size;
        for (l, &width) in self.hidden_sizes.iter().enumerate() {
            layers.push(MaskedLinear::new(fan_in, width, self.seed + LINEAR_SEED_OFFSET + l as u64, device));
            fan_in = width;
        }
        let total_out: usize = self.domain_sizes.iter().sum();
        let output = MaskedLinear::new(
            fan_in,
            total_out,
            self.seed + LINEAR_SEED_OFFSET + self.hidden_sizes.len() as u64,
            device,
        );

        let mut spec = MadeSpec {
            domain_sizes: self.domain_sizes.clone(),
            embed_size: self.embed_size,
            hidden_sizes: self.hidden_sizes.clone(),
            orderings,
            active: 0,
            next: 1,
            masks: Vec::new(),
        };
        spec.rebuild_masks();

        Ok(Made {
            embeddings,
            layers,
            output,
            spec: Ignored(spec),
        })
    }
}

fn normal_tensor<B: Backend, const D: usize>(
    shape: [usize; D],
    rng: &mut StdRng,
    std: f32,
    device: &B::Device,
) -> Tensor<B, D> {
    let numel: usize = shape.iter().product();
    let values: Vec<f32> = (0..numel)
        .map(|_| {
            let z: f32 = StandardNormal.sample(rng);
            z * std
        })
        .collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Linear layer whose weight is multiplied by a connectivity mask.
#[derive(Module, Debug)]
pub struct MaskedLinear<B: Backend> {
    /// `[out, in]`
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> MaskedLinear<B> {
    fn new(input_dim: usize, output_dim: usize, seed: u64, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let std = (2.0 / (input_dim + output_dim) as f32).sqrt();
        Self {
            weight: Param::from_tensor(normal_tensor([output_dim, input_dim], &mut rng, std, device)),
            bias: Param::from_tensor(normal_tensor([output_dim], &mut rng, 0.01, device)),
        }
    }

    fn forward(&self, input: Tensor<B, 2>, mask: &[f32]) -> Tensor<B, 2> {
        let weight = self.weight.val();
        let [out, inp] = weight.dims();
        let mask = Tensor::<B, 2>::from_data(TensorData::new(mask.to_vec(), [out, inp]), &weight.device());
        input.matmul((weight * mask).transpose()) + self.bias.val().unsqueeze()
    }
}

/// Non-trainable state: architecture, ordering ensemble and the host-side
/// masks of the installed ordering.
#[derive(Debug, Clone)]
pub struct MadeSpec {
    pub domain_sizes: Vec<usize>,
    pub embed_size: usize,
    pub hidden_sizes: Vec<usize>,
    pub orderings: Vec<Ordering>,
    pub active: usize,
    /// Ordering installed by the next `update_masks` call.
    pub next: usize,
    /// One `[out, in]` mask per hidden layer, then the output mask.
    pub masks: Vec<Vec<f32>>,
}

impl MadeSpec {
    fn rebuild_masks(&mut self) {
        let n = self.domain_sizes.len();
        let ranks = self.orderings[self.active].ranks();
        let max_degree = n.saturating_sub(1).max(1);

        let mut prev: Vec<usize> = (0..n * self.embed_size)
            .map(|u| ranks[u / self.embed_size])
            .collect();
        let mut masks = Vec::with_capacity(self.hidden_sizes.len() + 1);
        for &width in &self.hidden_sizes {
            let degrees: Vec<usize> = (0..width).map(|k| k % max_degree).collect();
            let mut mask = Vec::with_capacity(width * prev.len());
            for &d_out in &degrees {
                mask.extend(prev.iter().map(|&d_in| if d_out >= d_in { 1.0 } else { 0.0 }));
            }
            masks.push(mask);
            prev = degrees;
        }

        let mut output = Vec::new();
        for (c, &d) in self.domain_sizes.iter().enumerate() {
            for _ in 0..d {
                output.extend(prev.iter().map(|&d_in| if ranks[c] > d_in { 1.0 } else { 0.0 }));
            }
        }
        masks.push(output);
        self.masks = masks;
    }
}

#[derive(Module, Debug)]
pub struct Made<B: Backend> {
    /// Per column `[D_j + 1, embed_size]`; the last row is the wildcard.
    embeddings: Vec<Param<Tensor<B, 2>>>,
    layers: Vec<MaskedLinear<B>>,
    output: MaskedLinear<B>,
    spec: Ignored<MadeSpec>,
}

impl<B: Backend> Made<B> {
    pub fn orderings(&self) -> &[Ordering] {
        &self.spec.0.orderings
    }

    pub fn hidden_sizes(&self) -> &[usize] {
        &self.spec.0.hidden_sizes
    }

    fn embed(&self, codes: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let [n, cols] = codes.dims();
        let parts: Vec<Tensor<B, 2>> = self
            .embeddings
            .iter()
            .enumerate()
            .take(cols)
            .map(|(j, table)| {
                let idx = codes.clone().slice([0..n, j..j + 1]).reshape([n]);
                table.val().select(0, idx)
            })
            .collect();
        Tensor::cat(parts, 1)
    }
}

impl<B: Backend> DensityModel<B> for Made<B> {
    fn forward_logits(&self, codes: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let masks = &self.spec.0.masks;
        let mut x = self.embed(codes);
        for (layer, mask) in self.layers.iter().zip(masks) {
            x = activation::relu(layer.forward(x, mask));
        }
        self.output.forward(x, &masks[self.layers.len()])
    }

    fn domain_sizes(&self) -> &[usize] {
        &self.spec.0.domain_sizes
    }

    fn embed_size(&self) -> usize {
        self.spec.0.embed_size
    }

    fn ordering(&self) -> &Ordering {
        &self.spec.0.orderings[self.spec.0.active]
    }

    fn param_refs(&self) -> Vec<(ParamId, usize)> {
        let mut refs: Vec<(ParamId, usize)> = self.embeddings.iter().map(|p| (p.id, 2)).collect();
        for layer in self.layers.iter().chain(std::iter::once(&self.output)) {
            refs.push((layer.weight.id, 2));
            refs.push((layer.bias.id, 1));
        }
        refs
    }

    fn ensemble(&self) -> Option<&dyn SupportsOrderingEnsemble> {
        (self.spec.0.orderings.len() > 1).then_some(self as &dyn SupportsOrderingEnsemble)
    }

    fn ensemble_mut(&mut self) -> Option<&mut dyn SupportsOrderingEnsemble> {
        if self.spec.0.orderings.len() > 1 {
            Some(self)
        } else {
            None
        }
    }
}

impl<B: Backend> SupportsOrderingEnsemble for Made<B> {
    fn num_orderings(&self) -> usize {
        self.spec.0.orderings.len()
    }

    fn active_index(&self) -> usize {
        self.spec.0.active
    }

    fn set_ordering_index(&mut self, index: usize) {
        let spec = &mut self.spec.0;
        spec.active = index % spec.orderings.len();
        spec.next = (spec.active + 1) % spec.orderings.len();
        spec.rebuild_masks();
    }

    fn update_masks(&mut self) {
        let next = self.spec.0.next;
        self.set_ordering_index(next);
    }
}

/// Replace a random per-row fraction of input codes with each column's
/// wildcard token so the model learns marginals over unobserved columns.
pub fn apply_wildcard_dropout(codes: &mut [u32], cols: usize, domain_sizes: &[usize], rng: &mut StdRng) {
    if cols == 0 {
        return;
    }
    for row in codes.chunks_mut(cols) {
        let p: f64 = rng.random();
        for (c, code) in row.iter_mut().enumerate() {
            if rng.random::<f64>() < p {
                *code = domain_sizes[c] as u32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_config_default_stack() {
        let config = MadeConfig::new(vec![2, 3], 4, 64, 0, 0);
        assert_eq!(config.hidden_sizes, DEFAULT_HIDDEN_STACK.to_vec());
        let config = MadeConfig::new(vec![2, 3], 4, 64, 2, 0);
        assert_eq!(config.hidden_sizes, vec![64, 64]);
    }

    #[test]
    fn test_first_column_output_is_unconnected() {
        let device = Default::default();
        let ordering = Ordering::from_order(vec![1, 0, 2]).unwrap();
        let model: Made<TestBackend> = MadeConfig::new(vec![2, 3, 2], 2, 8, 1, 0)
            .init(vec![ordering], &device)
            .unwrap();

        // Column 1 is generated first: none of its output rows connect.
        let output_mask = model.spec.0.masks.last().unwrap();
        let width = 8;
        let rows_col1 = 2..5;
        for r in rows_col1 {
            assert!(output_mask[r * width..(r + 1) * width].iter().all(|&m| m == 0.0));
        }
    }

    #[test]
    fn test_update_masks_cycles() {
        let device = Default::default();
        let orderings = vec![
            Ordering::natural(3),
            Ordering::from_order(vec![2, 1, 0]).unwrap(),
        ];
        let mut model: Made<TestBackend> = MadeConfig::new(vec![2, 2, 2], 2, 8, 1, 0)
            .init(orderings, &device)
            .unwrap();
        assert_eq!(model.active_index(), 0);
        model.update_masks();
        assert_eq!(model.active_index(), 1);
        assert_eq!(model.ordering().column_order(), &[2, 1, 0]);
        model.update_masks();
        assert_eq!(model.active_index(), 0);
        assert!(model.ensemble().is_some());
    }

    #[test]
    fn test_init_rejects_mismatched_ordering() {
        let device = Default::default();
        let result: Result<Made<TestBackend>> =
            MadeConfig::new(vec![2, 2], 2, 8, 1, 0).init(vec![Ordering::natural(3)], &device);
        assert!(result.is_err());
    }

    #[test]
    fn test_wildcard_dropout_uses_wildcard_tokens() {
        let mut rng = StdRng::seed_from_u64(1);
        let domain_sizes = [3usize, 5];
        let mut codes = vec![0u32; 2 * 200];
        apply_wildcard_dropout(&mut codes, 2, &domain_sizes, &mut rng);
        assert!(codes.chunks(2).all(|r| (r[0] == 0 || r[0] == 3) && (r[1] == 0 || r[1] == 5)));
        assert!(codes.iter().any(|&c| c != 0));
    }
}
