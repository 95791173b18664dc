//! The interface the training loop and the estimators see of a density
//! model.

use burn::module::ParamId;
use burn::tensor::{backend::Backend, Int, Tensor};

use super::loss_utils;
use super::ordering::Ordering;

/// Capability of models trained over several orderings at once.
pub trait SupportsOrderingEnsemble {
    fn num_orderings(&self) -> usize;

    fn active_index(&self) -> usize;

    /// Install ordering `index` and rebuild the connectivity masks.
    fn set_ordering_index(&mut self, index: usize);

    /// Install the next ordering, cycling through the ensemble.
    fn update_masks(&mut self);
}

/// Autoregressive model over discretised columns.
pub trait DensityModel<B: Backend> {
    /// `[N, num_columns]` codes (wildcard tokens allowed) to
    /// `[N, sum(domain_sizes)]` logits.
    fn forward_logits(&self, codes: Tensor<B, 2, Int>) -> Tensor<B, 2>;

    fn domain_sizes(&self) -> &[usize];

    fn embed_size(&self) -> usize;

    /// Currently installed ordering.
    fn ordering(&self) -> &Ordering;

    /// Every trainable parameter with its tensor rank.
    fn param_refs(&self) -> Vec<(ParamId, usize)>;

    fn ensemble(&self) -> Option<&dyn SupportsOrderingEnsemble>;

    fn ensemble_mut(&mut self) -> Option<&mut dyn SupportsOrderingEnsemble>;

    fn num_columns(&self) -> usize {
        self.domain_sizes().len()
    }

    /// Input code meaning "column not observed".
    fn wildcard_token(&self, column: usize) -> u32 {
        self.domain_sizes()[column] as u32
    }

    /// Per-tuple negative log-likelihood in nats, shape `[N]`.
    fn nll(&self, logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>, label_smoothing: f64) -> Tensor<B, 1> {
        loss_utils::autoregressive_nll(logits, targets, self.domain_sizes(), label_smoothing)
    }

    /// Logits block of one column, `[N, D_column]`.
    fn column_logits(&self, logits: Tensor<B, 2>, column: usize) -> Tensor<B, 2> {
        let offsets = loss_utils::logit_offsets(self.domain_sizes());
        loss_utils::column_block(logits, &offsets, column)
    }
}
