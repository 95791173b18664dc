//! Likelihood objective shared by every density model.
//!
//! The model emits one block of logits per column, concatenated along the
//! last dimension. The per-tuple negative log-likelihood is the sum over
//! columns of the categorical cross-entropy of each block, optionally label
//! smoothed.

use burn::tensor::{activation, backend::Backend, ElementConversion, Int, Tensor};

use crate::cardest::error::{CardEstError, Result};

/// Block offsets of each column's logits, `offsets[j]..offsets[j + 1]`.
pub fn logit_offsets(domain_sizes: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(domain_sizes.len() + 1);
    offsets.push(0);
    for &d in domain_sizes {
        offsets.push(offsets.last().copied().unwrap_or(0) + d);
    }
    offsets
}

/// Logits block of a single column, shape `[N, D_j]`.
pub fn column_block<B: Backend>(
    logits: Tensor<B, 2>,
    offsets: &[usize],
    column: usize,
) -> Tensor<B, 2> {
    let [n, _] = logits.dims();
    logits.slice([0..n, offsets[column]..offsets[column + 1]])
}

/// Per-tuple negative log-likelihood in nats, shape `[N]`.
///
/// # Arguments
/// * `logits` - `[N, sum(domain_sizes)]`
/// * `targets` - `[N, num_columns]` true codes (never wildcard tokens)
/// * `label_smoothing` - `e` in `(1 - e) * nll + e * mean_k(-log p_k)`
pub fn autoregressive_nll<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2, Int>,
    domain_sizes: &[usize],
    label_smoothing: f64,
) -> Tensor<B, 1> {
    let [n, _] = logits.dims();
    let offsets = logit_offsets(domain_sizes);
    let mut total: Option<Tensor<B, 2>> = None;

    for column in 0..domain_sizes.len() {
        let log_probs = activation::log_softmax(column_block(logits.clone(), &offsets, column), 1);
        let target = targets.clone().slice([0..n, column..column + 1]);
        let picked = log_probs.clone().gather(1, target).neg();

        let loss = if label_smoothing > 0.0 {
            let uniform = log_probs.mean_dim(1).neg();
            picked.mul_scalar(1.0 - label_smoothing) + uniform.mul_scalar(label_smoothing)
        } else {
            picked
        };
        total = Some(match total {
            Some(acc) => acc + loss,
            None => loss,
        });
    }

    match total {
        Some(t) => t.reshape([n]),
        None => Tensor::zeros([n], &logits.device()),
    }
}

/// Read a scalar loss back to the host and reject NaN or infinity.
///
/// # Errors
/// `NonFiniteLoss` carrying the epoch and step so the failing batch can be
/// located in the logs.
pub fn ensure_finite<B: Backend>(loss: &Tensor<B, 1>, epoch: usize, step: usize) -> Result<f64> {
    let value: f64 = loss.clone().into_scalar().elem::<f64>();
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CardEstError::NonFiniteLoss { epoch, step, value })
    }
}

/// Convert nats per tuple to bits per tuple.
pub fn nats_to_bits(nats: f64) -> f64 {
    nats / std::f64::consts::LN_2
}
