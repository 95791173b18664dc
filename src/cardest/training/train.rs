//! Epoch loop of the density model.
//!
//! Training always runs the single ordering installed by a mask refresh
//! before each forward. Evaluation forwards every batch through every
//! ordering of an ensemble and sums the logits before the likelihood.

use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams};
use burn::tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Int, Tensor, TensorData};
use rand::{rngs::StdRng, SeedableRng};
use std::marker::PhantomData;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use super::checkpoint::{self, CheckpointMeta, OPTIMIZER_FILE};
use super::meters::{human_format, ProgressMeter};
use super::optimizer::StepOptimizer;
use super::schedule::LrPolicy;
use crate::cardest::architectures::{apply_wildcard_dropout, loss_utils, DensityModel};
use crate::cardest::data::{TupleBatch, TupleStream};
use crate::cardest::error::{CardEstError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Eval,
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// Gradient accumulation window.
    pub accum_iter: usize,
    /// Per-epoch step cap (`upto`); mandatory for unbounded streams.
    pub max_steps: usize,
    pub label_smoothing: f64,
    pub log_every: usize,
    pub wildcard_dropout: bool,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            accum_iter: 1,
            max_steps: usize::MAX,
            label_smoothing: 0.0,
            log_every: 10,
            wildcard_dropout: false,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpochOutcome {
    /// Mean loss over the epoch, bits per tuple.
    pub mean_loss: f64,
    /// Per-step losses, bits per tuple.
    pub losses: Vec<f64>,
}

/// Number of steps an epoch over `stream` takes.
pub fn steps_per_epoch(len_hint: Option<usize>, batch_size: usize, max_steps: usize) -> usize {
    match len_hint {
        Some(len) => len.div_ceil(batch_size.max(1)).min(max_steps),
        None => max_steps,
    }
}

fn codes_tensor<B: Backend>(batch: &TupleBatch, codes: &[u32], device: &B::Device) -> Tensor<B, 2, Int> {
    let values: Vec<i64> = codes.iter().map(|&c| i64::from(c)).collect();
    Tensor::from_data(TensorData::new(values, [batch.rows, batch.cols]), device)
}

pub struct Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + DensityModel<B>,
    O: StepOptimizer<M>,
{
    pub model: M,
    optimizer: O,
    policy: LrPolicy,
    accumulator: GradientsAccumulator<M>,
    config: TrainConfig,
    device: B::Device,
    rng: StdRng,
    global_step: usize,
    optimizer_steps: usize,
    scheduler_steps: usize,
    _backend: PhantomData<B>,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + DensityModel<B>,
    M::InnerModule: DensityModel<B::InnerBackend>,
    O: StepOptimizer<M>,
{
    pub fn new(model: M, optimizer: O, policy: LrPolicy, config: TrainConfig, device: B::Device) -> Result<Self> {
        if config.accum_iter == 0 {
            return Err(CardEstError::invalid_setting("accum_iter", "must be >= 1"));
        }
        info!("Learning-rate policy: {:?}", policy);
        Ok(Self {
            model,
            optimizer,
            policy,
            accumulator: GradientsAccumulator::new(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            device,
            global_step: 0,
            optimizer_steps: 0,
            scheduler_steps: 0,
            _backend: PhantomData,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    pub fn scheduler_steps(&self) -> usize {
        self.scheduler_steps
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn policy(&self) -> &LrPolicy {
        &self.policy
    }

    /// Rate the next training step will use.
    pub fn next_lr(&self) -> f64 {
        self.policy.lr_at(self.global_step + 1)
    }

    /// Run one epoch over `stream` and return the mean loss in bits.
    pub fn run_epoch(&mut self, split: Split, stream: &mut dyn TupleStream, epoch: usize) -> Result<EpochOutcome> {
        match split {
            Split::Train => self.train_epoch(stream, epoch),
            Split::Eval => self.eval_epoch(stream, epoch),
        }
    }

    fn train_epoch(&mut self, stream: &mut dyn TupleStream, epoch: usize) -> Result<EpochOutcome> {
        let max_step = steps_per_epoch(stream.len_hint(), self.config.batch_size, self.config.max_steps);
        if stream.len_hint().is_none() && self.config.max_steps == usize::MAX {
            return Err(CardEstError::invalid_setting("max_steps", "unbounded streams need a step budget"));
        }
        stream.start_epoch(true);

        let accum = self.config.accum_iter;
        let mut meter = ProgressMeter::new(format!("Epoch: [{epoch}]"), max_step);
        let mut losses = Vec::with_capacity(max_step);

        for step in 0..max_step {
            let Some(batch) = stream.next_batch(self.config.batch_size) else {
                break;
            };
            let started = Instant::now();
            if step == 0 {
                self.accumulator = GradientsAccumulator::new();
            }
            self.global_step += 1;
            let lr = self.policy.lr_at(self.global_step);

            if let Some(ensemble) = self.model.ensemble_mut() {
                ensemble.update_masks();
            }

            let targets = codes_tensor::<B>(&batch, &batch.codes, &self.device);
            let inputs = if self.config.wildcard_dropout {
                let mut dropped = batch.codes.clone();
                apply_wildcard_dropout(&mut dropped, batch.cols, self.model.domain_sizes(), &mut self.rng);
                codes_tensor::<B>(&batch, &dropped, &self.device)
            } else {
                targets.clone()
            };

            let logits = self.model.forward_logits(inputs);
            let loss = self
                .model
                .nll(logits, targets, self.config.label_smoothing)
                .mean();
            let nats = loss_utils::ensure_finite(&loss, epoch, step)?;

            let grads = loss.div_scalar(accum as f64).backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            if self.config.log_every > 0 && step % self.config.log_every == 0 {
                debug!("Step {step}: grad L2 norm {:.4}", self.grad_norm(&grads));
            }
            self.accumulator.accumulate(&self.model, grads);

            if (step + 1) % accum == 0 || step + 1 == max_step {
                let grads = self.accumulator.grads();
                self.model = self.optimizer.step(lr, self.model.clone(), grads);
                self.optimizer_steps += 1;
                if let Some(scheduler) = self.policy.stepped_mut() {
                    scheduler.step();
                    self.scheduler_steps += 1;
                }
            }

            let bits = loss_utils::nats_to_bits(nats);
            losses.push(bits);
            let elapsed = started.elapsed().as_secs_f64();
            meter.batch_time.update(elapsed, 1);
            meter.throughput.update(batch.rows as f64 / elapsed.max(1e-9), 1);
            meter.loss.update(bits, batch.rows);
            meter.lr.update(lr, 1);
            if self.config.log_every > 0 && step % self.config.log_every == 0 {
                info!("{}", meter.display(step));
            }
        }

        let mean_loss = mean(&losses);
        info!(
            "Epoch {epoch} train loss {:.4} bits/tuple over {} steps ({} tuples/s)",
            mean_loss,
            losses.len(),
            human_format(meter.throughput.avg())
        );
        Ok(EpochOutcome { mean_loss, losses })
    }

    /// Scores held-out tuples with the training objective, label smoothing included,
    /// so train and eval losses stay comparable.
    fn eval_epoch(&mut self, stream: &mut dyn TupleStream, epoch: usize) -> Result<EpochOutcome> {
        let max_step = steps_per_epoch(stream.len_hint(), self.config.batch_size, self.config.max_steps);
        stream.start_epoch(false);

        let mut model = self.model.valid();
        let ensemble = model.ensemble().map(|e| (e.num_orderings(), e.active_index()));
        let mut losses = Vec::with_capacity(max_step);

        for step in 0..max_step {
            let Some(batch) = stream.next_batch(self.config.batch_size) else {
                break;
            };
            let codes = codes_tensor::<B::InnerBackend>(&batch, &batch.codes, &self.device);
            let logits = match ensemble {
                Some((num_orderings, _)) => {
                    let mut sum: Option<Tensor<B::InnerBackend, 2>> = None;
                    for i in 0..num_orderings {
                        if let Some(e) = model.ensemble_mut() {
                            e.set_ordering_index(i);
                        }
                        let out = model.forward_logits(codes.clone());
                        sum = Some(match sum {
                            Some(acc) => acc + out,
                            None => out,
                        });
                    }
                    sum.ok_or_else(|| CardEstError::InvalidState("empty ordering ensemble".into()))?
                }
                None => model.forward_logits(codes.clone()),
            };
            let loss = model.nll(logits, codes, self.config.label_smoothing).mean();
            let nats = loss_utils::ensure_finite(&loss, epoch, step)?;
            losses.push(loss_utils::nats_to_bits(nats));
        }

        let mean_loss = mean(&losses);
        info!("Epoch {epoch} eval loss {:.4} bits/tuple", mean_loss);
        Ok(EpochOutcome { mean_loss, losses })
    }

    /// L2 norm over every parameter gradient. Diagnostics only.
    fn grad_norm(&self, grads: &GradientsParams) -> f64 {
        let mut sum_sq = 0.0;
        for (id, rank) in self.model.param_refs() {
            let sq = match rank {
                1 => grads
                    .get::<B::InnerBackend, 1>(id)
                    .map(|g| g.powf_scalar(2.0).sum().into_scalar().elem::<f64>()),
                2 => grads
                    .get::<B::InnerBackend, 2>(id)
                    .map(|g| g.powf_scalar(2.0).sum().into_scalar().elem::<f64>()),
                _ => None,
            };
            sum_sq += sq.unwrap_or(0.0);
        }
        sum_sq.sqrt()
    }

    /// Persist model, optimizer state and progress counters.
    pub fn save_checkpoint(&self, dir: &Path, epoch: usize, loss: f64) -> Result<CheckpointMeta> {
        checkpoint::save_model::<B, M>(dir, &self.model)?;
        self.optimizer.save_state(&dir.join(OPTIMIZER_FILE))?;
        let meta = CheckpointMeta {
            epoch,
            loss,
            global_step: self.global_step,
            optimizer_steps: self.optimizer_steps,
            scheduler_steps: self.scheduler_steps,
            scheduler: self.policy.stepped().cloned(),
        };
        meta.write(dir)?;
        info!("Checkpoint for epoch {epoch} written to {:?}", dir);
        Ok(meta)
    }

    /// Restore model, optimizer and counters from a checkpoint directory.
    pub fn load_checkpoint(&mut self, dir: &Path) -> Result<CheckpointMeta> {
        let meta = CheckpointMeta::read(dir)?;
        self.load_model(dir)?;
        self.optimizer.load_state(&dir.join(OPTIMIZER_FILE))?;
        self.global_step = meta.global_step;
        self.optimizer_steps = meta.optimizer_steps;
        self.scheduler_steps = meta.scheduler_steps;
        if let (Some(saved), Some(current)) = (meta.scheduler.as_ref(), self.policy.stepped_mut()) {
            *current = saved.clone();
        }
        info!(
            "Restored checkpoint {:?}: epoch {}, loss {:.4}",
            dir, meta.epoch, meta.loss
        );
        Ok(meta)
    }

    /// Restore only the model parameters.
    pub fn load_model(&mut self, dir: &Path) -> Result<()> {
        self.model = checkpoint::load_model::<B, M>(dir, self.model.clone(), &self.device)?;
        Ok(())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_per_epoch() {
        assert_eq!(steps_per_epoch(Some(10), 4, usize::MAX), 3);
        assert_eq!(steps_per_epoch(Some(10), 4, 2), 2);
        assert_eq!(steps_per_epoch(None, 4, 7), 7);
    }

    #[test]
    fn test_mean_of_empty() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 3.0]), 2.0);
    }
}
