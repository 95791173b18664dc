//! Learning-rate policies.
//!
//! Exactly one policy drives a run. They are checked in a fixed precedence:
//! a constant rate, then a custom function of the global step, then the
//! inverse-square-root warmup schedule, then a stepped scheduler object.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

use crate::cardest::error::{CardEstError, Result};

/// Base rate of the optimizers when the policy does not dictate one.
pub const DEFAULT_BASE_LR: f64 = 2e-4;
pub const ONE_CYCLE_MAX_LR: f64 = 2e-3;
const ONE_CYCLE_DEFAULT_PCT: f64 = 0.3;
const ONE_CYCLE_DIV_FACTOR: f64 = 25.0;
const ONE_CYCLE_FINAL_DIV_FACTOR: f64 = 1e4;
const COSINE_MIN_MULTIPLIER: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SteppedKind {
    CosineAnnealing,
    OneCycle { pct_start: f64 },
}

/// Scheduler advanced once per optimizer step. Its state is part of a
/// checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteppedScheduler {
    pub kind: SteppedKind,
    pub base_lr: f64,
    pub total_steps: usize,
    pub step_count: usize,
}

fn anneal_cos(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * (1.0 + (PI * pct).cos())
}

impl SteppedScheduler {
    pub fn cosine_annealing(base_lr: f64, total_steps: usize) -> Self {
        Self {
            kind: SteppedKind::CosineAnnealing,
            base_lr,
            total_steps: total_steps.max(1),
            step_count: 0,
        }
    }

    pub fn one_cycle(max_lr: f64, total_steps: usize, pct_start: f64) -> Self {
        Self {
            kind: SteppedKind::OneCycle { pct_start },
            base_lr: max_lr,
            total_steps: total_steps.max(1),
            step_count: 0,
        }
    }

    pub fn current_lr(&self) -> f64 {
        let t = self.step_count as f64;
        match self.kind {
            SteppedKind::CosineAnnealing => {
                let pct = (t / self.total_steps as f64).min(1.0);
                anneal_cos(self.base_lr, 0.0, pct)
            }
            SteppedKind::OneCycle { pct_start } => {
                let initial = self.base_lr / ONE_CYCLE_DIV_FACTOR;
                let min_lr = initial / ONE_CYCLE_FINAL_DIV_FACTOR;
                let last = (self.total_steps as f64 - 1.0).max(1.0);
                let warm_end = ((pct_start * self.total_steps as f64).round() - 1.0).max(1.0).min(last);
                if t <= warm_end {
                    anneal_cos(initial, self.base_lr, t / warm_end)
                } else {
                    let pct = ((t - warm_end) / (last - warm_end).max(1.0)).min(1.0);
                    anneal_cos(self.base_lr, min_lr, pct)
                }
            }
        }
    }

    pub fn step(&mut self) {
        self.step_count += 1;
    }
}

/// Cosine decay with linear warmup, as a multiplier of `base_lr`.
pub fn cosine_with_warmup(base_lr: f64, warmup_steps: usize, total_steps: usize) -> impl Fn(usize) -> f64 + Send + Sync {
    move |global_step: usize| {
        let mult = if global_step < warmup_steps {
            global_step as f64 / warmup_steps.max(1) as f64
        } else {
            let span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
            let progress = ((global_step - warmup_steps) as f64 / span).min(1.0);
            (0.5 * (1.0 + (PI * progress).cos())).max(COSINE_MIN_MULTIPLIER)
        };
        base_lr * mult
    }
}

pub enum LrPolicy {
    Constant(f64),
    Custom(Box<dyn Fn(usize) -> f64 + Send + Sync>),
    /// `d_model^-0.5 * min(t^-0.5, t * warmup^-1.5)`
    Warmup { d_model: usize, warmup_steps: usize },
    Stepped(SteppedScheduler),
}

impl fmt::Debug for LrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LrPolicy::Constant(lr) => write!(f, "Constant({lr})"),
            LrPolicy::Custom(_) => write!(f, "Custom(..)"),
            LrPolicy::Warmup { d_model, warmup_steps } => {
                write!(f, "Warmup {{ d_model: {d_model}, warmup_steps: {warmup_steps} }}")
            }
            LrPolicy::Stepped(s) => write!(f, "Stepped({:?})", s.kind),
        }
    }
}

/// The candidate policies of a run, before precedence is applied.
#[derive(Default)]
pub struct LrPolicyChoice {
    pub constant: Option<f64>,
    pub custom: Option<Box<dyn Fn(usize) -> f64 + Send + Sync>>,
    /// `(d_model, warmups)`; `warmups < 1` is a fraction of the total steps.
    pub warmup: Option<(usize, f64)>,
    pub stepped: Option<SteppedScheduler>,
}

impl LrPolicyChoice {
    /// Parse the `lr_scheduler` selector into the custom or stepped slot.
    ///
    /// Accepted: `CosineAnnealingLR`, `OneCycleLR`, `OneCycleLR-<pct>`,
    /// `wd_<lr>_<warmup_fraction>`.
    pub fn with_scheduler(mut self, selector: Option<&str>, total_steps: usize) -> Result<Self> {
        let Some(selector) = selector else {
            return Ok(self);
        };
        if let Some(rest) = selector.strip_prefix("wd_") {
            let (lr, frac) = rest
                .split_once('_')
                .ok_or_else(|| CardEstError::invalid_setting("lr_scheduler", format!("bad `{selector}`")))?;
            let lr: f64 = lr
                .parse()
                .map_err(|_| CardEstError::invalid_setting("lr_scheduler", format!("bad rate in `{selector}`")))?;
            let frac: f64 = frac
                .parse()
                .map_err(|_| CardEstError::invalid_setting("lr_scheduler", format!("bad fraction in `{selector}`")))?;
            let warmup = (frac * total_steps as f64).round() as usize;
            self.custom = Some(Box::new(cosine_with_warmup(lr, warmup, total_steps)));
        } else if selector == "CosineAnnealingLR" {
            self.stepped = Some(SteppedScheduler::cosine_annealing(DEFAULT_BASE_LR, total_steps));
        } else if let Some(rest) = selector.strip_prefix("OneCycleLR") {
            let pct = match rest.strip_prefix('-') {
                Some(p) => p
                    .parse()
                    .map_err(|_| CardEstError::invalid_setting("lr_scheduler", format!("bad pct in `{selector}`")))?,
                None if rest.is_empty() => ONE_CYCLE_DEFAULT_PCT,
                None => {
                    return Err(CardEstError::invalid_setting("lr_scheduler", format!("unknown `{selector}`")))
                }
            };
            self.stepped = Some(SteppedScheduler::one_cycle(ONE_CYCLE_MAX_LR, total_steps, pct));
        } else {
            return Err(CardEstError::invalid_setting(
                "lr_scheduler",
                format!("unknown scheduler `{selector}`"),
            ));
        }
        Ok(self)
    }

    /// Apply the precedence order. `total_steps` converts fractional warmups.
    pub fn resolve(self, total_steps: usize) -> Result<LrPolicy> {
        if let Some(lr) = self.constant {
            return Ok(LrPolicy::Constant(lr));
        }
        if let Some(f) = self.custom {
            return Ok(LrPolicy::Custom(f));
        }
        if let Some((d_model, warmups)) = self.warmup {
            let warmup_steps = if warmups < 1.0 {
                (warmups * total_steps as f64).round() as usize
            } else {
                warmups as usize
            };
            return Ok(LrPolicy::Warmup {
                d_model,
                warmup_steps: warmup_steps.max(1),
            });
        }
        if let Some(s) = self.stepped {
            return Ok(LrPolicy::Stepped(s));
        }
        Err(CardEstError::NoLearningRatePolicy)
    }
}

impl LrPolicy {
    /// Rate for the 1-based global step about to run.
    pub fn lr_at(&self, global_step: usize) -> f64 {
        match self {
            LrPolicy::Constant(lr) => *lr,
            LrPolicy::Custom(f) => f(global_step),
            LrPolicy::Warmup { d_model, warmup_steps } => {
                let t = global_step.max(1) as f64;
                let w = *warmup_steps as f64;
                (*d_model as f64).powf(-0.5) * t.powf(-0.5).min(t * w.powf(-1.5))
            }
            LrPolicy::Stepped(s) => s.current_lr(),
        }
    }

    pub fn stepped(&self) -> Option<&SteppedScheduler> {
        match self {
            LrPolicy::Stepped(s) => Some(s),
            _ => None,
        }
    }

    pub fn stepped_mut(&mut self) -> Option<&mut SteppedScheduler> {
        match self {
            LrPolicy::Stepped(s) => Some(s),
            _ => None,
        }
    }
}
