use burn::module::AutodiffModule;
use burn::optim::{
    adaptor::OptimizerAdaptor, AdaGrad, AdaGradConfig, Adam, AdamConfig, GradientsParams, Optimizer,
};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use std::path::Path;

use crate::cardest::error::{CardEstError, Result};
use crate::cardest::settings::OptimizerKind;

/// What the trainer needs of an optimizer: apply one update, and persist
/// its state alongside a checkpoint.
pub trait StepOptimizer<M> {
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;

    /// Write the optimizer state to `path` (the recorder adds the extension).
    fn save_state(&self, path: &Path) -> Result<()>;

    fn load_state(&mut self, path: &Path) -> Result<()>;
}

pub enum ModelOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    Adam {
        inner: OptimizerAdaptor<Adam, M, B>,
        device: B::Device,
    },
    AdaGrad {
        inner: OptimizerAdaptor<AdaGrad, M, B>,
        device: B::Device,
    },
}

impl<M, B> ModelOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    pub fn new(kind: OptimizerKind, device: &B::Device) -> Self {
        match kind {
            OptimizerKind::Adam => Self::Adam {
                inner: AdamConfig::new().init(),
                device: device.clone(),
            },
            OptimizerKind::Adagrad => Self::AdaGrad {
                inner: AdaGradConfig::new().init(),
                device: device.clone(),
            },
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            Self::Adam { .. } => OptimizerKind::Adam,
            Self::AdaGrad { .. } => OptimizerKind::Adagrad,
        }
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

impl<M, B> StepOptimizer<M> for ModelOptimizer<M, B>
where
    M: AutodiffModule<B>,
    B: AutodiffBackend,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        match self {
            Self::Adam { inner, .. } => inner.step(lr, module, grads),
            Self::AdaGrad { inner, .. } => inner.step(lr, module, grads),
        }
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        match self {
            Self::Adam { inner, .. } => Recorder::<B>::record(&recorder(), inner.to_record(), path),
            Self::AdaGrad { inner, .. } => Recorder::<B>::record(&recorder(), inner.to_record(), path),
        }
        .map(|_| ())
        .map_err(CardEstError::record)
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        match self {
            Self::Adam { inner, device } => {
                let record = Recorder::<B>::load(&recorder(), path, device).map_err(CardEstError::record)?;
                *inner = inner.clone().load_record(record);
            }
            Self::AdaGrad { inner, device } => {
                let record = Recorder::<B>::load(&recorder(), path, device).map_err(CardEstError::record)?;
                *inner = inner.clone().load_record(record);
            }
        }
        Ok(())
    }
}
