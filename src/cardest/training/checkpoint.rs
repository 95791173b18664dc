//! Checkpoint directories.
//!
//! ```text
//! <dir>/model.mpk   model parameters
//! <dir>/optim.mpk   optimizer state
//! <dir>/meta.json   epoch, loss, step counters, stepped-scheduler state
//! ```

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::schedule::SteppedScheduler;
use crate::cardest::error::{CardEstError, Result};

pub const MODEL_FILE: &str = "model";
pub const OPTIMIZER_FILE: &str = "optim";
pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    /// Mean training loss of `epoch`, bits per tuple.
    pub loss: f64,
    pub global_step: usize,
    pub optimizer_steps: usize,
    /// Scheduler advances so far; older checkpoints without it restore as 0.
    #[serde(default)]
    pub scheduler_steps: usize,
    pub scheduler: Option<SteppedScheduler>,
}

impl CheckpointMeta {
    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(META_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(dir.join(META_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Resolve a glob pattern to exactly one checkpoint directory.
///
/// # Errors
/// `CheckpointNotFound` when the pattern matches zero or several paths.
pub fn find_checkpoint(pattern: &str) -> Result<PathBuf> {
    let matches: Vec<PathBuf> = glob::glob(pattern)?.filter_map(|entry| entry.ok()).collect();
    match matches.as_slice() {
        [single] => Ok(single.clone()),
        _ => Err(CardEstError::CheckpointNotFound {
            pattern: pattern.to_string(),
            found: matches.len(),
        }),
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

pub fn save_model<B: Backend, M: Module<B>>(dir: &Path, model: &M) -> Result<()> {
    fs::create_dir_all(dir)?;
    model
        .clone()
        .save_file(dir.join(MODEL_FILE), &recorder())
        .map_err(CardEstError::record)?;
    info!("Saved model parameters to {:?}", dir);
    Ok(())
}

/// Load parameters into an already-constructed model of the same shape.
pub fn load_model<B: Backend, M: Module<B>>(dir: &Path, model: M, device: &B::Device) -> Result<M> {
    model
        .load_file(dir.join(MODEL_FILE), &recorder(), device)
        .map_err(CardEstError::record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_checkpoint_requires_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/run-*", dir.path().display());

        assert!(matches!(
            find_checkpoint(&pattern),
            Err(CardEstError::CheckpointNotFound { found: 0, .. })
        ));

        fs::create_dir(dir.path().join("run-1")).unwrap();
        assert_eq!(find_checkpoint(&pattern).unwrap(), dir.path().join("run-1"));

        fs::create_dir(dir.path().join("run-2")).unwrap();
        assert!(matches!(
            find_checkpoint(&pattern),
            Err(CardEstError::CheckpointNotFound { found: 2, .. })
        ));
    }

    #[test]
    fn test_meta_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = CheckpointMeta {
            epoch: 5,
            loss: 3.25,
            global_step: 60,
            optimizer_steps: 30,
            scheduler_steps: 30,
            scheduler: Some(SteppedScheduler::cosine_annealing(1e-3, 100)),
        };
        meta.write(dir.path()).unwrap();
        assert_eq!(CheckpointMeta::read(dir.path()).unwrap(), meta);
    }

    #[test]
    fn test_meta_without_scheduler_steps_still_reads() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{"epoch":1,"loss":2.0,"global_step":4,"optimizer_steps":4,"scheduler":null}"#;
        fs::write(dir.path().join(META_FILE), json).unwrap();
        let meta = CheckpointMeta::read(dir.path()).unwrap();
        assert_eq!(meta.scheduler_steps, 0);
        assert_eq!(meta.optimizer_steps, 4);
    }
}
