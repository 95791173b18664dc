use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::StepResult;
use crate::cardest::error::{CardEstError, Result};

/// Receives one structured result per trial step.
pub trait ResultSink {
    fn record(&mut self, result: &StepResult) -> Result<()>;

    /// Flush and release the underlying resource. Further records are an
    /// error for sinks that own a file.
    fn close(&mut self) -> Result<()>;
}

/// Appends one JSON object per step to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for JsonLinesSink {
    fn record(&mut self, result: &StepResult) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CardEstError::InvalidState(format!("sink {:?} is closed", self.path)))?;
        serde_json::to_writer(&mut *writer, result)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!("Closed result sink {:?}", self.path);
        }
        Ok(())
    }
}
