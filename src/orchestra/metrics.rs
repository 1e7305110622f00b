use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const METRICS_FILE: &str = "metrics.jsonl";

/// One logged optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u64,
    /// Mean loss over the micro-batches of the step.
    pub loss: f32,
    /// Mean embedding consistency difference over the same micro-batches.
    pub diff: f32,
    pub elapsed_ms: u128,
}

/// Appends one JSON object per line to `<run_dir>/metrics.jsonl`.
pub struct MetricsLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsLog {
    /// Opens the run log, creating the directory if needed. Existing lines are kept so a
    /// resumed run continues the same file.
    pub fn open<P: AsRef<Path>>(run_dir: P) -> Result<Self> {
        let run_dir = run_dir.as_ref();
        fs::create_dir_all(run_dir)?;

        let path = run_dir.join(METRICS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, metrics: &StepMetrics) -> Result<()> {
        serde_json::to_writer(&mut self.writer, metrics)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
