use std::{path::PathBuf, time::Instant};

use log::{debug, info, warn};
use ndarray::{Array3, Zip};
use tokio_util::sync::CancellationToken;

use super::{MetricsLog, PipelineHandle, StepMetrics};
use crate::{
    config::TrainingConfig,
    data::{Batch, DataSource},
    error::{Result, SwarmError},
};

/// Tolerance of the debug reconstruction check, `|a - b| <= ATOL + RTOL * |b|`.
const RTOL: f32 = 1e-4;
const ATOL: f32 = 1e-4;

/// What one forward, backward and (maybe) optimize cycle produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Optimizer steps completed so far.
    pub step: u64,
    pub loss: f32,
    /// Mean squared difference between the embedding and its reconstruction through the stages.
    pub diff: f32,
    /// Whether this cycle ended with the global step barrier.
    pub stepped: bool,
}

/// Drives the pipeline: one batch at a time through the embedding, the stages and back, then the
/// global optimizer step.
pub struct Orchestrator<D> {
    pipeline: PipelineHandle,
    data: D,
    accumulation_steps: usize,
    debug_activations: bool,
    log_every: u64,
    checkpoint_every: Option<u64>,
    checkpoint_dir: Option<PathBuf>,
    metrics: Option<MetricsLog>,
    step: u64,
    pending: usize,
    resumed: bool,
}

impl<D: DataSource> Orchestrator<D> {
    /// Creates a new `Orchestrator`.
    ///
    /// # Arguments
    /// * `pipeline` - The initialized actors.
    /// * `data` - Where batches come from.
    /// * `training` - Cadences, directories and the debug switch.
    ///
    /// # Errors
    /// `Io` if the run log cannot be opened.
    pub fn new(pipeline: PipelineHandle, data: D, training: &TrainingConfig) -> Result<Self> {
        let metrics = training
            .run_dir
            .as_ref()
            .map(MetricsLog::open)
            .transpose()?;

        Ok(Self {
            pipeline,
            data,
            accumulation_steps: training.accumulation_steps.max(1),
            debug_activations: training.debug_activations,
            log_every: training.log_every.max(1),
            checkpoint_every: training.checkpoint_every,
            checkpoint_dir: training.checkpoint_dir.clone(),
            metrics,
            step: 0,
            pending: 0,
            resumed: false,
        })
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }

    /// Optimizer steps completed so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Runs one micro-batch cycle, stepping every actor once `accumulation_steps` cycles have
    /// accumulated.
    ///
    /// Any failure aborts the cycle. Before it is returned every actor is asked to drop its
    /// accumulated gradients, so the pipeline is left without half-counted contributions.
    pub async fn train_step(&mut self) -> Result<StepReport> {
        let batch = self.data.get_samples()?;
        let result = self.cycle(batch).await;

        if result.is_err() {
            self.pending = 0;
            if let Err(e) = self.pipeline.reset_gradients().await {
                warn!(error:% = e; "could not reset gradients after a failed cycle");
            }
        }

        result
    }

    async fn cycle(&mut self, batch: Batch) -> Result<StepReport> {
        let Batch { obs, target } = batch;
        let embedding = self.pipeline.embedding();
        let stages = self.pipeline.stages();

        let mut x = embedding.embed_forward(obs.clone()).await?;

        let mut inputs = Vec::new();
        for stage in stages {
            if self.debug_activations {
                inputs.push(x.clone());
            }
            x = stage.forward(x).await?;
        }

        let ((mut y, mut dy), loss) = embedding.debed_grad(x, target).await?;
        if !loss.is_finite() {
            return Err(SwarmError::NumericDivergence {
                step: self.step,
                loss,
            });
        }

        for (i, stage) in stages.iter().enumerate().rev() {
            (y, dy) = stage.backward((y, dy)).await?;

            if let Some(input) = inputs.get(i) {
                check_reconstruction(i, input, &y)?;
            }
        }

        let diff = embedding.embed_grad(obs, (y, dy)).await?;
        debug!(step = self.step, loss, diff; "cycle done");

        self.pending += 1;
        let stepped = self.pending >= self.accumulation_steps;
        if stepped {
            self.pipeline.step_all().await?;
            self.pending = 0;
            self.step += 1;
        }

        Ok(StepReport {
            step: self.step,
            loss,
            diff,
            stepped,
        })
    }

    /// Trains until `num_steps` optimizer steps have been completed in total, or until `cancel`
    /// fires. Cancellation is only observed between cycles.
    ///
    /// On the first call, every actor is asked to restore its latest snapshot from the
    /// checkpoint directory. Snapshots are written every `checkpoint_every` steps and once more
    /// when the loop ends.
    ///
    /// # Returns
    /// The number of optimizer steps completed.
    pub async fn run(&mut self, num_steps: u64, cancel: &CancellationToken) -> Result<u64> {
        if !self.resumed {
            self.resume().await?;
            self.resumed = true;
        }

        let start = Instant::now();
        let (mut loss_sum, mut diff_sum, mut cycles) = (0., 0., 0);

        while self.step < num_steps {
            if cancel.is_cancelled() {
                info!(step = self.step; "training cancelled");
                break;
            }

            let report = self.train_step().await?;
            loss_sum += report.loss;
            diff_sum += report.diff;
            cycles += 1;

            if !report.stepped {
                continue;
            }

            let metrics = StepMetrics {
                step: report.step,
                loss: loss_sum / cycles as f32,
                diff: diff_sum / cycles as f32,
                elapsed_ms: start.elapsed().as_millis(),
            };
            (loss_sum, diff_sum, cycles) = (0., 0., 0);

            if report.step % self.log_every == 0 {
                info!(step = metrics.step, loss = metrics.loss, diff = metrics.diff; "training");
                if let Some(log) = &mut self.metrics {
                    log.record(&metrics)?;
                }
            }

            if self.checkpoint_every.is_some_and(|every| report.step % every == 0) {
                self.checkpoint().await?;
            }
        }

        self.checkpoint().await?;
        info!(step = self.step; "training finished");
        Ok(self.step)
    }

    /// Restores the actors from the checkpoint directory, if any.
    ///
    /// Training resumes at the furthest step any actor restored, so the epochs of new snapshots
    /// sort after every snapshot already on disk. When only some actors restored, the mix is
    /// kept as is.
    async fn resume(&mut self) -> Result<()> {
        let Some(dir) = &self.checkpoint_dir else {
            return Ok(());
        };

        let restored = self.pipeline.load_all(dir).await?;
        let count = restored.iter().filter(|&&r| r).count();
        if count == 0 {
            return Ok(());
        }

        let steps = self.pipeline.get_steps().await?;
        self.step = steps.into_iter().max().unwrap_or(0);

        if count == restored.len() {
            info!(step = self.step; "resuming from checkpoint");
        } else {
            warn!(
                restored = count,
                actors = restored.len(),
                step = self.step;
                "only some actors restored a snapshot"
            );
        }

        Ok(())
    }

    async fn checkpoint(&self) -> Result<()> {
        let Some(dir) = &self.checkpoint_dir else {
            return Ok(());
        };

        self.pipeline.save_all(dir, self.step).await?;
        info!(step = self.step, dir:% = dir.display(); "checkpoint saved");
        Ok(())
    }
}

/// Compares a stage's forward input with the input it reconstructed on the way back.
fn check_reconstruction(
    stage: usize,
    forward: &Array3<f32>,
    reconstructed: &Array3<f32>,
) -> Result<()> {
    if forward.dim() != reconstructed.dim() {
        return Err(SwarmError::shape(
            format!("stage {stage} reconstruction"),
            reconstructed.shape(),
            forward.shape(),
        ));
    }

    let mut max_abs_err = 0f32;
    let mut within = true;
    Zip::from(forward).and(reconstructed).for_each(|&a, &b| {
        let err = (a - b).abs();
        max_abs_err = max_abs_err.max(err);
        within &= err <= ATOL + RTOL * b.abs();
    });

    if !within {
        return Err(SwarmError::ReconstructionMismatch { stage, max_abs_err });
    }

    debug!(stage, max_abs_err; "reconstruction verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstruction_within_tolerance() {
        let a = Array3::<f32>::from_elem((1, 2, 2), 1.);
        let b = a.mapv(|x| x + 1e-5);
        tokio_test::assert_ok!(check_reconstruction(0, &a, &b));
    }

    #[test]
    fn reconstruction_drift_is_reported() {
        let a = Array3::<f32>::from_elem((1, 2, 2), 1.);
        let mut b = a.clone();
        b[[0, 1, 1]] += 0.1;

        let err = tokio_test::assert_err!(check_reconstruction(3, &a, &b));
        match err {
            SwarmError::ReconstructionMismatch { stage, max_abs_err } => {
                assert_eq!(stage, 3);
                assert!((max_abs_err - 0.1).abs() < 1e-6);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
