use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SwarmError},
    optimization::{
        Adam, ClipByGlobalNorm, GradientDescent, GradientDescentWithMomentum, Optimizer,
    },
    wire::NetworkPrecision,
};

/// The whole launch configuration, usually read from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
    pub optimizer: OptimizerConfig,
    pub precision: NetworkPrecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CouplingConfig {
    Mlp { ff_mult: usize },
    Attention { heads: usize, key_size: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab: usize,
    pub d_model: usize,
    /// Number of reversible stages between the embedding head and the projection tail.
    pub layers: usize,
    pub coupling: CouplingConfig,
    /// Reuse the embedding table as the output projection.
    pub tied_projection: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub steps: u64,
    pub batch_size: usize,
    pub seq_len: usize,
    /// Micro-batches accumulated before every optimizer step.
    pub accumulation_steps: usize,
    pub seed: Option<u64>,
    pub log_every: u64,
    pub checkpoint_every: Option<u64>,
    pub run_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    /// Cache every stage input and compare it with its reconstruction on the way back.
    pub debug_activations: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataConfig {
    /// Byte-level language modelling over a file.
    Text { path: PathBuf },
    /// Uniformly random tokens.
    #[default]
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateRuleConfig {
    Adam { lr: f32, b1: f32, b2: f32, eps: f32 },
    GradientDescent { lr: f32 },
    GradientDescentWithMomentum { lr: f32, mu: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub rule: UpdateRuleConfig,
    /// Clip the averaged gradient to this global norm before the update rule sees it.
    pub clip_global_norm: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab: 256,
            d_model: 256,
            layers: 12,
            coupling: CouplingConfig::Attention {
                heads: 4,
                key_size: 32,
            },
            tied_projection: true,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            steps: 1000,
            batch_size: 16,
            seq_len: 128,
            accumulation_steps: 1,
            seed: None,
            log_every: 10,
            checkpoint_every: None,
            run_dir: None,
            checkpoint_dir: None,
            debug_activations: false,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            rule: UpdateRuleConfig::Adam {
                lr: 2e-4,
                b1: 0.9,
                b2: 0.99,
                eps: 1e-5,
            },
            clip_global_norm: Some(0.25),
        }
    }
}

impl OptimizerConfig {
    /// Builds the optimizer every actor applies on `step()`.
    pub fn build(&self) -> Box<dyn Optimizer> {
        let rule: Box<dyn Optimizer> = match self.rule {
            UpdateRuleConfig::Adam { lr, b1, b2, eps } => Box::new(Adam::new(lr, b1, b2, eps)),
            UpdateRuleConfig::GradientDescent { lr } => Box::new(GradientDescent::new(lr)),
            UpdateRuleConfig::GradientDescentWithMomentum { lr, mu } => {
                Box::new(GradientDescentWithMomentum::new(lr, mu))
            }
        };

        match self.clip_global_norm {
            Some(max_norm) => Box::new(ClipByGlobalNorm::new(max_norm, rule)),
            None => rule,
        }
    }

    fn validate(&self) -> Result<()> {
        let lr = match self.rule {
            UpdateRuleConfig::Adam { lr, b1, b2, eps } => {
                if !(0. ..1.).contains(&b1) || !(0. ..1.).contains(&b2) || eps <= 0. {
                    return Err(invalid("adam betas must be in [0, 1) and eps positive"));
                }
                lr
            }
            UpdateRuleConfig::GradientDescent { lr } => lr,
            UpdateRuleConfig::GradientDescentWithMomentum { lr, mu } => {
                if !(0. ..1.).contains(&mu) {
                    return Err(invalid("momentum must be in [0, 1)"));
                }
                lr
            }
        };

        if !(lr.is_finite() && lr > 0.) {
            return Err(invalid(format!("learning rate must be positive, got {lr}")));
        }

        match self.clip_global_norm {
            Some(norm) if !(norm.is_finite() && norm > 0.) => {
                Err(invalid(format!("clip norm must be positive, got {norm}")))
            }
            _ => Ok(()),
        }
    }
}

impl SwarmConfig {
    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `Serde` if it is not valid JSON for this layout and
    /// `InvalidConfig` if validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the pipeline cannot be built from.
    pub fn validate(&self) -> Result<()> {
        let ModelConfig {
            vocab,
            d_model,
            layers,
            coupling,
            ..
        } = self.model;

        if vocab == 0 || d_model == 0 || layers == 0 {
            return Err(invalid("vocab, d_model and layers must be positive"));
        }

        if d_model % 2 != 0 {
            return Err(invalid(format!(
                "d_model must be even to split it into coupling halves, got {d_model}"
            )));
        }

        if vocab > u32::MAX as usize {
            return Err(invalid(format!("vocab {vocab} does not fit token ids")));
        }

        match coupling {
            CouplingConfig::Mlp { ff_mult } if ff_mult == 0 => {
                return Err(invalid("ff_mult must be positive"));
            }
            CouplingConfig::Attention { heads, key_size } if heads == 0 || key_size == 0 => {
                return Err(invalid("heads and key_size must be positive"));
            }
            _ => {}
        }

        let training = &self.training;
        if training.batch_size == 0 || training.seq_len == 0 || training.accumulation_steps == 0
        {
            return Err(invalid(
                "batch_size, seq_len and accumulation_steps must be positive",
            ));
        }

        if training.checkpoint_every == Some(0) {
            return Err(invalid("checkpoint_every must be positive"));
        }

        if matches!(self.data, DataConfig::Text { .. }) && vocab < 256 {
            return Err(invalid("byte-level text needs a vocabulary of at least 256"));
        }

        self.optimizer.validate()
    }
}

fn invalid(msg: impl Into<String>) -> SwarmError {
    SwarmError::InvalidConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        tokio_test::assert_ok!(SwarmConfig::default().validate());
    }

    #[test]
    fn parses_partial_json() {
        let json = r#"{
            "model": { "d_model": 64, "layers": 2, "coupling": { "kind": "mlp", "ff_mult": 4 } },
            "training": { "steps": 5, "batch_size": 2, "seq_len": 8 },
            "data": { "kind": "text", "path": "data/enwik8" },
            "optimizer": { "rule": { "kind": "gradient_descent", "lr": 0.1 } },
            "precision": { "fwd_act": "bfloat16" }
        }"#;

        let config: SwarmConfig = serde_json::from_str(json).unwrap();
        tokio_test::assert_ok!(config.validate());

        assert_eq!(config.model.vocab, 256);
        assert_eq!(config.model.coupling, CouplingConfig::Mlp { ff_mult: 4 });
        assert_eq!(config.training.accumulation_steps, 1);
        assert_eq!(config.optimizer.clip_global_norm, Some(0.25));
        assert_eq!(
            config.data,
            DataConfig::Text {
                path: "data/enwik8".into()
            }
        );
    }

    #[test]
    fn rejects_odd_width() {
        let mut config = SwarmConfig::default();
        config.model.d_model = 255;

        let err = tokio_test::assert_err!(config.validate());
        assert!(matches!(err, SwarmError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_bad_optimizer() {
        let mut config = SwarmConfig::default();
        config.optimizer.rule = UpdateRuleConfig::GradientDescent { lr: -1. };
        tokio_test::assert_err!(config.validate());

        config.optimizer.rule = UpdateRuleConfig::GradientDescent { lr: 0.1 };
        config.optimizer.clip_global_norm = Some(0.);
        tokio_test::assert_err!(config.validate());
    }
}
