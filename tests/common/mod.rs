#![allow(dead_code)]

use std::{env, fs, path::PathBuf, process, sync::Arc};

use ndarray::{Array, Dimension, ShapeBuilder};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use swarm_orchestra::{
    checkpoint::JsonFileStore,
    config::{CouplingConfig, OptimizerConfig, UpdateRuleConfig},
    data::RandomTokens,
    Orchestrator, PipelineHandle, SwarmConfig,
};

pub const MLP: CouplingConfig = CouplingConfig::Mlp { ff_mult: 2 };

/// A small model that trains with plain gradient descent.
pub fn small_config(layers: usize, d_model: usize, coupling: CouplingConfig) -> SwarmConfig {
    let mut config = SwarmConfig::default();

    config.model.vocab = 32;
    config.model.d_model = d_model;
    config.model.layers = layers;
    config.model.coupling = coupling;
    config.training.batch_size = 2;
    config.training.seq_len = 5;
    config.training.seed = Some(7);
    config.optimizer = OptimizerConfig {
        rule: UpdateRuleConfig::GradientDescent { lr: 0.1 },
        clip_global_norm: None,
    };

    config
}

pub async fn spawn(config: &SwarmConfig, seed: u64) -> PipelineHandle {
    PipelineHandle::spawn(config, Arc::new(JsonFileStore), seed)
        .await
        .unwrap()
}

pub fn new_orchestrator(pipeline: PipelineHandle, config: &SwarmConfig) -> Orchestrator<RandomTokens> {
    let training = &config.training;
    let data = RandomTokens::new(
        config.model.vocab as u32,
        training.batch_size,
        training.seq_len,
        3,
    );

    Orchestrator::new(pipeline, data, training).unwrap()
}

pub fn randn<Sh, D>(shape: Sh, seed: u64) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    let mut rng = StdRng::seed_from_u64(seed);
    Array::from_shape_simple_fn(shape, || StandardNormal.sample(&mut rng))
}

/// A fresh, empty directory private to this test process.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("swarm-{name}-{}", process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}
