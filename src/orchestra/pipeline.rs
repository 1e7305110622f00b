use std::{path::Path, sync::Arc};

use futures::future::{try_join, try_join_all};
use log::info;
use ndarray::{Array2, Array3};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    actors::{Embedding, EmbeddingHandle, ReversibleBlock, ReversibleHandle},
    checkpoint::CheckpointStore,
    config::SwarmConfig,
    error::Result,
};

/// The ordered actors of one model: the embedding head (which is also the projection tail) and
/// the reversible stages between them. Fixed once training starts.
#[derive(Clone)]
pub struct PipelineHandle {
    embedding: EmbeddingHandle,
    stages: Vec<ReversibleHandle>,
}

impl PipelineHandle {
    pub fn new(embedding: EmbeddingHandle, stages: Vec<ReversibleHandle>) -> Self {
        Self { embedding, stages }
    }

    /// Starts and initializes every actor the model configuration describes.
    ///
    /// Each actor gets its own arbiter and its own seed drawn from `seed`. The reversible stages
    /// are initialized in parallel once the embedding is ready. If any init fails every arbiter
    /// is stopped again.
    pub async fn spawn(
        config: &SwarmConfig,
        store: Arc<dyn CheckpointStore>,
        seed: u64,
    ) -> Result<Self> {
        let model = &config.model;

        let embedding = EmbeddingHandle::spawn(
            "embedding",
            Embedding::new(model.vocab, model.d_model, model.tied_projection),
            config.optimizer.build(),
            Arc::clone(&store),
            config.precision,
        );

        let init_scale = 2. / model.layers as f32;
        let stages = (0..model.layers)
            .map(|layer| {
                ReversibleHandle::spawn(
                    format!("layer-{layer}"),
                    ReversibleBlock::new(&model.coupling, model.d_model, init_scale),
                    config.optimizer.build(),
                    Arc::clone(&store),
                    config.precision,
                )
            })
            .collect();

        let pipeline = Self::new(embedding, stages);
        match pipeline.init_all(config, seed).await {
            Ok(num_params) => {
                info!(actors = pipeline.num_actors(), num_params; "pipeline ready");
                Ok(pipeline)
            }
            Err(e) => {
                pipeline.stop();
                Err(e)
            }
        }
    }

    async fn init_all(&self, config: &SwarmConfig, seed: u64) -> Result<usize> {
        let (model, training) = (&config.model, &config.training);
        let mut rng = StdRng::seed_from_u64(seed);

        let obs = Array2::<u32>::zeros((training.batch_size, training.seq_len));
        let embedding = self.embedding.init(rng.random(), obs).await?;

        let hidden = Array3::<f32>::zeros((training.batch_size, training.seq_len, model.d_model));
        let seeds: Vec<u64> = self.stages.iter().map(|_| rng.random()).collect();
        let inits = self
            .stages
            .iter()
            .zip(seeds)
            .map(|(stage, seed)| stage.init(seed, hidden.clone()));
        let stages = try_join_all(inits).await?;

        Ok(embedding + stages.into_iter().sum::<usize>())
    }

    pub fn embedding(&self) -> &EmbeddingHandle {
        &self.embedding
    }

    pub fn stages(&self) -> &[ReversibleHandle] {
        &self.stages
    }

    /// Number of actors, the embedding included.
    pub fn num_actors(&self) -> usize {
        self.stages.len() + 1
    }

    /// The global step barrier: every actor steps in parallel and all must finish.
    ///
    /// # Returns
    /// The step counter of every actor, embedding first.
    pub async fn step_all(&self) -> Result<Vec<u64>> {
        let stages = try_join_all(self.stages.iter().map(|stage| stage.step()));
        let (head, rest) = try_join(self.embedding.step(), stages).await?;
        Ok(std::iter::once(head).chain(rest).collect())
    }

    pub async fn get_steps(&self) -> Result<Vec<u64>> {
        let stages = try_join_all(self.stages.iter().map(|stage| stage.get_step()));
        let (head, rest) = try_join(self.embedding.get_step(), stages).await?;
        Ok(std::iter::once(head).chain(rest).collect())
    }

    pub async fn reset_gradients(&self) -> Result<()> {
        let stages = try_join_all(self.stages.iter().map(|stage| stage.reset_gradients()));
        try_join(self.embedding.reset_gradients(), stages).await?;
        Ok(())
    }

    /// Saves every actor under `<dir>/<actor name>` for `epoch`.
    pub async fn save_all(&self, dir: &Path, epoch: u64) -> Result<()> {
        let stages = try_join_all(
            self.stages
                .iter()
                .map(|stage| stage.save(dir.join(stage.name()), epoch)),
        );
        let embedding = self
            .embedding
            .save(dir.join(self.embedding.name()), epoch);

        try_join(embedding, stages).await?;
        Ok(())
    }

    /// Asks every actor to restore its latest snapshot from `<dir>/<actor name>`.
    ///
    /// # Returns
    /// Whether each actor restored, embedding first.
    pub async fn load_all(&self, dir: &Path) -> Result<Vec<bool>> {
        let stages = try_join_all(
            self.stages
                .iter()
                .map(|stage| stage.load(dir.join(stage.name()))),
        );
        let embedding = self.embedding.load(dir.join(self.embedding.name()));

        let (head, rest) = try_join(embedding, stages).await?;
        Ok(std::iter::once(head).chain(rest).collect())
    }

    /// Stops every actor's arbiter.
    pub fn stop(&self) {
        self.embedding.stop();
        self.stages.iter().for_each(|stage| stage.stop());
    }
}
