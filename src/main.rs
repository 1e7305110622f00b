use std::{env, pin::pin, sync::Arc};

use anyhow::{Context, Result};
use log::{error, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use swarm_orchestra::{
    checkpoint::JsonFileStore, data, Orchestrator, PipelineHandle, SwarmConfig,
};

const DEFAULT_CONFIG: &str = "swarm.json";

fn main() -> Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = SwarmConfig::from_file(&path)
        .with_context(|| format!("failed to load config from {path}"))?;

    let seed = config.training.seed.unwrap_or_else(|| rand::rng().random());
    info!(config = path.as_str(), seed; "starting");

    actix_rt::System::new().block_on(train(config, seed))
}

async fn train(config: SwarmConfig, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (model_seed, data_seed) = (rng.random(), rng.random());

    let pipeline = PipelineHandle::spawn(&config, Arc::new(JsonFileStore), model_seed)
        .await
        .context("failed to start the pipeline")?;

    let ret = drive(pipeline.clone(), &config, data_seed).await;
    pipeline.stop();

    if let Err(e) = &ret {
        error!("training aborted: {e:#}");
    }
    ret
}

async fn drive(pipeline: PipelineHandle, config: &SwarmConfig, data_seed: u64) -> Result<()> {
    let data = data::from_config(config, data_seed)?;
    let mut orchestrator = Orchestrator::new(pipeline, data, &config.training)?;

    let cancel = CancellationToken::new();
    let mut run = pin!(orchestrator.run(config.training.steps, &cancel));

    let steps = tokio::select! {
        ret = &mut run => ret?,
        _ = signal::ctrl_c() => {
            info!("received SIGINT, finishing the current cycle");
            cancel.cancel();
            run.await?
        }
    };

    info!(steps; "wrapping up");
    Ok(())
}
