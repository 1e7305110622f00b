use std::{path::PathBuf, sync::Arc};

use actix::{dev::ToEnvelope, prelude::*};
use ndarray::{Array2, Array3};

use super::{
    Backward, DebedForward, DebedGrad, EmbedForward, EmbedGrad, Embedding, Forward, GetGradAccum,
    GetGradCount, GetParams, GetStep, Init, Load, NumParams, ParameterActor, ResetGradients,
    ReversibleBlock, Save, Stage, Step,
};
use crate::{
    checkpoint::CheckpointStore,
    error::{Result, SwarmError},
    optimization::Optimizer,
    params::TensorTree,
    wire::NetworkPrecision,
};

/// Asynchronous, typed access to one actor living in its own arbiter.
///
/// Every method dispatches a message and resolves once the actor has handled it. Tensors coming
/// back are rounded to the configured wire precision.
pub struct ActorHandle<S: Stage> {
    name: Arc<str>,
    addr: Addr<ParameterActor<S>>,
    arbiter: ArbiterHandle,
    precision: NetworkPrecision,
}

pub type EmbeddingHandle = ActorHandle<Embedding>;
pub type ReversibleHandle = ActorHandle<ReversibleBlock>;

impl<S: Stage> Clone for ActorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            addr: self.addr.clone(),
            arbiter: self.arbiter.clone(),
            precision: self.precision,
        }
    }
}

impl<S: Stage> ActorHandle<S> {
    /// Starts a new actor on a dedicated arbiter thread.
    ///
    /// Must be called from within a running actix system.
    pub fn spawn(
        name: impl Into<String>,
        stage: S,
        optimizer: Box<dyn Optimizer>,
        store: Arc<dyn CheckpointStore>,
        precision: NetworkPrecision,
    ) -> Self {
        let name: String = name.into();
        let actor = ParameterActor::new(name.clone(), stage, optimizer, store);

        let arbiter = Arbiter::new().handle();
        let addr = ParameterActor::start_in_arbiter(&arbiter, move |_| actor);

        Self {
            name: name.into(),
            addr,
            arbiter,
            precision,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn call<M, R>(&self, msg: M) -> Result<R>
    where
        M: Message<Result = Result<R>> + Send + 'static,
        R: Send + 'static,
        ParameterActor<S>: Handler<M>,
        <ParameterActor<S> as Actor>::Context: ToEnvelope<ParameterActor<S>, M>,
    {
        self.addr
            .send(msg)
            .await
            .map_err(|source| SwarmError::RemoteDispatch {
                actor: self.name.to_string(),
                source,
            })?
    }

    /// Populates the actor state, sized from `sample`. Resolves to the parameter count.
    pub async fn init(&self, seed: u64, sample: S::Sample) -> Result<usize> {
        self.call(Init { seed, sample }).await
    }

    pub async fn step(&self) -> Result<u64> {
        self.call(Step).await
    }

    pub async fn get_params(&self) -> Result<TensorTree> {
        self.call(GetParams).await
    }

    pub async fn get_gradient_accumulator(&self) -> Result<TensorTree> {
        self.call(GetGradAccum).await
    }

    pub async fn get_grad_count(&self) -> Result<u32> {
        self.call(GetGradCount).await
    }

    pub async fn get_step(&self) -> Result<u64> {
        self.call(GetStep).await
    }

    pub async fn num_params(&self) -> Result<usize> {
        self.call(NumParams).await
    }

    pub async fn save(&self, path: PathBuf, epoch: u64) -> Result<()> {
        self.call(Save { path, epoch }).await
    }

    /// Restores the latest snapshot under `path`, `false` if there is none or it is unusable.
    pub async fn load(&self, path: PathBuf) -> Result<bool> {
        self.call(Load { path }).await
    }

    pub async fn reset_gradients(&self) -> Result<()> {
        self.call(ResetGradients).await
    }

    /// Stops the arbiter, the actor stops with it.
    pub fn stop(&self) {
        self.arbiter.stop();
    }
}

impl EmbeddingHandle {
    pub async fn embed_forward(&self, obs: Array2<u32>) -> Result<Array3<f32>> {
        let hidden = self.call(EmbedForward { obs }).await?;
        Ok(self.precision.fwd_act.cast(hidden))
    }

    pub async fn embed_grad(
        &self,
        obs: Array2<u32>,
        (hidden, grad): (Array3<f32>, Array3<f32>),
    ) -> Result<f32> {
        self.call(EmbedGrad { obs, hidden, grad }).await
    }

    pub async fn debed_forward(&self, hidden: Array3<f32>) -> Result<Array3<f32>> {
        self.call(DebedForward { hidden }).await
    }

    pub async fn debed_grad(
        &self,
        hidden: Array3<f32>,
        targets: Array2<u32>,
    ) -> Result<((Array3<f32>, Array3<f32>), f32)> {
        let ((hidden, grad), loss) = self.call(DebedGrad { hidden, targets }).await?;
        Ok(((hidden, self.precision.grad.cast(grad)), loss))
    }
}

impl ReversibleHandle {
    pub async fn forward(&self, x: Array3<f32>) -> Result<Array3<f32>> {
        let y = self.call(Forward { x }).await?;
        Ok(self.precision.fwd_act.cast(y))
    }

    /// Resolves to `(reconstructed_x, grad_x)`.
    pub async fn backward(
        &self,
        (y, grad): (Array3<f32>, Array3<f32>),
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        let (x, dx) = self.call(Backward { y, grad }).await?;
        Ok((self.precision.rev_act.cast(x), self.precision.grad.cast(dx)))
    }
}
