use std::{path::PathBuf, sync::Arc};

use actix::prelude::*;
use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::ActorState;
use crate::{
    checkpoint::CheckpointStore,
    error::{Result, SwarmError},
    optimization::Optimizer,
    params::TensorTree,
};

/// The model-specific part of a [`ParameterActor`].
///
/// A stage knows how to size and sample its parameters from a representative input, everything
/// else (accumulation, stepping, persistence) is shared.
pub trait Stage: Unpin + Send + 'static {
    /// The representative input `init` is sized from.
    type Sample: Send + 'static;

    /// Samples the initial parameters, recording whatever shape information later calls check.
    fn init_params(&mut self, rng: &mut StdRng, sample: &Self::Sample) -> Result<TensorTree>;
}

/* -------------------------------------------------------------------------- */
/*                                  Messages                                  */
/* -------------------------------------------------------------------------- */

/// Two-phase construction: fully populates the actor state. Returns the parameter count.
pub struct Init<T> {
    pub seed: u64,
    pub sample: T,
}

impl<T: 'static> Message for Init<T> {
    type Result = Result<usize>;
}

/// Applies the averaged accumulated gradient. Returns the new step counter.
#[derive(Message)]
#[rtype(result = "Result<u64>")]
pub struct Step;

#[derive(Message)]
#[rtype(result = "Result<TensorTree>")]
pub struct GetParams;

#[derive(Message)]
#[rtype(result = "Result<TensorTree>")]
pub struct GetGradAccum;

#[derive(Message)]
#[rtype(result = "Result<u32>")]
pub struct GetGradCount;

#[derive(Message)]
#[rtype(result = "Result<u64>")]
pub struct GetStep;

#[derive(Message)]
#[rtype(result = "Result<usize>")]
pub struct NumParams;

#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct Save {
    pub path: PathBuf,
    pub epoch: u64,
}

/// Restores the latest snapshot under `path`. Resolves to `false` when there is nothing usable.
#[derive(Message)]
#[rtype(result = "Result<bool>")]
pub struct Load {
    pub path: PathBuf,
}

#[derive(Message)]
#[rtype(result = "Result<()>")]
pub struct ResetGradients;

/* -------------------------------------------------------------------------- */
/*                               Parameter actor                              */
/* -------------------------------------------------------------------------- */

/// A stateful pipeline unit owning one slice of the model.
///
/// The actor's mailbox serializes every call, so its state is never shared nor locked.
pub struct ParameterActor<S> {
    name: String,
    pub(super) stage: S,
    optimizer: Box<dyn Optimizer>,
    store: Arc<dyn CheckpointStore>,
    state: Option<ActorState>,
}

impl<S: Stage> ParameterActor<S> {
    pub fn new(
        name: impl Into<String>,
        stage: S,
        optimizer: Box<dyn Optimizer>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            name: name.into(),
            stage,
            optimizer,
            store,
            state: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The state, or an `Initialization` error if `init` has not run yet.
    pub(super) fn state(&self) -> Result<&ActorState> {
        self.state.as_ref().ok_or_else(|| {
            SwarmError::Initialization(format!("{} was used before init", self.name))
        })
    }

    fn state_mut(&mut self) -> Result<&mut ActorState> {
        let name = &self.name;
        self.state
            .as_mut()
            .ok_or_else(|| SwarmError::Initialization(format!("{name} was used before init")))
    }

    /// Accumulates one gradient contribution.
    pub(super) fn accumulate(&mut self, grads: &TensorTree) -> Result<()> {
        self.state_mut()?.accumulate(grads)
    }

    fn initialize(&mut self, seed: u64, sample: &S::Sample) -> Result<usize> {
        if self.state.is_some() {
            return Err(SwarmError::Initialization(format!(
                "{} was already initialized",
                self.name
            )));
        }

        let mut master = StdRng::seed_from_u64(seed);
        let out_key: u64 = master.random();
        let mut init_rng = StdRng::seed_from_u64(master.random());

        let params = self.stage.init_params(&mut init_rng, sample)?;
        let num_params = params.num_params();

        self.state = Some(ActorState::new(params, &*self.optimizer, out_key));
        info!(actor = self.name.as_str(), num_params; "parameters initialized");

        Ok(num_params)
    }

    fn restore(&mut self, path: PathBuf) -> Result<bool> {
        let current = self.state()?;

        let restored = match self.store.load(&path) {
            Ok(Some(restored)) => restored,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(actor = self.name.as_str(), error:% = e; "ignoring unusable snapshot");
                return Ok(false);
            }
        };

        if let Err(e) = current
            .params()
            .ensure_same_structure(restored.params(), "snapshot params")
        {
            warn!(actor = self.name.as_str(), error:% = e; "snapshot does not fit this model");
            return Ok(false);
        }

        info!(
            actor = self.name.as_str(),
            step = restored.step_count(),
            path:% = path.display();
            "state restored"
        );
        self.state = Some(restored);

        Ok(true)
    }
}

impl<S: Stage> Actor for ParameterActor<S> {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        debug!(actor = self.name.as_str(); "actor started");
    }
}

impl<S: Stage> Handler<Init<S::Sample>> for ParameterActor<S> {
    type Result = Result<usize>;

    fn handle(&mut self, msg: Init<S::Sample>, _ctx: &mut Self::Context) -> Self::Result {
        self.initialize(msg.seed, &msg.sample)
    }
}

impl<S: Stage> Handler<Step> for ParameterActor<S> {
    type Result = Result<u64>;

    fn handle(&mut self, _msg: Step, _ctx: &mut Self::Context) -> Self::Result {
        let optimizer = &*self.optimizer;
        let state = self.state.as_mut().ok_or_else(|| {
            SwarmError::Initialization(format!("{} was used before init", self.name))
        })?;

        let averaged = state.grad_count();
        state.step(optimizer)?;

        debug!(actor = self.name.as_str(), step = state.step_count(), averaged; "step applied");
        Ok(state.step_count())
    }
}

impl<S: Stage> Handler<GetParams> for ParameterActor<S> {
    type Result = Result<TensorTree>;

    fn handle(&mut self, _msg: GetParams, _ctx: &mut Self::Context) -> Self::Result {
        Ok(self.state()?.params().clone())
    }
}

impl<S: Stage> Handler<GetGradAccum> for ParameterActor<S> {
    type Result = Result<TensorTree>;

    fn handle(&mut self, _msg: GetGradAccum, _ctx: &mut Self::Context) -> Self::Result {
        Ok(self.state()?.grad_accum().clone())
    }
}

impl<S: Stage> Handler<GetGradCount> for ParameterActor<S> {
    type Result = Result<u32>;

    fn handle(&mut self, _msg: GetGradCount, _ctx: &mut Self::Context) -> Self::Result {
        Ok(self.state()?.grad_count())
    }
}

impl<S: Stage> Handler<GetStep> for ParameterActor<S> {
    type Result = Result<u64>;

    fn handle(&mut self, _msg: GetStep, _ctx: &mut Self::Context) -> Self::Result {
        Ok(self.state()?.step_count())
    }
}

impl<S: Stage> Handler<NumParams> for ParameterActor<S> {
    type Result = Result<usize>;

    fn handle(&mut self, _msg: NumParams, _ctx: &mut Self::Context) -> Self::Result {
        Ok(self.state()?.params().num_params())
    }
}

impl<S: Stage> Handler<Save> for ParameterActor<S> {
    type Result = Result<()>;

    fn handle(&mut self, msg: Save, _ctx: &mut Self::Context) -> Self::Result {
        let state = self.state()?;
        self.store.save(state, &msg.path, msg.epoch)?;

        info!(actor = self.name.as_str(), epoch = msg.epoch; "state saved");
        Ok(())
    }
}

impl<S: Stage> Handler<Load> for ParameterActor<S> {
    type Result = Result<bool>;

    fn handle(&mut self, msg: Load, _ctx: &mut Self::Context) -> Self::Result {
        self.restore(msg.path)
    }
}

impl<S: Stage> Handler<ResetGradients> for ParameterActor<S> {
    type Result = Result<()>;

    fn handle(&mut self, _msg: ResetGradients, _ctx: &mut Self::Context) -> Self::Result {
        self.state_mut()?.reset_gradients();
        Ok(())
    }
}
