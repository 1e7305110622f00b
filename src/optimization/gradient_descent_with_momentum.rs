use super::{OptState, Optimizer};
use crate::{error::Result, params::TensorTree};

const VELOCITY: &str = "velocity";

#[derive(Debug, Clone, Copy)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - How much of the previous velocity survives each update.
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn init(&self, params: &TensorTree) -> OptState {
        OptState::new([(VELOCITY.to_string(), params.zeros_like())])
    }

    fn update(&self, grad: &TensorTree, state: &OptState) -> Result<(TensorTree, OptState)> {
        let mu = self.momentum;
        let velocity = state.slot(VELOCITY)?.zip_with(grad, |v, g| mu * v + g)?;
        let delta = velocity.scale(-self.learning_rate);

        Ok((delta, state.next([(VELOCITY.to_string(), velocity)])))
    }
}
