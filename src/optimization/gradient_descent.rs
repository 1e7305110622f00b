use super::{OptState, Optimizer};
use crate::{error::Result, params::TensorTree};

/// Gradient descent optimization algorithm.
#[derive(Debug, Clone, Copy)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken on `update`.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn init(&self, _params: &TensorTree) -> OptState {
        OptState::default()
    }

    /// A step in the opposite direction of the gradient, with a length of `learning_rate`.
    fn update(&self, grad: &TensorTree, state: &OptState) -> Result<(TensorTree, OptState)> {
        let lr = self.learning_rate;
        Ok((grad.scale(-lr), state.next([])))
    }
}
