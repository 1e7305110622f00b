use super::{OptState, Optimizer};
use crate::{error::Result, params::TensorTree};

const MU: &str = "mu";
const NU: &str = "nu";

/// Adam with bias-corrected first and second moment estimates.
#[derive(Debug, Clone, Copy)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        }
    }
}

impl Optimizer for Adam {
    fn init(&self, params: &TensorTree) -> OptState {
        OptState::new([
            (MU.to_string(), params.zeros_like()),
            (NU.to_string(), params.zeros_like()),
        ])
    }

    fn update(&self, grad: &TensorTree, state: &OptState) -> Result<(TensorTree, OptState)> {
        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
        } = *self;

        let mu = state.slot(MU)?.zip_with(grad, |m, g| b1 * m + (1. - b1) * g)?;
        let nu = state.slot(NU)?.zip_with(grad, |v, g| b2 * v + (1. - b2) * g * g)?;

        let t = (state.count() + 1) as i32;
        let bc1 = 1. - b1.powi(t);
        let bc2 = 1. - b2.powi(t);

        let delta = mu.zip_with(&nu, |m, v| -lr * (m / bc1) / ((v / bc2).sqrt() + eps))?;
        let next = state.next([(MU.to_string(), mu), (NU.to_string(), nu)]);

        Ok((delta, next))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn first_step_has_learning_rate_length() {
        let mut grad = TensorTree::new();
        grad.insert("w", array![3., -0.01]);

        let optimizer = Adam::new(1e-3, 0.9, 0.99, 1e-8);
        let state = optimizer.init(&grad);
        let (delta, state) = optimizer.update(&grad, &state).unwrap();

        // With bias correction the first update is lr * sign(g).
        let delta = delta.view1("w").unwrap();
        assert!((delta[0] + 1e-3).abs() < 1e-6);
        assert!((delta[1] - 1e-3).abs() < 1e-6);

        assert_eq!(state.count(), 1);
        tokio_test::assert_ok!(state.ensure_matches(&grad));
    }

    #[test]
    fn rejects_foreign_gradient() {
        let mut params = TensorTree::new();
        params.insert("w", array![1., 2.]);

        let mut grad = TensorTree::new();
        grad.insert("v", array![1., 2.]);

        let optimizer = Adam::new(1e-3, 0.9, 0.99, 1e-8);
        let state = optimizer.init(&params);
        assert!(optimizer.update(&grad, &state).is_err());
    }
}
