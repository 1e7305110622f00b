use super::{OptState, Optimizer};
use crate::{error::Result, params::TensorTree};

/// Rescales the gradient so that its global L2 norm is at most `max_norm`, then hands it to
/// the wrapped optimizer.
pub struct ClipByGlobalNorm<O> {
    max_norm: f32,
    inner: O,
}

impl<O: Optimizer> ClipByGlobalNorm<O> {
    pub fn new(max_norm: f32, inner: O) -> Self {
        Self { max_norm, inner }
    }
}

impl<O: Optimizer> Optimizer for ClipByGlobalNorm<O> {
    fn init(&self, params: &TensorTree) -> OptState {
        self.inner.init(params)
    }

    fn update(&self, grad: &TensorTree, state: &OptState) -> Result<(TensorTree, OptState)> {
        let norm = grad.sq_norm().sqrt();

        if norm > self.max_norm {
            let clipped = grad.scale(self.max_norm / norm);
            self.inner.update(&clipped, state)
        } else {
            self.inner.update(grad, state)
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::optimization::GradientDescent;

    #[test]
    fn clips_large_gradients_only() {
        let optimizer = ClipByGlobalNorm::new(1., GradientDescent::new(1.));

        let mut large = TensorTree::new();
        large.insert("w", array![3., 4.]);
        let state = optimizer.init(&large);
        let (delta, _) = optimizer.update(&large, &state).unwrap();
        assert!((delta.sq_norm().sqrt() - 1.).abs() < 1e-6);

        let mut small = TensorTree::new();
        small.insert("w", array![0.3, 0.4]);
        let (delta, _) = optimizer.update(&small, &state).unwrap();
        assert_eq!(delta, small.scale(-1.));
    }
}
