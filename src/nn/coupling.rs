use ndarray::{Array3, ArrayView3};
use rand::Rng;

use super::{AttentionCoupling, MlpCoupling};
use crate::{config::CouplingConfig, error::Result, params::TensorTree};

/// One of the two transforms (`f` or `g`) of a reversible block.
#[derive(Clone, Debug)]
pub enum Coupling {
    Mlp(MlpCoupling),
    Attention(AttentionCoupling),
}
use Coupling::*;

impl Coupling {
    /// Builds a transform over `dim` features whose parameters live under `prefix/`.
    pub fn new(config: &CouplingConfig, prefix: &str, dim: usize, init_scale: f32) -> Self {
        match *config {
            CouplingConfig::Mlp { ff_mult } => {
                Mlp(MlpCoupling::new(prefix, dim, ff_mult, init_scale))
            }
            CouplingConfig::Attention { heads, key_size } => Attention(AttentionCoupling::new(
                prefix, dim, heads, key_size, init_scale,
            )),
        }
    }

    pub fn init_params<R: Rng>(&self, rng: &mut R, params: &mut TensorTree) -> Result<()> {
        match self {
            Mlp(c) => c.init_params(rng, params),
            Attention(c) => c.init_params(rng, params),
        }
    }

    pub fn forward(&self, params: &TensorTree, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        match self {
            Mlp(c) => c.forward(params, x),
            Attention(c) => c.forward(params, x),
        }
    }

    /// Recomputes the transform at `x` and pulls `dy` back through it.
    ///
    /// # Returns
    /// The gradient with respect to `x`, parameter gradients are written into `grads`.
    pub fn backward(
        &self,
        params: &TensorTree,
        x: ArrayView3<f32>,
        dy: ArrayView3<f32>,
        grads: &mut TensorTree,
    ) -> Result<Array3<f32>> {
        match self {
            Mlp(c) => c.backward(params, x, dy, grads),
            Attention(c) => c.backward(params, x, dy, grads),
        }
    }
}
