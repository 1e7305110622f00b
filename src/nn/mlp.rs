use ndarray::{Array3, ArrayView3};
use rand::Rng;

use super::{flatten, unflatten, Gelu, LayerNorm, Linear};
use crate::{error::Result, params::TensorTree};

/// Position-wise feed-forward coupling transform: `LayerNorm → Linear → GELU → Linear`.
#[derive(Clone, Debug)]
pub struct MlpCoupling {
    ln: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    act: Gelu,
    init_scale: f32,
}

impl MlpCoupling {
    pub fn new(prefix: &str, dim: usize, ff_mult: usize, init_scale: f32) -> Self {
        let hidden = dim * ff_mult;

        Self {
            ln: LayerNorm::new(&format!("{prefix}/ln"), dim),
            fc1: Linear::new(&format!("{prefix}/fc1"), (dim, hidden), true),
            fc2: Linear::new(&format!("{prefix}/fc2"), (hidden, dim), true),
            act: Gelu,
            init_scale,
        }
    }

    pub fn init_params<R: Rng>(&self, rng: &mut R, params: &mut TensorTree) -> Result<()> {
        self.ln.init_params(params);
        self.fc1.init_params(rng, 1., params)?;
        self.fc2.init_params(rng, self.init_scale, params)
    }

    pub fn forward(&self, params: &TensorTree, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (b, t, _) = x.dim();
        let x = flatten(x)?;

        let (h, _) = self.ln.forward(params, x.view())?;
        let a = self.fc1.forward(params, h.view())?;
        let z = a.mapv(|a| self.act.f(a));
        let y = self.fc2.forward(params, z.view())?;

        unflatten(y, b, t)
    }

    pub fn backward(
        &self,
        params: &TensorTree,
        x: ArrayView3<f32>,
        dy: ArrayView3<f32>,
        grads: &mut TensorTree,
    ) -> Result<Array3<f32>> {
        let (b, t, _) = x.dim();
        let x = flatten(x)?;
        let dy = flatten(dy)?;

        let (h, ln_cache) = self.ln.forward(params, x.view())?;
        let a = self.fc1.forward(params, h.view())?;
        let z = a.mapv(|a| self.act.f(a));

        let mut da = self.fc2.backward(params, z.view(), dy.view(), grads)?;
        da.zip_mut_with(&a, |d, &a| *d *= self.act.df(a));

        let dh = self.fc1.backward(params, h.view(), da.view(), grads)?;
        let dx = self.ln.backward(params, &ln_cache, dh.view(), grads)?;

        unflatten(dx, b, t)
    }
}
