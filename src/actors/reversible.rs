use actix::prelude::*;
use log::debug;
use ndarray::{concatenate, Array3, ArrayView3, Axis};
use rand::rngs::StdRng;

use super::{ParameterActor, Stage};
use crate::{
    config::CouplingConfig,
    error::{Result, SwarmError},
    nn::Coupling,
    params::TensorTree,
};

/// One invertible residual block over the halves `(x1, x2)` of the feature axis:
/// `y1 = x1 + f(x2)`, `y2 = x2 + g(y1)`.
#[derive(Clone, Debug)]
pub struct ReversibleBlock {
    f: Coupling,
    g: Coupling,
    half: usize,
}

impl ReversibleBlock {
    /// Builds a block over `d_model` features, the coupling weights are scaled by `init_scale`.
    pub fn new(coupling: &CouplingConfig, d_model: usize, init_scale: f32) -> Self {
        let half = d_model / 2;

        Self {
            f: Coupling::new(coupling, "f", half, init_scale),
            g: Coupling::new(coupling, "g", half, init_scale),
            half,
        }
    }

    fn split<'a>(&self, x: ArrayView3<'a, f32>) -> Result<(ArrayView3<'a, f32>, ArrayView3<'a, f32>)> {
        let d = x.dim().2;
        if d != 2 * self.half {
            return Err(SwarmError::Initialization(format!(
                "input has {d} features, the block was built for {}",
                2 * self.half
            )));
        }

        Ok(x.split_at(Axis(2), self.half))
    }

    pub fn forward(&self, params: &TensorTree, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (x1, x2) = self.split(x)?;

        let y1 = &x1 + &self.f.forward(params, x2)?;
        let y2 = &x2 + &self.g.forward(params, y1.view())?;

        Ok(concatenate(Axis(2), &[y1.view(), y2.view()])?)
    }

    /// Reconstructs the block input from its output, `x2 = y2 - g(y1)`, `x1 = y1 - f(x2)`.
    pub fn reverse(&self, params: &TensorTree, y: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (y1, y2) = self.split(y)?;

        let x2 = &y2 - &self.g.forward(params, y1)?;
        let x1 = &y1 - &self.f.forward(params, x2.view())?;

        Ok(concatenate(Axis(2), &[x1.view(), x2.view()])?)
    }

    /// Reconstructs the input from `y` and pulls `dy` back through the block.
    ///
    /// # Returns
    /// The reconstructed input, the gradient with respect to it and the weight gradients.
    pub fn backward(
        &self,
        params: &TensorTree,
        y: ArrayView3<f32>,
        dy: ArrayView3<f32>,
    ) -> Result<(Array3<f32>, Array3<f32>, TensorTree)> {
        if dy.dim() != y.dim() {
            return Err(SwarmError::shape("block gradient", dy.shape(), y.shape()));
        }

        let x = self.reverse(params, y)?;
        let (x1, x2) = self.split(x.view())?;
        let (dy1, dy2) = self.split(dy)?;

        // Linearize at the reconstructed input.
        let y1 = &x1 + &self.f.forward(params, x2)?;

        let mut grads = TensorTree::new();
        let dy1 = &dy1 + &self.g.backward(params, y1.view(), dy2, &mut grads)?;
        let dx2 = &dy2 + &self.f.backward(params, x2, dy1.view(), &mut grads)?;

        let dx = concatenate(Axis(2), &[dy1.view(), dx2.view()])?;
        Ok((x, dx, grads))
    }
}

impl Stage for ReversibleBlock {
    type Sample = Array3<f32>;

    fn init_params(&mut self, rng: &mut StdRng, sample: &Array3<f32>) -> Result<TensorTree> {
        self.split(sample.view())?;

        let mut params = TensorTree::new();
        self.f.init_params(rng, &mut params)?;
        self.g.init_params(rng, &mut params)?;

        Ok(params)
    }
}

pub type ReversibleLayerActor = ParameterActor<ReversibleBlock>;

/* -------------------------------------------------------------------------- */
/*                                  Messages                                  */
/* -------------------------------------------------------------------------- */

#[derive(Message)]
#[rtype(result = "Result<Array3<f32>>")]
pub struct Forward {
    pub x: Array3<f32>,
}

/// Resolves to `(reconstructed_x, grad_x)`.
#[derive(Message)]
#[rtype(result = "Result<(Array3<f32>, Array3<f32>)>")]
pub struct Backward {
    pub y: Array3<f32>,
    pub grad: Array3<f32>,
}

impl Handler<Forward> for ReversibleLayerActor {
    type Result = Result<Array3<f32>>;

    fn handle(&mut self, msg: Forward, _ctx: &mut Self::Context) -> Self::Result {
        let params = self.state()?.params();
        self.stage.forward(params, msg.x.view())
    }
}

impl Handler<Backward> for ReversibleLayerActor {
    type Result = Result<(Array3<f32>, Array3<f32>)>;

    fn handle(&mut self, msg: Backward, _ctx: &mut Self::Context) -> Self::Result {
        let params = self.state()?.params();
        let (x, dx, grads) = self.stage.backward(params, msg.y.view(), msg.grad.view())?;

        self.accumulate(&grads)?;
        debug!(actor = self.name(); "block gradient accumulated");

        Ok((x, dx))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::nn::{
        max_abs_diff,
        testing::{assert_close, randn},
    };

    fn block(coupling: CouplingConfig) -> (ReversibleBlock, TensorTree) {
        let mut block = ReversibleBlock::new(&coupling, 8, 0.5);
        let sample = Array3::zeros((2, 3, 8));
        let params = block
            .init_params(&mut StdRng::seed_from_u64(11), &sample)
            .unwrap();
        (block, params)
    }

    fn max_diff3(a: &Array3<f32>, b: &Array3<f32>) -> f32 {
        let a = a.to_shape((a.len(), 1)).unwrap();
        let b = b.to_shape((b.len(), 1)).unwrap();
        max_abs_diff(a.view(), b.view())
    }

    #[test]
    fn reverse_inverts_forward() {
        for coupling in [
            CouplingConfig::Mlp { ff_mult: 2 },
            CouplingConfig::Attention {
                heads: 2,
                key_size: 3,
            },
        ] {
            let (block, params) = block(coupling);
            let x = randn((2, 3, 8), 21);

            let y = block.forward(&params, x.view()).unwrap();
            let x_rec = block.reverse(&params, y.view()).unwrap();

            assert!(max_diff3(&x, &x_rec) < 1e-5);
        }
    }

    #[test]
    fn rejects_wrong_width() {
        let (block, params) = block(CouplingConfig::Mlp { ff_mult: 2 });
        let x = randn((2, 3, 6), 0);

        let err = block.forward(&params, x.view()).unwrap_err();
        assert!(matches!(err, SwarmError::Initialization(_)));
    }

    #[test]
    fn gradients_match_finite_differences() {
        let (block, params) = block(CouplingConfig::Attention {
            heads: 2,
            key_size: 3,
        });
        let x = randn((2, 3, 8), 4);
        let dy = randn((2, 3, 8), 5);

        // L(x) = <forward(x), dy>, so dL/dx is the block's input gradient.
        let objective = |params: &TensorTree, x: &Array3<f32>| -> f32 {
            (block.forward(params, x.view()).unwrap() * &dy).sum()
        };

        let y = block.forward(&params, x.view()).unwrap();
        let (x_rec, dx, grads) = block.backward(&params, y.view(), dy.view()).unwrap();
        assert!(max_diff3(&x, &x_rec) < 1e-5);
        assert!(params.same_structure(&grads));

        let eps = 1e-2;
        for idx in [(0, 0, 0), (1, 2, 7), (0, 1, 4), (1, 0, 3)] {
            let mut plus = x.clone();
            plus[idx] += eps;
            let mut minus = x.clone();
            minus[idx] -= eps;

            let numeric = (objective(&params, &plus) - objective(&params, &minus)) / (2. * eps);
            assert_close(dx[idx], numeric, 2e-2, "dx");
        }

        let key = "g/query/w";
        let w = params.view2(key).unwrap().to_owned();
        for idx in [(0, 0), (3, 5), (2, 1)] {
            let mut plus = params.clone();
            let mut wp = w.clone();
            wp[idx] += eps;
            plus.insert(key, wp);

            let mut minus = params.clone();
            let mut wm = w.clone();
            wm[idx] -= eps;
            minus.insert(key, wm);

            let numeric = (objective(&plus, &x) - objective(&minus, &x)) / (2. * eps);
            assert_close(grads.view2(key).unwrap()[idx], numeric, 2e-2, key);
        }
    }
}
