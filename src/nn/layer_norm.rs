use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::{
    error::{Result, SwarmError},
    params::TensorTree,
};

const EPS: f32 = 1e-5;

/// Layer normalization over the feature axis with a learned scale and offset.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    scale_key: String,
    offset_key: String,
    dim: usize,
}

/// What [`LayerNorm::backward`] needs from the forward pass.
pub struct LayerNormCache {
    xhat: Array2<f32>,
    inv_std: Array1<f32>,
}

impl LayerNorm {
    pub fn new(prefix: &str, dim: usize) -> Self {
        Self {
            scale_key: format!("{prefix}/scale"),
            offset_key: format!("{prefix}/offset"),
            dim,
        }
    }

    /// Scale starts at one, offset at zero.
    pub fn init_params(&self, params: &mut TensorTree) {
        params.insert(self.scale_key.clone(), Array1::<f32>::ones(self.dim));
        params.insert(self.offset_key.clone(), Array1::<f32>::zeros(self.dim));
    }

    pub fn forward(
        &self,
        params: &TensorTree,
        x: ArrayView2<f32>,
    ) -> Result<(Array2<f32>, LayerNormCache)> {
        if x.ncols() != self.dim {
            return Err(SwarmError::shape("layer norm input", x.shape(), &[x.nrows(), self.dim]));
        }

        let scale = params.view1(&self.scale_key)?;
        let offset = params.view1(&self.offset_key)?;

        let mean = x.sum_axis(Axis(1)) / self.dim as f32;
        let centered = &x - &mean.insert_axis(Axis(1));
        let var = centered.mapv(|c| c * c).sum_axis(Axis(1)) / self.dim as f32;
        let inv_std = var.mapv(|v| 1. / (v + EPS).sqrt());

        let xhat = centered * &inv_std.view().insert_axis(Axis(1));
        let y = &xhat * &scale + &offset;

        Ok((y, LayerNormCache { xhat, inv_std }))
    }

    pub fn backward(
        &self,
        params: &TensorTree,
        cache: &LayerNormCache,
        dy: ArrayView2<f32>,
        grads: &mut TensorTree,
    ) -> Result<Array2<f32>> {
        let scale = params.view1(&self.scale_key)?;
        let n = self.dim as f32;

        grads.insert(self.scale_key.clone(), (&dy * &cache.xhat).sum_axis(Axis(0)));
        grads.insert(self.offset_key.clone(), dy.sum_axis(Axis(0)));

        let g = &dy * &scale;
        let g_mean = g.sum_axis(Axis(1)) / n;
        let gx_mean = (&g * &cache.xhat).sum_axis(Axis(1)) / n;

        let dx = (g - &g_mean.insert_axis(Axis(1)) - &cache.xhat * &gx_mean.insert_axis(Axis(1)))
            * &cache.inv_std.view().insert_axis(Axis(1));

        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::testing::{assert_close, randn};

    fn setup() -> (LayerNorm, TensorTree) {
        let ln = LayerNorm::new("ln", 5);
        let mut params = TensorTree::new();
        params.insert("ln/scale", randn(5, 1).mapv(|x: f32| 1. + 0.1 * x));
        params.insert("ln/offset", randn(5, 2));
        (ln, params)
    }

    #[test]
    fn normalizes_rows() {
        let ln = LayerNorm::new("ln", 4);
        let mut params = TensorTree::new();
        ln.init_params(&mut params);

        let x = randn((3, 4), 7).mapv(|x: f32| 3. * x + 10.);
        let (y, _) = ln.forward(&params, x.view()).unwrap();

        for row in y.rows() {
            let mean = row.sum() / 4.;
            let var = row.mapv(|v| (v - mean).powi(2)).sum() / 4.;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.).abs() < 1e-2);
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let (ln, params) = setup();
        let x = randn((3, 5), 3);
        let r = randn((3, 5), 4);

        let objective = |x: &Array2<f32>, params: &TensorTree| {
            let (y, _) = ln.forward(params, x.view()).unwrap();
            (&y * &r).sum()
        };

        let (_, cache) = ln.forward(&params, x.view()).unwrap();
        let mut grads = TensorTree::new();
        let dx = ln.backward(&params, &cache, r.view(), &mut grads).unwrap();

        let eps = 1e-2;
        for (i, j) in [(0, 0), (1, 3), (2, 4)] {
            let mut plus = x.clone();
            plus[(i, j)] += eps;
            let mut minus = x.clone();
            minus[(i, j)] -= eps;

            let numeric = (objective(&plus, &params) - objective(&minus, &params)) / (2. * eps);
            assert_close(dx[(i, j)], numeric, 1e-2, "dx");
        }

        let mut scale = params.view1("ln/scale").unwrap().to_owned();
        let mut plus = params.clone();
        let mut minus = params.clone();
        scale[0] += eps;
        plus.insert("ln/scale", scale.clone());
        scale[0] -= 2. * eps;
        minus.insert("ln/scale", scale);

        let numeric = (objective(&x, &plus) - objective(&x, &minus)) / (2. * eps);
        assert_close(grads.view1("ln/scale").unwrap()[0], numeric, 1e-2, "dscale");
    }
}
