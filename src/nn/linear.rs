use ndarray::{linalg, Array2, ArrayView2, Axis};
use rand::Rng;

use crate::{
    error::Result,
    params::{ConstParamGen, ParamGen, TensorTree, TruncatedNormalGen},
};

/// An affine map `y = x W + b` over row vectors, `W` has shape `(fan_in, fan_out)`.
#[derive(Clone, Debug)]
pub struct Linear {
    w_key: String,
    b_key: Option<String>,
    dim: (usize, usize),
}

impl Linear {
    /// Creates a new `Linear` whose tensors are stored under `prefix/w` and `prefix/b`.
    pub fn new(prefix: &str, dim: (usize, usize), bias: bool) -> Self {
        Self {
            w_key: format!("{prefix}/w"),
            b_key: bias.then(|| format!("{prefix}/b")),
            dim,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Samples the weights from a truncated normal with variance `scale / fan_in`, biases start
    /// at zero.
    pub fn init_params<R: Rng>(&self, rng: &mut R, scale: f32, params: &mut TensorTree) -> Result<()> {
        let std_dev = (scale / self.dim.0 as f32).sqrt();
        let w = TruncatedNormalGen::new(std_dev)?.tensor(rng, &[self.dim.0, self.dim.1]);
        params.insert(self.w_key.clone(), w);

        if let Some(b_key) = &self.b_key {
            params.insert(b_key.clone(), ConstParamGen::new(0.).tensor(rng, &[self.dim.1]));
        }

        Ok(())
    }

    pub fn forward(&self, params: &TensorTree, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let w = params.view2(&self.w_key)?;
        let mut y = x.dot(&w);

        if let Some(b_key) = &self.b_key {
            y += &params.view1(b_key)?;
        }

        Ok(y)
    }

    /// Writes `dW = xᵀ dy` (and `db`) into `grads` and returns `dx = dy Wᵀ`.
    pub fn backward(
        &self,
        params: &TensorTree,
        x: ArrayView2<f32>,
        dy: ArrayView2<f32>,
        grads: &mut TensorTree,
    ) -> Result<Array2<f32>> {
        let w = params.view2(&self.w_key)?;

        let mut dw = Array2::zeros(self.dim);
        linalg::general_mat_mul(1.0, &x.t(), &dy, 0.0, &mut dw);
        grads.insert(self.w_key.clone(), dw);

        if let Some(b_key) = &self.b_key {
            grads.insert(b_key.clone(), dy.sum_axis(Axis(0)));
        }

        Ok(dy.dot(&w.t()))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn forward_and_backward() {
        let linear = Linear::new("l", (2, 3), true);

        let mut params = TensorTree::new();
        params.insert("l/w", array![[1., 0., 2.], [0., 1., -1.]]);
        params.insert("l/b", array![0.5, 0., 0.]);

        let x = array![[1., 2.], [3., 4.]];
        let y = linear.forward(&params, x.view()).unwrap();
        assert_eq!(y, array![[1.5, 2., 0.], [3.5, 4., 2.]]);

        let dy = array![[1., 0., 0.], [0., 0., 1.]];
        let mut grads = TensorTree::new();
        let dx = linear
            .backward(&params, x.view(), dy.view(), &mut grads)
            .unwrap();

        assert_eq!(dx, array![[1., 0.], [2., -1.]]);
        assert_eq!(
            grads.view2("l/w").unwrap(),
            array![[1., 0., 3.], [2., 0., 4.]]
        );
        assert_eq!(grads.view1("l/b").unwrap(), array![1., 0., 1.]);
    }

    #[test]
    fn init_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut params = TensorTree::new();

        Linear::new("q", (4, 8), false)
            .init_params(&mut rng, 1., &mut params)
            .unwrap();

        assert_eq!(params.len(), 1);
        assert_eq!(params.get("q/w").unwrap().shape(), &[4, 8]);
    }
}
