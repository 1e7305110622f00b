//! Hand-derived forward and vector-Jacobian products for the fixed set of transforms the pipeline
//! is built from.
//!
//! Every module follows the same shape: `forward` returns its output together with whatever the
//! backward pass needs, and `backward` consumes that cache plus the upstream gradient, writes the
//! parameter gradients into a [`TensorTree`](crate::params::TensorTree) and returns the gradient
//! with respect to its input. Caches never outlive a single call.

mod activation;
mod attention;
mod coupling;
mod layer_norm;
mod linear;
mod loss;
mod mlp;

pub use activation::Gelu;
pub use attention::AttentionCoupling;
pub use coupling::Coupling;
pub use layer_norm::{LayerNorm, LayerNormCache};
pub use linear::Linear;
pub use loss::{cross_entropy, softmax_rows};
pub use mlp::MlpCoupling;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3};

use crate::error::Result;

/// Collapses `[batch, seq, features]` into `[batch * seq, features]`.
pub fn flatten(x: ArrayView3<f32>) -> Result<Array2<f32>> {
    let (b, t, d) = x.dim();
    Ok(x.as_standard_layout()
        .into_owned()
        .into_shape_with_order((b * t, d))?)
}

/// Inverse of [`flatten`].
pub fn unflatten(x: Array2<f32>, batch: usize, seq: usize) -> Result<Array3<f32>> {
    let d = x.ncols();
    Ok(x.as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, seq, d))?)
}

/// Largest element-wise absolute difference between two views of the same shape.
pub fn max_abs_diff(a: ArrayView2<f32>, b: ArrayView2<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0., f32::max)
}

#[cfg(test)]
pub(crate) mod testing {
    use ndarray::{Array, Dimension, ShapeBuilder};
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    /// A deterministic standard normal tensor.
    pub fn randn<Sh, D>(shape: Sh, seed: u64) -> Array<f32, D>
    where
        Sh: ShapeBuilder<Dim = D>,
        D: Dimension,
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0f32, 1.).unwrap();
        Array::from_shape_simple_fn(shape, || normal.sample(&mut rng))
    }

    /// Asserts `|a - b| <= atol + rtol * |b|`.
    pub fn assert_close(a: f32, b: f32, tol: f32, what: &str) {
        assert!(
            (a - b).abs() <= tol + tol * b.abs(),
            "{what}: analytic {a} vs numeric {b}"
        );
    }
}
