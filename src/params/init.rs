use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{Result, SwarmError};

/// A `ParamGen` generates values for the initial state of a parameter tensor.
pub trait ParamGen {
    /// Samples `n` values.
    fn sample<R: Rng>(&self, rng: &mut R, n: usize) -> Vec<f32>;

    /// Samples a whole tensor of the given shape.
    fn tensor<R: Rng>(&self, rng: &mut R, shape: &[usize]) -> ArrayD<f32> {
        let n = shape.iter().product();
        let values = self.sample(rng, n);

        // `sample` always yields exactly `n` values for a shape of `n` elements.
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)))
    }
}

/// A parameter generator that always generates the same value.
pub struct ConstParamGen {
    value: f32,
}

impl ConstParamGen {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl ParamGen for ConstParamGen {
    fn sample<R: Rng>(&self, _rng: &mut R, n: usize) -> Vec<f32> {
        vec![self.value; n]
    }
}

/// A normal distribution truncated at two standard deviations, values outside are redrawn.
pub struct TruncatedNormalGen {
    normal: Normal<f32>,
    bound: f32,
}

impl TruncatedNormalGen {
    /// Creates a new `TruncatedNormalGen` centered at zero.
    ///
    /// # Errors
    /// An `InvalidConfig` error if `std_dev` is not finite and positive.
    pub fn new(std_dev: f32) -> Result<Self> {
        if !(std_dev.is_finite() && std_dev > 0.) {
            return Err(SwarmError::InvalidConfig(format!(
                "standard deviation must be positive, got {std_dev}"
            )));
        }

        let normal =
            Normal::new(0., std_dev).map_err(|e| SwarmError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            normal,
            bound: 2. * std_dev,
        })
    }
}

impl ParamGen for TruncatedNormalGen {
    fn sample<R: Rng>(&self, rng: &mut R, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| loop {
                let x = self.normal.sample(&mut *rng);
                if x.abs() <= self.bound {
                    break x;
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn truncated_normal_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let param_gen = TruncatedNormalGen::new(0.02).unwrap();

        let sample = param_gen.sample(&mut rng, 1000);
        assert_eq!(sample.len(), 1000);
        assert!(sample.iter().all(|x| x.abs() <= 0.04));
        assert!(sample.iter().any(|&x| x != 0.));
    }

    #[test]
    fn const_tensor() {
        let mut rng = StdRng::seed_from_u64(0);
        let tensor = ConstParamGen::new(1.).tensor(&mut rng, &[2, 3]);

        assert_eq!(tensor.shape(), &[2, 3]);
        assert!(tensor.iter().all(|&x| x == 1.));
    }

    #[test]
    fn invalid_std_dev() {
        assert!(TruncatedNormalGen::new(0.).is_err());
        assert!(TruncatedNormalGen::new(f32::NAN).is_err());
    }
}
