use std::f32::consts::{FRAC_2_SQRT_PI, SQRT_2};

const GELU_COEF: f32 = 0.044_715;

/// Tanh approximation of the gaussian error linear unit.
#[derive(Clone, Copy, Debug, Default)]
pub struct Gelu;

impl Gelu {
    fn inner(x: f32) -> f32 {
        // sqrt(2 / pi) * (x + c * x^3)
        FRAC_2_SQRT_PI / SQRT_2 * (x + GELU_COEF * x.powi(3))
    }

    pub fn f(&self, x: f32) -> f32 {
        0.5 * x * (1. + Self::inner(x).tanh())
    }

    pub fn df(&self, x: f32) -> f32 {
        let t = Self::inner(x).tanh();
        let k = FRAC_2_SQRT_PI / SQRT_2;
        let dinner = k * (1. + 3. * GELU_COEF * x * x);

        0.5 * (1. + t) + 0.5 * x * (1. - t * t) * dinner
    }
}
