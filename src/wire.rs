//! Precision of the tensors travelling between actors.

use half::{bf16, f16};
use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float32,
    Float16,
    BFloat16,
}

impl Precision {
    /// Rounds every element to what survives a transfer in this precision.
    pub fn cast<D: Dimension>(self, mut x: Array<f32, D>) -> Array<f32, D> {
        match self {
            Precision::Float32 => {}
            Precision::Float16 => x.mapv_inplace(|v| f16::from_f32(v).to_f32()),
            Precision::BFloat16 => x.mapv_inplace(|v| bf16::from_f32(v).to_f32()),
        }

        x
    }
}

/// Wire precision of each kind of traffic in the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPrecision {
    /// Activations flowing head to tail.
    pub fwd_act: Precision,
    /// Reconstructed activations flowing tail to head.
    pub rev_act: Precision,
    /// Gradients flowing tail to head.
    pub grad: Precision,
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn float32_is_identity() {
        let x = array![1.0_f32 / 3., 1e-8, 12345.678];
        assert_eq!(Precision::Float32.cast(x.clone()), x);
    }

    #[test]
    fn reduced_precision_rounds() {
        let x = array![1.0_f32 / 3.];

        let half = Precision::Float16.cast(x.clone());
        assert_ne!(half, x);
        assert!((half[0] - x[0]).abs() < 1e-3);

        let brain = Precision::BFloat16.cast(x.clone());
        assert!((brain[0] - x[0]).abs() < 1e-2);
    }

    #[test]
    fn parses_lowercase_names() {
        let precision: NetworkPrecision =
            serde_json::from_str(r#"{ "grad": "float16" }"#).unwrap();

        assert_eq!(precision.grad, Precision::Float16);
        assert_eq!(precision.fwd_act, Precision::Float32);
    }
}
