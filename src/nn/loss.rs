use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{Result, SwarmError};

/// Row-wise softmax, shifted by the row maximum for stability.
pub fn softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();

    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }

    out
}

/// Mean token-level cross-entropy between `softmax(logits)` and one-hot `targets`.
///
/// # Returns
/// The scalar loss and its gradient with respect to `logits`, that is
/// `(softmax(logits) - onehot(targets)) / n`.
///
/// # Errors
/// A `ShapeMismatch` if there isn't a target per row, or if a target is outside the vocabulary.
pub fn cross_entropy(logits: ArrayView2<f32>, targets: ArrayView1<u32>) -> Result<(f32, Array2<f32>)> {
    let (n, vocab) = logits.dim();
    if targets.len() != n {
        return Err(SwarmError::shape("targets", &[targets.len()], &[n]));
    }

    if let Some(&bad) = targets.iter().find(|&&t| t as usize >= vocab) {
        return Err(SwarmError::shape("target token", &[bad as usize], &[vocab]));
    }

    let mut grad = softmax_rows(logits);
    let mut loss = 0.;

    let rows = logits.axis_iter(Axis(0)).zip(grad.axis_iter_mut(Axis(0)));
    for ((logit_row, mut grad_row), &target) in rows.zip(targets) {
        let target = target as usize;
        let max = logit_row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        let log_sum_exp = max + logit_row.mapv(|x| (x - max).exp()).sum().ln();

        loss += log_sum_exp - logit_row[target];
        grad_row[target] -= 1.;
    }

    let scale = 1. / n.max(1) as f32;
    grad.mapv_inplace(|g| g * scale);

    Ok((loss * scale, grad))
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax_rows(array![[1., 2., 3.], [1000., 0., -1000.]].view());

        for row in p.rows() {
            assert!((row.sum() - 1.).abs() < 1e-6);
        }
        assert!((p[(1, 0)] - 1.).abs() < 1e-6);
    }

    #[test]
    fn uniform_logits() {
        let logits = Array2::<f32>::zeros((2, 4));
        let (loss, grad) = cross_entropy(logits.view(), array![0, 3].view()).unwrap();

        assert!((loss - 4f32.ln()).abs() < 1e-6);
        assert!((grad[(0, 0)] - (0.25 - 1.) / 2.).abs() < 1e-6);
        assert!((grad[(0, 1)] - 0.125).abs() < 1e-6);
        assert!(grad.sum().abs() < 1e-6);
    }

    #[test]
    fn rejects_out_of_vocab_targets() {
        let logits = Array2::<f32>::zeros((1, 4));
        assert!(cross_entropy(logits.view(), array![4].view()).is_err());
        assert!(cross_entropy(logits.view(), array![0, 1].view()).is_err());
    }
}
