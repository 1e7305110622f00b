use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use rand::Rng;

use super::{flatten, softmax_rows, unflatten, LayerNorm, LayerNormCache, Linear};
use crate::{error::Result, params::TensorTree};

const MASK_VALUE: f32 = -1e10;

/// Causal multi-head self-attention coupling transform with a pre-layer-norm.
#[derive(Clone, Debug)]
pub struct AttentionCoupling {
    ln: LayerNorm,
    query: Linear,
    key: Linear,
    value: Linear,
    out: Linear,
    heads: usize,
    key_size: usize,
    init_scale: f32,
}

struct AttentionCache {
    ln: LayerNormCache,
    h: Array2<f32>,
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    // One `[seq, seq]` matrix per (batch, head), batch-major.
    probs: Vec<Array2<f32>>,
    context: Array2<f32>,
}

impl AttentionCoupling {
    pub fn new(prefix: &str, dim: usize, heads: usize, key_size: usize, init_scale: f32) -> Self {
        let inner = heads * key_size;

        Self {
            ln: LayerNorm::new(&format!("{prefix}/ln"), dim),
            query: Linear::new(&format!("{prefix}/query"), (dim, inner), false),
            key: Linear::new(&format!("{prefix}/key"), (dim, inner), false),
            value: Linear::new(&format!("{prefix}/value"), (dim, inner), false),
            out: Linear::new(&format!("{prefix}/out"), (inner, dim), true),
            heads,
            key_size,
            init_scale,
        }
    }

    pub fn init_params<R: Rng>(&self, rng: &mut R, params: &mut TensorTree) -> Result<()> {
        self.ln.init_params(params);
        for proj in [&self.query, &self.key, &self.value, &self.out] {
            proj.init_params(rng, self.init_scale, params)?;
        }

        Ok(())
    }

    pub fn forward(&self, params: &TensorTree, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (b, t, _) = x.dim();
        let (y, _) = self.forward_cached(params, x)?;
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
        let (_, cache) = self.forward_cached(params, x)?;
        let dy = flatten(dy)?;

        let dcontext = self
            .out
            .backward(params, cache.context.view(), dy.view(), grads)?;

        let scale = self.scale();
        let mut dq = Array2::zeros(cache.q.raw_dim());
        let mut dk = Array2::zeros(cache.k.raw_dim());
        let mut dv = Array2::zeros(cache.v.raw_dim());

        for batch in 0..b {
            for head in 0..self.heads {
                let rows = s![batch * t..(batch + 1) * t, head * self.key_size..(head + 1) * self.key_size];
                let p = &cache.probs[batch * self.heads + head];

                let q = cache.q.slice(rows);
                let k = cache.k.slice(rows);
                let v = cache.v.slice(rows);
                let dout = dcontext.slice(rows);

                let dp = dout.dot(&v.t());
                dv.slice_mut(rows).assign(&p.t().dot(&dout));

                // Softmax backward: dS = P ⊙ (dP - rowsum(dP ⊙ P)).
                let row_dot = (&dp * p).sum_axis(Axis(1)).insert_axis(Axis(1));
                let ds = p * &(dp - &row_dot);

                dq.slice_mut(rows).assign(&(ds.dot(&k) * scale));
                dk.slice_mut(rows).assign(&(ds.t().dot(&q) * scale));
            }
        }

        let mut dh = self.query.backward(params, cache.h.view(), dq.view(), grads)?;
        dh += &self.key.backward(params, cache.h.view(), dk.view(), grads)?;
        dh += &self.value.backward(params, cache.h.view(), dv.view(), grads)?;

        let dx = self.ln.backward(params, &cache.ln, dh.view(), grads)?;
        unflatten(dx, b, t)
    }

    fn scale(&self) -> f32 {
        1. / (self.key_size as f32).sqrt()
    }

    fn forward_cached(
        &self,
        params: &TensorTree,
        x: ArrayView3<f32>,
    ) -> Result<(Array2<f32>, AttentionCache)> {
        let (b, t, _) = x.dim();
        let x = flatten(x)?;

        let (h, ln) = self.ln.forward(params, x.view())?;
        let q = self.query.forward(params, h.view())?;
        let k = self.key.forward(params, h.view())?;
        let v = self.value.forward(params, h.view())?;

        let scale = self.scale();
        let mut context = Array2::zeros(q.raw_dim());
        let mut probs = Vec::with_capacity(b * self.heads);

        for batch in 0..b {
            for head in 0..self.heads {
                let rows = s![batch * t..(batch + 1) * t, head * self.key_size..(head + 1) * self.key_size];

                let mut logits = q.slice(rows).dot(&k.slice(rows).t()) * scale;
                causal_mask(&mut logits);
                let p = softmax_rows(logits.view());

                context.slice_mut(rows).assign(&p.dot(&v.slice(rows)));
                probs.push(p);
            }
        }

        let y = self.out.forward(params, context.view())?;
        let cache = AttentionCache {
            ln,
            h,
            q,
            k,
            v,
            probs,
            context,
        };

        Ok((y, cache))
    }
}

/// Forbids position `i` from attending to any position `j > i`.
fn causal_mask(logits: &mut Array2<f32>) {
    for ((i, j), logit) in logits.indexed_iter_mut() {
        if j > i {
            *logit = MASK_VALUE;
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use ndarray::ArrayView2;

    use super::*;
    use crate::nn::testing::{assert_close, randn};

    fn attends_to_future(p: ArrayView2<f32>) -> bool {
        p.indexed_iter().any(|((i, j), &w)| j > i && w > 0.)
    }

    fn setup() -> (AttentionCoupling, TensorTree) {
        let attn = AttentionCoupling::new("g", 4, 2, 3, 1.);
        let mut params = TensorTree::new();
        attn.init_params(&mut StdRng::seed_from_u64(5), &mut params)
            .unwrap();
        (attn, params)
    }

    #[test]
    fn is_causal() {
        let (attn, params) = setup();
        let x = randn((1, 4, 4), 21);
        let (_, cache) = attn.forward_cached(&params, x.view()).unwrap();

        assert!(cache.probs.iter().all(|p| !attends_to_future(p.view())));

        // Changing the last position must not change the earlier outputs.
        let mut changed = x.clone();
        changed.slice_mut(s![0, 3, ..]).fill(5.);
        let y = attn.forward(&params, x.view()).unwrap();
        let y_changed = attn.forward(&params, changed.view()).unwrap();

        let before = y.slice(s![0, ..3, ..]);
        let after = y_changed.slice(s![0, ..3, ..]);
        assert!(before.iter().zip(after.iter()).all(|(a, b)| (a - b).abs() < 1e-6));
    }

    #[test]
    fn backward_matches_finite_differences() {
        let (attn, params) = setup();
        let x = randn((2, 3, 4), 31);
        let r = randn((2, 3, 4), 32);
        let objective = |x: &Array3<f32>, params: &TensorTree| {
            (attn.forward(params, x.view()).unwrap() * &r).sum()
        };

        let mut grads = TensorTree::new();
        let dx = attn
            .backward(&params, x.view(), r.view(), &mut grads)
            .unwrap();
        assert!(grads.same_structure(&params));

        let eps = 1e-2;
        for idx in [(0, 0, 0), (1, 2, 1), (0, 2, 3), (1, 0, 2)] {
            let mut plus = x.clone();
            plus[idx] += eps;
            let mut minus = x.clone();
            minus[idx] -= eps;

            let numeric = (objective(&plus, &params) - objective(&minus, &params)) / (2. * eps);
            assert_close(dx[idx], numeric, 2e-2, "dx");
        }

        for (key, idx) in [("g/query/w", [0, 1]), ("g/key/w", [3, 4]), ("g/value/w", [2, 5])] {
            let mut w = params.view2(key).unwrap().to_owned();
            let mut plus = params.clone();
            let mut minus = params.clone();
            w[idx] += eps;
            plus.insert(key, w.clone());
            w[idx] -= 2. * eps;
            minus.insert(key, w);

            let numeric = (objective(&x, &plus) - objective(&x, &minus)) / (2. * eps);
            assert_close(grads.view2(key).unwrap()[idx], numeric, 2e-2, key);
        }
    }
}
