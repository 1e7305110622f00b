use actix::prelude::*;
use log::debug;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};
use rand::rngs::StdRng;

use super::{ParameterActor, Stage};
use crate::{
    error::{Result, SwarmError},
    nn::{cross_entropy, flatten, unflatten, LayerNorm, Linear},
    params::{ParamGen, TensorTree, TruncatedNormalGen},
};

const TABLE: &str = "embedding/table";
const POS: &str = "embedding/pos";
const EMBED_STD_DEV: f32 = 0.02;

/// How hidden states are mapped back to vocabulary logits.
#[derive(Clone, Debug)]
enum Projection {
    /// `logits = hidden · tableᵀ`, reusing the embedding table.
    Tied,
    /// `logits = Linear(LayerNorm(hidden))` with weights of its own.
    Untied { ln: LayerNorm, linear: Linear },
}

/// The head and tail of the pipeline: token embedding plus learned positions on the way in,
/// projection to the vocabulary and the loss on the way out.
#[derive(Clone, Debug)]
pub struct Embedding {
    vocab: usize,
    d_model: usize,
    seq_len: usize,
    projection: Projection,
}

impl Embedding {
    pub fn new(vocab: usize, d_model: usize, tied: bool) -> Self {
        let projection = if tied {
            Projection::Tied
        } else {
            Projection::Untied {
                ln: LayerNorm::new("projection/ln", d_model),
                linear: Linear::new("projection/linear", (d_model, vocab), true),
            }
        };

        Self {
            vocab,
            d_model,
            seq_len: 0,
            projection,
        }
    }

    fn check_obs(&self, obs: ArrayView2<u32>) -> Result<()> {
        if obs.ncols() != self.seq_len {
            return Err(SwarmError::Initialization(format!(
                "sequence length {} differs from the {} the embedding was initialized with",
                obs.ncols(),
                self.seq_len
            )));
        }

        match obs.iter().find(|&&tok| tok as usize >= self.vocab) {
            Some(&tok) => Err(SwarmError::shape("token id", &[tok as usize], &[self.vocab])),
            None => Ok(()),
        }
    }

    fn check_hidden(&self, hidden: ArrayView3<f32>) -> Result<()> {
        let (_, t, d) = hidden.dim();
        if d != self.d_model || t != self.seq_len {
            return Err(SwarmError::Initialization(format!(
                "hidden state of shape {:?} does not fit [_, {}, {}]",
                hidden.shape(),
                self.seq_len,
                self.d_model
            )));
        }

        Ok(())
    }

    /// Table lookup plus positional bias.
    pub fn embed(&self, params: &TensorTree, obs: ArrayView2<u32>) -> Result<Array3<f32>> {
        self.check_obs(obs)?;

        let table = params.view2(TABLE)?;
        let pos = params.view2(POS)?;

        let (b, t) = obs.dim();
        let mut hidden = Array3::zeros((b, t, self.d_model));

        for ((bi, ti), &tok) in obs.indexed_iter() {
            let mut out = hidden.slice_mut(s![bi, ti, ..]);
            out.assign(&table.row(tok as usize));
            out += &pos.row(ti);
        }

        Ok(hidden)
    }

    /// Gradient of the embedding with respect to the table and positions, scattered from `dh`.
    pub fn embed_vjp(&self, obs: ArrayView2<u32>, dh: ArrayView3<f32>) -> Result<TensorTree> {
        self.check_obs(obs)?;

        let (b, t) = obs.dim();
        if dh.dim() != (b, t, self.d_model) {
            return Err(SwarmError::shape(
                "embedding gradient",
                dh.shape(),
                &[b, t, self.d_model],
            ));
        }

        let mut dtable = Array2::<f32>::zeros((self.vocab, self.d_model));
        let mut dpos = Array2::<f32>::zeros((self.seq_len, self.d_model));

        for ((bi, ti), &tok) in obs.indexed_iter() {
            let g = dh.slice(s![bi, ti, ..]);

            let mut row = dtable.row_mut(tok as usize);
            row += &g;

            let mut row = dpos.row_mut(ti);
            row += &g;
        }

        let mut grads = TensorTree::new();
        grads.insert(TABLE, dtable);
        grads.insert(POS, dpos);
        Ok(grads)
    }

    /// Vocabulary logits for every position, flattened to `[batch * seq, vocab]`.
    pub fn logits(&self, params: &TensorTree, hidden: ArrayView3<f32>) -> Result<Array2<f32>> {
        self.check_hidden(hidden)?;
        let h = flatten(hidden)?;

        match &self.projection {
            Projection::Tied => Ok(h.dot(&params.view2(TABLE)?.t())),
            Projection::Untied { ln, linear } => {
                let (z, _) = ln.forward(params, h.view())?;
                linear.forward(params, z.view())
            }
        }
    }

    /// Mean cross-entropy of the projected `hidden` against `targets`.
    ///
    /// # Returns
    /// The loss, its gradient with respect to `hidden` and the projection weight gradients.
    pub fn loss_vjp(
        &self,
        params: &TensorTree,
        hidden: ArrayView3<f32>,
        targets: ArrayView2<u32>,
    ) -> Result<(f32, Array3<f32>, TensorTree)> {
        self.check_hidden(hidden)?;

        let (b, t, _) = hidden.dim();
        if targets.dim() != (b, t) {
            return Err(SwarmError::shape("targets", targets.shape(), &[b, t]));
        }

        let h = flatten(hidden)?;
        let targets = targets.iter().copied().collect::<ndarray::Array1<u32>>();
        let mut grads = TensorTree::new();

        let (loss, dh) = match &self.projection {
            Projection::Tied => {
                let table = params.view2(TABLE)?;
                let logits = h.dot(&table.t());
                let (loss, dlogits) = cross_entropy(logits.view(), targets.view())?;

                grads.insert(TABLE, dlogits.t().dot(&h));
                (loss, dlogits.dot(&table))
            }
            Projection::Untied { ln, linear } => {
                let (z, cache) = ln.forward(params, h.view())?;
                let logits = linear.forward(params, z.view())?;
                let (loss, dlogits) = cross_entropy(logits.view(), targets.view())?;

                let dz = linear.backward(params, z.view(), dlogits.view(), &mut grads)?;
                (loss, ln.backward(params, &cache, dz.view(), &mut grads)?)
            }
        };

        Ok((loss, unflatten(dh, b, t)?, grads))
    }
}

impl Stage for Embedding {
    type Sample = Array2<u32>;

    fn init_params(&mut self, rng: &mut StdRng, sample: &Array2<u32>) -> Result<TensorTree> {
        if sample.is_empty() {
            return Err(SwarmError::Initialization(
                "the sample batch must hold at least one token".into(),
            ));
        }
        self.seq_len = sample.ncols();
        self.check_obs(sample.view())?;

        let param_gen = TruncatedNormalGen::new(EMBED_STD_DEV)?;
        let mut params = TensorTree::new();
        params.insert(TABLE, param_gen.tensor(rng, &[self.vocab, self.d_model]));
        params.insert(POS, param_gen.tensor(rng, &[self.seq_len, self.d_model]));

        if let Projection::Untied { ln, linear } = &self.projection {
            ln.init_params(&mut params);
            linear.init_params(rng, 1., &mut params)?;
        }

        Ok(params)
    }
}

pub type EmbeddingActor = ParameterActor<Embedding>;

/* -------------------------------------------------------------------------- */
/*                                  Messages                                  */
/* -------------------------------------------------------------------------- */

#[derive(Message)]
#[rtype(result = "Result<Array3<f32>>")]
pub struct EmbedForward {
    pub obs: Array2<u32>,
}

/// Pushes the embedding gradient for `obs`. Resolves to the mean squared difference between
/// `hidden` and the recomputed embedding.
#[derive(Message)]
#[rtype(result = "Result<f32>")]
pub struct EmbedGrad {
    pub obs: Array2<u32>,
    pub hidden: Array3<f32>,
    pub grad: Array3<f32>,
}

#[derive(Message)]
#[rtype(result = "Result<Array3<f32>>")]
pub struct DebedForward {
    pub hidden: Array3<f32>,
}

/// Seeds the backward pass. Resolves to `((hidden, grad_hidden), loss)`.
#[derive(Message)]
#[rtype(result = "Result<((Array3<f32>, Array3<f32>), f32)>")]
pub struct DebedGrad {
    pub hidden: Array3<f32>,
    pub targets: Array2<u32>,
}

impl Handler<EmbedForward> for EmbeddingActor {
    type Result = Result<Array3<f32>>;

    fn handle(&mut self, msg: EmbedForward, _ctx: &mut Self::Context) -> Self::Result {
        let params = self.state()?.params();
        self.stage.embed(params, msg.obs.view())
    }
}

impl Handler<EmbedGrad> for EmbeddingActor {
    type Result = Result<f32>;

    fn handle(&mut self, msg: EmbedGrad, _ctx: &mut Self::Context) -> Self::Result {
        let EmbedGrad { obs, hidden, grad } = msg;

        let params = self.state()?.params();
        let recomputed = self.stage.embed(params, obs.view())?;
        if hidden.dim() != recomputed.dim() {
            return Err(SwarmError::shape(
                "embedding target",
                hidden.shape(),
                recomputed.shape(),
            ));
        }

        let grads = self.stage.embed_vjp(obs.view(), grad.view())?;
        let diff = (&hidden - &recomputed).mapv(|d| d * d).mean().unwrap_or(0.);

        self.accumulate(&grads)?;
        debug!(actor = self.name(), diff; "embedding gradient accumulated");

        Ok(diff)
    }
}

impl Handler<DebedForward> for EmbeddingActor {
    type Result = Result<Array3<f32>>;

    fn handle(&mut self, msg: DebedForward, _ctx: &mut Self::Context) -> Self::Result {
        let (b, t, _) = msg.hidden.dim();
        let params = self.state()?.params();
        let logits = self.stage.logits(params, msg.hidden.view())?;
        unflatten(logits, b, t)
    }
}

impl Handler<DebedGrad> for EmbeddingActor {
    type Result = Result<((Array3<f32>, Array3<f32>), f32)>;

    fn handle(&mut self, msg: DebedGrad, _ctx: &mut Self::Context) -> Self::Result {
        let DebedGrad { hidden, targets } = msg;

        let params = self.state()?.params();
        let (loss, grad, grads) = self.stage.loss_vjp(params, hidden.view(), targets.view())?;

        self.accumulate(&grads)?;
        debug!(actor = self.name(), loss; "projection gradient accumulated");

        Ok(((hidden, grad), loss))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;

    use super::*;
    use crate::nn::testing::{assert_close, randn};

    fn stage(tied: bool) -> (Embedding, TensorTree, Array2<u32>) {
        let obs = array![[1, 0, 3], [2, 2, 1]];
        let mut stage = Embedding::new(4, 6, tied);
        let params = stage
            .init_params(&mut StdRng::seed_from_u64(5), &obs)
            .unwrap();
        (stage, params, obs)
    }

    #[test]
    fn embeds_token_plus_position() {
        let (stage, params, obs) = stage(true);
        let hidden = stage.embed(&params, obs.view()).unwrap();

        let table = params.view2(TABLE).unwrap();
        let pos = params.view2(POS).unwrap();
        let expected = &table.row(3) + &pos.row(2);

        assert_eq!(hidden.dim(), (2, 3, 6));
        assert_eq!(hidden.slice(s![0, 2, ..]), expected);
    }

    #[test]
    fn untied_has_its_own_projection() {
        let (_, tied, _) = stage(true);
        let (stage, untied, _) = stage(false);

        assert_eq!(tied.len(), 2);
        assert_eq!(untied.len(), 6);
        assert_eq!(untied.view2("projection/linear/w").unwrap().dim(), (6, 4));

        let hidden = randn((2, 3, 6), 1);
        assert_eq!(stage.logits(&untied, hidden.view()).unwrap().dim(), (6, 4));
    }

    #[test]
    fn rejects_foreign_shapes() {
        let (stage, params, _) = stage(true);

        let longer = array![[0, 1, 2, 3]];
        let err = stage.embed(&params, longer.view()).unwrap_err();
        assert!(matches!(err, SwarmError::Initialization(_)));

        let out_of_vocab = array![[0, 1, 9]];
        assert!(stage.embed(&params, out_of_vocab.view()).is_err());

        let narrow = randn((1, 3, 5), 0);
        let err = stage.logits(&params, narrow.view()).unwrap_err();
        assert!(matches!(err, SwarmError::Initialization(_)));
    }

    #[test]
    fn embedding_gradient_scatters_into_rows() {
        let (stage, _, obs) = stage(true);
        let dh = Array3::<f32>::ones((2, 3, 6));
        let grads = stage.embed_vjp(obs.view(), dh.view()).unwrap();

        let dtable = grads.view2(TABLE).unwrap();
        // Token 2 appears twice, token 0 once.
        assert_eq!(dtable.row(2).sum(), 12.);
        assert_eq!(dtable.row(0).sum(), 6.);
        assert_eq!(grads.view2(POS).unwrap().row(0).sum(), 12.);
    }

    fn check_loss_gradient(tied: bool) {
        let (stage, params, _) = stage(tied);
        let hidden = randn((2, 3, 6), 3);
        let targets = array![[0, 1, 2], [3, 3, 0]];

        let (loss, dh, grads) = stage.loss_vjp(&params, hidden.view(), targets.view()).unwrap();
        assert!(loss.is_finite() && loss > 0.);

        let eps = 1e-2;
        for idx in [(0, 0, 0), (1, 2, 5), (0, 1, 3)] {
            let mut plus = hidden.clone();
            plus[idx] += eps;
            let mut minus = hidden.clone();
            minus[idx] -= eps;

            let (lp, _, _) = stage.loss_vjp(&params, plus.view(), targets.view()).unwrap();
            let (lm, _, _) = stage.loss_vjp(&params, minus.view(), targets.view()).unwrap();
            assert_close(dh[idx], (lp - lm) / (2. * eps), 1e-2, "dhidden");
        }

        let key = if tied { TABLE } else { "projection/linear/w" };
        let weight = params.view2(key).unwrap().to_owned();
        for idx in [(0, 0), (1, 3), (3, 2)] {
            let numeric = {
                let mut plus = params.clone();
                let mut w = weight.clone();
                w[idx] += eps;
                plus.insert(key, w);

                let mut minus = params.clone();
                let mut w = weight.clone();
                w[idx] -= eps;
                minus.insert(key, w);

                let (lp, _, _) = stage.loss_vjp(&plus, hidden.view(), targets.view()).unwrap();
                let (lm, _, _) = stage.loss_vjp(&minus, hidden.view(), targets.view()).unwrap();
                (lp - lm) / (2. * eps)
            };

            assert_close(grads.view2(key).unwrap()[idx], numeric, 1e-2, key);
        }
    }

    #[test]
    fn tied_loss_gradient_matches_finite_differences() {
        check_loss_gradient(true);
    }

    #[test]
    fn untied_loss_gradient_matches_finite_differences() {
        check_loss_gradient(false);
    }
}
