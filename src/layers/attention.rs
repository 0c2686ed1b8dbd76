//! Multi-Head Attention
//!
//! Attends from one sequence (queries, `inp1`) over another (keys and
//! values, `inp2`).
//!
//! ```text
//! Q, K, V = inp1 @ W_q, inp2 @ W_k, inp2 @ W_v
//! scores = (Q / √d_head) @ K^T            [batch, heads, len1, len2]
//! scores[mask] = -1e8
//! normal: out = softmax(scores) @ V @ W_o
//! copy:   out = scores                    (single head, no softmax)
//! ```
//!
//! Copy mode hands raw logits to a pointer/copy distribution computed by the
//! caller. A 2-D `inp1` (`[batch, features]`) is a single query; the result
//! drops the query axis in normal mode.

use super::linear::{LinearCache, LinearGradients, TrainableLinear};
use crate::config::ModelConfig;
use crate::error::{check_shape, ModelError, Result};
use crate::tensor::Tensor;
use crate::utils::child_seeds;

/// Value written into masked logits before softmax
pub const MASK_FILL: f32 = -1e8;

/// What the attention head returns
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttentionMode {
    /// Multi-head attention with output projection
    Normal,
    /// Single-head raw logits for copy/pointer mechanisms
    Copy,
}

pub struct MultiHeadAttention {
    pub wq: TrainableLinear,
    pub wk: TrainableLinear,
    pub wv: TrainableLinear,
    /// Output projection, only present in [`AttentionMode::Normal`]
    pub wo: Option<TrainableLinear>,
    pub num_heads: usize,
    pub head_dim: usize,
    pub mode: AttentionMode,
}

impl MultiHeadAttention {
    /// Build an attention head from the shared configuration
    ///
    /// * `Normal`: `nhead` heads of `head_dim`, queries and keys of width `nhid`
    /// * `Copy`: one head of `nhid`, queries of width `dec_ninp`
    ///
    /// Heads built next to the encoders take a seed derived from
    /// [`SeedStream::Attention`](crate::config::SeedStream::Attention).
    pub fn new(config: &ModelConfig, mode: AttentionMode, seed: u64) -> Result<Self> {
        config.validate()?;
        let (num_heads, head_dim, q_in, kv_in) = match mode {
            AttentionMode::Copy => (1, config.nhid, config.dec_ninp, config.nhid),
            AttentionMode::Normal => (config.nhead, config.head_dim, config.nhid, config.nhid),
        };
        let inner = num_heads * head_dim;
        let [q_seed, k_seed, v_seed, o_seed] = child_seeds(seed);
        let wo = match mode {
            AttentionMode::Normal => Some(TrainableLinear::new(inner, config.nhid, o_seed)),
            AttentionMode::Copy => None,
        };
        Ok(Self {
            wq: TrainableLinear::new(q_in, inner, q_seed),
            wk: TrainableLinear::new(kv_in, inner, k_seed),
            wv: TrainableLinear::new(kv_in, inner, v_seed),
            wo,
            num_heads,
            head_dim,
            mode,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `inp1` - Queries `[batch, q_in]` or `[batch, len1, q_in]`
    /// * `inp2` - Keys/values `[batch, len2, kv_in]`
    /// * `mask` - Optional `[batch, len2]`; non-zero suppresses a key position
    ///
    /// # Returns
    ///
    /// Normal mode: `[batch, len1, nhid]` (`[batch, nhid]` for 2-D `inp1`).
    /// Copy mode: `[batch, len1, len2]` logits (`len1 = 1` for 2-D `inp1`).
    pub fn forward(
        &self,
        inp1: &Tensor,
        inp2: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, AttentionCache)> {
        if inp2.ndim() != 3 || inp2.shape[2] != self.wk.in_features() {
            return Err(ModelError::ShapeMismatch {
                context: "attention keys",
                expected: vec![inp2.shape.first().copied().unwrap_or(0), 0, self.wk.in_features()],
                actual: inp2.shape.clone(),
            });
        }
        let (batch, len2) = (inp2.shape[0], inp2.shape[1]);
        let squeeze = inp1.ndim() == 2;
        let len1 = match inp1.ndim() {
            2 => 1,
            3 => inp1.shape[1],
            _ => {
                return Err(ModelError::ShapeMismatch {
                    context: "attention queries",
                    expected: vec![batch, self.wq.in_features()],
                    actual: inp1.shape.clone(),
                })
            }
        };
        if inp1.shape[0] != batch || inp1.last_dim() != self.wq.in_features() {
            let mut expected = inp1.shape.clone();
            expected[0] = batch;
            if let Some(last) = expected.last_mut() {
                *last = self.wq.in_features();
            }
            check_shape("attention queries", &expected, &inp1.shape)?;
        }
        if let Some(m) = mask {
            check_shape("attention mask", &[batch, len2], &m.shape)?;
        }

        let (nh, hd) = (self.num_heads, self.head_dim);
        let scale = (hd as f32).sqrt();

        let (q, q_cache) = self.wq.forward(inp1);
        let (k, k_cache) = self.wk.forward(inp2);
        let (v, v_cache) = self.wv.forward(inp2);

        let q4 = q
            .div_scalar(scale)
            .reshape(&[batch, len1, nh, hd])
            .permute(&[0, 2, 1, 3]);
        let k4 = k.reshape(&[batch, len2, nh, hd]).permute(&[0, 2, 3, 1]);
        let v4 = v.reshape(&[batch, len2, nh, hd]).permute(&[0, 2, 1, 3]);

        let mut scores = q4.matmul(&k4);
        let expanded_mask = mask.map(|m| expand_key_mask(m, nh, len1));
        if let Some(m) = &expanded_mask {
            scores = scores.masked_fill(m, MASK_FILL);
        }

        let (out, alpha, wo_cache) = match (&self.mode, &self.wo) {
            (AttentionMode::Normal, Some(wo)) => {
                let alpha = scores.softmax(-1);
                let attn = alpha
                    .matmul(&v4)
                    .permute(&[0, 2, 1, 3])
                    .reshape(&[batch, len1, nh * hd]);
                let (ret, wo_cache) = wo.forward(&attn);
                let ret = if squeeze {
                    ret.reshape(&[batch, wo.out_features()])
                } else {
                    ret
                };
                (ret, Some(alpha), Some(wo_cache))
            }
            _ => (scores.reshape(&[batch, len1, len2]), None, None),
        };

        log::trace!(
            "attention {:?}: queries {:?}, keys {:?} -> {:?}",
            self.mode,
            inp1.shape,
            inp2.shape,
            out.shape
        );

        let cache = AttentionCache {
            q_cache,
            k_cache,
            v_cache,
            wo_cache,
            q4,
            k4,
            v4,
            alpha,
            mask: expanded_mask,
            batch,
            len1,
            len2,
        };
        Ok((out, cache))
    }

    /// Backward pass: gradients for every projection and both inputs
    pub fn backward(&self, grad_out: &Tensor, cache: &AttentionCache) -> AttentionGradients {
        let (batch, len1, len2) = (cache.batch, cache.len1, cache.len2);
        let (nh, hd) = (self.num_heads, self.head_dim);
        let scale = (hd as f32).sqrt();

        let (grad_scores, grad_v4, out_grads) = match (&self.wo, &cache.alpha, &cache.wo_cache) {
            (Some(wo), Some(alpha), Some(wo_cache)) => {
                let out_grads = wo.backward(grad_out, wo_cache);
                let grad_attn4 = out_grads
                    .x
                    .reshape(&[batch, len1, nh, hd])
                    .permute(&[0, 2, 1, 3]);
                let grad_alpha = grad_attn4.matmul(&cache.v4.transpose(-2, -1));
                let grad_v4 = alpha.transpose(-2, -1).matmul(&grad_attn4);
                (softmax_backward(&grad_alpha, alpha), grad_v4, Some(out_grads))
            }
            _ => (
                grad_out.reshape(&[batch, nh, len1, len2]),
                Tensor::zeros(vec![batch, nh, len2, hd]),
                None,
            ),
        };
        let grad_scores = match &cache.mask {
            Some(m) => grad_scores.masked_fill(m, 0.0),
            None => grad_scores,
        };

        let grad_q4 = grad_scores
            .matmul(&cache.k4.transpose(-2, -1))
            .div_scalar(scale);
        let grad_k4 = cache.q4.transpose(-2, -1).matmul(&grad_scores);

        let grad_q = grad_q4.permute(&[0, 2, 1, 3]).reshape(&[batch, len1, nh * hd]);
        let grad_k = grad_k4.permute(&[0, 3, 1, 2]).reshape(&[batch, len2, nh * hd]);
        let grad_v = grad_v4.permute(&[0, 2, 1, 3]).reshape(&[batch, len2, nh * hd]);

        let q = self.wq.backward(&grad_q, &cache.q_cache);
        let k = self.wk.backward(&grad_k, &cache.k_cache);
        let v = self.wv.backward(&grad_v, &cache.v_cache);
        let inp2 = k.x.add(&v.x);
        let inp1 = q.x.clone();

        AttentionGradients {
            q,
            k,
            v,
            out: out_grads,
            inp1,
            inp2,
        }
    }
}

/// Broadcast a `[batch, len2]` key mask to `[batch, heads, len1, len2]`
fn expand_key_mask(mask: &Tensor, heads: usize, len1: usize) -> Tensor {
    let (batch, len2) = (mask.shape[0], mask.shape[1]);
    let mut data = Vec::with_capacity(batch * heads * len1 * len2);
    for b in 0..batch {
        let row = &mask.data[b * len2..(b + 1) * len2];
        for _ in 0..heads * len1 {
            data.extend_from_slice(row);
        }
    }
    Tensor::new(data, vec![batch, heads, len1, len2])
}

/// Row-wise softmax gradient: `a * (g - sum(g * a))`
fn softmax_backward(grad: &Tensor, probs: &Tensor) -> Tensor {
    let cols = probs.last_dim();
    let mut out = vec![0.0; probs.numel()];
    for ((o, g), a) in out
        .chunks_mut(cols)
        .zip(grad.data.chunks(cols))
        .zip(probs.data.chunks(cols))
    {
        let dot: f32 = g.iter().zip(a).map(|(x, y)| x * y).sum();
        for j in 0..cols {
            o[j] = a[j] * (g[j] - dot);
        }
    }
    Tensor::new(out, probs.shape.clone())
}

/// Cache for attention backward pass
pub struct AttentionCache {
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub wo_cache: Option<LinearCache>,
    /// Scaled queries `[batch, heads, len1, head_dim]`
    pub q4: Tensor,
    /// Keys `[batch, heads, head_dim, len2]`
    pub k4: Tensor,
    /// Values `[batch, heads, len2, head_dim]`
    pub v4: Tensor,
    /// Attention weights (normal mode)
    pub alpha: Option<Tensor>,
    pub mask: Option<Tensor>,
    pub batch: usize,
    pub len1: usize,
    pub len2: usize,
}

/// Gradients for attention
pub struct AttentionGradients {
    pub q: LinearGradients,
    pub k: LinearGradients,
    pub v: LinearGradients,
    pub out: Option<LinearGradients>,
    pub inp1: Tensor,
    pub inp2: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shape: Vec<usize>, step: f32) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::new((0..n).map(|i| ((i % 11) as f32 - 5.0) * step).collect(), shape)
    }

    #[test]
    fn test_normal_mode_preserves_query_shape() {
        let config = ModelConfig::tiny();
        let attn = MultiHeadAttention::new(&config, AttentionMode::Normal, 1).unwrap();
        let inp1 = ramp(vec![2, 3, config.nhid], 0.1);
        let inp2 = ramp(vec![2, 5, config.nhid], 0.2);
        let mask = Tensor::zeros(vec![2, 5]);
        let (out, _) = attn.forward(&inp1, &inp2, Some(&mask)).unwrap();
        assert_eq!(out.shape, inp1.shape);

        let single = ramp(vec![2, config.nhid], 0.1);
        let (out, _) = attn.forward(&single, &inp2, None).unwrap();
        assert_eq!(out.shape, single.shape);
    }

    #[test]
    fn test_copy_mode_masks_logits() {
        let config = ModelConfig::tiny();
        let attn = MultiHeadAttention::new(&config, AttentionMode::Copy, 2).unwrap();
        let inp1 = ramp(vec![1, 2, config.dec_ninp], 0.1);
        let inp2 = ramp(vec![1, 4, config.nhid], 0.3);
        let mask = Tensor::new(vec![0.0, 1.0, 0.0, 1.0], vec![1, 4]);
        let (logits, _) = attn.forward(&inp1, &inp2, Some(&mask)).unwrap();
        assert_eq!(logits.shape, vec![1, 2, 4]);
        for row in logits.data.chunks(4) {
            let unmasked = row[0].min(row[2]);
            assert!(row[1] <= unmasked - 0.9e8);
            assert!(row[3] <= unmasked - 0.9e8);
        }
    }

    #[test]
    fn test_masked_keys_do_not_change_output() {
        let config = ModelConfig::tiny();
        let attn = MultiHeadAttention::new(&config, AttentionMode::Normal, 4).unwrap();
        let inp1 = ramp(vec![1, config.nhid], 0.1);
        let inp2 = ramp(vec![1, 3, config.nhid], 0.2);
        let mask = Tensor::new(vec![0.0, 0.0, 1.0], vec![1, 3]);
        let (a, _) = attn.forward(&inp1, &inp2, Some(&mask)).unwrap();

        let mut changed = inp2.clone();
        for v in &mut changed.data[2 * config.nhid..] {
            *v += 10.0;
        }
        let (b, _) = attn.forward(&inp1, &changed, Some(&mask)).unwrap();
        for (x, y) in a.data.iter().zip(&b.data) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_bad_mask() {
        let config = ModelConfig::tiny();
        let attn = MultiHeadAttention::new(&config, AttentionMode::Normal, 1).unwrap();
        let inp = ramp(vec![1, 3, config.nhid], 0.1);
        let mask = Tensor::zeros(vec![1, 4]);
        assert!(matches!(
            attn.forward(&inp, &inp, Some(&mask)),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    /// Compare analytical input gradients with central differences of
    /// `sum(out * upstream)`, checking every third element.
    fn assert_gradients_match(
        attn: &MultiHeadAttention,
        inp1: &Tensor,
        inp2: &Tensor,
        mask: &Tensor,
        upstream: &Tensor,
    ) {
        let (out, cache) = attn.forward(inp1, inp2, Some(mask)).unwrap();
        assert_eq!(out.shape, upstream.shape);
        let grads = attn.backward(upstream, &cache);
        assert_eq!(grads.inp1.shape, inp1.shape);
        assert_eq!(grads.inp2.shape, inp2.shape);

        let loss = |a: &Tensor, b: &Tensor| -> f64 {
            let (out, _) = attn.forward(a, b, Some(mask)).unwrap();
            out.data
                .iter()
                .zip(&upstream.data)
                .map(|(y, g)| (*y as f64) * (*g as f64))
                .sum()
        };
        let eps = 1e-2;
        for i in (0..inp1.numel()).step_by(3) {
            let mut plus = inp1.clone();
            plus.data[i] += eps;
            let mut minus = inp1.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&plus, inp2) - loss(&minus, inp2)) / (2.0 * eps as f64);
            assert!(
                (numeric as f32 - grads.inp1.data[i]).abs() < 5e-3,
                "inp1[{i}]: {numeric} vs {}",
                grads.inp1.data[i]
            );
        }
        for i in (0..inp2.numel()).step_by(3) {
            let mut plus = inp2.clone();
            plus.data[i] += eps;
            let mut minus = inp2.clone();
            minus.data[i] -= eps;
            let numeric = (loss(inp1, &plus) - loss(inp1, &minus)) / (2.0 * eps as f64);
            assert!(
                (numeric as f32 - grads.inp2.data[i]).abs() < 5e-3,
                "inp2[{i}]: {numeric} vs {}",
                grads.inp2.data[i]
            );
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let config = ModelConfig::tiny();
        let attn = MultiHeadAttention::new(&config, AttentionMode::Normal, 9).unwrap();
        assert_gradients_match(
            &attn,
            &ramp(vec![1, 2, config.nhid], 0.05),
            &ramp(vec![1, 3, config.nhid], 0.07),
            &Tensor::new(vec![0.0, 0.0, 1.0], vec![1, 3]),
            &ramp(vec![1, 2, config.nhid], 0.13),
        );
    }

    #[test]
    fn test_backward_with_single_query_vector() {
        let config = ModelConfig::tiny();
        let attn = MultiHeadAttention::new(&config, AttentionMode::Normal, 10).unwrap();
        assert_gradients_match(
            &attn,
            &ramp(vec![2, config.nhid], 0.05),
            &ramp(vec![2, 3, config.nhid], 0.07),
            &Tensor::new(vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0], vec![2, 3]),
            &ramp(vec![2, config.nhid], 0.13),
        );
    }

    #[test]
    fn test_copy_mode_backward_matches_finite_difference() {
        let config = ModelConfig::tiny();
        let attn = MultiHeadAttention::new(&config, AttentionMode::Copy, 11).unwrap();
        let mask = Tensor::new(vec![0.0, 0.0, 0.0, 1.0], vec![1, 4]);
        assert_gradients_match(
            &attn,
            &ramp(vec![1, 2, config.dec_ninp], 0.04),
            &ramp(vec![1, 4, config.nhid], 0.06),
            &mask,
            &ramp(vec![1, 2, 4], 0.2),
        );

        // a 2-D decoder state gives logits [batch, 1, len2]
        assert_gradients_match(
            &attn,
            &ramp(vec![1, config.dec_ninp], 0.04),
            &ramp(vec![1, 4, config.nhid], 0.06),
            &mask,
            &ramp(vec![1, 1, 4], 0.2),
        );
    }
}
